//! Capture file source
//!
//! Provides `CaptureFileSource` - a runtime process node that reads DSLogic
//! .dsl capture archives and streams the three monitored protocol signals
//! (clock, serial data, load strobe) as run-length encoded `Sample` events.
//!
//! Each broadcast destination runs in its own independent reading thread, so
//! a slow consumer on one destination never blocks other destinations. All
//! threads share a single ZipArchive and block cache via `Arc<Mutex<..>>`.

use crate::runtime::Sender;
use crate::runtime::node::{InputPort, OutputPort, ProcessNode, WorkResult};
use crate::runtime::sample::Sample;
use crate::{CaptureError, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, info};
use zip::ZipArchive;

/// The three signal roles the decoder consumes, in port order
const ROLE_NAMES: [&str; 3] = ["clk", "sd", "load"];

/// Assignment of capture probes to the three protocol signal roles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalMap {
    /// Probe carrying the bit clock
    pub clk: usize,
    /// Probe carrying the serial data line
    pub sd: usize,
    /// Probe carrying the load strobe
    pub load: usize,
}

impl SignalMap {
    /// Probe numbers in port order (clk, sd, load)
    pub fn probes(&self) -> [usize; 3] {
        [self.clk, self.sd, self.load]
    }

    fn validate(&self, total_probes: usize) -> Result<()> {
        let probes = self.probes();
        for probe in probes {
            if probe >= total_probes {
                return Err(CaptureError::InvalidProbe(probe));
            }
        }
        if probes[0] == probes[1] || probes[0] == probes[2] || probes[1] == probes[2] {
            return Err(CaptureError::ParseError(format!(
                "signal roles must map to distinct probes, got clk={}, sd={}, load={}",
                self.clk, self.sd, self.load
            )));
        }
        Ok(())
    }
}

/// Header information from a capture file
#[derive(Debug, Clone)]
pub struct CaptureHeader {
    /// Total number of probes/channels in the capture
    pub total_probes: usize,
    /// Sample rate as a string (e.g., "50 MHz")
    pub samplerate: String,
    /// Sample rate in Hz
    pub samplerate_hz: f64,
    /// Sample period in seconds (1 / sample_rate)
    pub sample_period: f64,
    /// Total number of samples captured
    pub total_samples: u64,
    /// Total number of data blocks
    pub total_blocks: u64,
    /// Samples per block (fixed-size except the last)
    pub samples_per_block: u64,
    /// Probe names indexed by probe number (0-based)
    pub probe_names: Vec<String>,
}

type BlockCache = Arc<Mutex<HashMap<(usize, u64), Arc<[u8]>>>>;

/// Source node that streams the three protocol signals from a .dsl capture
///
/// This runtime `ProcessNode` (0 inputs, 3 outputs named `clk`/`sd`/`load`)
/// reads packed-bit blocks from the archive and emits one `Sample` per
/// signal transition, indexed by global sample position — the index space
/// the decoder's annotations live in.
///
/// ## Threading Model
///
/// This is a **self-threading node** (`is_self_threading() = true`). On the
/// first (and only) call to `work()`, it spawns one internal worker thread
/// **per broadcast destination**. The scheduler thread then waits for
/// `should_stop()` to signal completion, rather than calling `work()`
/// repeatedly.
///
/// If a signal is broadcast to multiple receivers, each receiver gets its own
/// independent reading thread, eliminating head-of-line blocking. All threads
/// share a single ZipArchive and block cache. Each reader signals explicit
/// end-of-stream on its channel when the capture is exhausted, so downstream
/// decoders terminate cleanly.
pub struct CaptureFileSource {
    name: String,
    // File access (shared across all reader threads)
    archive: Arc<Mutex<ZipArchive<File>>>,
    header: CaptureHeader,
    blocks: BlockCache,

    // Configuration
    signals: SignalMap,
    max_samples: Option<u64>,

    // Reader thread management
    shutdown: Arc<AtomicBool>,
    threads_completed: Arc<AtomicUsize>,
    thread_handles: Option<Vec<JoinHandle<()>>>,
    threads_spawned: bool,
    num_threads: usize,
}

impl CaptureFileSource {
    /// Open a capture file and map its probes to the three signal roles
    pub fn new<P: AsRef<Path>>(path: P, signals: SignalMap) -> Result<Self> {
        let file = File::open(path)?;
        let mut archive = ZipArchive::new(file)?;
        let header = Self::parse_header(&mut archive)?;

        signals.validate(header.total_probes)?;

        Ok(Self {
            name: "capture_file_source".to_string(),
            archive: Arc::new(Mutex::new(archive)),
            header,
            blocks: Arc::new(Mutex::new(HashMap::new())),
            signals,
            max_samples: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            threads_completed: Arc::new(AtomicUsize::new(0)),
            thread_handles: None,
            threads_spawned: false,
            num_threads: 0,
        })
    }

    fn parse_header(archive: &mut ZipArchive<File>) -> Result<CaptureHeader> {
        let mut header_file = archive
            .by_name("header")
            .map_err(|e| CaptureError::ParseHeader(format!("Cannot find header file: {}", e)))?;

        let mut header_content = String::new();
        header_file.read_to_string(&mut header_content)?;
        drop(header_file); // Explicitly drop to release archive borrow

        let mut total_probes: Option<usize> = None;
        let mut samplerate: Option<String> = None;
        let mut total_samples: Option<u64> = None;
        let mut total_blocks: Option<u64> = None;
        let mut probe_names_map: HashMap<usize, String> = HashMap::new();

        for line in header_content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(value) = line.strip_prefix("total probes = ") {
                total_probes = value.parse().ok();
            } else if let Some(value) = line.strip_prefix("samplerate = ") {
                samplerate = Some(value.to_string());
            } else if let Some(value) = line.strip_prefix("total samples = ") {
                total_samples = value.parse().ok();
            } else if let Some(value) = line.strip_prefix("total blocks = ") {
                total_blocks = value.parse().ok();
            } else if line.starts_with("probe")
                && let Some((probe_part, name)) = line.split_once(" = ")
                && let Some(num_str) = probe_part.strip_prefix("probe")
                && let Ok(probe_num) = num_str.parse::<usize>()
            {
                probe_names_map.insert(probe_num, name.to_string());
            }
        }

        let total_probes =
            total_probes.ok_or_else(|| CaptureError::MissingField("total probes".to_string()))?;
        let samplerate =
            samplerate.ok_or_else(|| CaptureError::MissingField("samplerate".to_string()))?;
        let total_samples =
            total_samples.ok_or_else(|| CaptureError::MissingField("total samples".to_string()))?;
        let total_blocks =
            total_blocks.ok_or_else(|| CaptureError::MissingField("total blocks".to_string()))?;

        let samplerate_hz = Self::parse_sample_rate(&samplerate).ok_or_else(|| {
            CaptureError::ParseHeader(format!("Invalid sample rate: {}", samplerate))
        })?;
        let sample_period = 1.0 / samplerate_hz;

        // Determine actual block size by reading the first block (blocks are fixed-size except last)
        let samples_per_block = {
            let block_name = "L-0/0";
            let mut file = archive
                .by_name(block_name)
                .map_err(|_| CaptureError::ParseHeader("Could not read first block".to_string()))?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf).map_err(|_| {
                CaptureError::ParseHeader("Could not read first block data".to_string())
            })?;
            (buf.len() * 8) as u64 // Convert bytes to bits/samples
        };

        debug!(
            "Capture has {} samples across {} blocks ({} samples/block standard size)",
            total_samples, total_blocks, samples_per_block
        );

        let probe_names = (0..total_probes)
            .map(|i| {
                probe_names_map
                    .get(&i)
                    .cloned()
                    .unwrap_or_else(|| format!("Probe{}", i))
            })
            .collect();

        Ok(CaptureHeader {
            total_probes,
            samplerate,
            samplerate_hz,
            sample_period,
            total_samples,
            total_blocks,
            samples_per_block,
            probe_names,
        })
    }

    /// Get the header information
    pub fn header(&self) -> &CaptureHeader {
        &self.header
    }

    /// Get the probe-to-role assignment
    pub fn signals(&self) -> SignalMap {
        self.signals
    }

    /// Get the total number of samples
    pub fn total_samples(&self) -> u64 {
        self.header.total_samples
    }

    /// Get the total capture duration in seconds
    pub fn capture_duration(&self) -> f64 {
        self.header.total_samples as f64 * self.header.sample_period
    }

    /// Set custom name (builder pattern)
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set maximum number of samples to read from the capture (for benchmarking)
    pub fn with_max_samples(mut self, max_samples: Option<u64>) -> Self {
        self.max_samples = max_samples;
        self
    }

    // ── Associated Functions (Helpers) ──────────────────────────────────

    /// Extract a single bit from a packed block at the given bit index (LSB-first)
    #[inline]
    fn get_bit(data: &[u8], bit_index: usize) -> bool {
        let byte_index = bit_index / 8;
        let bit_offset = bit_index % 8;

        if byte_index < data.len() {
            (data[byte_index] >> bit_offset) & 1 == 1
        } else {
            false
        }
    }

    /// Parse a sample rate string (e.g., "50 MHz") into Hz
    fn parse_sample_rate(samplerate: &str) -> Option<f64> {
        let parts: Vec<&str> = samplerate.split_whitespace().collect();
        if parts.len() >= 2
            && let Ok(value) = parts[0].parse::<f64>()
        {
            let multiplier = match parts[1] {
                "GHz" => 1_000_000_000.0,
                "MHz" => 1_000_000.0,
                "KHz" | "kHz" => 1_000.0,
                "Hz" => 1.0,
                _ => return None,
            };
            return Some(value * multiplier);
        }
        None
    }

    /// Worker thread that reads one probe's data and sends to one destination.
    ///
    /// Each thread loads blocks from the shared ZipArchive + cache, walks bits
    /// to detect transitions, and sends Samples to its destination. Threads
    /// are fully independent — if a signal is broadcast to multiple
    /// destinations, each destination gets its own thread reading the same
    /// probe data, so slow destinations don't block fast ones.
    ///
    /// Cross-signal temporal alignment is handled downstream using sample
    /// indices (the decoder's `value_at`).
    fn probe_reader_thread(config: ProbeReaderConfig) {
        let ProbeReaderConfig {
            archive,
            blocks,
            role,
            probe,
            header,
            sender,
            max_samples,
            shutdown,
            completed,
        } = config;
        let total_samples = max_samples
            .unwrap_or(header.total_samples)
            .min(header.total_samples);

        let mut current_value = false;
        let mut value_start: u64 = 0;
        let mut position: u64 = 0;
        let mut items_sent: u64 = 0;

        info!(
            "[{}] Starting reader thread for probe {} ({} samples, {} blocks)",
            role, probe, total_samples, header.total_blocks
        );

        for block_num in 0..header.total_blocks {
            if shutdown.load(Ordering::Relaxed) {
                debug!("[{}] Shutdown signal received at block {}", role, block_num);
                break;
            }

            // Check if we've exceeded our sample limit
            let block_start_position = block_num * header.samples_per_block;
            if block_start_position >= total_samples {
                break;
            }

            // Load block data (check cache first, then archive)
            let block_data = {
                let key = (probe, block_num);

                let cache_guard = blocks.lock().unwrap();
                if let Some(data) = cache_guard.get(&key) {
                    Arc::clone(data)
                } else {
                    drop(cache_guard);

                    // Load from archive
                    let block_name = format!("L-{}/{}", probe, block_num);
                    let data = {
                        let mut archive_guard = archive.lock().unwrap();
                        let mut file = match archive_guard.by_name(&block_name) {
                            Ok(f) => f,
                            Err(_) => {
                                debug!("[{}] Block {} not found, stopping", role, block_num);
                                break;
                            }
                        };
                        let mut buf = Vec::new();
                        if file.read_to_end(&mut buf).is_err() {
                            debug!("[{}] Failed to read block {}", role, block_num);
                            break;
                        }
                        Arc::<[u8]>::from(buf)
                    };

                    // Insert into cache
                    let mut cache_guard = blocks.lock().unwrap();
                    cache_guard.insert(key, Arc::clone(&data));
                    data
                }
            };

            // Walk bits in this block, detecting transitions
            let block_capacity = (block_data.len() * 8) as u64;
            let samples_in_block = block_capacity.min(total_samples - block_start_position);

            for sample_in_block in 0..samples_in_block as usize {
                let value = Self::get_bit(&block_data, sample_in_block);

                if position == 0 {
                    current_value = value;
                    value_start = 0;
                } else if value != current_value {
                    let transition = Sample::new(current_value, value_start);
                    if sender.send(transition).is_err() {
                        debug!("[{}] All receivers disconnected at position {}", role, position);
                        completed.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    items_sent += 1;

                    current_value = value;
                    value_start = position;
                }

                position += 1;
            }

            if block_num > 0 && block_num % 10 == 0 {
                let pct = (position as f64 / total_samples as f64) * 100.0;
                debug!(
                    "[{}] Progress: {:.1}% ({} samples, {} transitions sent)",
                    role, pct, position, items_sent
                );
            }
        }

        // Send the trailing level, then signal end-of-stream
        if position > 0 {
            let final_sample = Sample::new(current_value, value_start);
            let _ = sender.send(final_sample);
            items_sent += 1;
        }
        sender.close();

        info!(
            "[{}] Reader complete: {} samples, {} transitions sent",
            role, position, items_sent
        );

        drop(sender);
        completed.fetch_add(1, Ordering::Relaxed);
    }
}

impl ProcessNode for CaptureFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn should_stop(&self) -> bool {
        self.threads_spawned && self.threads_completed.load(Ordering::Relaxed) >= self.num_threads
    }

    fn is_self_threading(&self) -> bool {
        true
    }

    fn num_inputs(&self) -> usize {
        0 // Source node
    }

    fn num_outputs(&self) -> usize {
        ROLE_NAMES.len()
    }

    fn output_schema(&self) -> Vec<crate::runtime::ports::PortSchema> {
        use crate::runtime::ports::{PortDirection, PortSchema};

        ROLE_NAMES
            .iter()
            .enumerate()
            .map(|(i, role)| PortSchema::new::<Sample>(*role, i, PortDirection::Output))
            .collect()
    }

    fn work(&mut self, _inputs: &[InputPort], outputs: &[OutputPort]) -> WorkResult<usize> {
        use crate::runtime::node::WorkError;

        if self.threads_spawned {
            // Already started - this shouldn't be called again for self-threading nodes
            return Err(WorkError::NodeError(
                "work() called multiple times on self-threading node".to_string(),
            ));
        }

        // First and only call: spawn one thread per connected output destination
        self.threads_spawned = true;

        info!(
            "Capture source: spawning per-destination threads for {} samples ({})",
            self.header.total_samples, self.header.samplerate
        );

        // Collect all role-destination pairs to spawn threads for.
        // Each destination gets its own independent reader thread.
        let mut thread_configs: Vec<(usize, usize, Sender<Sample>)> = Vec::new();
        for (role_idx, _) in ROLE_NAMES.iter().enumerate() {
            if let Some(senders) = outputs
                .get(role_idx)
                .and_then(|port| port.split_senders::<Sample>())
            {
                for (dest_idx, sender) in senders.into_iter().enumerate() {
                    thread_configs.push((role_idx, dest_idx, sender));
                }
            }
        }

        let probes = self.signals.probes();
        let mut handles = Vec::new();

        for (role_idx, dest_idx, sender) in thread_configs.into_iter() {
            let archive = Arc::clone(&self.archive);
            let blocks = Arc::clone(&self.blocks);
            let header = self.header.clone();
            let max_samples = self.max_samples;
            let shutdown = Arc::clone(&self.shutdown);
            let completed = Arc::clone(&self.threads_completed);
            let role = ROLE_NAMES[role_idx];
            let probe = probes[role_idx];

            let handle = std::thread::Builder::new()
                .name(format!("capture_{}_dest{}", role, dest_idx))
                .spawn(move || {
                    Self::probe_reader_thread(ProbeReaderConfig {
                        archive,
                        blocks,
                        role,
                        probe,
                        header,
                        sender,
                        max_samples,
                        shutdown,
                        completed,
                    });
                })
                .expect("Failed to spawn capture reader thread");

            handles.push(handle);
        }

        self.num_threads = handles.len();
        self.thread_handles = Some(handles);

        info!("Capture source: spawned {} reader threads", self.num_threads);

        Ok(0)
    }
}

impl Drop for CaptureFileSource {
    fn drop(&mut self) {
        // Signal all threads to stop
        self.shutdown.store(true, Ordering::Relaxed);

        // Join all thread handles
        if let Some(handles) = self.thread_handles.take() {
            for handle in handles {
                let _ = handle.join();
            }
        }
    }
}

// ============================================================================
// Per-probe thread function
// ============================================================================

/// Configuration for a per-probe reader thread
struct ProbeReaderConfig {
    archive: Arc<Mutex<ZipArchive<File>>>,
    blocks: BlockCache,
    role: &'static str,
    probe: usize,
    header: CaptureHeader,
    sender: Sender<Sample>,
    max_samples: Option<u64>,
    shutdown: Arc<AtomicBool>,
    completed: Arc<AtomicUsize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sample_rate_valid() {
        assert_eq!(
            CaptureFileSource::parse_sample_rate("50 MHz"),
            Some(50_000_000.0)
        );
        assert_eq!(
            CaptureFileSource::parse_sample_rate("1 GHz"),
            Some(1_000_000_000.0)
        );
        assert_eq!(CaptureFileSource::parse_sample_rate("100 kHz"), Some(100_000.0));
        assert_eq!(CaptureFileSource::parse_sample_rate("100 KHz"), Some(100_000.0));
        assert_eq!(CaptureFileSource::parse_sample_rate("1000 Hz"), Some(1000.0));
        assert_eq!(
            CaptureFileSource::parse_sample_rate("2.5 MHz"),
            Some(2_500_000.0)
        );
    }

    #[test]
    fn test_parse_sample_rate_invalid() {
        assert_eq!(CaptureFileSource::parse_sample_rate("invalid"), None);
        assert_eq!(CaptureFileSource::parse_sample_rate("50"), None);
        assert_eq!(CaptureFileSource::parse_sample_rate("MHz 50"), None);
        assert_eq!(CaptureFileSource::parse_sample_rate("50 mhz"), None);
        assert_eq!(CaptureFileSource::parse_sample_rate(""), None);
        assert_eq!(CaptureFileSource::parse_sample_rate("abc MHz"), None);
    }

    #[test]
    fn test_get_bit() {
        let data = vec![0b10101010, 0b11001100];
        assert!(!CaptureFileSource::get_bit(&data, 0)); // bit 0 of byte 0
        assert!(CaptureFileSource::get_bit(&data, 1)); // bit 1 of byte 0
        assert!(!CaptureFileSource::get_bit(&data, 2)); // bit 2 of byte 0
        assert!(CaptureFileSource::get_bit(&data, 3)); // bit 3 of byte 0
        assert!(CaptureFileSource::get_bit(&data, 7)); // bit 7 of byte 0
        assert!(!CaptureFileSource::get_bit(&data, 8)); // bit 0 of byte 1
        assert!(!CaptureFileSource::get_bit(&data, 9)); // bit 1 of byte 1
        assert!(CaptureFileSource::get_bit(&data, 10)); // bit 2 of byte 1
        assert!(CaptureFileSource::get_bit(&data, 11)); // bit 3 of byte 1

        // Out of bounds
        assert!(!CaptureFileSource::get_bit(&data, 16));
        assert!(!CaptureFileSource::get_bit(&data, 100));
    }

    #[test]
    fn test_signal_map_rejects_duplicate_probes() {
        let map = SignalMap { clk: 0, sd: 0, load: 2 };
        assert!(map.validate(8).is_err());

        let map = SignalMap { clk: 0, sd: 1, load: 1 };
        assert!(map.validate(8).is_err());
    }

    #[test]
    fn test_signal_map_rejects_out_of_range_probe() {
        let map = SignalMap { clk: 0, sd: 1, load: 8 };
        let err = map.validate(8).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidProbe(8)));
    }

    #[test]
    fn test_signal_map_accepts_distinct_probes() {
        let map = SignalMap { clk: 5, sd: 3, load: 7 };
        assert!(map.validate(8).is_ok());
        assert_eq!(map.probes(), [5, 3, 7]);
    }

    #[test]
    fn test_source_invalid_file() {
        let map = SignalMap { clk: 0, sd: 1, load: 2 };
        let result = CaptureFileSource::new("nonexistent.dsl", map);
        assert!(result.is_err());
    }
}
