//! Example: decoding YM3014 DAC words from a capture file
//!
//! Reconstructs the DAC's floating-point output from a DSLogic capture of
//! the clock, serial-data and load signals, printing each decoded word.
//!
//! Usage:
//!   cargo run --release --example decode -- \
//!       --file capture.dsl \
//!       --clk 0 --sd 1 --load 2 \
//!       -n 100
//!
//! With a normalized 16-bit output stream (little-endian u16 per word):
//!   cargo run --release --example decode -- \
//!       --file capture.dsl \
//!       --clk 0 --sd 1 --load 2 \
//!       --normalized-output out.raw

use clap::Parser;
use std::fs::File;
use std::io::{BufWriter, Write};
use tracing::info;
use ym3014::{
    Annotation, CaptureFileSource, DecodedSample, InputPort, OutputPort, Pipeline, ProcessNode,
    SignalMap, WorkError, WorkResult, Ym3014Decoder,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the capture file
    #[arg(short, long)]
    file: String,

    /// Probe number of the bit clock
    #[arg(long)]
    clk: usize,

    /// Probe number of the serial data line
    #[arg(long)]
    sd: usize,

    /// Probe number of the load strobe
    #[arg(long)]
    load: usize,

    /// Number of words to decode (0 = unlimited)
    #[arg(short, long, default_value = "100")]
    n: usize,

    /// Also print bit/field annotations
    #[arg(long)]
    annotations: bool,

    /// Stop reading the capture after this many samples (for benchmarking)
    #[arg(long)]
    max_samples: Option<u64>,

    /// Write the normalized 16-bit output stream to this file
    #[arg(long)]
    normalized_output: Option<String>,
}

/// Sink that prints decoded words
struct WordPrinter {
    count: usize,
    max_words: usize,
}

impl WordPrinter {
    fn new(max_words: usize) -> Self {
        Self { count: 0, max_words }
    }
}

impl ProcessNode for WordPrinter {
    fn name(&self) -> &str {
        "word_printer"
    }

    fn should_stop(&self) -> bool {
        self.max_words > 0 && self.count >= self.max_words
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn num_outputs(&self) -> usize {
        0 // Sink
    }

    fn input_schema(&self) -> Vec<ym3014::PortSchema> {
        use ym3014::{PortDirection, PortSchema};
        vec![PortSchema::new::<DecodedSample>("samples", 0, PortDirection::Input)]
    }

    fn work(&mut self, inputs: &[InputPort], _outputs: &[OutputPort]) -> WorkResult<usize> {
        let mut input_buffer = std::collections::VecDeque::new();
        let mut input = inputs
            .first()
            .and_then(|port| port.get::<DecodedSample>(&mut input_buffer))
            .ok_or_else(|| WorkError::NodeError("Missing input channel".to_string()))?;

        let decoded = input.recv()?;

        self.count += 1;
        info!(
            "Word #{}: mantissa={:.10} exponent={} vout={:.6}V normalized={} at {}",
            self.count,
            decoded.mantissa,
            decoded.exponent,
            decoded.vout,
            decoded.normalized,
            decoded.span
        );

        if self.max_words > 0 && self.count >= self.max_words {
            info!("[WordPrinter] Max words ({}) reached, shutting down", self.max_words);
            return Err(WorkError::Shutdown);
        }

        Ok(1)
    }
}

/// Sink that prints decoder annotations
struct AnnotationPrinter;

impl ProcessNode for AnnotationPrinter {
    fn name(&self) -> &str {
        "annotation_printer"
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn num_outputs(&self) -> usize {
        0 // Sink
    }

    fn input_schema(&self) -> Vec<ym3014::PortSchema> {
        use ym3014::{PortDirection, PortSchema};
        vec![PortSchema::new::<Annotation>("annotations", 0, PortDirection::Input)]
    }

    fn work(&mut self, inputs: &[InputPort], _outputs: &[OutputPort]) -> WorkResult<usize> {
        let mut input_buffer = std::collections::VecDeque::new();
        let mut input = inputs
            .first()
            .and_then(|port| port.get::<Annotation>(&mut input_buffer))
            .ok_or_else(|| WorkError::NodeError("Missing input channel".to_string()))?;

        let ann = input.recv()?;
        info!("{:?} {}: {}", ann.kind, ann.span, ann.text);

        Ok(1)
    }
}

/// Sink that writes the normalized output stream as little-endian u16
struct NormalizedWriter {
    writer: BufWriter<File>,
    count: usize,
}

impl NormalizedWriter {
    fn new(path: &str) -> Result<Self, std::io::Error> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            count: 0,
        })
    }
}

impl ProcessNode for NormalizedWriter {
    fn name(&self) -> &str {
        "normalized_writer"
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn num_outputs(&self) -> usize {
        0 // Sink
    }

    fn input_schema(&self) -> Vec<ym3014::PortSchema> {
        use ym3014::{PortDirection, PortSchema};
        vec![PortSchema::new::<u16>("normalized", 0, PortDirection::Input)]
    }

    fn work(&mut self, inputs: &[InputPort], _outputs: &[OutputPort]) -> WorkResult<usize> {
        let mut input_buffer = std::collections::VecDeque::new();
        let mut input = inputs
            .first()
            .and_then(|port| port.get::<u16>(&mut input_buffer))
            .ok_or_else(|| WorkError::NodeError("Missing input channel".to_string()))?;

        let value = input.recv()?;

        self.writer
            .write_all(&value.to_le_bytes())
            .map_err(|e| WorkError::NodeError(format!("Write error: {}", e)))?;
        self.count += 1;

        Ok(1)
    }
}

impl Drop for NormalizedWriter {
    fn drop(&mut self) {
        let _ = self.writer.flush();
        info!("[NormalizedWriter] Wrote {} values", self.count);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("=== YM3014 Decode Example ===");
    info!("File: {}", args.file);
    info!("Signals: CLK={}, SD={}, LOAD={}", args.clk, args.sd, args.load);

    let map = SignalMap {
        clk: args.clk,
        sd: args.sd,
        load: args.load,
    };

    // Create pipeline with large buffers
    let mut pipeline = Pipeline::new().with_default_buffer_size(1_000_000);

    // Add the capture source and decoder
    let source = CaptureFileSource::new(&args.file, map)?.with_max_samples(args.max_samples);
    pipeline.add_process("source", source)?;
    pipeline.add_process("decoder", Ym3014Decoder::new())?;

    // Wire decoder inputs from the source
    pipeline.connect("source", "clk", "decoder", "clk")?;
    pipeline.connect("source", "sd", "decoder", "sd")?;
    pipeline.connect("source", "load", "decoder", "load")?;

    // Add the word printer sink
    pipeline.add_process("printer", WordPrinter::new(args.n))?;
    pipeline.connect("decoder", "samples", "printer", "samples")?;

    // Optionally print annotations
    if args.annotations {
        pipeline.add_process("annotations", AnnotationPrinter)?;
        pipeline.connect("decoder", "annotations", "annotations", "annotations")?;
    }

    // Optionally write the normalized output stream
    if let Some(path) = &args.normalized_output {
        info!("Normalized output: {}", path);
        pipeline.add_process("normalized_writer", NormalizedWriter::new(path)?)?;
        pipeline.connect("decoder", "normalized", "normalized_writer", "normalized")?;
    }

    // Build and run
    info!("Building pipeline...");
    let scheduler = pipeline.build()?;

    info!("Running...");
    scheduler.wait();

    info!("Done!");

    Ok(())
}
