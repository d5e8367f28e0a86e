//! YM3014 decoder — edge-by-edge sequential design
//!
//! Processes the three protocol signals one transition at a time using
//! [`Receiver`], which provides peek/putback semantics over a crossbeam
//! channel.
//!
//! Flow per clock cycle:
//!   1. Wait for the next rising edge on CLK (the only blocking point)
//!   2. Read the SD and LOAD levels at the edge's sample index
//!   3. Shift the SD bit into the sliding register
//!   4. On a falling LOAD edge with a full register, decode the 13-bit word
//!      and emit the decoded sample plus its field/output annotations
//!   5. Emit the cycle's bit annotations (all 13 when the register first
//!      fills, the newest bit afterwards)
//!
//! Any input channel ending terminates the session cleanly; a partial word
//! at end-of-stream is discarded, never reported as an error.

use super::shift_register::{Observed, ShiftRegister};
use super::types::{Annotation, AnnotationKind, Bit, DecodedSample};
use crate::runtime::Receiver;
use crate::runtime::node::{InputPort, OutputPort, ProcessNode, WorkError, WorkResult};
use crate::runtime::sample::Sample;
use crate::runtime::sender::Sender;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Clock edges processed per work() call before yielding to the scheduler
const MAX_EDGES_PER_CALL: usize = 1024;

/// YM3014 DAC decoder node
///
/// Inputs: clk, sd, load — Sample channels
/// Outputs (each optional): samples (DecodedSample), annotations
/// (Annotation), raw (f64 vout per word), normalized (u16 per word)
pub struct Ym3014Decoder {
    name: String,

    /// Per-channel putback buffers, persisted across work() calls.
    /// Indexed by CLK=0, SD=1, LOAD=2.
    channel_buffers: Vec<VecDeque<Sample>>,

    /// Tracks CLK state for edge detection across work() boundaries.
    prev_clk: bool,

    /// Sliding window over the serial-data stream.
    register: ShiftRegister,

    /// Word counter for logging.
    words_decoded: u64,
}

impl Ym3014Decoder {
    /// Create a new decoder
    pub fn new() -> Self {
        Self {
            name: "ym3014_decoder".to_string(),
            channel_buffers: (0..3).map(|_| VecDeque::new()).collect(),
            prev_clk: false,
            register: ShiftRegister::new(),
            words_decoded: 0,
        }
    }

    /// With custom name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Block until the clock transitions low→high, returning the sample
    /// index of the edge.
    ///
    /// Every rising edge is reported exactly once, in sample order. Returns
    /// `Err(Shutdown)` when the clock channel ends.
    fn next_rising_edge(clk: &mut Receiver<'_, Sample>, prev_clk: &mut bool) -> WorkResult<u64> {
        loop {
            let edge = clk.recv()?;
            let is_rising = !*prev_clk && edge.value;
            *prev_clk = edge.value;
            if is_rising {
                return Ok(edge.index);
            }
        }
    }

    /// Read the level of a signal channel at a given sample index.
    ///
    /// With the run-length-encoded Sample format, a transition is valid from
    /// its index until the next transition's index. We peek at the next
    /// transition to determine when the current one ends.
    ///
    /// Returns None if the channel is exhausted before the index is reached.
    fn value_at(channel: &mut Receiver<'_, Sample>, index: u64) -> WorkResult<Option<bool>> {
        loop {
            let current = match channel.recv() {
                Ok(sample) => sample,
                Err(WorkError::Shutdown) => {
                    debug!("Channel recv returned Shutdown at index {}", index);
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            match channel.peek() {
                Ok(next) => {
                    // Check if index is in [current.index, next.index)
                    if current.index <= index && index < next.index {
                        channel.put_back(current);
                        return Ok(Some(current.value));
                    }
                    // index >= next.index, current has ended - continue
                }
                Err(WorkError::Shutdown) => {
                    // Channel closed - current is the last transition and
                    // extends to the end of the capture
                    debug!("Channel peek returned Shutdown at index {}", index);
                    if current.index <= index {
                        channel.put_back(current);
                        return Ok(Some(current.value));
                    } else {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn send_bit_annotation(
        annotations: &Option<Sender<Annotation>>,
        bit: &Bit,
    ) -> WorkResult<()> {
        if let Some(out) = annotations {
            out.send(Annotation::new(
                AnnotationKind::Bit,
                bit.span,
                bit.value.to_string(),
            ))?;
        }
        Ok(())
    }
}

impl Default for Ym3014Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessNode for Ym3014Decoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_inputs(&self) -> usize {
        3
    }

    fn num_outputs(&self) -> usize {
        4
    }

    fn input_schema(&self) -> Vec<crate::runtime::ports::PortSchema> {
        use crate::runtime::ports::{PortDirection, PortSchema};

        vec![
            PortSchema::new::<Sample>("clk", 0, PortDirection::Input),
            PortSchema::new::<Sample>("sd", 1, PortDirection::Input),
            PortSchema::new::<Sample>("load", 2, PortDirection::Input),
        ]
    }

    fn output_schema(&self) -> Vec<crate::runtime::ports::PortSchema> {
        use crate::runtime::ports::{PortDirection, PortSchema};

        vec![
            PortSchema::new::<DecodedSample>("samples", 0, PortDirection::Output),
            PortSchema::new::<Annotation>("annotations", 1, PortDirection::Output),
            PortSchema::new::<f64>("raw", 2, PortDirection::Output),
            PortSchema::new::<u16>("normalized", 3, PortDirection::Output),
        ]
    }

    fn work(&mut self, inputs: &[InputPort], outputs: &[OutputPort]) -> WorkResult<usize> {
        // All outputs are optional: unconnected sinks are simply skipped.
        let samples_out = outputs.first().and_then(|port| port.get::<DecodedSample>());
        let annotations_out = outputs.get(1).and_then(|port| port.get::<Annotation>());
        let raw_out = outputs.get(2).and_then(|port| port.get::<f64>());
        let normalized_out = outputs.get(3).and_then(|port| port.get::<u16>());

        // Create named Receivers per channel with automatic watchdog
        let mut buf_iter = self.channel_buffers.iter_mut();
        let mut clk = inputs
            .first()
            .and_then(|p| p.get::<Sample>(buf_iter.next().unwrap()))
            .ok_or_else(|| WorkError::NodeError("Missing CLK input".into()))?;
        let mut sd = inputs
            .get(1)
            .and_then(|p| p.get::<Sample>(buf_iter.next().unwrap()))
            .ok_or_else(|| WorkError::NodeError("Missing SD input".into()))?;
        let mut load = inputs
            .get(2)
            .and_then(|p| p.get::<Sample>(buf_iter.next().unwrap()))
            .ok_or_else(|| WorkError::NodeError("Missing LOAD input".into()))?;

        let mut words_emitted: usize = 0;

        for _ in 0..MAX_EDGES_PER_CALL {
            // ── 1. Sample SD and LOAD on the next rising clock edge ─────
            let index = Self::next_rising_edge(&mut clk, &mut self.prev_clk)?;

            let sd_val = match Self::value_at(&mut sd, index)? {
                Some(v) => v,
                None => {
                    debug!("SD channel exhausted, ending decode session");
                    return Err(WorkError::Shutdown);
                }
            };
            let load_val = match Self::value_at(&mut load, index)? {
                Some(v) => v,
                None => {
                    debug!("LOAD channel exhausted, ending decode session");
                    return Err(WorkError::Shutdown);
                }
            };

            trace!("edge at {}: sd={}, load={}", index, sd_val, load_val);

            // ── 2. Shift into the register, latching on a falling LOAD ──
            let outcome = self.register.append(sd_val, load_val, index);

            // ── 3. Decode and emit a latched word ───────────────────────
            if let Some(word) = outcome.latched {
                let decoded = word.decode();

                self.words_decoded += 1;
                words_emitted += 1;
                debug!(
                    "#{}: vout={:.6}V normalized={} at {}",
                    self.words_decoded, decoded.vout, decoded.normalized, decoded.span
                );

                if let Some(out) = &annotations_out {
                    for ann in word.annotations(&decoded) {
                        out.send(ann)?;
                    }
                }
                if let Some(out) = &samples_out {
                    out.send(decoded)?;
                }
                if let Some(out) = &raw_out {
                    out.send(decoded.vout)?;
                }
                if let Some(out) = &normalized_out {
                    out.send(decoded.normalized)?;
                }
            }

            // ── 4. Emit the cycle's bit annotations ─────────────────────
            match outcome.observed {
                Observed::None => {}
                Observed::All => {
                    for bit in self.register.iter() {
                        Self::send_bit_annotation(&annotations_out, bit)?;
                    }
                }
                Observed::Newest => {
                    if let Some(bit) = self.register.newest() {
                        Self::send_bit_annotation(&annotations_out, bit)?;
                    }
                }
            }
        }

        Ok(words_emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Watchdog;
    use crate::runtime::sender::ChannelMessage;
    use crate::runtime::{InputPort, OutputPort, Sender};
    use crossbeam_channel::{Receiver as CrossbeamReceiver, bounded};

    struct Harness {
        inputs: Vec<InputPort>,
        outputs: Vec<OutputPort>,
        samples_rx: CrossbeamReceiver<ChannelMessage<DecodedSample>>,
        annotations_rx: CrossbeamReceiver<ChannelMessage<Annotation>>,
        raw_rx: CrossbeamReceiver<ChannelMessage<f64>>,
        normalized_rx: CrossbeamReceiver<ChannelMessage<u16>>,
    }

    /// Build decoder ports around the given per-signal streams. Each stream
    /// is a run-length-encoded list of transitions, terminated by
    /// end-of-stream.
    fn harness(clk: &[Sample], sd: &[Sample], load: &[Sample]) -> Harness {
        let watchdog = Watchdog::new();
        let mut inputs = Vec::new();

        for (port_name, stream) in [("clk", clk), ("sd", sd), ("load", load)] {
            let (tx, rx) = bounded::<ChannelMessage<Sample>>(stream.len() + 1);
            for sample in stream {
                tx.send(ChannelMessage::Sample(*sample)).unwrap();
            }
            tx.send(ChannelMessage::EndOfStream).unwrap();
            inputs.push(InputPort::new_with_watchdog(rx, &watchdog, "decoder", port_name));
        }

        let (samples_tx, samples_rx) = bounded::<ChannelMessage<DecodedSample>>(64);
        let (ann_tx, annotations_rx) = bounded::<ChannelMessage<Annotation>>(1024);
        let (raw_tx, raw_rx) = bounded::<ChannelMessage<f64>>(64);
        let (norm_tx, normalized_rx) = bounded::<ChannelMessage<u16>>(64);

        let outputs = vec![
            OutputPort::new_with_watchdog(Sender::new(vec![samples_tx]), &watchdog, "decoder", "samples"),
            OutputPort::new_with_watchdog(Sender::new(vec![ann_tx]), &watchdog, "decoder", "annotations"),
            OutputPort::new_with_watchdog(Sender::new(vec![raw_tx]), &watchdog, "decoder", "raw"),
            OutputPort::new_with_watchdog(Sender::new(vec![norm_tx]), &watchdog, "decoder", "normalized"),
        ];

        Harness {
            inputs,
            outputs,
            samples_rx,
            annotations_rx,
            raw_rx,
            normalized_rx,
        }
    }

    #[test]
    fn test_decoder_creation() {
        let decoder = Ym3014Decoder::new().with_name("dac");
        assert_eq!(decoder.name(), "dac");
        assert_eq!(decoder.num_inputs(), 3);
        assert_eq!(decoder.num_outputs(), 4);
        assert_eq!(decoder.channel_buffers.len(), 3); // CLK, SD, LOAD
    }

    fn drain<T>(rx: &CrossbeamReceiver<ChannelMessage<T>>) -> Vec<T> {
        let mut items = Vec::new();
        while let Ok(ChannelMessage::Sample(item)) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    /// Streams for `bits` clocked on rising edges at indices 1, 3, 5, ...,
    /// with the load strobe falling exactly on the final edge.
    fn word_streams(bits: &[u8]) -> (Vec<Sample>, Vec<Sample>, Vec<Sample>) {
        let mut clk = vec![Sample::new(false, 0)];
        for k in 0..bits.len() as u64 {
            clk.push(Sample::new(true, 2 * k + 1));
            clk.push(Sample::new(false, 2 * k + 2));
        }

        // SD changes just before each rising edge; run-length encode.
        let mut sd = Vec::new();
        let mut level = None;
        for (k, &bit) in bits.iter().enumerate() {
            let value = bit == 1;
            if level != Some(value) {
                sd.push(Sample::new(value, 2 * k as u64));
                level = Some(value);
            }
        }

        let last_edge = 2 * (bits.len() as u64 - 1) + 1;
        let load = vec![Sample::new(true, 0), Sample::new(false, last_edge)];

        (clk, sd, load)
    }

    #[test]
    fn test_end_to_end_word() {
        let bits = [1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0];
        let (clk, sd, load) = word_streams(&bits);
        let h = harness(&clk, &sd, &load);

        let mut decoder = Ym3014Decoder::new();
        // The session runs until the clock channel ends.
        let result = decoder.work(&h.inputs, &h.outputs);
        assert!(matches!(result, Err(WorkError::Shutdown)));

        // One decoded word with the reference values.
        let samples = drain(&h.samples_rx);
        assert_eq!(samples.len(), 1);
        let decoded = samples[0];
        assert_eq!(decoded.exponent, 1.0);
        assert_eq!(decoded.mantissa, 0.0009765625);
        assert_eq!(decoded.normalized, 32767);
        assert_eq!(decoded.span, crate::nodes::decoders::Span::new(1, 25));

        // Raw and normalized streams carry the same word.
        assert_eq!(drain(&h.raw_rx), vec![decoded.vout]);
        assert_eq!(drain(&h.normalized_rx), vec![32767]);

        // Field and output annotations first, then the 13 bit annotations.
        let anns = drain(&h.annotations_rx);
        assert_eq!(anns.len(), 16);
        assert_eq!(anns[0].kind, AnnotationKind::Mantissa);
        assert_eq!(anns[0].span, crate::nodes::decoders::Span::new(1, 19));
        assert_eq!(anns[1].kind, AnnotationKind::Exponent);
        assert_eq!(anns[1].span, crate::nodes::decoders::Span::new(21, 25));
        assert_eq!(anns[2].kind, AnnotationKind::Output);
        assert_eq!(anns[2].span, crate::nodes::decoders::Span::new(1, 25));

        for (k, ann) in anns[3..].iter().enumerate() {
            assert_eq!(ann.kind, AnnotationKind::Bit);
            assert_eq!(ann.text, bits[k].to_string());
            assert_eq!(ann.span.start, 2 * k as u64 + 1);
        }
    }

    #[test]
    fn test_short_stream_emits_nothing() {
        // 12 edges with a load strobe: the register never fills, so no word
        // and no bit annotations may appear.
        let bits = [1u8; 12];
        let (clk, sd, load) = word_streams(&bits);
        let h = harness(&clk, &sd, &load);

        let mut decoder = Ym3014Decoder::new();
        let result = decoder.work(&h.inputs, &h.outputs);
        assert!(matches!(result, Err(WorkError::Shutdown)));

        assert!(drain(&h.samples_rx).is_empty());
        assert!(drain(&h.annotations_rx).is_empty());
        assert!(drain(&h.raw_rx).is_empty());
        assert!(drain(&h.normalized_rx).is_empty());
    }

    #[test]
    fn test_no_word_without_falling_load() {
        // 13 edges, load held high throughout: the register fills (13 bit
        // annotations) but nothing latches.
        let bits = [1u8; 13];
        let (clk, sd, _) = word_streams(&bits);
        let load = vec![Sample::new(true, 0)];
        let h = harness(&clk, &sd, &load);

        let mut decoder = Ym3014Decoder::new();
        let result = decoder.work(&h.inputs, &h.outputs);
        assert!(matches!(result, Err(WorkError::Shutdown)));

        assert!(drain(&h.samples_rx).is_empty());
        let anns = drain(&h.annotations_rx);
        assert_eq!(anns.len(), 13);
        assert!(anns.iter().all(|a| a.kind == AnnotationKind::Bit));
    }

    #[test]
    fn test_sliding_second_word() {
        // 16 edges: strobe on the 13th edge latches bits 0..13, a second
        // strobe on the 16th edge latches the slid window (bits 3..16).
        let bits: [u8; 16] = [1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0];
        let mut clk = vec![Sample::new(false, 0)];
        for k in 0..16u64 {
            clk.push(Sample::new(true, 2 * k + 1));
            clk.push(Sample::new(false, 2 * k + 2));
        }
        let mut sd = Vec::new();
        let mut level = None;
        for (k, &bit) in bits.iter().enumerate() {
            let value = bit == 1;
            if level != Some(value) {
                sd.push(Sample::new(value, 2 * k as u64));
                level = Some(value);
            }
        }
        // Load: high, falls at edge 13 (index 25), rises at index 27,
        // falls again at edge 16 (index 31).
        let load = vec![
            Sample::new(true, 0),
            Sample::new(false, 25),
            Sample::new(true, 27),
            Sample::new(false, 31),
        ];

        let h = harness(&clk, &sd, &load);
        let mut decoder = Ym3014Decoder::new();
        let result = decoder.work(&h.inputs, &h.outputs);
        assert!(matches!(result, Err(WorkError::Shutdown)));

        let samples = drain(&h.samples_rx);
        assert_eq!(samples.len(), 2);

        // First word: bits 0..13 of the stream.
        assert_eq!(samples[0].span, crate::nodes::decoders::Span::new(1, 25));
        assert_eq!(samples[0].exponent, 1.0);

        // Second word: the window slid by three; its mantissa starts with
        // bit 3 and its exponent field is bits 13..16 (all zero).
        assert_eq!(samples[1].span, crate::nodes::decoders::Span::new(7, 31));
        assert_eq!(samples[1].exponent, 0.0);
        // Mantissa bits [0,0,0,0,0,0,0,1,0,0] — the stream's bit 10 lands at
        // window position 7.
        assert_eq!(
            samples[1].mantissa,
            -1.0 + 2.0_f64.powi(-7) + 2.0_f64.powi(-10)
        );

        // 13 bit annotations at fill + 3 newest-bit annotations afterwards,
        // plus 3 word annotations per decoded word.
        let anns = drain(&h.annotations_rx);
        let bit_anns = anns.iter().filter(|a| a.kind == AnnotationKind::Bit).count();
        assert_eq!(bit_anns, 16);
        assert_eq!(anns.len(), 16 + 6);
    }

    #[test]
    fn test_bit_annotations_are_index_ordered() {
        let bits = [0u8, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1];
        let (clk, sd, load) = word_streams(&bits);
        let h = harness(&clk, &sd, &load);

        let mut decoder = Ym3014Decoder::new();
        let _ = decoder.work(&h.inputs, &h.outputs);

        let anns = drain(&h.annotations_rx);
        let bit_spans: Vec<u64> = anns
            .iter()
            .filter(|a| a.kind == AnnotationKind::Bit)
            .map(|a| a.span.start)
            .collect();
        assert!(bit_spans.windows(2).all(|w| w[0] < w[1]));
    }
}
