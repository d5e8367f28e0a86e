//! Node-based signal processing system
//!
//! Streaming nodes for decoding the YM3014 serial bitstream:
//! - **CaptureFileSource**: streams the three monitored signals out of a
//!   DSLogic capture file
//! - **Ym3014Decoder**: reconstructs floating-point words from clock edges
//! - All connected via crossbeam channels, one thread per node

pub mod capture_file;
pub mod decoders;

// Export the capture source and related types
pub use capture_file::{CaptureFileSource, CaptureHeader, SignalMap};

// Re-export Sample from runtime
pub use crate::runtime::Sample;
