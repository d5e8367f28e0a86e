//! YM3014 serial floating-point DAC decoder with a streaming node-based API
//!
//! This library decodes the three-wire synchronous serial protocol (clock,
//! serial data, load strobe) of the Yamaha YM3014 DAC, reconstructing the
//! 13-bit floating-point words it carries into analog output values plus
//! per-bit and per-field timing annotations.
//!
//! # Architecture
//!
//! - **CaptureFileSource**: streams the three monitored signals from a
//!   DSLogic .dsl capture archive with on-demand ZIP block reads
//! - **Ym3014Decoder**: clock-edge driven decoder node (sliding shift
//!   register + floating-point word reconstruction)
//! - **Streaming runtime**: thread-per-node execution with crossbeam channels
//!
//! # Example
//!
//! ```no_run
//! use ym3014::{CaptureFileSource, Pipeline, SignalMap, Ym3014Decoder};
//!
//! let mut pipeline = Pipeline::new();
//! let map = SignalMap { clk: 0, sd: 1, load: 2 };
//! pipeline.add_process("source", CaptureFileSource::new("capture.dsl", map)?)?;
//! pipeline.add_process("decoder", Ym3014Decoder::new())?;
//! // ... connect clk/sd/load and output sinks, then build and run
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use thiserror::Error;

pub mod nodes;
pub mod runtime;

// Re-export decoder data types
pub use nodes::decoders::{
    Annotation, AnnotationKind, Bit, DecodedSample, ShiftRegister, Span, Word, Ym3014Decoder,
};

// Re-export the capture source
pub use nodes::{CaptureFileSource, CaptureHeader, SignalMap};

// Re-export data types from runtime
pub use runtime::Sample;

// Re-export streaming runtime components
pub use runtime::{
    ConnectionError, InputPort, OutputPort, Pipeline, PortDirection, PortError, PortSchema,
    ProcessNode, Scheduler, WorkError, WorkResult, register_type,
};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Header parsing error: {0}")]
    ParseHeader(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid probe number: {0}")]
    InvalidProbe(usize),
}

pub type Result<T> = std::result::Result<T, CaptureError>;
