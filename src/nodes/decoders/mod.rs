//! Protocol decoder nodes
//!
//! The YM3014 decoder and the data types it produces.

pub mod shift_register;
pub mod types;
pub mod word;
pub mod ym3014;

// Re-export common types
pub use types::{Annotation, AnnotationKind, Bit, DecodedSample, Span};

// Re-export the decoder pieces
pub use shift_register::{Observed, ShiftOutcome, ShiftRegister};
pub use word::Word;
pub use ym3014::Ym3014Decoder;
