//! Runtime support for streaming node graphs

pub mod errors;
pub mod node;
pub mod pipeline;
pub mod ports;
pub mod receiver;
pub mod sample;
pub mod scheduler;
pub mod sender;
pub mod type_registry;
pub mod watchdog;

pub use errors::{ConnectionError, PortError, WorkError, WorkResult};
pub use node::ProcessNode;
pub use ports::{InputPort, OutputPort, Pipeline, PortDirection, PortSchema, register_type};
pub use receiver::Receiver;
pub use sample::Sample;
pub use scheduler::Scheduler;
pub use sender::Sender;
pub use watchdog::Watchdog;
