//! Port-based API for ergonomic node connections
//!
//! Provides InputPort and OutputPort type-erased wrappers for channel
//! endpoints, plus the port schema type nodes use to describe themselves
//! (e.g. the decoder's `clk`/`sd`/`load` inputs).

use std::any::TypeId;

pub use super::errors::{ConnectionError, PortError};
pub use super::pipeline::Pipeline;
pub use super::receiver::Receiver;
pub use super::sender::Sender;
pub use super::type_registry::register_type;
pub use super::watchdog::{Watchdog, WatchdogHandle};

use super::sender::ChannelMessage;
use crossbeam_channel::Receiver as CrossbeamReceiver;
use std::fmt;
use std::sync::atomic::AtomicBool;

/// Direction of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// Schema describing a port's metadata
#[derive(Debug, Clone)]
pub struct PortSchema {
    pub name: String,
    pub type_id: TypeId,
    pub index: usize,
    pub direction: PortDirection,
}

impl PortSchema {
    /// Create a new port schema with type information
    pub fn new<T: 'static>(name: impl Into<String>, index: usize, direction: PortDirection) -> Self {
        Self {
            name: name.into(),
            type_id: TypeId::of::<T>(),
            index,
            direction,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Type-erased port wrappers
// ────────────────────────────────────────────────────────────────────────────

/// Type-erased input port wrapping a crossbeam receiver
///
/// Owns the end-of-stream flag for its channel so the cached EOS state in
/// [`Receiver`] survives across `work()` calls.
pub struct InputPort {
    channel: Box<dyn std::any::Any + Send>,
    watchdog_handle: Option<WatchdogHandle>,
    eos: AtomicBool,
}

impl InputPort {
    /// Create from type-erased box (for internal use by Pipeline).
    /// Watchdog must be attached via with_watchdog() before use.
    pub(crate) fn from_type_erased(channel: Box<dyn std::any::Any + Send>) -> Self {
        Self {
            channel,
            watchdog_handle: None,
            eos: AtomicBool::new(false),
        }
    }

    /// Create a new InputPort with a watchdog (for testing).
    pub fn new_with_watchdog<T: Send + 'static>(
        receiver: CrossbeamReceiver<ChannelMessage<T>>,
        watchdog: &Watchdog,
        node_name: &str,
        port_name: &str,
    ) -> Self {
        Self {
            channel: Box::new(receiver),
            watchdog_handle: Some(watchdog.register_port(node_name, "recv", port_name)),
            eos: AtomicBool::new(false),
        }
    }

    /// Set watchdog context for this port
    pub(crate) fn with_watchdog(
        mut self,
        watchdog: Watchdog,
        node_name: String,
        port_name: String,
    ) -> Self {
        self.watchdog_handle = Some(watchdog.register_port(&node_name, "recv", &port_name));
        self
    }

    /// Get a Receiver with automatic watchdog monitoring.
    ///
    /// Returns None if the port doesn't carry a channel of `T` (e.g. an
    /// unconnected input).
    ///
    /// # Panics
    /// Panics if watchdog has not been attached to this port.
    pub fn get<'a, T: Send + 'static>(
        &'a self,
        buffer: &'a mut std::collections::VecDeque<T>,
    ) -> Option<Receiver<'a, T>> {
        let receiver = self
            .channel
            .downcast_ref::<CrossbeamReceiver<ChannelMessage<T>>>()?;
        let watchdog = self
            .watchdog_handle
            .as_ref()
            .expect("InputPort.get() called before watchdog attached - this is a bug in the pipeline");
        Some(Receiver::new(receiver, buffer, watchdog.clone(), &self.eos))
    }
}

/// Type-erased output port wrapping a Sender<T>
pub struct OutputPort {
    channel: Box<dyn std::any::Any + Send>,
    watchdog_handle: Option<WatchdogHandle>,
}

impl OutputPort {
    /// Create from type-erased box (for internal use by Pipeline).
    /// Watchdog must be attached via with_watchdog() before use.
    pub(crate) fn from_type_erased(channel: Box<dyn std::any::Any + Send>) -> Self {
        Self {
            channel,
            watchdog_handle: None,
        }
    }

    /// Create a new OutputPort with a watchdog (for testing).
    pub fn new_with_watchdog<T: Send + Clone + 'static>(
        sender: Sender<T>,
        watchdog: &Watchdog,
        node_name: &str,
        port_name: &str,
    ) -> Self {
        Self {
            channel: Box::new(sender),
            watchdog_handle: Some(watchdog.register_port(node_name, "send", port_name)),
        }
    }

    /// Set watchdog context for this port
    pub(crate) fn with_watchdog(
        mut self,
        watchdog: Watchdog,
        node_name: String,
        port_name: String,
    ) -> Self {
        self.watchdog_handle = Some(watchdog.register_port(&node_name, "send", &port_name));
        self
    }

    /// Get a Sender with automatic watchdog monitoring.
    /// Returns an owned sender (cheaply cloned from internal storage).
    ///
    /// Returns None if the port doesn't carry a Sender<T> (e.g. an
    /// unconnected output — nodes with optional outputs check this).
    ///
    /// # Panics
    /// Panics if watchdog has not been attached to this port.
    pub fn get<T: Send + Clone + 'static>(&self) -> Option<Sender<T>> {
        let sender = self.channel.downcast_ref::<Sender<T>>()?;
        let watchdog = self
            .watchdog_handle
            .as_ref()
            .expect("OutputPort.get() called before watchdog attached - this is a bug in the pipeline");
        Some(sender.with_watchdog(watchdog.clone()))
    }

    /// Split the underlying broadcast Sender into individual senders (one per
    /// destination).
    ///
    /// For nodes that spawn their own worker threads (e.g. `CaptureFileSource`),
    /// this allows one thread per destination. Each returned Sender sends to
    /// exactly one destination.
    ///
    /// Returns None if the port doesn't contain a Sender<T>, or if the sender
    /// has no destinations.
    pub fn split_senders<T: Send + Clone + 'static>(&self) -> Option<Vec<Sender<T>>> {
        let sender = self.channel.downcast_ref::<Sender<T>>()?;
        let splits = sender.split_senders();
        if splits.is_empty() { None } else { Some(splits) }
    }
}

impl fmt::Debug for OutputPort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "OutputPort")
    }
}
