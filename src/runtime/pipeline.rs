//! Pipeline builder for constructing node graphs

use super::errors::ConnectionError;
use super::node::{InputPort, OutputPort, ProcessNode};
use super::ports::PortSchema;
use super::scheduler::Scheduler;
use super::type_registry::TYPE_REGISTRY;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use tracing::{debug, info};

/// Pipeline builder that manages nodes and connections
pub struct Pipeline {
    nodes: Vec<(usize, Box<dyn ProcessNode>)>,
    node_names: HashMap<String, usize>,
    node_schemas: HashMap<usize, (Vec<PortSchema>, Vec<PortSchema>)>,
    connections: Vec<PendingConnection>,
    next_id: usize,
    default_buffer_size: usize,
}

pub(crate) struct PendingConnection {
    pub(crate) from_node: usize,
    pub(crate) from_port: usize,
    pub(crate) to_node: usize,
    pub(crate) to_port: usize,
    pub(crate) type_id: TypeId,
    pub(crate) buffer_size: usize,
}

impl Pipeline {
    /// Create a new pipeline
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            node_names: HashMap::new(),
            node_schemas: HashMap::new(),
            connections: Vec::new(),
            next_id: 0,
            default_buffer_size: 1000,
        }
    }

    /// Set the default buffer size for connections
    pub fn with_default_buffer_size(mut self, size: usize) -> Self {
        self.default_buffer_size = size;
        self
    }

    /// Add a process node by name (inputs/outputs determined automatically from node)
    pub fn add_process<N: ProcessNode + 'static>(
        &mut self,
        name: impl Into<String>,
        node: N,
    ) -> Result<(), String> {
        let name = name.into();

        if self.node_names.contains_key(&name) {
            return Err(format!("Node with name '{}' already exists", name));
        }

        let input_schemas = node.input_schema();
        let output_schemas = node.output_schema();

        let id = self.next_id;
        self.next_id += 1;

        self.node_schemas
            .insert(id, (input_schemas.clone(), output_schemas.clone()));
        self.node_names.insert(name, id);
        self.nodes.push((id, Box::new(node)));

        Ok(())
    }

    /// Connect two nodes by name and port name
    pub fn connect(
        &mut self,
        from_node: &str,
        from_port: &str,
        to_node: &str,
        to_port: &str,
    ) -> Result<(), Box<ConnectionError>> {
        self.connect_with_buffer(from_node, from_port, to_node, to_port, self.default_buffer_size)
    }

    /// Connect with custom buffer size
    pub fn connect_with_buffer(
        &mut self,
        from_node: &str,
        from_port: &str,
        to_node: &str,
        to_port: &str,
        buffer_size: usize,
    ) -> Result<(), Box<ConnectionError>> {
        // Look up node IDs
        let from_id = *self
            .node_names
            .get(from_node)
            .ok_or_else(|| Box::new(ConnectionError::NodeNotFound(from_node.to_string())))?;
        let to_id = *self
            .node_names
            .get(to_node)
            .ok_or_else(|| Box::new(ConnectionError::NodeNotFound(to_node.to_string())))?;

        // Get schemas
        let (_, from_outputs) = self
            .node_schemas
            .get(&from_id)
            .ok_or_else(|| Box::new(ConnectionError::NodeNotFound(from_node.to_string())))?;
        let (to_inputs, _) = self
            .node_schemas
            .get(&to_id)
            .ok_or_else(|| Box::new(ConnectionError::NodeNotFound(to_node.to_string())))?;

        // Find output port
        let from_schema = from_outputs
            .iter()
            .find(|s| s.name == from_port)
            .ok_or_else(|| {
                Box::new(ConnectionError::PortNotFound {
                    node: from_node.to_string(),
                    port: from_port.to_string(),
                })
            })?;

        // Find input port
        let to_schema = to_inputs.iter().find(|s| s.name == to_port).ok_or_else(|| {
            Box::new(ConnectionError::PortNotFound {
                node: to_node.to_string(),
                port: to_port.to_string(),
            })
        })?;

        // Type check
        if from_schema.type_id != to_schema.type_id {
            return Err(Box::new(ConnectionError::TypeMismatch {
                from_node: from_node.to_string(),
                from_port: from_port.to_string(),
                from_type: from_schema.type_id,
                to_node: to_node.to_string(),
                to_port: to_port.to_string(),
                to_type: to_schema.type_id,
            }));
        }

        // Check for duplicate connection to same input port
        if self
            .connections
            .iter()
            .any(|c| c.to_node == to_id && c.to_port == to_schema.index)
        {
            return Err(Box::new(ConnectionError::DuplicateConnection(format!(
                "Input port '{}' on node '{}' is already connected",
                to_port, to_node
            ))));
        }

        self.connections.push(PendingConnection {
            from_node: from_id,
            from_port: from_schema.index,
            to_node: to_id,
            to_port: to_schema.index,
            type_id: from_schema.type_id,
            buffer_size,
        });

        Ok(())
    }

    /// Build the pipeline and return a ready-to-run scheduler
    pub fn build(mut self) -> Result<Scheduler, String> {
        info!(
            "Building pipeline with {} nodes and {} connections",
            self.nodes.len(),
            self.connections.len()
        );

        let mut scheduler = Scheduler::new();
        let registry = TYPE_REGISTRY.lock().unwrap();

        // Phase 1: Create all channels, accumulating receivers and senders
        type PortKey = (usize, usize);
        let mut receivers: HashMap<PortKey, Box<dyn Any + Send>> = HashMap::new();
        let mut senders: HashMap<PortKey, (TypeId, Vec<Box<dyn Any + Send>>)> = HashMap::new();

        for conn in &self.connections {
            let (tx, rx) = registry
                .create_channel(conn.type_id, conn.buffer_size)
                .ok_or_else(|| {
                    format!(
                        "Type {:?} not registered. Call register_type::<T>() before building pipeline.",
                        conn.type_id
                    )
                })?;

            receivers.insert((conn.to_node, conn.to_port), rx);
            senders
                .entry((conn.from_node, conn.from_port))
                .or_insert_with(|| (conn.type_id, Vec::new()))
                .1
                .push(tx);
        }

        // Phase 2: Start all nodes, wrapping outputs inline
        let watchdog = scheduler.watchdog().clone();

        for (node_id, node) in self.nodes.drain(..) {
            let node_name = node.name().to_string();
            let num_inputs = node.num_inputs();
            let num_outputs = node.num_outputs();
            let input_schemas = node.input_schema();
            let output_schemas = node.output_schema();

            debug!("Starting node {}: {}", node_id, node_name);

            // Collect inputs (unconnected inputs are allowed - nodes may have optional inputs)
            let input_ports: Vec<_> = (0..num_inputs)
                .map(|i| {
                    let port = receivers
                        .remove(&(node_id, i))
                        .map(InputPort::from_type_erased)
                        .unwrap_or_else(|| {
                            // Unconnected input: use dummy port
                            InputPort::from_type_erased(Box::new(()) as Box<dyn Any + Send>)
                        });

                    let port_name = input_schemas
                        .get(i)
                        .map(|s| s.name.clone())
                        .unwrap_or_else(|| format!("in{}", i));
                    port.with_watchdog(watchdog.clone(), node_name.clone(), port_name)
                })
                .collect();

            // Collect outputs (unconnected outputs are allowed - nodes must check before sending)
            let output_ports: Result<Vec<_>, String> = (0..num_outputs)
                .map(|i| {
                    let port = if let Some((type_id, sender_list)) = senders.remove(&(node_id, i)) {
                        registry
                            .wrap_output(type_id, sender_list)
                            .map(OutputPort::from_type_erased)?
                    } else {
                        // Unconnected output: use dummy port
                        OutputPort::from_type_erased(Box::new(()) as Box<dyn Any + Send>)
                    };

                    let port_name = output_schemas
                        .get(i)
                        .map(|s| s.name.clone())
                        .unwrap_or_else(|| format!("out{}", i));
                    Ok(port.with_watchdog(watchdog.clone(), node_name.clone(), port_name))
                })
                .collect();
            let output_ports = output_ports?;

            scheduler.start_process(node, input_ports, output_ports);
        }

        drop(registry);
        info!(
            "Pipeline built successfully with {} threads",
            scheduler.num_threads()
        );
        Ok(scheduler)
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}
