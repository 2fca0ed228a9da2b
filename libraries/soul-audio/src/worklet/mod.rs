//! Custom processors hosted inside the render graph
//!
//! A [`WorkletModule`] bundles named processor factories. Once a module is
//! added to a context's [`AudioWorklet`], an [`AudioWorkletNode`] can be
//! created for any processor it registered. Processors run on the render
//! thread and talk to the control side through a bounded message port:
//! posting never blocks and a full port drops the message.

mod lufs;

pub use lufs::{LufsMeterModule, LUFS_METER_PROCESSOR};

use crate::block::{AudioBlock, ChannelCountMode};
use crate::context::{AudioContext, ContextShared};
use crate::error::{AudioError, Result};
use crate::node::{AudioNode, NodeMessage, NodeRef};
use crate::render::{ParamBlock, Processor, RenderScope};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Messages a port buffers before dropping new ones
pub const DEFAULT_PORT_CAPACITY: usize = 64;

/// Timing of the quantum being processed
#[derive(Debug, Clone, Copy)]
pub struct WorkletScope {
    pub sample_rate: f32,
    pub current_frame: u64,
    pub current_time: f64,
}

/// Render-side half of a message port
#[derive(Debug, Clone)]
pub struct ProcessorPort {
    sender: mpsc::Sender<Value>,
}

impl ProcessorPort {
    /// Queue a message for the control side; false when it was dropped
    pub fn post_message(&self, message: Value) -> bool {
        self.sender.try_send(message).is_ok()
    }
}

/// Processor running on the render thread
pub trait WorkletProcessor: Send {
    /// Process one quantum; returning false releases the processor and the
    /// node outputs silence from then on
    fn process(
        &mut self,
        scope: &WorkletScope,
        inputs: &[AudioBlock],
        outputs: &mut [AudioBlock],
        port: &ProcessorPort,
    ) -> bool;

    /// Message posted from the control side
    fn on_message(&mut self, _message: Value) {}
}

/// Construction parameters for a worklet node
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    pub number_of_inputs: usize,
    pub number_of_outputs: usize,
    /// Channels per output; missing entries default to one
    pub output_channel_count: Vec<usize>,
    /// Free-form options handed to the processor factory
    pub processor_options: Value,
    pub port_capacity: usize,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            number_of_inputs: 1,
            number_of_outputs: 1,
            output_channel_count: Vec::new(),
            processor_options: Value::Null,
            port_capacity: DEFAULT_PORT_CAPACITY,
        }
    }
}

/// Builds a processor for a given sample rate
pub type ProcessorFactory =
    Arc<dyn Fn(&ProcessorOptions, u32) -> Result<Box<dyn WorkletProcessor>> + Send + Sync>;

/// Bundle of processors loaded together
pub trait WorkletModule: Send + Sync {
    /// Identifier used in logs and load errors
    fn name(&self) -> &str;

    fn processors(&self) -> Vec<(String, ProcessorFactory)>;
}

/// Per-context registry of loaded worklet processors
pub struct AudioWorklet {
    context: Arc<ContextShared>,
    factories: Mutex<HashMap<String, ProcessorFactory>>,
    modules: Mutex<Vec<String>>,
}

impl std::fmt::Debug for AudioWorklet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioWorklet")
            .field("modules", &*self.modules.lock().unwrap_or_else(PoisonError::into_inner))
            .finish()
    }
}

impl AudioWorklet {
    pub(crate) fn new(context: Arc<ContextShared>) -> Self {
        Self {
            context,
            factories: Mutex::new(HashMap::new()),
            modules: Mutex::new(Vec::new()),
        }
    }

    /// Register every processor of `module`
    ///
    /// Adding a module that is already loaded is a no-op. A processor name
    /// registered by another module fails the whole load.
    pub async fn add_module(&self, module: &dyn WorkletModule) -> Result<()> {
        if self.context.is_closed() {
            return Err(AudioError::ContextClosed);
        }
        let name = module.name().to_string();
        let mut modules = self.modules.lock().unwrap_or_else(PoisonError::into_inner);
        if modules.contains(&name) {
            debug!(module = %name, "Worklet module already loaded");
            return Ok(());
        }

        let processors = module.processors();
        if processors.is_empty() {
            return Err(AudioError::ModuleLoad {
                module: name,
                reason: "module registers no processors".into(),
            });
        }

        let mut factories = self.factories.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((duplicate, _)) = processors.iter().find(|(p, _)| factories.contains_key(p)) {
            return Err(AudioError::ModuleLoad {
                module: name,
                reason: format!("processor '{duplicate}' is already registered"),
            });
        }
        let count = processors.len();
        factories.extend(processors);
        modules.push(name.clone());

        info!(module = %name, processors = count, "Loaded worklet module");
        Ok(())
    }

    pub fn has_processor(&self, name: &str) -> bool {
        self.factories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    fn factory(&self, name: &str) -> Option<ProcessorFactory> {
        self.factories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

/// Graph node backed by a [`WorkletProcessor`]
#[derive(Clone)]
pub struct AudioWorkletNode {
    node: NodeRef,
    name: String,
    receiver: Arc<Mutex<Option<mpsc::Receiver<Value>>>>,
}

impl std::fmt::Debug for AudioWorkletNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioWorkletNode")
            .field("node", &self.node)
            .field("name", &self.name)
            .finish()
    }
}

impl AudioWorkletNode {
    pub fn new(context: &AudioContext, name: &str, options: ProcessorOptions) -> Result<Self> {
        let shared = context.shared();
        if shared.is_closed() {
            return Err(AudioError::ContextClosed);
        }
        let factory = context
            .audio_worklet()
            .factory(name)
            .ok_or_else(|| AudioError::UnknownProcessor(name.to_string()))?;
        let processor = factory(&options, shared.sample_rate())?;

        let (sender, receiver) = mpsc::channel(options.port_capacity.max(1));
        let outputs = (0..options.number_of_outputs)
            .map(|i| options.output_channel_count.get(i).copied().unwrap_or(1))
            .collect();
        let (node, []) = shared.register(
            Box::new(WorkletHost {
                processor,
                port: ProcessorPort { sender },
                active: true,
                name: name.to_string(),
            }),
            vec![ChannelCountMode::Max; options.number_of_inputs],
            outputs,
            [],
        )?;

        debug!(processor = name, "Created worklet node");
        Ok(Self {
            node,
            name: name.to_string(),
            receiver: Arc::new(Mutex::new(Some(receiver))),
        })
    }

    pub fn processor_name(&self) -> &str {
        &self.name
    }

    /// Receiving end of the port; available once
    pub fn take_message_receiver(&self) -> Option<mpsc::Receiver<Value>> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Deliver a message to the processor on the next quantum
    pub fn post_message(&self, message: Value) {
        self.node.send(NodeMessage::Worklet(message));
    }
}

impl AudioNode for AudioWorkletNode {
    fn node_ref(&self) -> &NodeRef {
        &self.node
    }
}

struct WorkletHost {
    processor: Box<dyn WorkletProcessor>,
    port: ProcessorPort,
    active: bool,
    name: String,
}

impl Processor for WorkletHost {
    fn process(
        &mut self,
        scope: &RenderScope,
        inputs: &[AudioBlock],
        outputs: &mut [AudioBlock],
        _params: &ParamBlock<'_>,
    ) {
        if !self.active {
            for output in outputs.iter_mut() {
                output.silence();
            }
            return;
        }
        let worklet_scope = WorkletScope {
            sample_rate: scope.sample_rate,
            current_frame: scope.frame,
            current_time: scope.time,
        };
        if !self
            .processor
            .process(&worklet_scope, inputs, outputs, &self.port)
        {
            warn!(processor = %self.name, "Worklet processor released itself");
            self.active = false;
        }
    }

    fn handle_message(&mut self, message: NodeMessage) {
        if let NodeMessage::Worklet(value) = message {
            self.processor.on_message(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextOptions;
    use serde_json::json;

    /// Counts quanta and reports every fourth one
    struct Counter {
        quanta: u64,
    }

    impl WorkletProcessor for Counter {
        fn process(
            &mut self,
            _scope: &WorkletScope,
            inputs: &[AudioBlock],
            outputs: &mut [AudioBlock],
            port: &ProcessorPort,
        ) -> bool {
            if let (Some(input), Some(output)) = (inputs.first(), outputs.first_mut()) {
                output.copy_from(input);
            }
            self.quanta += 1;
            if self.quanta % 4 == 0 {
                port.post_message(json!({ "quanta": self.quanta }));
            }
            true
        }
    }

    struct CounterModule;

    impl WorkletModule for CounterModule {
        fn name(&self) -> &str {
            "counter"
        }

        fn processors(&self) -> Vec<(String, ProcessorFactory)> {
            let factory: ProcessorFactory = Arc::new(|_options: &ProcessorOptions, _rate: u32| {
                Ok(Box::new(Counter { quanta: 0 }) as Box<dyn WorkletProcessor>)
            });
            vec![("counter-processor".to_string(), factory)]
        }
    }

    #[tokio::test]
    async fn unknown_processor_is_rejected() {
        let ctx = AudioContext::new(ContextOptions::default()).unwrap();
        let err = AudioWorkletNode::new(&ctx, "missing", ProcessorOptions::default()).unwrap_err();
        assert!(matches!(err, AudioError::UnknownProcessor(_)));
    }

    #[tokio::test]
    async fn processor_messages_reach_the_control_side() {
        let ctx = AudioContext::new(ContextOptions::default()).unwrap();
        ctx.audio_worklet().add_module(&CounterModule).await.unwrap();
        // Second load is a no-op
        ctx.audio_worklet().add_module(&CounterModule).await.unwrap();

        let node = AudioWorkletNode::new(&ctx, "counter-processor", ProcessorOptions::default())
            .unwrap();
        node.connect(&ctx.destination()).unwrap();
        let mut rx = node.take_message_receiver().unwrap();
        assert!(node.take_message_receiver().is_none());

        ctx.render(128 * 8).unwrap();
        let first = rx.try_recv().unwrap();
        assert_eq!(first["quanta"], 4);
        assert_eq!(rx.try_recv().unwrap()["quanta"], 8);
    }

    #[tokio::test]
    async fn full_port_drops_messages() {
        let ctx = AudioContext::new(ContextOptions::default()).unwrap();
        ctx.audio_worklet().add_module(&CounterModule).await.unwrap();
        let options = ProcessorOptions {
            port_capacity: 1,
            ..ProcessorOptions::default()
        };
        let node = AudioWorkletNode::new(&ctx, "counter-processor", options).unwrap();
        node.connect(&ctx.destination()).unwrap();
        let mut rx = node.take_message_receiver().unwrap();

        ctx.render(128 * 12).unwrap();
        assert_eq!(rx.try_recv().unwrap()["quanta"], 4);
        assert!(rx.try_recv().is_err());
    }
}
