//! Control-side node handles
//!
//! Each handle owns an id in the render graph plus its [`AudioParam`]s.
//! Handles are cheap to clone and can be shared across threads; the DSP
//! itself lives on the render thread.

mod analyser;
mod biquad;
mod channel;
mod compressor;
mod convolver;
mod delay;
mod destination;
mod gain;
mod media_source;
mod oscillator;
mod panner;

pub use analyser::AnalyserNode;
pub use biquad::{BiquadFilterNode, BiquadFilterType};
pub use channel::{ChannelMergerNode, ChannelSplitterNode};
pub use compressor::DynamicsCompressorNode;
pub use convolver::ConvolverNode;
pub use delay::DelayNode;
pub use gain::GainNode;
pub use media_source::MediaElementSourceNode;
pub use oscillator::{OscillatorNode, OscillatorType};
pub use panner::{DistanceModel, PannerNode, PanningModel};

pub(crate) use convolver::ConvolutionKernel;
pub(crate) use destination::DestinationProcessor;

use crate::context::ContextShared;
use crate::error::{AudioError, Result};
use crate::param::AudioParam;
use crate::render::{Command, NodeId};
use std::sync::Arc;

/// Node-specific messages delivered to processors
pub(crate) enum NodeMessage {
    SetKernel(Option<Box<ConvolutionKernel>>),
    Start(f64),
    Stop(f64),
    SetFilterType(BiquadFilterType),
    SetOscillatorType(OscillatorType),
    SetPanningModel(PanningModel),
    SetDistanceModel(DistanceModel),
    /// Message posted to a worklet processor from the control side
    Worklet(serde_json::Value),
}

/// Identity of a node inside its context
#[derive(Clone)]
pub struct NodeRef {
    pub(crate) id: NodeId,
    pub(crate) inputs: usize,
    pub(crate) outputs: usize,
    pub(crate) context: Arc<ContextShared>,
}

impl NodeRef {
    fn same_context(&self, other: &Arc<ContextShared>) -> Result<()> {
        if Arc::ptr_eq(&self.context, other) {
            Ok(())
        } else {
            Err(AudioError::InvalidState(
                "nodes belong to different contexts".into(),
            ))
        }
    }

    pub(crate) fn send(&self, message: NodeMessage) {
        self.context.send(Command::Message {
            id: self.id,
            message,
        });
    }
}

impl std::fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRef")
            .field("id", &self.id)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

/// Common behaviour of every node handle
pub trait AudioNode {
    fn node_ref(&self) -> &NodeRef;

    fn number_of_inputs(&self) -> usize {
        self.node_ref().inputs
    }

    fn number_of_outputs(&self) -> usize {
        self.node_ref().outputs
    }

    /// Connect output 0 to input 0 of `destination`
    fn connect(&self, destination: &dyn AudioNode) -> Result<()> {
        self.connect_at(destination, 0, 0)
    }

    /// Connect a specific output to a specific input
    fn connect_at(&self, destination: &dyn AudioNode, output: usize, input: usize) -> Result<()> {
        let from = self.node_ref();
        let to = destination.node_ref();
        from.same_context(&to.context)?;
        if from.context.is_closed() {
            return Err(AudioError::ContextClosed);
        }
        if output >= from.outputs {
            return Err(AudioError::InvalidState(format!(
                "output {output} out of range ({} outputs)",
                from.outputs
            )));
        }
        if input >= to.inputs {
            return Err(AudioError::InvalidState(format!(
                "input {input} out of range ({} inputs)",
                to.inputs
            )));
        }
        from.context.send(Command::Connect {
            from: from.id,
            output,
            to: to.id,
            input,
        });
        Ok(())
    }

    /// Drive an automatable parameter with this node's output
    fn connect_param(&self, param: &AudioParam) -> Result<()> {
        let from = self.node_ref();
        from.same_context(param.context())?;
        if from.context.is_closed() {
            return Err(AudioError::ContextClosed);
        }
        if from.outputs == 0 {
            return Err(AudioError::InvalidState("node has no outputs".into()));
        }
        from.context.send(Command::ConnectParam {
            from: from.id,
            output: 0,
            param: param.id(),
        });
        Ok(())
    }

    /// Remove every outgoing connection
    fn disconnect(&self) {
        let from = self.node_ref();
        from.context.send(Command::Disconnect { from: from.id });
    }
}
