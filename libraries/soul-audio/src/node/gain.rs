use super::{AudioNode, NodeRef};
use crate::block::{AudioBlock, ChannelCountMode};
use crate::context::ContextShared;
use crate::error::Result;
use crate::param::{AudioParam, ParamSpec};
use crate::render::{ParamBlock, Processor, RenderScope};
use std::sync::Arc;

/// Multiplies its input by an automatable gain
#[derive(Debug, Clone)]
pub struct GainNode {
    node: NodeRef,
    gain: AudioParam,
}

impl GainNode {
    pub(crate) fn new(context: &Arc<ContextShared>) -> Result<Self> {
        let (node, [gain]) = context.register(
            Box::new(GainProcessor),
            vec![ChannelCountMode::Max],
            vec![1],
            [ParamSpec::unbounded("gain", 1.0)],
        )?;
        Ok(Self { node, gain })
    }

    pub fn gain(&self) -> &AudioParam {
        &self.gain
    }
}

impl AudioNode for GainNode {
    fn node_ref(&self) -> &NodeRef {
        &self.node
    }
}

struct GainProcessor;

impl Processor for GainProcessor {
    fn process(
        &mut self,
        _scope: &RenderScope,
        inputs: &[AudioBlock],
        outputs: &mut [AudioBlock],
        params: &ParamBlock<'_>,
    ) {
        let (Some(input), Some(output)) = (inputs.first(), outputs.first_mut()) else {
            return;
        };
        let gain = params.values(0);
        let channels = input.channel_count();
        output.set_channel_count(channels);
        for ch in 0..channels {
            let src = input.channel(ch);
            let dst = output.channel_mut(ch);
            for ((o, i), g) in dst.iter_mut().zip(src.iter()).zip(gain.iter()) {
                *o = i * g;
            }
        }
    }
}
