use super::{AudioNode, NodeRef};
use crate::block::{AudioBlock, ChannelCountMode, MAX_CHANNELS};
use crate::context::ContextShared;
use crate::error::{AudioError, Result};
use crate::render::{ParamBlock, Processor, RenderScope};
use std::sync::Arc;

fn check_count(count: usize) -> Result<()> {
    if (1..=MAX_CHANNELS).contains(&count) {
        Ok(())
    } else {
        Err(AudioError::InvalidState(format!(
            "channel count {count} out of range 1..={MAX_CHANNELS}"
        )))
    }
}

/// Routes each input channel to its own mono output
///
/// The input is mixed to exactly as many channels as there are outputs, so
/// a mono source feeds every output.
#[derive(Debug, Clone)]
pub struct ChannelSplitterNode {
    node: NodeRef,
}

impl ChannelSplitterNode {
    pub(crate) fn new(context: &Arc<ContextShared>, outputs: usize) -> Result<Self> {
        check_count(outputs)?;
        let (node, []) = context.register(
            Box::new(SplitterProcessor),
            vec![ChannelCountMode::Explicit(outputs)],
            vec![1; outputs],
            [],
        )?;
        Ok(Self { node })
    }
}

impl AudioNode for ChannelSplitterNode {
    fn node_ref(&self) -> &NodeRef {
        &self.node
    }
}

struct SplitterProcessor;

impl Processor for SplitterProcessor {
    fn process(
        &mut self,
        _scope: &RenderScope,
        inputs: &[AudioBlock],
        outputs: &mut [AudioBlock],
        _params: &ParamBlock<'_>,
    ) {
        let Some(input) = inputs.first() else {
            return;
        };
        for (ch, output) in outputs.iter_mut().enumerate() {
            output.set_channel_count(1);
            output.channel_mut(0).copy_from_slice(input.channel(ch));
        }
    }
}

/// Interleaves mono inputs into one multichannel output
#[derive(Debug, Clone)]
pub struct ChannelMergerNode {
    node: NodeRef,
}

impl ChannelMergerNode {
    pub(crate) fn new(context: &Arc<ContextShared>, inputs: usize) -> Result<Self> {
        check_count(inputs)?;
        let (node, []) = context.register(
            Box::new(MergerProcessor),
            vec![ChannelCountMode::Explicit(1); inputs],
            vec![inputs],
            [],
        )?;
        Ok(Self { node })
    }
}

impl AudioNode for ChannelMergerNode {
    fn node_ref(&self) -> &NodeRef {
        &self.node
    }
}

struct MergerProcessor;

impl Processor for MergerProcessor {
    fn process(
        &mut self,
        _scope: &RenderScope,
        inputs: &[AudioBlock],
        outputs: &mut [AudioBlock],
        _params: &ParamBlock<'_>,
    ) {
        let Some(output) = outputs.first_mut() else {
            return;
        };
        output.set_channel_count(inputs.len());
        for (ch, input) in inputs.iter().enumerate() {
            output.channel_mut(ch).copy_from_slice(input.channel(0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::ParamSlot;

    fn no_params() -> (Vec<usize>, Vec<Option<ParamSlot>>) {
        (Vec::new(), Vec::new())
    }

    fn scope() -> RenderScope {
        RenderScope {
            sample_rate: 48000.0,
            frame: 0,
            time: 0.0,
        }
    }

    #[test]
    fn splitter_separates_channels() {
        let (ids, slots) = no_params();
        let params = ParamBlock::for_test(&ids, &slots);
        let mut input = AudioBlock::new(2);
        input.channel_mut(0).fill(0.25);
        input.channel_mut(1).fill(-0.5);
        let mut outputs = [AudioBlock::new(1), AudioBlock::new(1)];

        SplitterProcessor.process(&scope(), std::slice::from_ref(&input), &mut outputs, &params);
        assert_eq!(outputs[0].channel(0)[10], 0.25);
        assert_eq!(outputs[1].channel(0)[10], -0.5);
    }

    #[test]
    fn merger_builds_stereo() {
        let (ids, slots) = no_params();
        let params = ParamBlock::for_test(&ids, &slots);
        let mut left = AudioBlock::new(1);
        left.channel_mut(0).fill(1.0);
        let right = AudioBlock::new(1);
        let mut outputs = [AudioBlock::new(1)];

        MergerProcessor.process(&scope(), &[left, right], &mut outputs, &params);
        assert_eq!(outputs[0].channel_count(), 2);
        assert_eq!(outputs[0].channel(0)[0], 1.0);
        assert_eq!(outputs[0].channel(1)[0], 0.0);
    }
}
