use crate::block::AudioBlock;
use crate::render::{ParamBlock, Processor, RenderScope};

/// Hands its input to the renderer unchanged
pub(crate) struct DestinationProcessor;

impl Processor for DestinationProcessor {
    fn process(
        &mut self,
        _scope: &RenderScope,
        inputs: &[AudioBlock],
        outputs: &mut [AudioBlock],
        _params: &ParamBlock<'_>,
    ) {
        if let (Some(input), Some(output)) = (inputs.first(), outputs.first_mut()) {
            output.copy_from(input);
        }
    }
}
