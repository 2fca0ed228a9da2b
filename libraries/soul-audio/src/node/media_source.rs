use super::{AudioNode, NodeRef};
use crate::block::{AudioBlock, MAX_CHANNELS, RENDER_QUANTUM};
use crate::context::ContextShared;
use crate::error::Result;
use crate::media::MediaElement;
use crate::render::{ParamBlock, Processor, RenderScope};
use std::sync::Arc;

/// Pulls audio from a host [`MediaElement`] into the graph
#[derive(Clone)]
pub struct MediaElementSourceNode {
    node: NodeRef,
    media: Arc<dyn MediaElement>,
}

impl std::fmt::Debug for MediaElementSourceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaElementSourceNode")
            .field("node", &self.node)
            .field("channels", &self.media.channel_count())
            .finish()
    }
}

impl MediaElementSourceNode {
    pub(crate) fn new(context: &Arc<ContextShared>, media: Arc<dyn MediaElement>) -> Result<Self> {
        let channels = media.channel_count().clamp(1, MAX_CHANNELS);
        let (node, []) = context.register(
            Box::new(MediaSourceProcessor {
                media: Arc::clone(&media),
                scratch: vec![0.0; RENDER_QUANTUM * channels],
                channels,
            }),
            Vec::new(),
            vec![channels],
            [],
        )?;
        Ok(Self { node, media })
    }

    pub fn media_element(&self) -> &Arc<dyn MediaElement> {
        &self.media
    }
}

impl AudioNode for MediaElementSourceNode {
    fn node_ref(&self) -> &NodeRef {
        &self.node
    }
}

struct MediaSourceProcessor {
    media: Arc<dyn MediaElement>,
    scratch: Vec<f32>,
    channels: usize,
}

impl Processor for MediaSourceProcessor {
    fn process(
        &mut self,
        _scope: &RenderScope,
        _inputs: &[AudioBlock],
        outputs: &mut [AudioBlock],
        _params: &ParamBlock<'_>,
    ) {
        let Some(output) = outputs.first_mut() else {
            return;
        };
        output.set_channel_count(self.channels);
        output.silence();
        if self.media.is_paused() {
            return;
        }

        let frames = self.media.read(&mut self.scratch).min(RENDER_QUANTUM);
        for ch in 0..self.channels {
            let dst = output.channel_mut(ch);
            for (n, d) in dst.iter_mut().enumerate().take(frames) {
                *d = self.scratch[n * self.channels + ch];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AudioBuffer;
    use crate::media::BufferMedia;

    #[test]
    fn pads_short_reads_with_silence() {
        let buffer = AudioBuffer::new(48000, vec![vec![0.5; 100]]).unwrap();
        let media = Arc::new(BufferMedia::new(Arc::new(buffer)));
        media.play().unwrap();
        let mut processor = MediaSourceProcessor {
            media: media.clone(),
            scratch: vec![0.0; RENDER_QUANTUM],
            channels: 1,
        };
        let ids: [usize; 0] = [];
        let slots = Vec::new();
        let params = ParamBlock::for_test(&ids, &slots);
        let scope = RenderScope {
            sample_rate: 48000.0,
            frame: 0,
            time: 0.0,
        };
        let mut outputs = [AudioBlock::new(1)];
        processor.process(&scope, &[], &mut outputs, &params);

        assert_eq!(outputs[0].channel(0)[99], 0.5);
        assert_eq!(outputs[0].channel(0)[100], 0.0);
        assert!(media.is_ended());
    }
}
