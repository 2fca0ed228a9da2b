//! Momentary loudness meter as a worklet processor
//!
//! A pure sink: it measures its input and posts a
//! [`MeterMessage`](soul_loudness::MeterMessage) every 100 ms, writing
//! silence to its output.

use super::{ProcessorFactory, ProcessorOptions, ProcessorPort, WorkletModule, WorkletProcessor, WorkletScope};
use crate::block::{AudioBlock, MAX_CHANNELS, RENDER_QUANTUM};
use crate::error::AudioError;
use soul_loudness::{MeterMessage, MomentaryLoudnessMeter};
use std::sync::Arc;
use tracing::trace;

/// Processor name registered by [`LufsMeterModule`]
pub const LUFS_METER_PROCESSOR: &str = "lufs-meter-processor";

/// Module providing the `lufs-meter-processor`
#[derive(Debug, Clone, Copy, Default)]
pub struct LufsMeterModule;

impl WorkletModule for LufsMeterModule {
    fn name(&self) -> &str {
        "lufs-meter"
    }

    fn processors(&self) -> Vec<(String, ProcessorFactory)> {
        let factory: ProcessorFactory = Arc::new(|_options: &ProcessorOptions, sample_rate: u32| {
            let meter = MomentaryLoudnessMeter::new(sample_rate).map_err(|e| {
                AudioError::ModuleLoad {
                    module: "lufs-meter".into(),
                    reason: e.to_string(),
                }
            })?;
            Ok(Box::new(LufsMeterProcessor { meter }) as Box<dyn WorkletProcessor>)
        });
        vec![(LUFS_METER_PROCESSOR.to_string(), factory)]
    }
}

struct LufsMeterProcessor {
    meter: MomentaryLoudnessMeter,
}

impl WorkletProcessor for LufsMeterProcessor {
    fn process(
        &mut self,
        _scope: &WorkletScope,
        inputs: &[AudioBlock],
        outputs: &mut [AudioBlock],
        port: &ProcessorPort,
    ) -> bool {
        for output in outputs.iter_mut() {
            output.silence();
        }
        let Some(input) = inputs.first() else {
            return true;
        };

        let channels = input.channel_count().min(MAX_CHANNELS);
        let mut frame = [0.0_f32; MAX_CHANNELS];
        for n in 0..RENDER_QUANTUM {
            for (ch, slot) in frame.iter_mut().enumerate().take(channels) {
                *slot = input.channel(ch)[n];
            }
            if let Some(lufs) = self.meter.push_frame(&frame[..channels]) {
                if !port.post_message(MeterMessage::momentary(lufs).to_value()) {
                    trace!(lufs, "Loudness report dropped");
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AudioContext, ContextOptions};
    use crate::node::AudioNode;
    use crate::worklet::AudioWorkletNode;

    #[tokio::test]
    async fn meter_reports_momentary_loudness() {
        let ctx = AudioContext::new(ContextOptions::default()).unwrap();
        ctx.audio_worklet().add_module(&LufsMeterModule).await.unwrap();

        let osc = ctx.create_oscillator().unwrap();
        osc.frequency().set_value(1000.0);
        let meter =
            AudioWorkletNode::new(&ctx, LUFS_METER_PROCESSOR, ProcessorOptions::default()).unwrap();
        osc.connect(&meter).unwrap();
        osc.start().unwrap();
        let mut reports = meter.take_message_receiver().unwrap();

        // Half a second: five reports at 48 kHz
        ctx.render(24_000).unwrap();

        let mut last = None;
        while let Ok(value) = reports.try_recv() {
            last = Some(MeterMessage::from_value(value).unwrap().lufs());
        }
        let lufs = last.unwrap();
        assert!((lufs - -3.0).abs() < 0.5, "read {lufs}");
    }

    #[tokio::test]
    async fn silent_input_posts_nothing() {
        let ctx = AudioContext::new(ContextOptions::default()).unwrap();
        ctx.audio_worklet().add_module(&LufsMeterModule).await.unwrap();
        let meter =
            AudioWorkletNode::new(&ctx, LUFS_METER_PROCESSOR, ProcessorOptions::default()).unwrap();
        let mut reports = meter.take_message_receiver().unwrap();

        ctx.render(24_000).unwrap();
        assert!(reports.try_recv().is_err());
    }
}
