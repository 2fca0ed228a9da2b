//! Offline rendering through a complete effects session

use anyhow::{Context, Result};
use soul_audio::{AudioBuffer, BufferMedia, MediaElement};
use soul_effects::{EffectsSession, PerformanceTier, ReverbPreset};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Frames rendered between two yields to the session's background tasks
const BLOCK_FRAMES: usize = 4096;

/// Effect choices for one render
#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub volume: f32,
    pub eq_gains: Vec<f64>,
    pub reverb: Option<ReverbPreset>,
    pub compressor: bool,
    pub spatial: bool,
    pub widener: Option<f64>,
    /// Normalization target in LUFS
    pub loudness_target: Option<f64>,
    pub impulse_response: Option<String>,
    pub convolver_mix: f64,
    pub tier: PerformanceTier,
    /// Seconds rendered past the end of the input
    pub tail: f64,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            volume: 1.0,
            eq_gains: Vec::new(),
            reverb: None,
            compressor: false,
            spatial: false,
            widener: None,
            loudness_target: None,
            impulse_response: None,
            convolver_mix: 0.3,
            tier: PerformanceTier::High,
            tail: 1.0,
        }
    }
}

/// Summary of a finished render
#[derive(Debug, Clone, PartialEq)]
pub struct RenderReport {
    pub frames: usize,
    pub sample_rate: u32,
    pub peak: f32,
    /// Last meter reading, or silence when normalization was off
    pub momentary_lufs: f64,
}

/// Push the settings into the session store
pub async fn configure(session: &EffectsSession, settings: &RenderSettings) {
    if !settings.eq_gains.is_empty() {
        session.apply_eq_preset(&settings.eq_gains).await;
    }
    if let Some(preset) = settings.reverb {
        session.set_reverb_preset(preset).await;
        session.set_reverb_enabled(true).await;
    }
    session.set_compressor_enabled(settings.compressor).await;
    session.set_spatial_enabled(settings.spatial).await;
    if let Some(amount) = settings.widener {
        session.set_widener_amount(amount).await;
        session.set_widener_enabled(true).await;
    }
    if let Some(target) = settings.loudness_target {
        session.set_loudness_target(target).await;
        session.set_loudness_enabled(true).await;
    }
    if let Some(id) = &settings.impulse_response {
        session.set_convolver_mix(settings.convolver_mix).await;
        session.select_ir(Some(id.clone())).await;
        session.set_convolver_enabled(true).await;
    }
    session.set_performance_tier(settings.tier).await;
}

/// Render `input` plus the tail and tear the session down
///
/// Returns interleaved stereo at the input's sample rate.
pub async fn render(
    session: &EffectsSession,
    input: AudioBuffer,
    settings: &RenderSettings,
) -> Result<(Vec<f32>, RenderReport)> {
    let sample_rate = input.sample_rate();
    let tail = (settings.tail.max(0.0) * f64::from(sample_rate)) as usize;
    let total = input.length() + tail;

    let media = Arc::new(BufferMedia::new(Arc::new(input)));
    media.play()?;
    session.initialize(media.clone(), settings.volume).await?;
    configure(session, settings).await;

    let ctx = session
        .context()
        .await
        .context("session has no processing context")?;

    let mut samples = Vec::with_capacity(total * 2);
    let mut rendered = 0;
    while rendered < total {
        let frames = BLOCK_FRAMES.min(total - rendered);
        samples.extend(ctx.render(frames)?);
        rendered += frames;
        // Lets meter feedback and automation keep up with the clock
        tokio::task::yield_now().await;
    }
    debug!(frames = rendered, ended = media.is_ended(), "Render finished");

    let report = RenderReport {
        frames: rendered,
        sample_rate,
        peak: samples.iter().fold(0.0_f32, |peak, s| peak.max(s.abs())),
        momentary_lufs: session.snapshot().loudness.momentary_lufs,
    };
    session.destroy().await;

    info!(
        frames = report.frames,
        peak = report.peak,
        lufs = report.momentary_lufs,
        "Rendered through effect chain"
    );
    Ok((samples, report))
}

/// Decode a WAV file at `sample_rate`
pub fn read_input(path: &Path, sample_rate: u32) -> Result<AudioBuffer> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    AudioBuffer::decode_at_rate(&bytes, sample_rate)
        .with_context(|| format!("failed to decode {}", path.display()))
}

/// Write interleaved stereo as a 32-bit float WAV file
pub fn write_output(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use soul_effects::EffectsConfig;

    fn tone(seconds: f32) -> AudioBuffer {
        let frames = (48000.0 * seconds) as usize;
        let channel: Vec<f32> = (0..frames)
            .map(|n| 0.25 * (2.0 * std::f32::consts::PI * 220.0 * n as f32 / 48000.0).sin())
            .collect();
        AudioBuffer::new(48000, vec![channel.clone(), channel]).unwrap()
    }

    fn session() -> EffectsSession {
        EffectsSession::builder()
            .config(EffectsConfig::default())
            .without_catalog()
            .without_storage()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_dry_render_covers_input_and_tail() {
        let settings = RenderSettings {
            tail: 0.25,
            ..Default::default()
        };
        let (samples, report) = render(&session(), tone(0.5), &settings).await.unwrap();

        assert_eq!(report.frames, 36000);
        assert_eq!(samples.len(), 72000);
        assert!(report.peak > 0.05);
        // Limiter ceiling
        assert!(report.peak <= 1.0);
    }

    #[tokio::test]
    async fn test_render_with_effects_stays_finite() {
        let settings = RenderSettings {
            reverb: Some(ReverbPreset::Plate),
            compressor: true,
            spatial: true,
            widener: Some(0.6),
            loudness_target: Some(-14.0),
            eq_gains: vec![3.0, 0.0, -2.0],
            tail: 0.5,
            ..Default::default()
        };
        let (samples, report) = render(&session(), tone(1.0), &settings).await.unwrap();

        assert!(samples.iter().all(|s| s.is_finite()));
        assert!(report.peak > 0.0);
        // Meter reported something above the silence floor
        assert!(report.momentary_lufs > -70.0);
    }

    #[test]
    fn test_output_round_trips_through_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let samples: Vec<f32> = (0..960).map(|n| (n as f32 / 960.0) - 0.5).collect();

        write_output(&path, &samples, 48000).unwrap();
        let decoded = read_input(&path, 48000).unwrap();

        assert_eq!(decoded.number_of_channels(), 2);
        assert_eq!(decoded.length(), 480);
        assert!((decoded.channel(0)[10] - samples[20]).abs() < 1e-6);
    }
}
