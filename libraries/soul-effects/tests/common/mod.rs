//! Shared helpers for the soul-effects integration tests

#![allow(dead_code)]

use soul_audio::{AudioBuffer, AudioContext, AudioParam, BufferMedia};
use soul_effects::{EffectsConfig, EffectsSession, Environment, IrCatalog, PreferenceStorage};
use std::io::Cursor;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "soul_effects=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Float WAV file with a decaying click per channel
pub fn wav_bytes(sample_rate: u32, channels: u16, frames: usize) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for n in 0..frames {
            let sample = 0.5 * (-(n as f32) / 64.0).exp();
            for _ in 0..channels {
                writer.write_sample(sample).unwrap();
            }
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// Looping-free stereo media holding a quiet sine, already playing
pub fn playing_media(seconds: f32) -> Arc<BufferMedia> {
    let frames = (48000.0 * seconds) as usize;
    let channel: Vec<f32> = (0..frames)
        .map(|n| 0.1 * (2.0 * std::f32::consts::PI * 440.0 * n as f32 / 48000.0).sin())
        .collect();
    let buffer = AudioBuffer::new(48000, vec![channel.clone(), channel]).unwrap();
    let media = Arc::new(BufferMedia::new(Arc::new(buffer)));
    soul_audio::MediaElement::play(media.as_ref()).unwrap();
    media
}

/// Config with a short persistence debounce
pub fn test_config() -> EffectsConfig {
    let mut config = EffectsConfig::default();
    config.persistence.debounce_ms = 20;
    config
}

pub struct SessionSetup {
    pub environment: Arc<Environment>,
    pub catalog: Option<Arc<dyn IrCatalog>>,
    pub storage: Option<Arc<dyn PreferenceStorage>>,
    pub config: EffectsConfig,
}

impl Default for SessionSetup {
    fn default() -> Self {
        Self {
            environment: Arc::new(Environment::desktop()),
            catalog: None,
            storage: None,
            config: test_config(),
        }
    }
}

impl SessionSetup {
    pub fn build(self) -> EffectsSession {
        let mut builder = EffectsSession::builder()
            .config(self.config)
            .environment(self.environment);
        builder = match self.catalog {
            Some(catalog) => builder.catalog(catalog),
            None => builder.without_catalog(),
        };
        builder = match self.storage {
            Some(storage) => builder.storage(storage),
            None => builder.without_storage(),
        };
        builder.build().unwrap()
    }
}

/// Value a parameter settles at once every scheduled ramp has finished
pub fn settled(param: &AudioParam, ctx: &AudioContext) -> f64 {
    f64::from(param.value_at(ctx.current_time() + 5.0))
}

/// Yield to spawned tasks until `done` holds or the attempts run out
pub async fn eventually(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if done() {
            return true;
        }
        tokio::task::yield_now().await;
    }
    done()
}

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-4
}
