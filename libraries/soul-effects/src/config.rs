/// Effects engine configuration
use crate::error::{EffectsError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EffectsConfig {
    #[serde(default = "default_audio")]
    pub audio: AudioSettings,

    #[serde(default = "default_mix")]
    pub mix: MixSettings,

    #[serde(default = "default_widener")]
    pub widener: WidenerSettings,

    #[serde(default = "default_loudness")]
    pub loudness: LoudnessSettings,

    #[serde(default = "default_automation")]
    pub automation: AutomationSettings,

    #[serde(default = "default_persistence")]
    pub persistence: PersistenceSettings,

    #[serde(default = "default_catalog")]
    pub catalog: CatalogSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AudioSettings {
    /// Rate of contexts created without an output device
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

/// Ramp times and loudness compensation constants
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MixSettings {
    /// Cross-fade time for every wet/bypass pair
    #[serde(default = "default_crossfade_ms")]
    pub crossfade_ms: f64,

    #[serde(default = "default_compressor_ramp_ms")]
    pub compressor_ramp_ms: f64,

    /// Convolver mix below which no boost is applied
    #[serde(default = "default_boost_threshold_mix")]
    pub convolver_boost_threshold_mix: f64,

    /// Boost reached at mix 1.0
    #[serde(default = "default_boost_max_db")]
    pub convolver_boost_max_db: f64,

    /// Fixed gain on the spatializer wet path
    #[serde(default = "default_spatial_wet_compensation_db")]
    pub spatial_wet_compensation_db: f64,

    /// Wet gain is `amount * (1 + wet_boost * amount)`
    #[serde(default = "default_widener_wet_boost")]
    pub widener_wet_boost: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WidenerSettings {
    #[serde(default = "default_left_delay_ms")]
    pub left_delay_ms: f64,

    #[serde(default = "default_right_delay_ms")]
    pub right_delay_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoudnessSettings {
    #[serde(default = "default_max_boost_db")]
    pub max_boost_db: f64,

    #[serde(default = "default_max_cut_db")]
    pub max_cut_db: f64,

    /// Ramp toward a new correction gain
    #[serde(default = "default_correction_ramp_ms")]
    pub correction_ramp_ms: f64,

    /// Ramp back to unity when normalization is switched off
    #[serde(default = "default_release_ramp_ms")]
    pub release_ramp_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AutomationSettings {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Orbit radius in panner units
    #[serde(default = "default_radius")]
    pub radius: f64,

    /// Store position updates happen once every this many ticks
    #[serde(default = "default_ui_update_every")]
    pub ui_update_every: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PersistenceSettings {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Directory for `JsonFileStorage`; in-memory storage when unset
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CatalogSettings {
    /// Server exposing `/api/irs`
    #[serde(default)]
    pub base_url: Option<String>,

    /// Local directory of `.irs` files, used when no base URL is set
    #[serde(default)]
    pub directory: Option<PathBuf>,

    #[serde(default = "default_public_prefix")]
    pub public_prefix: String,

    /// Decoded impulse responses kept in memory
    #[serde(default = "default_cache_entries")]
    pub cache_entries: usize,
}

impl Default for EffectsConfig {
    fn default() -> Self {
        Self {
            audio: default_audio(),
            mix: default_mix(),
            widener: default_widener(),
            loudness: default_loudness(),
            automation: default_automation(),
            persistence: default_persistence(),
            catalog: default_catalog(),
        }
    }
}

impl EffectsConfig {
    /// Load from `effects.toml` in the working directory and environment
    pub fn load() -> Result<Self> {
        Self::load_from(Some(Path::new("effects.toml")))
    }

    /// Load from an optional TOML file, then apply `SOUL_FX__*` overrides
    ///
    /// Nested keys use a double underscore, e.g.
    /// `SOUL_FX__AUTOMATION__INTERVAL_MS=40`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut settings = config::Config::builder();

        if let Some(path) = path {
            if path.exists() {
                settings = settings.add_source(config::File::from(path.to_path_buf()));
            }
        }

        settings = settings.add_source(
            config::Environment::with_prefix("SOUL_FX")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = settings
            .build()
            .map_err(|e| EffectsError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| EffectsError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(soul_audio::MIN_SAMPLE_RATE..=soul_audio::MAX_SAMPLE_RATE)
            .contains(&self.audio.sample_rate)
        {
            return Err(EffectsError::Config(format!(
                "sample rate {} out of range",
                self.audio.sample_rate
            )));
        }

        let ramps = [
            ("mix.crossfade_ms", self.mix.crossfade_ms),
            ("mix.compressor_ramp_ms", self.mix.compressor_ramp_ms),
            ("loudness.correction_ramp_ms", self.loudness.correction_ramp_ms),
            ("loudness.release_ramp_ms", self.loudness.release_ramp_ms),
            ("widener.left_delay_ms", self.widener.left_delay_ms),
            ("widener.right_delay_ms", self.widener.right_delay_ms),
        ];
        for (name, value) in ramps {
            if !value.is_finite() || value < 0.0 {
                return Err(EffectsError::Config(format!(
                    "{name} must be a non-negative number"
                )));
            }
        }

        if !(0.0..1.0).contains(&self.mix.convolver_boost_threshold_mix) {
            return Err(EffectsError::Config(
                "mix.convolver_boost_threshold_mix must be in [0, 1)".to_string(),
            ));
        }
        if self.widener.left_delay_ms.max(self.widener.right_delay_ms) > 1000.0 {
            return Err(EffectsError::Config(
                "widener delays are limited to one second".to_string(),
            ));
        }
        if self.automation.interval_ms == 0 {
            return Err(EffectsError::Config(
                "automation.interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.catalog.cache_entries == 0 {
            return Err(EffectsError::Config(
                "catalog.cache_entries must be at least 1".to_string(),
            ));
        }
        soul_loudness::GainLaw::new(self.loudness.max_boost_db, self.loudness.max_cut_db)?;

        Ok(())
    }
}

impl MixSettings {
    pub fn crossfade(&self) -> f64 {
        self.crossfade_ms / 1000.0
    }

    pub fn compressor_ramp(&self) -> f64 {
        self.compressor_ramp_ms / 1000.0
    }
}

impl LoudnessSettings {
    pub fn correction_ramp(&self) -> f64 {
        self.correction_ramp_ms / 1000.0
    }

    pub fn release_ramp(&self) -> f64 {
        self.release_ramp_ms / 1000.0
    }
}

impl AutomationSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl PersistenceSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

// Default value functions
fn default_audio() -> AudioSettings {
    AudioSettings {
        sample_rate: default_sample_rate(),
    }
}

fn default_mix() -> MixSettings {
    MixSettings {
        crossfade_ms: default_crossfade_ms(),
        compressor_ramp_ms: default_compressor_ramp_ms(),
        convolver_boost_threshold_mix: default_boost_threshold_mix(),
        convolver_boost_max_db: default_boost_max_db(),
        spatial_wet_compensation_db: default_spatial_wet_compensation_db(),
        widener_wet_boost: default_widener_wet_boost(),
    }
}

fn default_widener() -> WidenerSettings {
    WidenerSettings {
        left_delay_ms: default_left_delay_ms(),
        right_delay_ms: default_right_delay_ms(),
    }
}

fn default_loudness() -> LoudnessSettings {
    LoudnessSettings {
        max_boost_db: default_max_boost_db(),
        max_cut_db: default_max_cut_db(),
        correction_ramp_ms: default_correction_ramp_ms(),
        release_ramp_ms: default_release_ramp_ms(),
    }
}

fn default_automation() -> AutomationSettings {
    AutomationSettings {
        interval_ms: default_interval_ms(),
        radius: default_radius(),
        ui_update_every: default_ui_update_every(),
    }
}

fn default_persistence() -> PersistenceSettings {
    PersistenceSettings {
        debounce_ms: default_debounce_ms(),
        directory: None,
    }
}

fn default_catalog() -> CatalogSettings {
    CatalogSettings {
        base_url: None,
        directory: None,
        public_prefix: default_public_prefix(),
        cache_entries: default_cache_entries(),
    }
}

fn default_sample_rate() -> u32 {
    48000
}

fn default_crossfade_ms() -> f64 {
    50.0
}

fn default_compressor_ramp_ms() -> f64 {
    20.0
}

fn default_boost_threshold_mix() -> f64 {
    0.3
}

fn default_boost_max_db() -> f64 {
    6.0
}

fn default_spatial_wet_compensation_db() -> f64 {
    5.0
}

fn default_widener_wet_boost() -> f64 {
    0.25
}

fn default_left_delay_ms() -> f64 {
    0.0
}

fn default_right_delay_ms() -> f64 {
    12.0
}

fn default_max_boost_db() -> f64 {
    soul_loudness::DEFAULT_MAX_BOOST_DB
}

fn default_max_cut_db() -> f64 {
    soul_loudness::DEFAULT_MAX_CUT_DB
}

fn default_correction_ramp_ms() -> f64 {
    300.0
}

fn default_release_ramp_ms() -> f64 {
    500.0
}

fn default_interval_ms() -> u64 {
    50
}

fn default_radius() -> f64 {
    8.0
}

fn default_ui_update_every() -> u32 {
    4
}

fn default_debounce_ms() -> u64 {
    750
}

fn default_public_prefix() -> String {
    "/eq/irs/".to_string()
}

fn default_cache_entries() -> usize {
    4
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EffectsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mix.crossfade(), 0.05);
        assert_eq!(config.automation.interval(), Duration::from_millis(50));
        assert_eq!(config.persistence.debounce(), Duration::from_millis(750));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[automation]\nradius = 4.0\n\n[mix]\nconvolver_boost_max_db = 3.0").unwrap();

        let config = EffectsConfig::load_from(Some(file.path())).unwrap();
        assert_eq!(config.automation.radius, 4.0);
        assert_eq!(config.automation.interval_ms, 50);
        assert_eq!(config.mix.convolver_boost_max_db, 3.0);
        assert_eq!(config.mix.crossfade_ms, 50.0);
        assert_eq!(config.catalog.cache_entries, 4);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = EffectsConfig::load_from(Some(Path::new("/nonexistent/effects.toml")));
        assert_eq!(config.unwrap().audio, default_audio());
    }

    #[test]
    fn test_rejects_invalid_values() {
        let mut config = EffectsConfig::default();
        config.catalog.cache_entries = 0;
        assert!(matches!(config.validate(), Err(EffectsError::Config(_))));

        let mut config = EffectsConfig::default();
        config.mix.convolver_boost_threshold_mix = 1.0;
        assert!(config.validate().is_err());

        let mut config = EffectsConfig::default();
        config.loudness.max_cut_db = -1.0;
        assert!(config.validate().is_err());
    }
}
