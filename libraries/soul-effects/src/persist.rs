//! Preference persistence
//!
//! The user-facing part of [`EffectParameters`] is saved as one flat camelCase
//! JSON blob under [`PREFERENCES_KEY`]. Missing or unknown fields fall back to
//! defaults, nested objects merge field by field, so blobs written by older
//! builds keep loading.
//!
//! Writes go through a [`PersistenceWriter`], which collapses bursts of
//! updates (a slider drag) into a single write once the input goes quiet.

use crate::error::Result;
use crate::params::{EffectParameters, Position, ReverbParams};
use crate::presets::ReverbPreset;
use crate::tier::PerformanceTier;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Storage key of the preference blob
pub const PREFERENCES_KEY: &str = "musify-audio-settings";

/// Persisted preference blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PersistedPreferences {
    pub performance_mode: PerformanceTier,
    pub eq_gains: Vec<f64>,

    pub convolver_enabled: bool,
    pub convolver_mix: f64,
    pub selected_ir_url: Option<String>,

    pub generic_reverb_enabled: bool,
    pub generic_reverb_mix: f64,
    pub generic_reverb_decay: f64,
    pub generic_reverb_damping: f64,
    pub generic_reverb_pre_delay: f64,
    /// Preset id; unknown ids load as "hall"
    pub generic_reverb_type: String,
    pub generic_reverb_custom_settings: ReverbParams,
    pub generic_reverb_modulation_rate: f64,
    pub generic_reverb_modulation_depth: f64,

    pub compressor_enabled: bool,
    pub compressor_threshold: f64,
    pub compressor_knee: f64,
    pub compressor_ratio: f64,
    pub compressor_attack: f64,
    pub compressor_release: f64,

    pub panner_position: Position,
    pub panner_automation_enabled: bool,
    pub panner_automation_rate: f64,
    pub spatial_audio_enabled: bool,

    pub stereo_widener_enabled: bool,
    pub stereo_widener_amount: f64,

    pub loudness_normalization_enabled: bool,
    pub loudness_target: f64,
}

impl Default for PersistedPreferences {
    fn default() -> Self {
        Self::from(&EffectParameters::default())
    }
}

impl From<&EffectParameters> for PersistedPreferences {
    fn from(p: &EffectParameters) -> Self {
        Self {
            performance_mode: p.tier,
            eq_gains: p.eq_gains.clone(),
            convolver_enabled: p.convolver.enabled,
            convolver_mix: p.convolver.mix,
            selected_ir_url: p.convolver.selected_ir.clone(),
            generic_reverb_enabled: p.reverb.enabled,
            generic_reverb_mix: p.reverb.params.mix,
            generic_reverb_decay: p.reverb.params.decay,
            generic_reverb_damping: p.reverb.params.damping,
            generic_reverb_pre_delay: p.reverb.params.pre_delay,
            generic_reverb_type: p.reverb.preset.id().to_string(),
            generic_reverb_custom_settings: p.reverb.custom,
            generic_reverb_modulation_rate: p.reverb.params.modulation_rate,
            generic_reverb_modulation_depth: p.reverb.params.modulation_depth,
            compressor_enabled: p.compressor.enabled,
            compressor_threshold: p.compressor.threshold,
            compressor_knee: p.compressor.knee,
            compressor_ratio: p.compressor.ratio,
            compressor_attack: p.compressor.attack,
            compressor_release: p.compressor.release,
            panner_position: p.spatial.position,
            panner_automation_enabled: p.spatial.automation_enabled,
            panner_automation_rate: p.spatial.automation_rate,
            spatial_audio_enabled: p.spatial.enabled,
            stereo_widener_enabled: p.widener.enabled,
            stereo_widener_amount: p.widener.amount,
            loudness_normalization_enabled: p.loudness.enabled,
            loudness_target: p.loudness.target_lufs,
        }
    }
}

impl PersistedPreferences {
    /// Merge into live parameters
    ///
    /// Transient fields (catalog listing, decoded buffer, loudness reading,
    /// tier snapshot) are left alone.
    pub fn apply_to(&self, p: &mut EffectParameters) {
        p.tier = self.performance_mode;
        p.set_eq_gains(&self.eq_gains);

        p.convolver.enabled = self.convolver_enabled;
        p.convolver.mix = self.convolver_mix;
        if p.convolver.selected_ir != self.selected_ir_url {
            p.convolver.selected_ir = self.selected_ir_url.clone();
            p.convolver.impulse_buffer = None;
        }

        p.reverb.enabled = self.generic_reverb_enabled;
        p.reverb.preset = ReverbPreset::from_id_or_hall(&self.generic_reverb_type);
        p.reverb.custom = self.generic_reverb_custom_settings;
        p.reverb.params = ReverbParams {
            decay: self.generic_reverb_decay,
            damping: self.generic_reverb_damping,
            mix: self.generic_reverb_mix,
            pre_delay: self.generic_reverb_pre_delay,
            modulation_rate: self.generic_reverb_modulation_rate,
            modulation_depth: self.generic_reverb_modulation_depth,
        };

        p.compressor.enabled = self.compressor_enabled;
        p.compressor.threshold = self.compressor_threshold;
        p.compressor.knee = self.compressor_knee;
        p.compressor.ratio = self.compressor_ratio;
        p.compressor.attack = self.compressor_attack;
        p.compressor.release = self.compressor_release;

        p.spatial.position = self.panner_position;
        p.spatial.automation_enabled = self.panner_automation_enabled;
        p.spatial.automation_rate = self.panner_automation_rate;
        p.spatial.enabled = self.spatial_audio_enabled;

        p.widener.enabled = self.stereo_widener_enabled;
        p.widener.amount = self.stereo_widener_amount;

        p.loudness.enabled = self.loudness_normalization_enabled;
        p.loudness.target_lufs = self.loudness_target;
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Key-value store for preference blobs
#[async_trait]
pub trait PreferenceStorage: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>>;

    async fn save(&self, key: &str, value: &str) -> Result<()>;
}

/// One `<key>.json` file per key in a directory
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    directory: PathBuf,
}

impl JsonFileStorage {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.directory.join(format!("{key}.json"))
    }
}

#[async_trait]
impl PreferenceStorage for JsonFileStorage {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &str, value: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.directory).await?;
        // Atomic replace
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Process-local storage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
    writes: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn insert(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }

    /// Number of `save` calls so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }
}

#[async_trait]
impl PreferenceStorage for MemoryStorage {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get(key))
    }

    async fn save(&self, key: &str, value: &str) -> Result<()> {
        self.insert(key, value);
        self.writes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Read the saved blob; an unreadable blob counts as absent
pub async fn load_preferences(storage: &dyn PreferenceStorage) -> Result<Option<PersistedPreferences>> {
    let Some(json) = storage.load(PREFERENCES_KEY).await? else {
        return Ok(None);
    };
    match PersistedPreferences::from_json(&json) {
        Ok(prefs) => {
            info!("Loaded audio preferences");
            Ok(Some(prefs))
        }
        Err(e) => {
            error!(error = %e, "Failed to parse saved audio preferences");
            Ok(None)
        }
    }
}

pub async fn save_preferences(
    storage: &dyn PreferenceStorage,
    prefs: &PersistedPreferences,
) -> Result<()> {
    storage.save(PREFERENCES_KEY, &prefs.to_json()?).await
}

enum WriterCommand {
    Schedule(Box<PersistedPreferences>),
    Flush(oneshot::Sender<()>),
}

/// Debounced background writer
///
/// Each [`schedule`](Self::schedule) replaces the pending blob and restarts
/// the quiet period; the blob is written once no new one arrived for the
/// debounce window.
#[derive(Debug)]
pub struct PersistenceWriter {
    commands: mpsc::UnboundedSender<WriterCommand>,
    task: JoinHandle<()>,
}

impl PersistenceWriter {
    /// Spawn the writer task on the current runtime
    pub fn spawn(storage: Arc<dyn PreferenceStorage>, debounce: Duration) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(Self::run(storage, debounce, rx));
        Self { commands, task }
    }

    pub fn schedule(&self, prefs: PersistedPreferences) {
        if self.commands.send(WriterCommand::Schedule(Box::new(prefs))).is_err() {
            warn!("Persistence writer stopped, dropping preferences");
        }
    }

    /// Write the pending blob now, if any
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(WriterCommand::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Flush and stop the task
    pub async fn shutdown(self) {
        self.flush().await;
        drop(self.commands);
        if let Err(e) = self.task.await {
            error!(error = %e, "Persistence writer task failed");
        }
    }

    async fn run(
        storage: Arc<dyn PreferenceStorage>,
        debounce: Duration,
        mut commands: mpsc::UnboundedReceiver<WriterCommand>,
    ) {
        let mut pending: Option<Box<PersistedPreferences>> = None;
        let mut deadline = Instant::now();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(WriterCommand::Schedule(prefs)) => {
                        pending = Some(prefs);
                        deadline = Instant::now() + debounce;
                    }
                    Some(WriterCommand::Flush(done)) => {
                        if let Some(prefs) = pending.take() {
                            Self::write(storage.as_ref(), &prefs).await;
                        }
                        let _ = done.send(());
                    }
                    None => break,
                },
                () = tokio::time::sleep_until(deadline), if pending.is_some() => {
                    if let Some(prefs) = pending.take() {
                        Self::write(storage.as_ref(), &prefs).await;
                    }
                }
            }
        }

        if let Some(prefs) = pending.take() {
            Self::write(storage.as_ref(), &prefs).await;
        }
        debug!("Persistence writer stopped");
    }

    async fn write(storage: &dyn PreferenceStorage, prefs: &PersistedPreferences) {
        match save_preferences(storage, prefs).await {
            Ok(()) => debug!("Saved audio preferences"),
            Err(e) => error!(error = %e, "Failed to save audio preferences"),
        }
    }
}
