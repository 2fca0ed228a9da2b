//! Effects session lifecycle
//!
//! [`EffectsSession`] owns everything one player needs: the parameter store,
//! the processing context with its wired [`EffectGraph`], the lazily created
//! loudness meter, the automation timer, the visibility listener and the
//! persistence writer. Sessions are independent; nothing lives in globals.
//!
//! Control methods are serialized through one async lock around the runtime
//! state. The render side never takes it: parameter changes travel as
//! commands, loudness readings come back over the meter's message port.

use crate::appliers::{self, apply_loudness_correction};
use crate::automation::AutomationDriver;
use crate::config::EffectsConfig;
use crate::error::{EffectsError, Result};
use crate::graph::{EffectGraph, LeafUnits};
use crate::ir::{self, ImpulseResponseCache, IrCatalog};
use crate::params::{
    CompressorParams, EffectParameters, PositionUpdate, ReverbParams, EQ_BAND_COUNT,
};
use crate::persist::{self, JsonFileStorage, PersistedPreferences, PersistenceWriter, PreferenceStorage};
use crate::presets::{apply_reverb_preset, ReverbPreset};
use crate::store::ParameterStore;
use crate::tier::{self, PerformanceTier};
use serde_json::Value;
use soul_audio::{
    AnalyserNode, AudioContext, AudioNode, AudioWorkletNode, ContextOptions, ContextState,
    LatencyHint, LufsMeterModule, MediaElement, ProcessorOptions, WorkletModule,
    LUFS_METER_PROCESSOR,
};
use soul_loudness::{GainLaw, MeterMessage};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// ===== Context providers =====

/// Creates the processing context for a session
pub trait ContextProvider: Send + Sync {
    fn create_context(&self, options: ContextOptions) -> soul_audio::Result<AudioContext>;
}

/// Contexts rendered by the caller through [`AudioContext::render`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualContextProvider {
    start_suspended: bool,
}

impl ManualContextProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contexts start suspended, like a browser before a user gesture
    pub fn suspended() -> Self {
        Self {
            start_suspended: true,
        }
    }
}

impl ContextProvider for ManualContextProvider {
    fn create_context(&self, options: ContextOptions) -> soul_audio::Result<AudioContext> {
        AudioContext::new(ContextOptions {
            start_suspended: options.start_suspended || self.start_suspended,
            ..options
        })
    }
}

/// Contexts playing through the default output device
#[cfg(feature = "desktop")]
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceContextProvider;

#[cfg(feature = "desktop")]
impl ContextProvider for DeviceContextProvider {
    fn create_context(&self, options: ContextOptions) -> soul_audio::Result<AudioContext> {
        AudioContext::with_output_device(options)
    }
}

// ===== Host environment =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
}

/// Precision of the primary pointing device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerPrecision {
    /// Mouse or trackpad
    Fine,
    /// Touch
    Coarse,
    None,
}

/// Input capabilities used to classify the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub hover: bool,
    pub pointer: PointerPrecision,
}

impl DeviceCapabilities {
    pub const DESKTOP: Self = Self {
        hover: true,
        pointer: PointerPrecision::Fine,
    };

    pub const TOUCH: Self = Self {
        hover: false,
        pointer: PointerPrecision::Coarse,
    };

    /// Hover support with a fine pointer
    pub fn is_desktop_like(&self) -> bool {
        self.hover && self.pointer == PointerPrecision::Fine
    }
}

/// Host state the session reacts to
///
/// The host reports visibility changes here; sessions built with this
/// environment pick them up on their own.
#[derive(Debug)]
pub struct Environment {
    capabilities: DeviceCapabilities,
    visibility: watch::Sender<Visibility>,
}

impl Environment {
    pub fn new(capabilities: DeviceCapabilities) -> Self {
        let (visibility, _) = watch::channel(Visibility::Visible);
        Self {
            capabilities,
            visibility,
        }
    }

    pub fn desktop() -> Self {
        Self::new(DeviceCapabilities::DESKTOP)
    }

    pub fn touch() -> Self {
        Self::new(DeviceCapabilities::TOUCH)
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    pub fn visibility(&self) -> Visibility {
        *self.visibility.borrow()
    }

    pub fn set_visibility(&self, visibility: Visibility) {
        self.visibility.send_if_modified(|current| {
            let changed = *current != visibility;
            *current = visibility;
            changed
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<Visibility> {
        self.visibility.subscribe()
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::desktop()
    }
}

// ===== Session =====

/// Volatile state that exists only while initialized
struct Runtime {
    ctx: AudioContext,
    graph: EffectGraph,
    media: Arc<dyn MediaElement>,
    meter: Option<AudioWorkletNode>,
    was_playing_before_suspend: bool,
    modulators_started: bool,
    automation: AutomationDriver,
    visibility_task: Option<JoinHandle<()>>,
    feedback_task: Option<JoinHandle<()>>,
    writer: Option<PersistenceWriter>,
}

struct Inner {
    config: EffectsConfig,
    store: ParameterStore,
    provider: Arc<dyn ContextProvider>,
    environment: Arc<Environment>,
    catalog: Option<Arc<dyn IrCatalog>>,
    ir_cache: ImpulseResponseCache,
    storage: Option<Arc<dyn PreferenceStorage>>,
    meter_module: Arc<dyn WorkletModule>,
    gain_law: GainLaw,
    runtime: Mutex<Option<Runtime>>,
}

/// Builder for [`EffectsSession`]
pub struct EffectsSessionBuilder {
    config: EffectsConfig,
    provider: Option<Arc<dyn ContextProvider>>,
    environment: Option<Arc<Environment>>,
    catalog: Option<Option<Arc<dyn IrCatalog>>>,
    storage: Option<Option<Arc<dyn PreferenceStorage>>>,
    meter_module: Option<Arc<dyn WorkletModule>>,
}

impl EffectsSessionBuilder {
    pub fn config(mut self, config: EffectsConfig) -> Self {
        self.config = config;
        self
    }

    pub fn context_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn environment(mut self, environment: Arc<Environment>) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Impulse response source; defaults to the one named in the config
    pub fn catalog(mut self, catalog: Arc<dyn IrCatalog>) -> Self {
        self.catalog = Some(Some(catalog));
        self
    }

    pub fn without_catalog(mut self) -> Self {
        self.catalog = Some(None);
        self
    }

    /// Preference storage; defaults to the configured directory, if any
    pub fn storage(mut self, storage: Arc<dyn PreferenceStorage>) -> Self {
        self.storage = Some(Some(storage));
        self
    }

    pub fn without_storage(mut self) -> Self {
        self.storage = Some(None);
        self
    }

    /// Module providing the loudness meter processor
    pub fn meter_module(mut self, module: Arc<dyn WorkletModule>) -> Self {
        self.meter_module = Some(module);
        self
    }

    pub fn build(self) -> Result<EffectsSession> {
        self.config.validate()?;

        let catalog = match self.catalog {
            Some(catalog) => catalog,
            None => ir::catalog_from_config(&self.config.catalog)?,
        };
        let storage = match self.storage {
            Some(storage) => storage,
            None => self
                .config
                .persistence
                .directory
                .as_ref()
                .map(|dir| Arc::new(JsonFileStorage::new(dir)) as Arc<dyn PreferenceStorage>),
        };
        let gain_law = GainLaw::new(
            self.config.loudness.max_boost_db,
            self.config.loudness.max_cut_db,
        )?;

        Ok(EffectsSession {
            inner: Arc::new(Inner {
                ir_cache: ImpulseResponseCache::new(self.config.catalog.cache_entries),
                config: self.config,
                store: ParameterStore::default(),
                provider: self
                    .provider
                    .unwrap_or_else(|| Arc::new(ManualContextProvider::new())),
                environment: self.environment.unwrap_or_default(),
                catalog,
                storage,
                meter_module: self
                    .meter_module
                    .unwrap_or_else(|| Arc::new(LufsMeterModule)),
                gain_law,
                runtime: Mutex::new(None),
            }),
        })
    }
}

/// Live effect chain of one player
#[derive(Clone)]
pub struct EffectsSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EffectsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectsSession")
            .field("store", &self.inner.store)
            .field("has_catalog", &self.inner.catalog.is_some())
            .field("has_storage", &self.inner.storage.is_some())
            .finish()
    }
}

impl EffectsSession {
    pub fn builder() -> EffectsSessionBuilder {
        EffectsSessionBuilder {
            config: EffectsConfig::default(),
            provider: None,
            environment: None,
            catalog: None,
            storage: None,
            meter_module: None,
        }
    }

    pub fn config(&self) -> &EffectsConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &ParameterStore {
        &self.inner.store
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.inner.environment
    }

    pub fn snapshot(&self) -> EffectParameters {
        self.inner.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<EffectParameters> {
        self.inner.store.subscribe()
    }

    // ===== Lifecycle =====

    /// Build the context and the effect chain around `media`
    ///
    /// A second call while initialized logs a warning and does nothing.
    /// Fails only when no context can be created; the session then stays
    /// uninitialized.
    pub async fn initialize(&self, media: Arc<dyn MediaElement>, initial_volume: f32) -> Result<()> {
        let inner = &self.inner;
        let mut guard = inner.runtime.lock().await;
        if guard.is_some() {
            warn!("Effects session already initialized");
            return Ok(());
        }

        let options = ContextOptions {
            sample_rate: inner.config.audio.sample_rate,
            latency_hint: LatencyHint::Playback,
            start_suspended: false,
        };
        let ctx = inner.provider.create_context(options).map_err(|e| {
            error!(error = %e, "Failed to create audio context");
            EffectsError::from(e)
        })?;
        if ctx.state() == ContextState::Suspended {
            ctx.resume().await?;
        }
        info!(
            sample_rate = ctx.sample_rate(),
            state = ?ctx.state(),
            "Audio context created"
        );

        let params = inner.store.snapshot();
        let units = match LeafUnits::create(
            &ctx,
            Arc::clone(&media),
            initial_volume,
            &params,
            &inner.config,
        ) {
            Ok(units) => units,
            Err(e) => {
                let _ = ctx.close().await;
                return Err(e);
            }
        };

        // Only the listing; decoding waits until the convolver needs it
        inner.refresh_catalog().await;

        let graph = match units.wire(&ctx) {
            Ok(graph) => graph,
            Err(e) => {
                error!(error = %e, "Failed to wire effect graph");
                let _ = ctx.close().await;
                return Err(e);
            }
        };

        // Tiers below high own the reverb values
        inner.store.update(|p| {
            if p.tier == PerformanceTier::High {
                let preset = p.reverb.preset;
                apply_reverb_preset(p, preset);
            }
        });

        let automation = AutomationDriver::new(
            ctx.clone(),
            graph.clone(),
            inner.store.clone(),
            inner.config.automation.clone(),
        );
        let writer = inner
            .storage
            .as_ref()
            .map(|storage| PersistenceWriter::spawn(Arc::clone(storage), inner.config.persistence.debounce()));

        let runtime = guard.insert(Runtime {
            ctx,
            graph,
            media,
            meter: None,
            was_playing_before_suspend: false,
            modulators_started: false,
            automation,
            visibility_task: None,
            feedback_task: None,
            writer,
        });

        inner.apply_pass(runtime).await;
        inner.start_modulators(runtime);

        let mut visibility = inner.environment.subscribe();
        visibility.borrow_and_update();
        runtime.visibility_task = Some(tokio::spawn(watch_visibility(
            Arc::downgrade(&self.inner),
            visibility,
        )));
        inner.visibility_step(runtime).await;

        if inner.store.read(|p| p.loudness.enabled) {
            inner.ensure_meter(runtime).await;
            inner.apply_pass(runtime).await;
        }
        drop(guard);

        self.load_selected_impulse_response().await;
        info!("Effects session initialized");
        Ok(())
    }

    /// Tear everything down and reset the store
    ///
    /// Safe to call when never initialized, and more than once.
    pub async fn destroy(&self) {
        let inner = &self.inner;
        let runtime = inner.runtime.lock().await.take();

        if let Some(mut rt) = runtime {
            rt.automation.stop().await;
            if rt.modulators_started {
                if let Err(e) = rt.graph.stop_modulators() {
                    warn!(error = %e, "Failed to stop reverb modulators");
                }
            }
            for task in [rt.visibility_task.take(), rt.feedback_task.take()]
                .into_iter()
                .flatten()
            {
                task.abort();
            }
            if let Err(e) = rt.ctx.close().await {
                error!(error = %e, "Failed to close audio context");
            }
            if let Some(writer) = rt.writer.take() {
                writer.shutdown().await;
            }
            info!("Effects session destroyed");
        } else {
            debug!("Destroy on an uninitialized effects session");
        }

        inner.store.reset();
    }

    pub async fn is_initialized(&self) -> bool {
        self.inner.runtime.lock().await.is_some()
    }

    /// Handle of the live context
    pub async fn context(&self) -> Option<AudioContext> {
        self.inner.runtime.lock().await.as_ref().map(|rt| rt.ctx.clone())
    }

    /// Handle of the wired graph
    pub async fn graph(&self) -> Option<EffectGraph> {
        self.inner
            .runtime
            .lock()
            .await
            .as_ref()
            .map(|rt| rt.graph.clone())
    }

    /// Spectrum analyser at the end of the chain
    pub async fn analyser(&self) -> Option<AnalyserNode> {
        self.inner
            .runtime
            .lock()
            .await
            .as_ref()
            .map(|rt| rt.graph.analyser.clone())
    }

    pub async fn has_loudness_meter(&self) -> bool {
        self.inner
            .runtime
            .lock()
            .await
            .as_ref()
            .is_some_and(|rt| rt.meter.is_some())
    }

    pub async fn automation_running(&self) -> bool {
        self.inner
            .runtime
            .lock()
            .await
            .as_ref()
            .is_some_and(|rt| rt.automation.is_running())
    }

    /// Start the reverb modulators; later calls do nothing
    pub async fn start_modulators(&self) {
        if let Some(rt) = self.inner.runtime.lock().await.as_mut() {
            self.inner.start_modulators(rt);
        }
    }

    /// Bring every node in line with the store
    ///
    /// Logged as an error and skipped when the graph does not exist.
    pub async fn update_all_effects(&self) {
        let mut guard = self.inner.runtime.lock().await;
        match guard.as_mut() {
            Some(rt) => self.inner.apply_pass(rt).await,
            None => error!("Effect parameter pass requested before the graph was built"),
        }
    }

    /// React to the current host visibility
    pub async fn handle_visibility_change(&self) {
        let mut guard = self.inner.runtime.lock().await;
        if let Some(rt) = guard.as_mut() {
            self.inner.visibility_step(rt).await;
        }
    }

    // ===== Preferences =====

    /// Merge saved preferences into the store; true when some were found
    pub async fn load_preferences(&self) -> Result<bool> {
        let Some(storage) = &self.inner.storage else {
            return Ok(false);
        };
        let Some(prefs) = persist::load_preferences(storage.as_ref()).await? else {
            return Ok(false);
        };
        self.inner.store.update(|p| prefs.apply_to(p));
        self.commit().await;
        Ok(true)
    }

    /// Write pending preferences now
    pub async fn flush_preferences(&self) {
        if let Some(writer) = self
            .inner
            .runtime
            .lock()
            .await
            .as_ref()
            .and_then(|rt| rt.writer.as_ref())
        {
            writer.flush().await;
        }
    }

    // ===== Setters =====

    /// Fade the master volume; no duration sets it at once
    pub async fn set_master_volume(&self, level: f32, fade: Option<Duration>) {
        let guard = self.inner.runtime.lock().await;
        let Some(rt) = guard.as_ref() else {
            debug!("Master volume set before initialization");
            return;
        };
        let now = rt.ctx.current_time();
        let level = f64::from(level.max(0.0));
        match fade {
            Some(fade) => appliers::glide(rt.graph.master.gain(), level, now, fade.as_secs_f64()),
            None => appliers::set_now(rt.graph.master.gain(), level, now),
        }
    }

    /// Apply a mutation to the store, then run a full pass
    pub async fn update_parameters(&self, f: impl FnOnce(&mut EffectParameters)) {
        self.inner.store.update(f);
        self.commit().await;
    }

    pub async fn set_eq_gain(&self, band: usize, gain_db: f64) {
        if band >= EQ_BAND_COUNT {
            warn!(band, "EQ band out of range");
            return;
        }
        self.update_parameters(|p| p.eq_gains[band] = gain_db).await;
    }

    /// Replace all band gains; extra values are dropped, missing ones are 0 dB
    pub async fn apply_eq_preset(&self, gains: &[f64]) {
        self.update_parameters(|p| p.set_eq_gains(gains)).await;
    }

    pub async fn set_convolver_enabled(&self, enabled: bool) {
        self.update_parameters(|p| p.convolver.enabled = enabled).await;
    }

    pub async fn set_convolver_mix(&self, mix: f64) {
        self.update_parameters(|p| p.convolver.mix = mix.clamp(0.0, 1.0))
            .await;
    }

    /// Select an impulse response; loading waits for the convolver
    pub async fn select_ir(&self, id: Option<String>) {
        self.update_parameters(|p| {
            if p.convolver.selected_ir != id {
                p.convolver.selected_ir = id;
                p.convolver.impulse_buffer = None;
            }
        })
        .await;
    }

    /// Fetch the catalog listing again and reconcile the selection
    pub async fn refresh_impulse_responses(&self) {
        self.inner.refresh_catalog().await;
        self.commit().await;
    }

    pub async fn set_reverb_enabled(&self, enabled: bool) {
        self.update_parameters(|p| p.reverb.enabled = enabled).await;
    }

    pub async fn set_reverb_preset(&self, preset: ReverbPreset) {
        self.update_parameters(|p| apply_reverb_preset(p, preset))
            .await;
    }

    /// Select a preset by id; unknown ids select "hall"
    pub async fn set_reverb_preset_id(&self, id: &str) {
        self.set_reverb_preset(ReverbPreset::from_id_or_hall(id))
            .await;
    }

    async fn edit_reverb(&self, edit: impl Fn(&mut ReverbParams)) {
        self.update_parameters(|p| p.edit_reverb(edit)).await;
    }

    pub async fn set_reverb_decay(&self, decay: f64) {
        self.edit_reverb(|r| r.decay = decay).await;
    }

    pub async fn set_reverb_damping(&self, damping: f64) {
        self.edit_reverb(|r| r.damping = damping).await;
    }

    pub async fn set_reverb_mix(&self, mix: f64) {
        self.edit_reverb(|r| r.mix = mix).await;
    }

    pub async fn set_reverb_pre_delay(&self, pre_delay: f64) {
        self.edit_reverb(|r| r.pre_delay = pre_delay).await;
    }

    pub async fn set_reverb_modulation_rate(&self, rate: f64) {
        self.edit_reverb(|r| r.modulation_rate = rate).await;
    }

    pub async fn set_reverb_modulation_depth(&self, depth: f64) {
        self.edit_reverb(|r| r.modulation_depth = depth).await;
    }

    pub async fn set_compressor_enabled(&self, enabled: bool) {
        self.update_parameters(|p| p.compressor.enabled = enabled)
            .await;
    }

    /// Replace every compressor setting at once
    pub async fn set_compressor(&self, compressor: CompressorParams) {
        self.update_parameters(|p| p.compressor = compressor).await;
    }

    pub async fn set_compressor_threshold(&self, threshold: f64) {
        self.update_parameters(|p| p.compressor.threshold = threshold)
            .await;
    }

    pub async fn set_compressor_knee(&self, knee: f64) {
        self.update_parameters(|p| p.compressor.knee = knee).await;
    }

    pub async fn set_compressor_ratio(&self, ratio: f64) {
        self.update_parameters(|p| p.compressor.ratio = ratio).await;
    }

    pub async fn set_compressor_attack(&self, attack: f64) {
        self.update_parameters(|p| p.compressor.attack = attack).await;
    }

    pub async fn set_compressor_release(&self, release: f64) {
        self.update_parameters(|p| p.compressor.release = release)
            .await;
    }

    pub async fn set_spatial_enabled(&self, enabled: bool) {
        self.update_parameters(|p| p.spatial.enabled = enabled).await;
    }

    /// Move the source by hand
    ///
    /// Axes left out of the update keep their current value. Ignored
    /// (returning false) while automation runs or below the high tier.
    pub async fn set_panner_position(&self, update: impl Into<PositionUpdate>) -> bool {
        let update = update.into();
        let allowed = self
            .inner
            .store
            .read(|p| !p.spatial.automation_enabled && p.tier == PerformanceTier::High);
        if !allowed {
            debug!("Manual panner position ignored");
            return false;
        }
        self.update_parameters(|p| p.spatial.position = p.spatial.position.merged(update))
            .await;
        true
    }

    pub async fn set_automation_enabled(&self, enabled: bool) {
        self.update_parameters(|p| p.spatial.automation_enabled = enabled)
            .await;
    }

    pub async fn set_automation_rate(&self, rate: f64) {
        self.update_parameters(|p| p.spatial.automation_rate = rate)
            .await;
    }

    pub async fn set_widener_enabled(&self, enabled: bool) {
        self.update_parameters(|p| p.widener.enabled = enabled).await;
    }

    pub async fn set_widener_amount(&self, amount: f64) {
        self.update_parameters(|p| p.widener.amount = amount.clamp(0.0, 1.0))
            .await;
    }

    /// Turn normalization on or off; the first enable loads the meter
    pub async fn set_loudness_enabled(&self, enabled: bool) {
        self.update_parameters(|p| p.loudness.enabled = enabled).await;
    }

    pub async fn set_loudness_target(&self, target_lufs: f64) {
        self.update_parameters(|p| p.loudness.target_lufs = target_lufs)
            .await;
    }

    /// Switch tiers; returns false when already there
    pub async fn set_performance_tier(&self, target: PerformanceTier) -> bool {
        let mut changed = false;
        self.inner
            .store
            .update(|p| changed = tier::transition(p, target));
        if changed {
            self.commit().await;
        }
        changed
    }

    // ===== Internals =====

    /// Acquire lazy resources the store now asks for and run a pass
    async fn commit(&self) {
        {
            let mut guard = self.inner.runtime.lock().await;
            let Some(rt) = guard.as_mut() else {
                debug!("Parameters stored; session not initialized");
                return;
            };
            if self.inner.store.read(|p| p.loudness.enabled) {
                self.inner.ensure_meter(rt).await;
            }
            self.inner.apply_pass(rt).await;
        }
        self.load_selected_impulse_response().await;
    }

    /// Fetch and decode the selected impulse response if the convolver wants it
    ///
    /// The result is stored only if the selection did not change meanwhile.
    async fn load_selected_impulse_response(&self) {
        let inner = &self.inner;
        let wanted = inner.store.read(|p| {
            if p.convolver.enabled && p.convolver.impulse_buffer.is_none() {
                p.convolver.selected_ir.clone()
            } else {
                None
            }
        });
        let Some(id) = wanted else {
            return;
        };
        let Some(catalog) = inner.catalog.clone() else {
            warn!(id = %id, "No impulse response catalog configured");
            return;
        };
        let Some(sample_rate) = inner
            .runtime
            .lock()
            .await
            .as_ref()
            .map(|rt| rt.ctx.sample_rate())
        else {
            return;
        };

        let buffer = match ir::load_impulse_response(
            catalog.as_ref(),
            &inner.ir_cache,
            &id,
            sample_rate,
        )
        .await
        {
            Ok(buffer) => buffer,
            Err(e) => {
                error!(id = %id, error = %e, "Failed to load impulse response");
                return;
            }
        };

        let mut applied = false;
        inner.store.update(|p| {
            if p.convolver.selected_ir.as_deref() == Some(id.as_str()) {
                p.convolver.impulse_buffer = Some(buffer);
                applied = true;
            }
        });
        if !applied {
            debug!(id = %id, "Impulse response selection changed during load");
            return;
        }

        let mut guard = inner.runtime.lock().await;
        if let Some(rt) = guard.as_mut() {
            inner.apply_pass(rt).await;
        }
    }
}

impl Inner {
    /// Every applier, then automation, then a debounced save
    async fn apply_pass(&self, rt: &mut Runtime) {
        let params = self.store.snapshot();
        appliers::apply_all(&params, &rt.graph, rt.ctx.current_time(), &self.config);

        let env = &self.environment;
        let should_automate = params.spatial.automation_enabled
            && rt.ctx.state() == ContextState::Running
            && (env.capabilities().is_desktop_like() || env.visibility() == Visibility::Visible);
        if should_automate {
            rt.automation.start();
        } else if rt.automation.is_running() {
            rt.automation.stop().await;
        }

        if let Some(writer) = &rt.writer {
            writer.schedule(PersistedPreferences::from(&self.store.snapshot()));
        }
    }

    fn start_modulators(&self, rt: &mut Runtime) {
        if rt.modulators_started {
            debug!("Reverb modulators already started");
            return;
        }
        match rt.graph.start_modulators() {
            Ok(()) => rt.modulators_started = true,
            Err(e) => error!(error = %e, "Failed to start reverb modulators"),
        }
    }

    async fn visibility_step(&self, rt: &mut Runtime) {
        let state = rt.ctx.state();
        if state == ContextState::Closed {
            return;
        }
        let desktop = self.environment.capabilities().is_desktop_like();

        match self.environment.visibility() {
            Visibility::Hidden if desktop => {
                debug!("Hidden on a desktop-like device, staying active");
            }
            Visibility::Hidden => {
                if state == ContextState::Running {
                    rt.was_playing_before_suspend = !rt.media.is_paused();
                    if let Err(e) = rt.ctx.suspend().await {
                        error!(error = %e, "Failed to suspend audio context");
                    }
                    if rt.was_playing_before_suspend {
                        rt.media.pause();
                    }
                    info!(
                        was_playing = rt.was_playing_before_suspend,
                        "Audio suspended while hidden"
                    );
                }
                rt.automation.stop().await;
            }
            Visibility::Visible if state == ContextState::Suspended => {
                if let Err(e) = rt.ctx.resume().await {
                    error!(error = %e, "Failed to resume audio context");
                    return;
                }
                self.apply_pass(rt).await;
                if rt.was_playing_before_suspend {
                    rt.was_playing_before_suspend = false;
                    if let Err(e) = rt.media.play() {
                        error!(error = %e, "Failed to resume playback");
                    }
                }
                info!("Audio resumed on becoming visible");
            }
            Visibility::Visible => self.apply_pass(rt).await,
        }
    }

    async fn refresh_catalog(&self) {
        let listing = match &self.catalog {
            Some(catalog) => catalog.list().await,
            None => Ok(Vec::new()),
        };
        let selected = self.store.read(|p| p.convolver.selected_ir.clone());
        let reconciled = ir::reconcile_selection(listing, selected.as_deref());

        self.store.update(|p| {
            if p.convolver.selected_ir != reconciled.selected {
                p.convolver.impulse_buffer = None;
            }
            p.convolver.available_irs = reconciled.available;
            p.convolver.selected_ir = reconciled.selected;
        });
    }

    /// Create the loudness meter once; failure turns normalization off
    async fn ensure_meter(&self, rt: &mut Runtime) {
        if rt.meter.is_some() {
            return;
        }
        match self.create_meter(rt).await {
            Ok(meter) => {
                info!("Loudness meter attached");
                rt.meter = Some(meter);
            }
            Err(e) => {
                error!(error = %e, "Loudness meter unavailable, disabling normalization");
                self.store.update(|p| p.loudness.enabled = false);
            }
        }
    }

    async fn create_meter(&self, rt: &mut Runtime) -> Result<AudioWorkletNode> {
        rt.ctx
            .audio_worklet()
            .add_module(self.meter_module.as_ref())
            .await?;
        let meter = AudioWorkletNode::new(
            &rt.ctx,
            LUFS_METER_PROCESSOR,
            ProcessorOptions {
                output_channel_count: vec![2],
                ..ProcessorOptions::default()
            },
        )?;
        rt.graph.loudness_tap.connect(&meter)?;

        if let Some(messages) = meter.take_message_receiver() {
            rt.feedback_task = Some(tokio::spawn(loudness_feedback(
                messages,
                rt.ctx.clone(),
                rt.graph.clone(),
                self.store.clone(),
                self.config.clone(),
                self.gain_law,
            )));
        }
        Ok(meter)
    }
}

/// Forward host visibility changes to the session while it lives
async fn watch_visibility(session: Weak<Inner>, mut visibility: watch::Receiver<Visibility>) {
    while visibility.changed().await.is_ok() {
        let Some(inner) = session.upgrade() else {
            break;
        };
        debug!(visibility = ?*visibility.borrow_and_update(), "Visibility changed");
        EffectsSession { inner }.handle_visibility_change().await;
    }
}

/// Turn meter readings into store updates and gain corrections
async fn loudness_feedback(
    mut messages: mpsc::Receiver<Value>,
    ctx: AudioContext,
    graph: EffectGraph,
    store: ParameterStore,
    config: EffectsConfig,
    law: GainLaw,
) {
    while let Some(message) = messages.recv().await {
        let lufs = match MeterMessage::from_value(message) {
            Ok(message) => message.lufs(),
            Err(e) => {
                warn!(error = %e, "Ignoring malformed meter message");
                continue;
            }
        };
        store.set_momentary_lufs(lufs);

        let (enabled, target) = store.read(|p| (p.loudness.enabled, p.loudness.target_lufs));
        if enabled && ctx.state() == ContextState::Running {
            let gain = law.gain(target, lufs);
            apply_loudness_correction(&graph, gain, ctx.current_time(), &config);
        }
    }
    debug!("Loudness feedback stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_classification() {
        assert!(DeviceCapabilities::DESKTOP.is_desktop_like());
        assert!(!DeviceCapabilities::TOUCH.is_desktop_like());
        assert!(!DeviceCapabilities {
            hover: true,
            pointer: PointerPrecision::Coarse,
        }
        .is_desktop_like());
        assert!(!DeviceCapabilities {
            hover: false,
            pointer: PointerPrecision::Fine,
        }
        .is_desktop_like());
    }

    #[test]
    fn test_environment_notifies_only_on_change() {
        let env = Environment::touch();
        let mut rx = env.subscribe();

        env.set_visibility(Visibility::Visible);
        assert!(!rx.has_changed().unwrap());

        env.set_visibility(Visibility::Hidden);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Visibility::Hidden);
    }

    #[test]
    fn test_manual_provider_forces_suspended() {
        let ctx = ManualContextProvider::suspended()
            .create_context(ContextOptions::default())
            .unwrap();
        assert_eq!(ctx.state(), ContextState::Suspended);
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let mut config = EffectsConfig::default();
        config.automation.interval_ms = 0;
        assert!(EffectsSession::builder().config(config).build().is_err());
    }
}
