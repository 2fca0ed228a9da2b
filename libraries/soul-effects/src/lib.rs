//! Soul Player Effects
//!
//! Live effect chain for Soul Player: the parameter store, the graph of
//! processing units built on [`soul_audio`], and the session that owns the
//! chain's lifecycle.
//!
//! This crate provides:
//! - [`ParameterStore`] holding the single source of truth for every effect
//! - Reverb presets and performance tiers
//! - The effect graph: EQ, convolution, algorithmic reverb, compressor,
//!   spatializer, loudness normalization, stereo widener, analyser, limiter
//! - Appliers that bring every node in line with the store
//! - Position automation on an orbit around the listener
//! - Impulse response catalogs (HTTP, directory, in-memory) with a decode cache
//! - Preference persistence with a debounced writer
//! - [`EffectsSession`], the lifecycle controller tying it together
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  setters   ┌────────────────┐  apply pass  ┌─────────────┐
//! │  EffectsSession  │ ─────────► │ ParameterStore │ ───────────► │ EffectGraph │
//! └──────────────────┘            └────────────────┘              └─────────────┘
//!         │   ▲                          ▲                               │
//!         │   └─ visibility, automation  └──── momentary LUFS ◄── meter ─┘
//!         ▼
//!   PersistenceWriter (debounced)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use soul_audio::SilentMedia;
//! use soul_effects::{EffectsSession, ReverbPreset};
//! use std::sync::Arc;
//!
//! # async fn example() -> soul_effects::Result<()> {
//! let session = EffectsSession::builder().build()?;
//! session.initialize(Arc::new(SilentMedia::new()), 0.8).await?;
//!
//! session.set_reverb_preset(ReverbPreset::Plate).await;
//! session.set_reverb_enabled(true).await;
//! session.set_eq_gain(0, 3.0).await;
//!
//! session.destroy().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod appliers;
pub mod automation;
pub mod config;
mod error;
pub mod graph;
pub mod ir;
pub mod params;
pub mod persist;
pub mod presets;
pub mod session;
mod store;
pub mod tier;

pub use config::EffectsConfig;
pub use error::{EffectsError, Result};
pub use graph::EffectGraph;
pub use ir::{DirectoryIrCatalog, HttpIrCatalog, IrCatalog, MemoryIrCatalog};
pub use params::{
    CompressorParams, EffectParameters, Position, PositionUpdate, ReverbParams, EQ_BANDS,
    EQ_BAND_COUNT,
};
pub use persist::{JsonFileStorage, MemoryStorage, PersistedPreferences, PreferenceStorage};
pub use presets::ReverbPreset;
#[cfg(feature = "desktop")]
pub use session::DeviceContextProvider;
pub use session::{
    ContextProvider, DeviceCapabilities, EffectsSession, EffectsSessionBuilder, Environment,
    ManualContextProvider, PointerPrecision, Visibility,
};
pub use store::ParameterStore;
pub use tier::PerformanceTier;
