//! Soul Player Audio
//!
//! Real-time render graph for Soul Player's effects engine.
//!
//! This crate provides:
//! - A processing context with a sample clock and suspend/resume/close lifecycle
//! - Automatable parameters with sample-accurate set/ramp/cancel timelines
//! - Built-in nodes: gain, biquad filter, delay, convolver, dynamics
//!   compressor, panner, oscillator, analyser, channel splitter/merger and a
//!   media element source
//! - Worklet hosting for custom processors, including the momentary
//!   loudness meter
//! - WAV decoding and resampling into [`AudioBuffer`]s
//! - Output through the default device behind the `desktop` feature
//!
//! # Architecture
//!
//! ```text
//! Control side                          Render side
//! ┌─────────────┐   commands   ┌──────────────────────────────┐
//! │ AudioContext│ ───────────► │ Renderer                     │
//! │ node handles│  (lock-free) │  ordered nodes, 128 frames   │
//! │ AudioParams │              │  per quantum, cycle breakers │
//! └─────────────┘              └──────────────────────────────┘
//!        ▲                                    │
//!        └──────── worklet message ports ◄────┘
//! ```
//!
//! Graphs may contain feedback loops as long as each loop holds a delay
//! node; such delays cannot go below one render quantum.
//!
//! # Example
//!
//! ```rust
//! use soul_audio::{AudioContext, AudioNode, ContextOptions};
//!
//! # fn example() -> soul_audio::Result<()> {
//! let ctx = AudioContext::new(ContextOptions::default())?;
//! let osc = ctx.create_oscillator()?;
//! let gain = ctx.create_gain()?;
//! gain.gain().set_value(0.25);
//!
//! osc.connect(&gain)?;
//! gain.connect(&ctx.destination())?;
//! osc.start()?;
//!
//! // Half a second of interleaved stereo
//! let samples = ctx.render(24_000)?;
//! assert_eq!(samples.len(), 48_000);
//! # Ok(())
//! # }
//! ```

pub mod block;
pub mod buffer;
mod context;
#[cfg(feature = "desktop")]
mod device;
mod error;
pub mod media;
pub mod node;
mod param;
mod render;
pub mod worklet;

pub use block::{AudioBlock, ChannelCountMode, MAX_CHANNELS, RENDER_QUANTUM};
pub use buffer::AudioBuffer;
pub use context::{
    AudioContext, ContextOptions, ContextState, Destination, LatencyHint, MAX_SAMPLE_RATE,
    MIN_SAMPLE_RATE,
};
pub use error::{AudioError, Result};
pub use media::{BufferMedia, MediaElement, SilentMedia};
pub use node::{
    AnalyserNode, AudioNode, BiquadFilterNode, BiquadFilterType, ChannelMergerNode,
    ChannelSplitterNode, ConvolverNode, DelayNode, DistanceModel, DynamicsCompressorNode,
    GainNode, MediaElementSourceNode, OscillatorNode, OscillatorType, PannerNode, PanningModel,
};
pub use param::AudioParam;
pub use worklet::{
    AudioWorklet, AudioWorkletNode, LufsMeterModule, ProcessorOptions, WorkletModule,
    WorkletProcessor, LUFS_METER_PROCESSOR,
};
