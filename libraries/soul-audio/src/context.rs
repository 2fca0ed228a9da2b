//! Processing context
//!
//! An [`AudioContext`] owns one render graph, a sample clock and the driver
//! that pulls audio through the graph. The clock is derived from rendered
//! frames, so it stands still while the context is suspended.
//!
//! Two drivers exist:
//! - the manual driver (always available) renders on demand through
//!   [`AudioContext::render`], which is what offline rendering and tests use;
//! - the device driver (`desktop` feature) renders from a `cpal` output
//!   stream owned by a dedicated audio thread.

use crate::block::ChannelCountMode;
use crate::buffer::AudioBuffer;
use crate::error::{AudioError, Result};
use crate::media::MediaElement;
use crate::node::{
    AnalyserNode, BiquadFilterNode, ChannelMergerNode, ChannelSplitterNode, ConvolverNode,
    DelayNode, DestinationProcessor, DynamicsCompressorNode, GainNode, MediaElementSourceNode,
    NodeRef, OscillatorNode, PannerNode,
};
use crate::param::{AudioParam, ParamSpec};
use crate::render::{Command, NodeSpec, Processor, Renderer, RunState};
use crate::worklet::AudioWorklet;
use crossbeam_channel::{unbounded, Sender};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, trace};

/// Lowest sample rate a context accepts
pub const MIN_SAMPLE_RATE: u32 = 3000;
/// Highest sample rate a context accepts
pub const MAX_SAMPLE_RATE: u32 = 768_000;

/// Lifecycle state of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Suspended,
    Running,
    Closed,
}

impl From<RunState> for ContextState {
    fn from(state: RunState) -> Self {
        match state {
            RunState::Suspended => Self::Suspended,
            RunState::Running => Self::Running,
            RunState::Closed => Self::Closed,
        }
    }
}

/// Latency / power trade-off requested at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatencyHint {
    /// Lowest latency the device allows
    Interactive,
    Balanced,
    /// Large buffers, favouring stability and power use
    #[default]
    Playback,
}

impl LatencyHint {
    /// Device buffer size requested for this hint, in frames
    pub fn buffer_frames(self) -> u32 {
        match self {
            Self::Interactive => 256,
            Self::Balanced => 1024,
            Self::Playback => 4096,
        }
    }
}

/// Options for creating a context
#[derive(Debug, Clone, Copy)]
pub struct ContextOptions {
    pub sample_rate: u32,
    pub latency_hint: LatencyHint,
    /// Create the context suspended, as browsers do without a user gesture
    pub start_suspended: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            latency_hint: LatencyHint::Playback,
            start_suspended: false,
        }
    }
}

/// State shared by every handle of one context
pub(crate) struct ContextShared {
    sample_rate: u32,
    frames: Arc<AtomicU64>,
    state: Arc<AtomicU8>,
    commands: Sender<Command>,
    next_node: AtomicUsize,
    next_param: AtomicUsize,
}

impl ContextShared {
    pub(crate) fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub(crate) fn current_time(&self) -> f64 {
        self.frames.load(Ordering::Acquire) as f64 / f64::from(self.sample_rate)
    }

    pub(crate) fn run_state(&self) -> RunState {
        RunState::load(&self.state)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.run_state() == RunState::Closed
    }

    fn set_state(&self, state: RunState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn send(&self, command: Command) {
        if self.is_closed() {
            return;
        }
        if self.commands.send(command).is_err() {
            trace!("Renderer gone, dropping command");
        }
    }

    /// Register a processor with the renderer and create its param handles
    pub(crate) fn register<const N: usize>(
        self: &Arc<Self>,
        processor: Box<dyn Processor>,
        inputs: Vec<ChannelCountMode>,
        output_channels: Vec<usize>,
        params: [ParamSpec; N],
    ) -> Result<(NodeRef, [AudioParam; N])> {
        if self.is_closed() {
            return Err(AudioError::ContextClosed);
        }

        let id = self.next_node.fetch_add(1, Ordering::Relaxed);
        let handles: [AudioParam; N] = std::array::from_fn(|i| {
            let param_id = self.next_param.fetch_add(1, Ordering::Relaxed);
            AudioParam::new(param_id, params[i], Arc::clone(self))
        });

        let node = NodeRef {
            id,
            inputs: inputs.len(),
            outputs: output_channels.len(),
            context: Arc::clone(self),
        };

        self.send(Command::AddNode {
            id,
            spec: NodeSpec {
                processor,
                inputs,
                output_channels,
                params: handles
                    .iter()
                    .zip(params.iter())
                    .map(|(handle, spec)| (handle.id(), *spec))
                    .collect(),
            },
        });

        Ok((node, handles))
    }
}

enum Driver {
    Manual(Mutex<Renderer>),
    #[cfg(feature = "desktop")]
    Device(crate::device::DeviceDriver),
}

struct ContextInner {
    shared: Arc<ContextShared>,
    driver: Driver,
    destination: NodeRef,
    worklet: AudioWorklet,
    latency_hint: LatencyHint,
}

/// Handle to a processing context; clones share the same graph
#[derive(Clone)]
pub struct AudioContext {
    inner: Arc<ContextInner>,
}

impl AudioContext {
    /// Create a context rendered on demand through [`AudioContext::render`]
    pub fn new(options: ContextOptions) -> Result<Self> {
        validate_sample_rate(options.sample_rate)?;
        let (shared, renderer) = Self::build_core(options);
        let destination = Self::register_destination(&shared)?;

        info!(
            sample_rate = options.sample_rate,
            latency_hint = ?options.latency_hint,
            suspended = options.start_suspended,
            "Created manual audio context"
        );

        Ok(Self {
            inner: Arc::new(ContextInner {
                worklet: AudioWorklet::new(Arc::clone(&shared)),
                shared,
                driver: Driver::Manual(Mutex::new(renderer)),
                destination,
                latency_hint: options.latency_hint,
            }),
        })
    }

    /// Create a context that plays through the default output device
    ///
    /// The device's native sample rate overrides `options.sample_rate`.
    #[cfg(feature = "desktop")]
    pub fn with_output_device(options: ContextOptions) -> Result<Self> {
        let output = crate::device::find_default_device()?;
        let options = ContextOptions {
            sample_rate: output.sample_rate,
            ..options
        };
        validate_sample_rate(options.sample_rate)?;
        let (shared, renderer) = Self::build_core(options);
        let destination = Self::register_destination(&shared)?;
        let driver = crate::device::DeviceDriver::start(
            output,
            renderer,
            options.latency_hint,
            !options.start_suspended,
        )?;

        info!(
            sample_rate = options.sample_rate,
            latency_hint = ?options.latency_hint,
            "Created device audio context"
        );

        Ok(Self {
            inner: Arc::new(ContextInner {
                worklet: AudioWorklet::new(Arc::clone(&shared)),
                shared,
                driver: Driver::Device(driver),
                destination,
                latency_hint: options.latency_hint,
            }),
        })
    }

    fn build_core(options: ContextOptions) -> (Arc<ContextShared>, Renderer) {
        let (commands, receiver) = unbounded();
        let frames = Arc::new(AtomicU64::new(0));
        let initial = if options.start_suspended {
            RunState::Suspended
        } else {
            RunState::Running
        };
        let state = Arc::new(AtomicU8::new(initial as u8));
        let renderer = Renderer::new(
            options.sample_rate,
            receiver,
            Arc::clone(&frames),
            Arc::clone(&state),
        );
        let shared = Arc::new(ContextShared {
            sample_rate: options.sample_rate,
            frames,
            state,
            commands,
            next_node: AtomicUsize::new(0),
            next_param: AtomicUsize::new(0),
        });
        (shared, renderer)
    }

    fn register_destination(shared: &Arc<ContextShared>) -> Result<NodeRef> {
        let (node, []) = shared.register(
            Box::new(DestinationProcessor),
            vec![ChannelCountMode::Explicit(2)],
            vec![2],
            [],
        )?;
        Ok(node)
    }

    pub(crate) fn shared(&self) -> &Arc<ContextShared> {
        &self.inner.shared
    }

    pub fn state(&self) -> ContextState {
        self.inner.shared.run_state().into()
    }

    /// Seconds of audio rendered so far
    pub fn current_time(&self) -> f64 {
        self.inner.shared.current_time()
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.shared.sample_rate
    }

    pub fn latency_hint(&self) -> LatencyHint {
        self.inner.latency_hint
    }

    /// Final output node
    pub fn destination(&self) -> Destination {
        Destination {
            node: self.inner.destination.clone(),
        }
    }

    pub fn audio_worklet(&self) -> &AudioWorklet {
        &self.inner.worklet
    }

    /// Start or continue rendering
    pub async fn resume(&self) -> Result<()> {
        match self.inner.shared.run_state() {
            RunState::Closed => Err(AudioError::InvalidState(
                "cannot resume a closed context".into(),
            )),
            RunState::Running => Ok(()),
            RunState::Suspended => {
                self.inner.shared.set_state(RunState::Running);
                #[cfg(feature = "desktop")]
                if let Driver::Device(device) = &self.inner.driver {
                    device.play();
                }
                debug!(time = self.current_time(), "Context resumed");
                Ok(())
            }
        }
    }

    /// Stop rendering; the clock holds its value
    pub async fn suspend(&self) -> Result<()> {
        match self.inner.shared.run_state() {
            RunState::Closed => Err(AudioError::InvalidState(
                "cannot suspend a closed context".into(),
            )),
            RunState::Suspended => Ok(()),
            RunState::Running => {
                self.inner.shared.set_state(RunState::Suspended);
                #[cfg(feature = "desktop")]
                if let Driver::Device(device) = &self.inner.driver {
                    device.pause();
                }
                debug!(time = self.current_time(), "Context suspended");
                Ok(())
            }
        }
    }

    /// Release the renderer; closing twice is a no-op
    pub async fn close(&self) -> Result<()> {
        if self.inner.shared.is_closed() {
            return Ok(());
        }
        self.inner.shared.set_state(RunState::Closed);
        #[cfg(feature = "desktop")]
        if let Driver::Device(device) = &self.inner.driver {
            device.shutdown();
        }
        info!(time = self.current_time(), "Context closed");
        Ok(())
    }

    /// Render `frames` frames of interleaved stereo (manual driver only)
    pub fn render(&self, frames: usize) -> Result<Vec<f32>> {
        let mut out = vec![0.0; frames * 2];
        self.render_into(&mut out, 2)?;
        Ok(out)
    }

    /// Render into an interleaved buffer with `channels` channels
    pub fn render_into(&self, out: &mut [f32], channels: usize) -> Result<()> {
        match &self.inner.driver {
            Driver::Manual(renderer) => {
                renderer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .render_interleaved(out, channels);
                Ok(())
            }
            #[cfg(feature = "desktop")]
            Driver::Device(_) => Err(AudioError::InvalidState(
                "context is driven by an output device".into(),
            )),
        }
    }

    /// Decode WAV bytes at this context's sample rate
    pub fn decode_audio_data(&self, bytes: &[u8]) -> Result<AudioBuffer> {
        AudioBuffer::decode_at_rate(bytes, self.sample_rate())
    }

    pub fn create_gain(&self) -> Result<GainNode> {
        GainNode::new(self.shared())
    }

    pub fn create_biquad_filter(&self) -> Result<BiquadFilterNode> {
        BiquadFilterNode::new(self.shared())
    }

    /// Delay line able to hold `max_delay_time` seconds
    pub fn create_delay(&self, max_delay_time: f64) -> Result<DelayNode> {
        DelayNode::new(self.shared(), max_delay_time)
    }

    pub fn create_convolver(&self) -> Result<ConvolverNode> {
        ConvolverNode::new(self.shared())
    }

    pub fn create_dynamics_compressor(&self) -> Result<DynamicsCompressorNode> {
        DynamicsCompressorNode::new(self.shared())
    }

    pub fn create_panner(&self) -> Result<PannerNode> {
        PannerNode::new(self.shared())
    }

    pub fn create_oscillator(&self) -> Result<OscillatorNode> {
        OscillatorNode::new(self.shared())
    }

    pub fn create_analyser(&self) -> Result<AnalyserNode> {
        AnalyserNode::new(self.shared())
    }

    pub fn create_channel_splitter(&self, outputs: usize) -> Result<ChannelSplitterNode> {
        ChannelSplitterNode::new(self.shared(), outputs)
    }

    pub fn create_channel_merger(&self, inputs: usize) -> Result<ChannelMergerNode> {
        ChannelMergerNode::new(self.shared(), inputs)
    }

    pub fn create_media_element_source(
        &self,
        media: Arc<dyn MediaElement>,
    ) -> Result<MediaElementSourceNode> {
        MediaElementSourceNode::new(self.shared(), media)
    }
}

impl std::fmt::Debug for AudioContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioContext")
            .field("sample_rate", &self.sample_rate())
            .field("state", &self.state())
            .field("current_time", &self.current_time())
            .finish()
    }
}

/// The context's output node
#[derive(Debug, Clone)]
pub struct Destination {
    node: NodeRef,
}

impl crate::node::AudioNode for Destination {
    fn node_ref(&self) -> &NodeRef {
        &self.node
    }
}

fn validate_sample_rate(sample_rate: u32) -> Result<()> {
    if (MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&sample_rate) {
        Ok(())
    } else {
        Err(AudioError::BackendUnavailable(format!(
            "unsupported sample rate {sample_rate} Hz"
        )))
    }
}
