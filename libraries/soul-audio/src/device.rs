//! Output-device driver (`desktop` feature)
//!
//! A dedicated audio thread owns the `cpal` stream; the control side talks to
//! it over a small command channel, which keeps the platform stream type off
//! every other thread. The renderer moves into the stream callback and pulls
//! the graph once per device buffer.

use crate::context::LatencyHint;
use crate::error::{AudioError, Result};
use crate::render::Renderer;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Default output device and its preferred configuration
pub(crate) struct OutputDevice {
    device: Device,
    config: SupportedStreamConfig,
    pub(crate) sample_rate: u32,
}

pub(crate) fn find_default_device() -> Result<OutputDevice> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioError::BackendUnavailable("no default output device".into()))?;
    let config = device
        .default_output_config()
        .map_err(|e| AudioError::BackendUnavailable(e.to_string()))?;
    if config.sample_format() != SampleFormat::F32 {
        return Err(AudioError::BackendUnavailable(format!(
            "unsupported device sample format {:?}",
            config.sample_format()
        )));
    }
    let sample_rate = config.sample_rate();
    Ok(OutputDevice {
        device,
        config,
        sample_rate,
    })
}

enum DeviceCommand {
    Play,
    Pause,
    Shutdown,
}

pub(crate) struct DeviceDriver {
    commands: Sender<DeviceCommand>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceDriver {
    /// Spawn the audio thread and wait until the stream is built
    pub(crate) fn start(
        output: OutputDevice,
        renderer: Renderer,
        latency_hint: LatencyHint,
        playing: bool,
    ) -> Result<Self> {
        let (commands, command_rx) = bounded::<DeviceCommand>(16);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);

        let mut config: StreamConfig = output.config.config();
        config.buffer_size = BufferSize::Fixed(latency_hint.buffer_frames());
        let device = output.device;

        let thread = thread::Builder::new()
            .name("soul-audio-render".into())
            .spawn(move || {
                Self::run(device, config, renderer, playing, command_rx, ready_tx);
            })
            .map_err(AudioError::Io)?;

        ready_rx
            .recv()
            .map_err(|_| AudioError::Device("audio thread exited during startup".into()))??;

        Ok(Self {
            commands,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn run(
        device: Device,
        config: StreamConfig,
        renderer: Renderer,
        playing: bool,
        commands: Receiver<DeviceCommand>,
        ready: Sender<Result<()>>,
    ) {
        let channels = usize::from(config.channels);
        // Only the live stream's callback ever locks this
        let renderer = Arc::new(Mutex::new(renderer));
        let stream = match Self::build_stream(&device, &config, channels, &renderer) {
            Ok(stream) => stream,
            Err(e) => {
                // Not every backend accepts a fixed buffer size
                warn!(error = %e, "Fixed buffer size rejected, using device default");
                let fallback = StreamConfig {
                    buffer_size: BufferSize::Default,
                    ..config.clone()
                };
                match Self::build_stream(&device, &fallback, channels, &renderer) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready.send(Err(e));
                        return;
                    }
                }
            }
        };

        if playing {
            if let Err(e) = stream.play() {
                let _ = ready.send(Err(AudioError::Device(e.to_string())));
                return;
            }
        }
        info!(
            channels,
            sample_rate = config.sample_rate,
            "Output stream started"
        );
        let _ = ready.send(Ok(()));

        while let Ok(command) = commands.recv() {
            match command {
                DeviceCommand::Play => {
                    if let Err(e) = stream.play() {
                        error!(error = %e, "Failed to start output stream");
                    }
                }
                DeviceCommand::Pause => {
                    if let Err(e) = stream.pause() {
                        warn!(error = %e, "Failed to pause output stream");
                    }
                }
                DeviceCommand::Shutdown => break,
            }
        }
        drop(stream);
        debug!("Output stream released");
    }

    fn build_stream(
        device: &Device,
        config: &StreamConfig,
        channels: usize,
        renderer: &Arc<Mutex<Renderer>>,
    ) -> Result<Stream> {
        let renderer = Arc::clone(renderer);
        device
            .build_output_stream(
                config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| match renderer.try_lock() {
                    Ok(mut renderer) => renderer.render_interleaved(data, channels),
                    Err(_) => data.fill(0.0),
                },
                |err| error!(error = %err, "Output stream error"),
                None,
            )
            .map_err(|e| AudioError::Device(e.to_string()))
    }

    pub(crate) fn play(&self) {
        let _ = self.commands.send(DeviceCommand::Play);
    }

    pub(crate) fn pause(&self) {
        let _ = self.commands.send(DeviceCommand::Pause);
    }

    /// Stop the stream and join the audio thread
    pub(crate) fn shutdown(&self) {
        let _ = self.commands.send(DeviceCommand::Shutdown);
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Audio thread panicked");
            }
        }
    }
}

impl Drop for DeviceDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}
