//! Playback sources that feed a [`MediaElementSourceNode`]
//!
//! A media element is whatever the host uses to play a track. The render
//! thread pulls interleaved frames from it every quantum, so `read` must not
//! block.
//!
//! [`MediaElementSourceNode`]: crate::MediaElementSourceNode

use crate::buffer::AudioBuffer;
use crate::error::Result;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Host-side player that the processing context pulls samples from
pub trait MediaElement: Send + Sync {
    /// Channels produced by [`MediaElement::read`]
    fn channel_count(&self) -> usize;

    /// Fill `out` with interleaved frames and return the frame count written
    ///
    /// Called on the render thread. Returns 0 when paused or ended.
    fn read(&self, out: &mut [f32]) -> usize;

    fn is_paused(&self) -> bool;

    fn play(&self) -> Result<()>;

    fn pause(&self);
}

/// Media element that never produces audio
#[derive(Debug, Default)]
pub struct SilentMedia {
    paused: AtomicBool,
}

impl SilentMedia {
    pub fn new() -> Self {
        Self {
            paused: AtomicBool::new(true),
        }
    }
}

impl MediaElement for SilentMedia {
    fn channel_count(&self) -> usize {
        2
    }

    fn read(&self, _out: &mut [f32]) -> usize {
        0
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn play(&self) -> Result<()> {
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }
}

/// Plays a decoded buffer once from the start; pauses itself at the end
#[derive(Debug)]
pub struct BufferMedia {
    buffer: Arc<AudioBuffer>,
    position: AtomicUsize,
    paused: AtomicBool,
}

impl BufferMedia {
    /// Starts paused
    pub fn new(buffer: Arc<AudioBuffer>) -> Self {
        Self {
            buffer,
            position: AtomicUsize::new(0),
            paused: AtomicBool::new(true),
        }
    }

    /// Frames played so far
    pub fn position(&self) -> usize {
        self.position.load(Ordering::Acquire)
    }

    pub fn is_ended(&self) -> bool {
        self.position() >= self.buffer.length()
    }

    pub fn seek(&self, frame: usize) {
        self.position
            .store(frame.min(self.buffer.length()), Ordering::Release);
    }
}

impl MediaElement for BufferMedia {
    fn channel_count(&self) -> usize {
        self.buffer.number_of_channels()
    }

    fn read(&self, out: &mut [f32]) -> usize {
        if self.is_paused() {
            return 0;
        }
        let channels = self.channel_count().max(1);
        let start = self.position.load(Ordering::Acquire);
        let frames = (out.len() / channels).min(self.buffer.length().saturating_sub(start));

        for ch in 0..channels {
            let src = &self.buffer.channel(ch)[start..start + frames];
            for (i, &s) in src.iter().enumerate() {
                out[i * channels + ch] = s;
            }
        }
        self.position.store(start + frames, Ordering::Release);
        if start + frames >= self.buffer.length() {
            self.paused.store(true, Ordering::Release);
        }
        frames
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn play(&self) -> Result<()> {
        if self.is_ended() {
            self.seek(0);
        }
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }
}
