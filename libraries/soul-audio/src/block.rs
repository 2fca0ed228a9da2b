//! Fixed-size planar sample blocks exchanged between nodes
//!
//! Every node reads and writes one [`AudioBlock`] per port per render quantum.
//! Blocks are allocated once when a node is registered and reused forever,
//! so the render loop itself never allocates.

/// Frames processed per render call
pub const RENDER_QUANTUM: usize = 128;

/// Upper bound on channels per block
pub const MAX_CHANNELS: usize = 8;

/// How a node input derives its channel count from its connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCountMode {
    /// Widest connected output
    Max,
    /// Widest connected output, capped
    ClampedMax(usize),
    /// Always exactly this many channels
    Explicit(usize),
}

impl ChannelCountMode {
    pub(crate) fn resolve(self, widest: usize) -> usize {
        let n = match self {
            Self::Max => widest,
            Self::ClampedMax(cap) => widest.min(cap),
            Self::Explicit(n) => n,
        };
        n.clamp(1, MAX_CHANNELS)
    }
}

/// One render quantum of planar audio
#[derive(Clone)]
pub struct AudioBlock {
    channels: usize,
    data: Box<[[f32; RENDER_QUANTUM]; MAX_CHANNELS]>,
}

impl AudioBlock {
    /// Silent block with `channels` active channels
    pub fn new(channels: usize) -> Self {
        Self {
            channels: channels.clamp(1, MAX_CHANNELS),
            data: Box::new([[0.0; RENDER_QUANTUM]; MAX_CHANNELS]),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels
    }

    /// Change the active channel count; contents are left as they are
    pub fn set_channel_count(&mut self, channels: usize) {
        self.channels = channels.clamp(1, MAX_CHANNELS);
    }

    pub fn channel(&self, index: usize) -> &[f32; RENDER_QUANTUM] {
        &self.data[index.min(MAX_CHANNELS - 1)]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut [f32; RENDER_QUANTUM] {
        &mut self.data[index.min(MAX_CHANNELS - 1)]
    }

    /// Zero all active channels
    pub fn silence(&mut self) {
        for ch in &mut self.data[..self.channels] {
            ch.fill(0.0);
        }
    }

    pub fn is_silent(&self) -> bool {
        self.data[..self.channels]
            .iter()
            .all(|ch| ch.iter().all(|&s| s == 0.0))
    }

    /// Copy another block, adopting its channel count
    pub fn copy_from(&mut self, other: &AudioBlock) {
        self.channels = other.channels;
        for (dst, src) in self.data.iter_mut().zip(other.data.iter()).take(other.channels) {
            dst.copy_from_slice(src);
        }
    }

    /// Mono mix of the sample at `frame` (average of active channels)
    pub fn mono_sample(&self, frame: usize) -> f32 {
        let sum: f32 = self.data[..self.channels].iter().map(|ch| ch[frame]).sum();
        sum / self.channels as f32
    }

    /// Sum `src` into this block, up- or down-mixing to this block's channel count
    ///
    /// Mono to stereo copies into both sides, stereo to mono averages,
    /// everything else maps channels one to one.
    pub fn mix_from(&mut self, src: &AudioBlock) {
        let dst_channels = self.channels;
        match (src.channels, dst_channels) {
            (s, d) if s == d => {
                for (dst, src) in self.data.iter_mut().zip(src.data.iter()).take(d) {
                    for (o, i) in dst.iter_mut().zip(src.iter()) {
                        *o += *i;
                    }
                }
            }
            (1, d) if d >= 2 => {
                let mono = &src.data[0];
                for dst in self.data.iter_mut().take(2) {
                    for (o, i) in dst.iter_mut().zip(mono.iter()) {
                        *o += *i;
                    }
                }
            }
            (2, 1) => {
                let (l, r) = (&src.data[0], &src.data[1]);
                for (n, o) in self.data[0].iter_mut().enumerate() {
                    *o += 0.5 * (l[n] + r[n]);
                }
            }
            (s, d) => {
                for (dst, src) in self.data.iter_mut().zip(src.data.iter()).take(s.min(d)) {
                    for (o, i) in dst.iter_mut().zip(src.iter()) {
                        *o += *i;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for AudioBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioBlock")
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}
