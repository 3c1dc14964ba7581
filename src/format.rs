//! Sample formats, channel layouts and sample-rate ranges

use dasp_sample::{Sample, I24};

/// How one sample is laid out in memory.
///
/// 24-bit formats use a 32-bit container with the value sign-extended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    S8,
    U8,
    S16Le,
    S16Be,
    U16Le,
    U16Be,
    S24Le,
    S24Be,
    S32Le,
    S32Be,
    F32Le,
    F32Be,
    F64Le,
    F64Be,
}

impl SampleFormat {
    #[cfg(target_endian = "little")]
    pub const S16_NE: Self = Self::S16Le;
    #[cfg(target_endian = "big")]
    pub const S16_NE: Self = Self::S16Be;
    #[cfg(target_endian = "little")]
    pub const F32_NE: Self = Self::F32Le;
    #[cfg(target_endian = "big")]
    pub const F32_NE: Self = Self::F32Be;

    pub const ALL: [SampleFormat; 14] = [
        Self::S8,
        Self::U8,
        Self::S16Le,
        Self::S16Be,
        Self::U16Le,
        Self::U16Be,
        Self::S24Le,
        Self::S24Be,
        Self::S32Le,
        Self::S32Be,
        Self::F32Le,
        Self::F32Be,
        Self::F64Le,
        Self::F64Be,
    ];

    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::S8 | Self::U8 => 1,
            Self::S16Le | Self::S16Be | Self::U16Le | Self::U16Be => 2,
            Self::S24Le | Self::S24Be | Self::S32Le | Self::S32Be => 4,
            Self::F32Le | Self::F32Be => 4,
            Self::F64Le | Self::F64Be => 8,
        }
    }

    /// Unsigned formats are silent at mid-scale rather than at zero.
    pub fn is_unsigned(self) -> bool {
        matches!(self, Self::U8 | Self::U16Le | Self::U16Be)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::S8 => "signed 8-bit",
            Self::U8 => "unsigned 8-bit",
            Self::S16Le => "signed 16-bit LE",
            Self::S16Be => "signed 16-bit BE",
            Self::U16Le => "unsigned 16-bit LE",
            Self::U16Be => "unsigned 16-bit BE",
            Self::S24Le => "signed 24-bit LE",
            Self::S24Be => "signed 24-bit BE",
            Self::S32Le => "signed 32-bit LE",
            Self::S32Be => "signed 32-bit BE",
            Self::F32Le => "float 32-bit LE",
            Self::F32Be => "float 32-bit BE",
            Self::F64Le => "float 64-bit LE",
            Self::F64Be => "float 64-bit BE",
        }
    }

    /// Encodes one sample in `[-1.0, 1.0]` into the first
    /// [`bytes_per_sample`](Self::bytes_per_sample) bytes of `out`.
    #[inline]
    pub fn encode(self, value: f32, out: &mut [u8]) {
        let s = value.clamp(-1.0, 1.0);
        match self {
            Self::S8 => out[0] = s.to_sample::<i8>().to_ne_bytes()[0],
            Self::U8 => out[0] = s.to_sample::<u8>(),
            Self::S16Le => out[..2].copy_from_slice(&s.to_sample::<i16>().to_le_bytes()),
            Self::S16Be => out[..2].copy_from_slice(&s.to_sample::<i16>().to_be_bytes()),
            Self::U16Le => out[..2].copy_from_slice(&s.to_sample::<u16>().to_le_bytes()),
            Self::U16Be => out[..2].copy_from_slice(&s.to_sample::<u16>().to_be_bytes()),
            Self::S24Le => out[..4].copy_from_slice(&s.to_sample::<I24>().inner().to_le_bytes()),
            Self::S24Be => out[..4].copy_from_slice(&s.to_sample::<I24>().inner().to_be_bytes()),
            Self::S32Le => out[..4].copy_from_slice(&s.to_sample::<i32>().to_le_bytes()),
            Self::S32Be => out[..4].copy_from_slice(&s.to_sample::<i32>().to_be_bytes()),
            Self::F32Le => out[..4].copy_from_slice(&s.to_le_bytes()),
            Self::F32Be => out[..4].copy_from_slice(&s.to_be_bytes()),
            Self::F64Le => out[..8].copy_from_slice(&s.to_sample::<f64>().to_le_bytes()),
            Self::F64Be => out[..8].copy_from_slice(&s.to_sample::<f64>().to_be_bytes()),
        }
    }

    /// Overwrites `out` (a whole number of samples) with silence.
    pub fn fill_silence(self, out: &mut [u8]) {
        if !self.is_unsigned() {
            out.fill(0);
            return;
        }
        for sample in out.chunks_exact_mut(self.bytes_per_sample()) {
            self.encode(0.0, sample);
        }
    }
}

/// Position of one channel within a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelId {
    FrontLeft,
    FrontRight,
    FrontCenter,
    Lfe,
    BackLeft,
    BackRight,
    BackCenter,
    SideLeft,
    SideRight,
}

/// A named, ordered set of channels.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChannelLayout {
    name: String,
    channels: Vec<ChannelId>,
}

impl ChannelLayout {
    pub fn new(name: impl Into<String>, channels: Vec<ChannelId>) -> Self {
        Self {
            name: name.into(),
            channels,
        }
    }

    pub fn mono() -> Self {
        Self::new("Mono", vec![ChannelId::FrontCenter])
    }

    pub fn stereo() -> Self {
        Self::new("Stereo", vec![ChannelId::FrontLeft, ChannelId::FrontRight])
    }

    pub fn quad() -> Self {
        use ChannelId::*;
        Self::new("Quad", vec![FrontLeft, FrontRight, BackLeft, BackRight])
    }

    pub fn surround_5_1() -> Self {
        use ChannelId::*;
        Self::new(
            "5.1",
            vec![FrontLeft, FrontRight, FrontCenter, Lfe, SideLeft, SideRight],
        )
    }

    pub fn surround_7_1() -> Self {
        use ChannelId::*;
        Self::new(
            "7.1",
            vec![
                FrontLeft,
                FrontRight,
                FrontCenter,
                Lfe,
                BackLeft,
                BackRight,
                SideLeft,
                SideRight,
            ],
        )
    }

    /// The conventional layout for a channel count, if there is one.
    pub fn default_for(channel_count: usize) -> Option<Self> {
        match channel_count {
            1 => Some(Self::mono()),
            2 => Some(Self::stereo()),
            4 => Some(Self::quad()),
            6 => Some(Self::surround_5_1()),
            8 => Some(Self::surround_7_1()),
            _ => None,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn channels(&self) -> &[ChannelId] {
        &self.channels
    }

    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn find_channel(&self, id: ChannelId) -> Option<usize> {
        self.channels.iter().position(|&c| c == id)
    }
}

/// An inclusive range of sample rates a device accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SampleRateRange {
    pub min: u32,
    pub max: u32,
}

impl SampleRateRange {
    pub fn new(min: u32, max: u32) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }

    pub fn exactly(rate: u32) -> Self {
        Self::new(rate, rate)
    }

    #[inline]
    pub fn contains(&self, rate: u32) -> bool {
        (self.min..=self.max).contains(&rate)
    }
}

/// Everything fixed about a stream once it has been opened.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamFormat {
    pub sample_format: SampleFormat,
    pub sample_rate: u32,
    pub layout: ChannelLayout,
    /// Frames the backend asks for per period, at most.
    pub period_frames: usize,
    pub software_latency: std::time::Duration,
}

impl StreamFormat {
    #[inline]
    pub fn channels(&self) -> usize {
        self.layout.channel_count()
    }

    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.sample_format.bytes_per_sample() * self.channels()
    }

    #[inline]
    pub fn bytes_per_second(&self) -> usize {
        self.bytes_per_frame() * self.sample_rate as usize
    }

    pub fn period_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.period_frames as f64 / f64::from(self.sample_rate))
    }
}
