//! Configuration for contexts and streams.

use std::time::Duration;

use crate::backend::BackendKind;
use crate::format::{ChannelLayout, SampleFormat};

/// How an [`AudioContext`](crate::AudioContext) picks its backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextConfig {
    /// Reported to backends that show client names.
    pub app_name: String,
    /// Tried in order on `connect`; the first one that connects wins.
    pub backends: Vec<BackendKind>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            app_name: "soundout".to_string(),
            backends: BackendKind::defaults(),
        }
    }
}

impl ContextConfig {
    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    pub fn with_backends(mut self, backends: Vec<BackendKind>) -> Self {
        self.backends = backends;
        self
    }
}

/// What an [`OutputStream`](crate::OutputStream) asks for when it opens.
///
/// `None` fields are negotiated from the device: sample rate nearest to 48 kHz,
/// native-endian f32 if available, the device's current layout and latency.
///
/// # Example
///
/// ```
/// use soundout::{SampleFormat, StreamConfig};
/// use std::time::Duration;
///
/// let config = StreamConfig::default()
///     .with_sample_rate(48000)
///     .with_format(SampleFormat::S16Le)
///     .with_software_latency(Duration::from_millis(20));
/// assert_eq!(config.sample_rate, Some(48000));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub name: String,
    pub format: Option<SampleFormat>,
    pub sample_rate: Option<u32>,
    pub layout: Option<ChannelLayout>,
    /// Device-side buffering. Clamped to what the device accepts.
    pub software_latency: Option<Duration>,
    /// How much audio the application may queue ahead in the ring buffer.
    ///
    /// Default: 200ms
    pub ring_latency: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: "soundout".to_string(),
            format: None,
            sample_rate: None,
            layout: None,
            software_latency: None,
            ring_latency: Duration::from_millis(200),
        }
    }
}

impl StreamConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_format(mut self, format: SampleFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = Some(rate);
        self
    }

    pub fn with_layout(mut self, layout: ChannelLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn with_software_latency(mut self, latency: Duration) -> Self {
        self.software_latency = Some(latency);
        self
    }

    pub fn with_ring_latency(mut self, latency: Duration) -> Self {
        self.ring_latency = latency;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_config_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.name, "soundout");
        assert_eq!(config.format, None);
        assert_eq!(config.sample_rate, None);
        assert_eq!(config.ring_latency, Duration::from_millis(200));
    }

    #[test]
    fn test_context_config_defaults_end_with_dummy() {
        let config = ContextConfig::default();
        assert_eq!(config.backends.last(), Some(&BackendKind::Dummy));
        assert_eq!(config.app_name, "soundout");
    }
}
