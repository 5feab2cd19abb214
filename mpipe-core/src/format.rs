//! Elementary stream format descriptors
//!
//! A [`FourCC`] names the codec of a compressed stream; an [`EsFormat`]
//! describes one elementary stream as handed to a decoder or muxer input.
//! [`AudioFormat`] is the decoded output format negotiated with a sink.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Four-character codec identifier (case-sensitive)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FourCC([u8; 4]);

impl FourCC {
    pub const fn new(code: &[u8; 4]) -> Self {
        FourCC(*code)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCC({})", self)
    }
}

impl FromStr for FourCC {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 {
            return Err(format!("fourcc must be exactly 4 bytes, got '{}'", s));
        }
        Ok(FourCC([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl TryFrom<String> for FourCC {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FourCC> for String {
    fn from(value: FourCC) -> Self {
        value.to_string()
    }
}

/// Elementary stream category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EsCategory {
    Audio,
    Video,
    Other,
}

/// Audio parameters of a compressed or raw stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    pub rate: u32,
    pub channels: u16,
    /// Bits per sample for raw formats (0 when not meaningful)
    #[serde(default)]
    pub bits_per_sample: u16,
}

/// Video parameters of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
}

/// Elementary stream format descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EsFormat {
    pub category: EsCategory,
    pub codec: FourCC,
    #[serde(default)]
    pub audio: Option<AudioParams>,
    #[serde(default)]
    pub video: Option<VideoParams>,
}

impl EsFormat {
    /// Audio stream descriptor
    pub fn audio(codec: FourCC, rate: u32, channels: u16) -> Self {
        Self {
            category: EsCategory::Audio,
            codec,
            audio: Some(AudioParams {
                rate,
                channels,
                bits_per_sample: 0,
            }),
            video: None,
        }
    }

    /// Video stream descriptor without geometry
    pub fn video(codec: FourCC) -> Self {
        Self {
            category: EsCategory::Video,
            codec,
            audio: None,
            video: None,
        }
    }

    pub fn with_video_size(mut self, width: u32, height: u32) -> Self {
        self.video = Some(VideoParams { width, height });
        self
    }
}

/// Decoded audio output format (interleaved f32 samples)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub rate: u32,
    pub channels: u16,
}
