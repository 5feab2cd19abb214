//! Raw interleaved PCM decoder
//!
//! Handles little-endian signed 16-bit (`s16l`) and 32-bit float (`f32l`)
//! payloads and normalizes both to f32 in [-1.0, 1.0].

use super::{DecodedFrame, Decoder};
use crate::block::{Block, BlockFlags};
use crate::error::{Error, Result};
use crate::format::{AudioFormat, EsFormat, FourCC};
use tracing::debug;

pub const CODEC_S16L: FourCC = FourCC::new(b"s16l");
pub const CODEC_F32L: FourCC = FourCC::new(b"f32l");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleEncoding {
    S16Le,
    F32Le,
}

impl SampleEncoding {
    fn bytes_per_sample(self) -> usize {
        match self {
            SampleEncoding::S16Le => 2,
            SampleEncoding::F32Le => 4,
        }
    }
}

/// Decoder for raw PCM blocks
#[derive(Debug, Default)]
pub struct PcmDecoder {
    encoding: Option<SampleEncoding>,
    channels: u16,
}

impl PcmDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn supports(codec: FourCC) -> bool {
        codec == CODEC_S16L || codec == CODEC_F32L
    }
}

impl Decoder for PcmDecoder {
    fn name(&self) -> &'static str {
        "pcm"
    }

    fn open(&mut self, format: &EsFormat) -> Result<AudioFormat> {
        let encoding = if format.codec == CODEC_S16L {
            SampleEncoding::S16Le
        } else if format.codec == CODEC_F32L {
            SampleEncoding::F32Le
        } else {
            return Err(Error::Unsupported(format!("pcm codec '{}'", format.codec)));
        };

        let audio = format
            .audio
            .ok_or_else(|| Error::Unsupported("pcm stream without audio parameters".to_string()))?;
        if audio.rate == 0 || audio.channels == 0 {
            return Err(Error::Unsupported(format!(
                "pcm stream with rate={} channels={}",
                audio.rate, audio.channels
            )));
        }

        self.encoding = Some(encoding);
        self.channels = audio.channels;
        debug!(
            "PCM decoder opened: codec={} rate={} channels={}",
            format.codec, audio.rate, audio.channels
        );

        Ok(AudioFormat {
            rate: audio.rate,
            channels: audio.channels,
        })
    }

    fn decode(&mut self, block: &Block) -> Result<Vec<DecodedFrame>> {
        let encoding = self
            .encoding
            .ok_or_else(|| Error::InvalidState("pcm decoder not opened".to_string()))?;

        if block.flags.contains(BlockFlags::CORRUPTED) {
            return Err(Error::Decode("block flagged corrupted".to_string()));
        }
        if block.is_empty() {
            return Ok(Vec::new());
        }

        let frame_bytes = encoding.bytes_per_sample() * self.channels as usize;
        if block.len() % frame_bytes != 0 {
            return Err(Error::Decode(format!(
                "{} bytes is not a whole number of {}-byte frames",
                block.len(),
                frame_bytes
            )));
        }

        let sample_count = block.len() / encoding.bytes_per_sample();
        let mut samples: Vec<f32> = Vec::new();
        samples.try_reserve_exact(sample_count).map_err(|e| {
            Error::ResourceExhausted(format!("pcm output of {} samples: {}", sample_count, e))
        })?;

        match encoding {
            SampleEncoding::S16Le => samples.extend(
                block
                    .data()
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0),
            ),
            SampleEncoding::F32Le => samples.extend(
                block
                    .data()
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]).clamp(-1.0, 1.0)),
            ),
        }

        Ok(vec![DecodedFrame::new(samples, self.channels)])
    }

    fn close(&mut self) {
        self.encoding = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s16_stereo() -> EsFormat {
        EsFormat::audio(CODEC_S16L, 48_000, 2)
    }

    #[test]
    fn test_open_reports_output_format() {
        let mut decoder = PcmDecoder::new();
        let output = decoder.open(&s16_stereo()).unwrap();
        assert_eq!(output, AudioFormat { rate: 48_000, channels: 2 });
    }

    #[test]
    fn test_open_rejects_foreign_codec() {
        let mut decoder = PcmDecoder::new();
        let err = decoder
            .open(&EsFormat::audio(FourCC::new(b"mp4a"), 48_000, 2))
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn test_open_rejects_zero_channels() {
        let mut decoder = PcmDecoder::new();
        assert!(decoder.open(&EsFormat::audio(CODEC_S16L, 48_000, 0)).is_err());
    }

    #[test]
    fn test_decode_s16() {
        let mut decoder = PcmDecoder::new();
        decoder.open(&s16_stereo()).unwrap();

        let mut payload = Vec::new();
        for sample in [0i16, 16384, -32768, 32767] {
            payload.extend_from_slice(&sample.to_le_bytes());
        }
        let frames = decoder.decode(&Block::from_vec(payload)).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frames, 2);
        assert_eq!(frames[0].samples[0], 0.0);
        assert_eq!(frames[0].samples[1], 0.5);
        assert_eq!(frames[0].samples[2], -1.0);
        assert!(frames[0].samples[3] > 0.99);
    }

    #[test]
    fn test_decode_f32_clamps() {
        let mut decoder = PcmDecoder::new();
        decoder.open(&EsFormat::audio(CODEC_F32L, 44_100, 1)).unwrap();

        let mut payload = Vec::new();
        for sample in [0.25f32, 2.0] {
            payload.extend_from_slice(&sample.to_le_bytes());
        }
        let frames = decoder.decode(&Block::from_vec(payload)).unwrap();
        assert_eq!(frames[0].samples, vec![0.25, 1.0]);
    }

    #[test]
    fn test_partial_frame_is_decode_error() {
        let mut decoder = PcmDecoder::new();
        decoder.open(&s16_stereo()).unwrap();

        let err = decoder.decode(&Block::from_vec(vec![0; 5])).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_empty_block_yields_no_frames() {
        let mut decoder = PcmDecoder::new();
        decoder.open(&s16_stereo()).unwrap();
        assert!(decoder.decode(&Block::from_vec(Vec::new())).unwrap().is_empty());
    }
}
