//! Multipart JPEG muxer
//!
//! Each block becomes one part of a `multipart/x-mixed-replace` body:
//!
//! ```text
//! \r\n--<BOUNDARY>\r\n
//! Content-Type: image/jpeg\r\n
//! Content-Length: <len>\r\n
//! \r\n
//! <payload>
//! ```
//!
//! The part header and the payload go out as two separate writes. Parts have
//! no trailing terminator; the closing `--<BOUNDARY>--` line is only written
//! on close when enabled.

use super::{MuxCapabilities, MuxFormat, StreamId};
use crate::block::{Block, BlockFlags, BlockPool};
use crate::error::{RejectReason, Result};
use crate::format::{EsFormat, FourCC};
use crate::sink::AccessOutput;
use mpipe_common::config::MuxConfig;
use tracing::{debug, trace, warn};

pub const BOUNDARY: &str = "7b3cc56e5f51db803f790dad720ed50a";

pub const CONTENT_TYPE: &str = "image/jpeg";

/// Codec identifiers accepted as JPEG frames
pub const SUPPORTED_CODECS: [FourCC; 7] = [
    FourCC::new(b"MJPG"),
    FourCC::new(b"mjpg"),
    FourCC::new(b"jpeg"),
    FourCC::new(b"JPEG"),
    FourCC::new(b"JFIF"),
    FourCC::new(b"JPGL"),
    FourCC::new(b"mjpa"),
];

/// Multipart JPEG framing
pub struct MpjpegFormat {
    pool: BlockPool,
    emit_final_boundary: bool,
    parts: u64,
}

impl MpjpegFormat {
    pub fn new() -> Self {
        Self {
            // Headers are under 128 bytes; a small pool covers steady state
            pool: BlockPool::new(8, 256),
            emit_final_boundary: false,
            parts: 0,
        }
    }

    pub fn from_config(config: &MuxConfig) -> Self {
        Self::new().with_final_boundary(config.emit_final_boundary)
    }

    /// Write `\r\n--<BOUNDARY>--\r\n` on close
    pub fn with_final_boundary(mut self, enabled: bool) -> Self {
        self.emit_final_boundary = enabled;
        self
    }

    /// Use `pool` for part headers
    pub fn with_pool(mut self, pool: BlockPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn parts_written(&self) -> u64 {
        self.parts
    }

    /// Header preceding a payload of `len` bytes
    pub fn part_header(len: usize) -> String {
        format!(
            "\r\n--{}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
            BOUNDARY, CONTENT_TYPE, len
        )
    }
}

impl Default for MpjpegFormat {
    fn default() -> Self {
        Self::new()
    }
}

impl MuxFormat for MpjpegFormat {
    fn name(&self) -> &'static str {
        "mpjpeg"
    }

    fn capabilities(&self) -> MuxCapabilities {
        MuxCapabilities {
            add_while_muxing: true,
            wait_for_first_block: true,
            max_inputs: Some(1),
        }
    }

    fn mime(&self) -> Option<String> {
        Some(format!("multipart/x-mixed-replace; boundary={}", BOUNDARY))
    }

    fn accepts(&self, format: &EsFormat) -> std::result::Result<(), RejectReason> {
        if SUPPORTED_CODECS.contains(&format.codec) {
            Ok(())
        } else {
            Err(RejectReason::UnsupportedCodec(format.codec))
        }
    }

    fn write_block(
        &mut self,
        stream: StreamId,
        block: Block,
        access: &mut dyn AccessOutput,
    ) -> Result<()> {
        let header_text = Self::part_header(block.len());
        let mut header = match self.pool.alloc_from(header_text.as_bytes()) {
            Ok(header) => header,
            Err(e) => {
                // Skip this part only; the payload is released here
                warn!("mpjpeg: dropping {} byte part from {}: {}", block.len(), stream, e);
                return Ok(());
            }
        };
        header.flags.insert(BlockFlags::HEADER);

        trace!("mpjpeg: part of {} bytes from {}", block.len(), stream);
        access.write(header)?;
        access.write(block)?;
        self.parts += 1;
        Ok(())
    }

    fn close(&mut self, access: &mut dyn AccessOutput) -> Result<()> {
        if !self.emit_final_boundary {
            return Ok(());
        }

        let trailer = self
            .pool
            .alloc_from(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes())?
            .with_flags(BlockFlags::HEADER);
        access.write(trailer)?;
        debug!("mpjpeg: final boundary written after {} parts", self.parts);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::{MuxQuery, MuxReply};
    use crate::sink::MemoryAccess;

    #[test]
    fn test_part_header_layout() {
        assert_eq!(
            MpjpegFormat::part_header(3),
            "\r\n--7b3cc56e5f51db803f790dad720ed50a\r\n\
             Content-Type: image/jpeg\r\n\
             Content-Length: 3\r\n\
             \r\n"
        );
    }

    #[test]
    fn test_whitelist() {
        let format = MpjpegFormat::new();
        for codec in SUPPORTED_CODECS {
            assert!(format.accepts(&EsFormat::video(codec)).is_ok());
        }
        assert_eq!(
            format.accepts(&EsFormat::video(FourCC::new(b"h264"))),
            Err(RejectReason::UnsupportedCodec(FourCC::new(b"h264")))
        );
    }

    #[test]
    fn test_mime_reply() {
        let format = MpjpegFormat::new();
        assert_eq!(
            format.control(&MuxQuery::Mime).unwrap(),
            MuxReply::Mime(
                "multipart/x-mixed-replace; boundary=7b3cc56e5f51db803f790dad720ed50a".to_string()
            )
        );
        assert_eq!(
            format.control(&MuxQuery::CanAddStreamWhileMuxing).unwrap(),
            MuxReply::Bool(true)
        );
    }

    #[test]
    fn test_write_block_is_two_writes() {
        let mut format = MpjpegFormat::new();
        let mut access = MemoryAccess::new();

        format
            .write_block(StreamId(0), Block::from_vec(b"ABC".to_vec()), &mut access)
            .unwrap();

        let writes = access.writes();
        assert_eq!(writes.len(), 2);
        assert!(writes[0].flags.contains(BlockFlags::HEADER));
        assert_eq!(writes[1].data, b"ABC");
        assert_eq!(format.parts_written(), 1);
    }

    #[test]
    fn test_header_allocation_failure_drops_only_that_part() {
        let tiny = BlockPool::new(4, 256).with_max_block_size(16);
        let mut format = MpjpegFormat::new().with_pool(tiny);
        let mut access = MemoryAccess::new();

        format
            .write_block(StreamId(0), Block::from_vec(b"ABC".to_vec()), &mut access)
            .unwrap();
        assert_eq!(access.write_count(), 0);
        assert_eq!(format.parts_written(), 0);

        // A pool that can hold the header frames the next part normally
        let mut format = format.with_pool(BlockPool::new(4, 256));
        format
            .write_block(StreamId(0), Block::from_vec(b"DEF".to_vec()), &mut access)
            .unwrap();
        assert_eq!(access.write_count(), 2);
        assert_eq!(format.parts_written(), 1);
    }

    #[test]
    fn test_close_without_final_boundary_writes_nothing() {
        let mut format = MpjpegFormat::new();
        let mut access = MemoryAccess::new();
        format.close(&mut access).unwrap();
        assert_eq!(access.write_count(), 0);
    }

    #[test]
    fn test_close_with_final_boundary() {
        let mut format = MpjpegFormat::from_config(&MuxConfig {
            emit_final_boundary: true,
            ..MuxConfig::default()
        });
        let mut access = MemoryAccess::new();
        format.close(&mut access).unwrap();
        assert_eq!(
            access.contents(),
            b"\r\n--7b3cc56e5f51db803f790dad720ed50a--\r\n".to_vec()
        );
    }
}
