use super::{MuxCapabilities, MuxFormat, StreamId};
use crate::block::Block;
use crate::error::{RejectReason, Result};
use crate::format::EsFormat;
use crate::sink::AccessOutput;

/// Pass-through muxer: every block is written as-is
///
/// Accepts any codec. Capability flags are set by the caller, which makes
/// this the format for multi-input sessions.
#[derive(Debug, Clone)]
pub struct RawFormat {
    caps: MuxCapabilities,
}

impl RawFormat {
    pub fn new() -> Self {
        Self {
            caps: MuxCapabilities {
                add_while_muxing: true,
                wait_for_first_block: false,
                max_inputs: None,
            },
        }
    }

    pub fn with_max_inputs(mut self, max: Option<usize>) -> Self {
        self.caps.max_inputs = max;
        self
    }

    pub fn with_add_while_muxing(mut self, allowed: bool) -> Self {
        self.caps.add_while_muxing = allowed;
        self
    }

    pub fn with_wait_for_first_block(mut self, wait: bool) -> Self {
        self.caps.wait_for_first_block = wait;
        self
    }
}

impl Default for RawFormat {
    fn default() -> Self {
        Self::new()
    }
}

impl MuxFormat for RawFormat {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn capabilities(&self) -> MuxCapabilities {
        self.caps
    }

    fn mime(&self) -> Option<String> {
        Some("application/octet-stream".to_string())
    }

    fn accepts(&self, _format: &EsFormat) -> std::result::Result<(), RejectReason> {
        Ok(())
    }

    fn write_block(
        &mut self,
        _stream: StreamId,
        block: Block,
        access: &mut dyn AccessOutput,
    ) -> Result<()> {
        access.write(block)?;
        Ok(())
    }
}
