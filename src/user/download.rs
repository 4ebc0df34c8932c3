//! Receiving side of the windowed file transfer.

use tracing::debug;

use crate::sync::{MessageError, MessageReader};

/// What a download op did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Not the block we wait for; nothing to acknowledge.
    Ignored,
    /// Stored; acknowledge this block.
    Accepted(u16),
    /// The empty final block; acknowledge it and take the file.
    Finished(u16),
    /// The host refused the request.
    Denied(String),
}

/// A file being received.
#[derive(Debug, Clone)]
pub struct IncomingDownload {
    name: String,
    size: Option<u64>,
    expected: u16,
    data: Vec<u8>,
}

impl IncomingDownload {
    /// Waiting for block 0 of `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: None,
            expected: 0,
            data: Vec::new(),
        }
    }

    /// Requested file name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size announced in block 0.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Bytes received so far.
    pub fn received(&self) -> usize {
        self.data.len()
    }

    /// Take the assembled file.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Read one download op body and apply it.
    ///
    /// Blocks arrive in order or not at all: anything but the next expected
    /// block is ignored and the host retransmits from the last
    /// acknowledgment.
    pub fn read_block(&mut self, r: &mut MessageReader<'_>) -> Result<BlockOutcome, MessageError> {
        let block = r.read_u16()?;
        if block == 0 {
            let size = r.read_i32()?;
            if size < 0 {
                return Ok(BlockOutcome::Denied(r.read_string()?));
            }
            if self.expected == 0 {
                self.size = Some(size as u64);
            }
        }
        let len = r.read_u16()? as usize;
        let bytes = r.read_bytes(len)?;

        if block != self.expected {
            debug!(name = %self.name, expected = self.expected, block, "out of order download block");
            return Ok(BlockOutcome::Ignored);
        }
        self.data.extend_from_slice(bytes);
        self.expected = self.expected.wrapping_add(1);
        if len == 0 {
            Ok(BlockOutcome::Finished(block))
        } else {
            Ok(BlockOutcome::Accepted(block))
        }
    }
}
