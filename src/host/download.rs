//! Windowed file download.
//!
//! ```text
//! Download block:2 [size:4 if block 0] length:2 bytes
//! ```
//!
//! Up to [`MAX_DOWNLOAD_WINDOW`] blocks of [`MAX_DOWNLOAD_BLKSIZE`] bytes
//! are read ahead. One block is sent per frame; once the whole window is
//! out the host waits, then resends from the oldest unacknowledged block
//! after [`DOWNLOAD_RETRANSMIT_MS`]. A zero-length block ends the file. A
//! denial is block 0 with size -1 and a reason string.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::core::{DOWNLOAD_RETRANSMIT_MS, MAX_DOWNLOAD_BLKSIZE, MAX_DOWNLOAD_SIZE, MAX_DOWNLOAD_WINDOW};
use crate::sync::{HostOp, MessageWriter};

/// Source of downloadable files.
pub trait FileStore: Send {
    /// Open `name`, returning its size and a reader.
    fn open(&self, name: &str) -> io::Result<(u64, Box<dyn Read + Send>)>;
}

/// Files under a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Serve files below `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FileStore for DirectoryStore {
    fn open(&self, name: &str) -> io::Result<(u64, Box<dyn Read + Send>)> {
        let relative = Path::new(name);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("refusing path {name:?}"),
            ));
        }
        let file = File::open(self.root.join(relative))?;
        let size = file.metadata()?.len();
        Ok((size, Box::new(file)))
    }
}

/// A store with nothing in it.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFiles;

impl FileStore for NoFiles {
    fn open(&self, name: &str) -> io::Result<(u64, Box<dyn Read + Send>)> {
        Err(io::Error::new(io::ErrorKind::NotFound, name.to_owned()))
    }
}

/// Why a download request was refused. The text is sent to the
/// participant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DownloadError {
    /// Not in the list of files participants may fetch.
    #[error("File \"{0}\" is not referenced and cannot be downloaded.")]
    NotReferenced(String),

    /// Referenced but never served.
    #[error("Cannot autodownload protected file \"{0}\"")]
    Protected(String),

    /// Downloads are turned off.
    #[error("Could not download \"{0}\" because autodownloading is disabled on the host.")]
    Disabled(String),

    /// Referenced but missing from the store.
    #[error("File \"{0}\" not found on host for autodownloading.")]
    NotFound(String),

    /// Larger than the block numbering can address.
    #[error("File \"{0}\" is too large to autodownload.")]
    TooLarge(String),
}

/// Which files may be served.
#[derive(Debug, Clone, Copy)]
pub struct DownloadPolicy<'a> {
    /// Downloads enabled.
    pub allow: bool,
    /// Files participants may fetch.
    pub references: &'a [String],
    /// Referenced files that are never served.
    pub protected: &'a [String],
}

impl DownloadPolicy<'_> {
    /// Check `name` against the policy, most specific reason first.
    pub fn check(&self, name: &str) -> Result<(), DownloadError> {
        let listed = |list: &[String]| list.iter().any(|f| f.eq_ignore_ascii_case(name));
        if !listed(self.references) {
            return Err(DownloadError::NotReferenced(name.to_owned()));
        }
        if listed(self.protected) {
            return Err(DownloadError::Protected(name.to_owned()));
        }
        if !self.allow {
            return Err(DownloadError::Disabled(name.to_owned()));
        }
        Ok(())
    }
}

/// Outcome of a `nextdl` acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAck {
    /// Older than anything outstanding; ignored.
    Stale,
    /// The window moved forward.
    Advanced,
    /// The end-of-file block was acknowledged.
    Complete,
    /// Acknowledges a block that was never sent.
    Broken,
}

/// A block ready to go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadBlock<'a> {
    /// Block index.
    pub index: u32,
    /// File size, carried by block 0.
    pub size: Option<u64>,
    /// Block bytes; empty at end of file.
    pub data: &'a [u8],
}

/// An open download.
pub struct Download {
    name: String,
    size: u64,
    reader: Box<dyn Read + Send>,
    blocks: Vec<Vec<u8>>,
    /// Next block to read.
    current_block: u32,
    /// Oldest unacknowledged block.
    user_block: u32,
    /// Next block to transmit.
    xmit_block: u32,
    count: u64,
    eof: bool,
    send_time: u64,
}

impl fmt::Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Download")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("current_block", &self.current_block)
            .field("user_block", &self.user_block)
            .field("xmit_block", &self.xmit_block)
            .field("eof", &self.eof)
            .finish()
    }
}

impl Download {
    /// Check the policy and open `name` from `store`.
    pub fn begin(
        name: &str,
        policy: &DownloadPolicy<'_>,
        store: &dyn FileStore,
    ) -> Result<Self, DownloadError> {
        policy.check(name)?;
        let (size, reader) = store.open(name).map_err(|e| {
            debug!(name, error = %e, "download open failed");
            DownloadError::NotFound(name.to_owned())
        })?;
        if size > MAX_DOWNLOAD_SIZE {
            debug!(name, size, "download too large");
            return Err(DownloadError::TooLarge(name.to_owned()));
        }
        Ok(Self {
            name: name.to_owned(),
            size,
            reader,
            blocks: vec![Vec::new(); MAX_DOWNLOAD_WINDOW],
            current_block: 0,
            user_block: 0,
            xmit_block: 0,
            count: 0,
            eof: false,
            send_time: 0,
        })
    }

    /// File name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// File size.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Oldest unacknowledged block.
    pub fn user_block(&self) -> u32 {
        self.user_block
    }

    fn in_flight(&self) -> usize {
        self.current_block.wrapping_sub(self.user_block) as usize
    }

    fn slot(block: u32) -> usize {
        block as usize % MAX_DOWNLOAD_WINDOW
    }

    /// Read ahead until the window is full, then append the EOF block.
    fn fill(&mut self) {
        while self.in_flight() < MAX_DOWNLOAD_WINDOW && self.count != self.size {
            let want = (MAX_DOWNLOAD_BLKSIZE as u64).min(self.size - self.count);
            let block = &mut self.blocks[Self::slot(self.current_block)];
            block.clear();
            match self
                .reader
                .by_ref()
                .take(want)
                .read_to_end(block)
            {
                Ok(0) => {
                    // Shorter than announced.
                    self.count = self.size;
                    break;
                }
                Ok(n) => {
                    self.count += n as u64;
                    self.current_block += 1;
                }
                Err(e) => {
                    warn!(name = %self.name, error = %e, "download read failed, truncating");
                    block.clear();
                    self.count = self.size;
                    break;
                }
            }
        }

        if self.count == self.size && !self.eof && self.in_flight() < MAX_DOWNLOAD_WINDOW {
            self.blocks[Self::slot(self.current_block)].clear();
            self.current_block += 1;
            self.eof = true;
        }
    }

    /// The block to send this frame, if any.
    pub fn poll(&mut self, now: u64) -> Option<DownloadBlock<'_>> {
        self.fill();
        if self.user_block == self.current_block {
            return None;
        }
        if self.xmit_block == self.current_block {
            // Whole window out; resend from the oldest after a while.
            if now.saturating_sub(self.send_time) > DOWNLOAD_RETRANSMIT_MS {
                debug!(name = %self.name, block = self.user_block, "download retransmit");
                self.xmit_block = self.user_block;
            } else {
                return None;
            }
        }

        let index = self.xmit_block;
        self.xmit_block += 1;
        self.send_time = now;
        Some(DownloadBlock {
            index,
            size: (index == 0).then_some(self.size),
            data: &self.blocks[Self::slot(index)],
        })
    }

    /// Apply a cumulative acknowledgment of every block up to `block`.
    pub fn acknowledge(&mut self, block: u32, now: u64) -> BlockAck {
        if block < self.user_block {
            return BlockAck::Stale;
        }
        if block >= self.current_block {
            return BlockAck::Broken;
        }
        self.user_block = block + 1;
        self.send_time = now;
        if self.xmit_block < self.user_block {
            self.xmit_block = self.user_block;
        }
        if self.eof && self.user_block == self.current_block {
            BlockAck::Complete
        } else {
            BlockAck::Advanced
        }
    }
}

/// Write one download block.
pub fn write_download_block(w: &mut MessageWriter, block: &DownloadBlock<'_>) {
    w.write_host_op(HostOp::Download);
    w.write_u16(block.index as u16);
    if let Some(size) = block.size {
        w.write_u32(size as u32);
    }
    w.write_u16(block.data.len() as u16);
    w.write_bytes(block.data);
}

/// Write a refusal in place of block 0.
pub fn write_download_denial(w: &mut MessageWriter, reason: &DownloadError) {
    w.write_host_op(HostOp::Download);
    w.write_u16(0);
    w.write_i32(-1);
    w.write_string(&reason.to_string());
}
