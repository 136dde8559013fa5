//! Raw byte dump of the sample stream
//!
//! The file format is flat: one byte per sample word (its low 8 bits),
//! appended sequentially with no header or framing.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Outcome of writing one buffer to the dump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpProgress {
    /// Every word of the buffer was written
    Written(usize),
    /// The byte limit was reached after writing this many words; the rest
    /// of the buffer was discarded
    LimitReached(usize),
}

/// An open dump target
#[derive(Debug)]
pub struct FileDump {
    writer: BufWriter<File>,
    path: PathBuf,
    written: u64,
    /// Zero means unlimited
    limit: u64,
}

impl FileDump {
    /// Truncate (by removing) the target and open it for appending
    pub fn create(path: &Path, limit: u64) -> io::Result<Self> {
        match fs::remove_file(path) {
            Ok(()) => debug!("Removed previous dump file {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!("Dumping samples to {} (limit: {})", path.display(), limit);

        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            written: 0,
            limit,
        })
    }

    /// Append the low byte of each word, honoring the byte limit
    pub fn write_words(&mut self, words: &[u16]) -> io::Result<DumpProgress> {
        let take = match self.remaining() {
            Some(remaining) => words.len().min(remaining as usize),
            None => words.len(),
        };

        let bytes: Vec<u8> = words[..take].iter().map(|&w| (w & 0xFF) as u8).collect();
        self.writer.write_all(&bytes)?;
        self.written += take as u64;

        if self.limit_reached() {
            Ok(DumpProgress::LimitReached(take))
        } else {
            Ok(DumpProgress::Written(take))
        }
    }

    /// Flush and close the file, returning the number of bytes written
    pub fn finish(mut self) -> io::Result<u64> {
        self.writer.flush()?;
        debug!("Closed dump file {} after {} bytes", self.path.display(), self.written);
        Ok(self.written)
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn remaining(&self) -> Option<u64> {
        (self.limit > 0).then(|| self.limit.saturating_sub(self.written))
    }

    fn limit_reached(&self) -> bool {
        self.limit > 0 && self.written >= self.limit
    }
}
