//! Body buffer allocation: heap below 1 MiB, file-backed mapping above
//!
//! Large POST bodies would otherwise pin megabytes of anonymous memory
//! per connection. Past the threshold the body spools into a temp file
//! that is unlinked immediately after creation and privately mapped;
//! dropping the buffer unmaps and releases it on every exit path,
//! including task abort.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::MmapMut;
use tracing::warn;

use crate::error::{Error, Result};
use crate::parser::Span;

/// Bodies below this size stay on the task heap.
pub const SPOOL_THRESHOLD: usize = 1 << 20;

static SPOOL_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Where a request body lives.
#[derive(Debug, Default)]
pub enum BodyStore {
    /// No body read (yet)
    #[default]
    None,
    /// Body fully contained in the request buffer (pipelined fast path)
    Inline(Span),
    /// Body read into its own buffer
    Buffered(BodyBuffer),
}

/// An owned body buffer, heap- or file-backed.
#[derive(Debug)]
pub enum BodyBuffer {
    Heap(Vec<u8>),
    Mapped(MmapMut),
}

impl BodyBuffer {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            BodyBuffer::Heap(v) => v,
            BodyBuffer::Mapped(m) => m,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            BodyBuffer::Heap(v) => v,
            BodyBuffer::Mapped(m) => m,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Allocate a body buffer of exactly `size` bytes.
///
/// Sizes under [`SPOOL_THRESHOLD`] come from the heap. Larger bodies
/// need `allow_file`; without it, or when every spool step fails, the
/// request surfaces an internal error.
pub fn alloc(size: usize, allow_file: bool) -> Result<BodyBuffer> {
    if size < SPOOL_THRESHOLD {
        return Ok(BodyBuffer::Heap(vec![0; size]));
    }

    if !allow_file {
        return Err(Error::Internal("post body exceeds in-memory limit"));
    }

    let dir = temp_dir().ok_or(Error::Internal("no usable temp directory"))?;
    let file = create_unlinked_file(&dir).map_err(|err| {
        warn!("body spool file in {:?} failed: {}", dir, err);
        Error::Internal("body spool file creation failed")
    })?;
    file.set_len(size as u64)
        .map_err(|_| Error::Internal("body spool truncate failed"))?;

    // SAFETY: the file was created by us, unlinked right away, and the
    // mapping is private; no other process can reach or resize it.
    let map = unsafe { MmapMut::map_mut(&file) }
        .map_err(|_| Error::Internal("body spool mapping failed"))?;

    Ok(BodyBuffer::Mapped(map))
}

/// First usable spool directory: `$TMPDIR`, `$TMP`, `$TEMP` (absolute
/// paths only), then `/tmp` and `/var/tmp`.
fn temp_dir() -> Option<PathBuf> {
    for var in ["TMPDIR", "TMP", "TEMP"] {
        if let Ok(value) = std::env::var(var) {
            let path = PathBuf::from(value);
            if path.is_absolute() && path.is_dir() {
                return Some(path);
            }
        }
    }

    for fallback in ["/tmp", "/var/tmp"] {
        let path = Path::new(fallback);
        if path.is_dir() {
            return Some(path.to_path_buf());
        }
    }

    None
}

/// Create a uniquely named spool file and unlink it immediately, so it
/// vanishes as soon as the mapping (and the handle) go away.
fn create_unlinked_file(dir: &Path) -> std::io::Result<File> {
    let pid = std::process::id();

    for _ in 0..32 {
        let counter = SPOOL_COUNTER.fetch_add(1, Ordering::Relaxed);
        let candidate = dir.join(format!("squall-body-{pid}-{counter}"));

        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(file) => {
                let _ = std::fs::remove_file(&candidate);
                return Ok(file);
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        "could not allocate unique spool file",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_body_is_heap() {
        let buf = alloc(128, false).unwrap();
        assert!(matches!(buf, BodyBuffer::Heap(_)));
        assert_eq!(buf.len(), 128);
    }

    #[test]
    fn test_large_body_needs_file_permission() {
        assert!(alloc(SPOOL_THRESHOLD, false).is_err());
    }

    #[test]
    fn test_large_body_spools_to_mapping() {
        let mut buf = alloc(SPOOL_THRESHOLD, true).unwrap();
        assert!(matches!(buf, BodyBuffer::Mapped(_)));
        assert_eq!(buf.len(), SPOOL_THRESHOLD);

        let slice = buf.as_mut_slice();
        slice[0] = 0xAB;
        slice[SPOOL_THRESHOLD - 1] = 0xCD;
        assert_eq!(buf.as_slice()[0], 0xAB);
        assert_eq!(buf.as_slice()[SPOOL_THRESHOLD - 1], 0xCD);
    }

    #[test]
    fn test_temp_dir_exists() {
        assert!(temp_dir().is_some());
    }
}
