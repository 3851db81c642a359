//! File-backed shared memory mappings.
//!
//! All cross-process state lives in regular files under the driver
//! directory, mapped shared into each participating process. The driver
//! creates every file and owns its lifecycle; clients open existing files
//! read-write and never unlink them. Cleanup of the file *names* is a
//! driver-shutdown concern (the directory is removed wholesale), so
//! dropping a mapping only unmaps.
//!
//! The mapping hands out [`AtomicBuffer`] views; all concurrent access
//! goes through those. A `MappedFile` must outlive every view derived
//! from it.

use std::fs::OpenOptions;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::ptr::{NonNull, null_mut};

use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use thiserror::Error;

use crate::concurrent::AtomicBuffer;

/// Errors creating or opening a mapping.
#[derive(Debug, Error)]
pub enum MappedFileError {
    #[error("{op} failed for `{path}`: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("mmap failed for `{path}`: {source}")]
    Mmap {
        path: PathBuf,
        #[source]
        source: rustix::io::Errno,
    },
    #[error("`{path}` is {actual} bytes, expected {expected}")]
    SizeMismatch {
        path: PathBuf,
        expected: usize,
        actual: u64,
    },
}

/// A read-write shared mapping of one file.
pub struct MappedFile {
    ptr: NonNull<u8>,
    len: usize,
    path: PathBuf,
}

// SAFETY: the mapping is shared memory; concurrent access is mediated by
// the AtomicBuffer views handed out over it.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    /// Creates a new file of `len` zeroed bytes and maps it.
    ///
    /// Fails if the file already exists; a driver finding leftovers from
    /// a previous run must remove them before starting.
    pub fn create(path: &Path, len: usize) -> Result<Self, MappedFileError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| MappedFileError::Io {
                op: "create",
                path: path.to_path_buf(),
                source,
            })?;
        file.set_len(len as u64).map_err(|source| MappedFileError::Io {
            op: "set_len",
            path: path.to_path_buf(),
            source,
        })?;
        Self::map(&file, path, len)
    }

    /// Opens and maps an existing file, whose size must be `len`.
    pub fn open(path: &Path, len: usize) -> Result<Self, MappedFileError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| MappedFileError::Io {
                op: "open",
                path: path.to_path_buf(),
                source,
            })?;
        let actual = file
            .metadata()
            .map_err(|source| MappedFileError::Io {
                op: "stat",
                path: path.to_path_buf(),
                source,
            })?
            .len();
        if actual != len as u64 {
            return Err(MappedFileError::SizeMismatch {
                path: path.to_path_buf(),
                expected: len,
                actual,
            });
        }
        Self::map(&file, path, len)
    }

    /// Opens and maps an existing file at whatever size it has.
    pub fn open_existing(path: &Path) -> Result<Self, MappedFileError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| MappedFileError::Io {
                op: "open",
                path: path.to_path_buf(),
                source,
            })?;
        let len = file
            .metadata()
            .map_err(|source| MappedFileError::Io {
                op: "stat",
                path: path.to_path_buf(),
                source,
            })?
            .len() as usize;
        Self::map(&file, path, len)
    }

    fn map(file: &std::fs::File, path: &Path, len: usize) -> Result<Self, MappedFileError> {
        // SAFETY: a fresh shared mapping of a file we just opened; it
        // aliases no existing Rust object, is page-aligned, and spans
        // exactly `len` bytes backed by the file.
        let ptr = unsafe {
            mmap(
                null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
        }
        .map_err(|source| MappedFileError::Mmap {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            // SAFETY: mmap never returns null on success.
            ptr: unsafe { NonNull::new_unchecked(ptr.cast()) },
            len,
            path: path.to_path_buf(),
        })
    }

    /// Length of the mapping in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The path this mapping was created from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A view over the whole mapping.
    #[must_use]
    pub fn buffer(&self) -> AtomicBuffer {
        // SAFETY: the mapping stays valid until this MappedFile drops;
        // callers are required to keep the file alive for every view.
        unsafe { AtomicBuffer::new(self.ptr, self.len) }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe a live mapping created by mmap.
        let _ = unsafe { munmap(self.ptr.as_ptr().cast(), self.len) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_open_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");

        let created = MappedFile::create(&path, 4096).unwrap();
        created.buffer().put_u64(128, 0xfeed_f00d);

        let opened = MappedFile::open(&path, 4096).unwrap();
        assert_eq!(opened.buffer().get_u64(128), 0xfeed_f00d);
        assert_eq!(opened.len(), 4096);
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");

        let _first = MappedFile::create(&path, 1024).unwrap();
        assert!(matches!(
            MappedFile::create(&path, 1024),
            Err(MappedFileError::Io { op: "create", .. })
        ));
    }

    #[test]
    fn open_checks_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");

        let _created = MappedFile::create(&path, 1024).unwrap();
        assert!(matches!(
            MappedFile::open(&path, 2048),
            Err(MappedFileError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn open_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            MappedFile::open(&dir.path().join("absent"), 1024),
            Err(MappedFileError::Io { op: "open", .. })
        ));
    }

    #[test]
    fn new_mapping_is_zeroed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");
        let mapped = MappedFile::create(&path, 8192).unwrap();
        let buffer = mapped.buffer();
        for offset in (0..8192).step_by(8) {
            assert_eq!(buffer.get_u64(offset), 0);
        }
    }

    #[test]
    fn open_existing_uses_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");
        let _created = MappedFile::create(&path, 2048).unwrap();
        let opened = MappedFile::open_existing(&path).unwrap();
        assert_eq!(opened.len(), 2048);
    }
}
