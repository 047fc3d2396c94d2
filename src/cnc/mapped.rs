//! Memory mapping of the CnC file with automatic cleanup.
//!
//! [`CncFile`] is the owning handle for the mapped region: constructing one
//! maps the file, dropping it unmaps. Every IPC handle derived from the file
//! holds an `Arc<CncFile>` so the unmap happens exactly once, after the last
//! handle is gone, on success and failure paths alike.

use std::path::{Path, PathBuf};
use std::ptr::{NonNull, null_mut};

use rustix::fs::{Mode, OFlags, fstat, ftruncate, open};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};

use crate::error::{ClientError, Result};
use crate::ipc::region::Region;

/// A CnC file mapped read-write into this process.
///
/// Read-write because the command ring and its trailer counters live inside
/// the file and the client is a producer on them.
pub struct CncFile {
    path: PathBuf,
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: The mapping is shared memory; it is not tied to the creating
// thread, and concurrent access goes through Region's atomic accessors.
unsafe impl Send for CncFile {}
// SAFETY: As above; &CncFile only exposes the region view.
unsafe impl Sync for CncFile {}

impl CncFile {
    /// Maps an existing CnC file at its current length.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Io`] if `open`, `fstat` or `mmap` fail
    /// - [`ClientError::Cnc`] if the file is too short to hold any layout
    pub fn map_existing(path: &Path) -> Result<Self> {
        let fd = open(path, OFlags::RDWR, Mode::empty())
            .map_err(|err| ClientError::io("open", path, err))?;

        let stat = match fstat(&fd) {
            Ok(stat) => stat,
            Err(err) => {
                drop(fd);
                return Err(ClientError::io("fstat", path, err));
            }
        };
        let len = stat.st_size as usize;
        if stat.st_size <= 0 {
            drop(fd);
            return Err(ClientError::Cnc(format!(
                "file `{}` is empty",
                path.display()
            )));
        }

        // SAFETY: Fresh mapping of a valid fd at the length fstat reported;
        // mmap returns a page-aligned pointer that aliases no Rust object.
        // READ|WRITE matches the ring's producer role.
        let ptr_result = unsafe {
            mmap(
                null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        };
        let ptr = match ptr_result {
            Ok(p) => p,
            Err(err) => {
                drop(fd);
                return Err(ClientError::io("mmap", path, err));
            }
        };

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(ptr as *mut u8) };

        Ok(Self {
            path: path.to_path_buf(),
            ptr,
            len,
        })
    }

    /// Creates a new zero-filled file of `len` bytes and maps it.
    ///
    /// This is the fixture/tooling entry point; a client connecting to a
    /// live driver uses [`CncFile::map_existing`].
    ///
    /// # Errors
    ///
    /// - [`ClientError::Io`] if the file exists or any syscall fails
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        let fd = open(
            path,
            OFlags::CREATE | OFlags::EXCL | OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| ClientError::io("open", path, err))?;

        if let Err(err) = ftruncate(&fd, len as u64) {
            drop(fd);
            let _ = std::fs::remove_file(path);
            return Err(ClientError::io("ftruncate", path, err));
        }

        // SAFETY: As in map_existing; ftruncate succeeded so the object is
        // `len` bytes and zero-filled.
        let ptr_result = unsafe {
            mmap(
                null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        };
        let ptr = match ptr_result {
            Ok(p) => p,
            Err(err) => {
                drop(fd);
                let _ = std::fs::remove_file(path);
                return Err(ClientError::io("mmap", path, err));
            }
        };

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(ptr as *mut u8) };

        Ok(Self {
            path: path.to_path_buf(),
            ptr,
            len,
        })
    }

    /// Path the mapping was created from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length of the mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty. Always false for a live handle.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View of the whole mapped file.
    #[must_use]
    pub fn region(&self) -> Region {
        // SAFETY: The mapping is valid for self.len bytes and callers hold
        // an Arc<CncFile> alongside every Region they retain.
        unsafe { Region::new(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for CncFile {
    fn drop(&mut self) {
        // SAFETY: ptr/len are the values returned by mmap; the mapping has
        // not been unmapped elsewhere.
        unsafe {
            let _ = munmap(self.ptr.as_ptr() as *mut _, self.len);
        }
    }
}

impl std::fmt::Debug for CncFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CncFile")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_then_map_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cnc.dat");

        let created = CncFile::create(&path, 4096).unwrap();
        created.region().put_i64_ordered(0, 0x5454);

        let mapped = CncFile::map_existing(&path).unwrap();
        assert_eq!(mapped.len(), 4096);
        assert_eq!(mapped.region().get_i64_volatile(0), 0x5454);
    }

    #[test]
    fn create_fails_if_file_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cnc.dat");

        let _first = CncFile::create(&path, 1024).unwrap();
        let second = CncFile::create(&path, 1024);
        assert!(matches!(second, Err(ClientError::Io { op: "open", .. })));
    }

    #[test]
    fn map_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let result = CncFile::map_existing(&dir.path().join("absent.dat"));
        assert!(matches!(result, Err(ClientError::Io { op: "open", .. })));
    }

    #[test]
    fn writes_are_visible_across_mappings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cnc.dat");

        let a = CncFile::create(&path, 1024).unwrap();
        let b = CncFile::map_existing(&path).unwrap();

        a.region().put_i64_ordered(64, 99);
        assert_eq!(b.region().get_i64_volatile(64), 99);
    }
}
