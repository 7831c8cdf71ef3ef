// Backing Store Contract
//
// The memory core does not know about directories, inodes or block devices.
// It consumes files through `BackingFile`: page-granular fill/write, a lock
// for direct mappings, modification time and an access check used when a
// shared mapping is upgraded to writable.
//
// Files are shared as `FileRef` (`Arc<dyn BackingFile>`); cloning the Arc is
// the "hold" operation and dropping it the "release".

use alloc::sync::Arc;

use crate::mm::PhysAddr;

pub type FileId = u64;
pub type FileRef = Arc<dyn BackingFile>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// The device reported a failure.
    Device,
    /// Offset at or beyond end of file where the operation needs data.
    OutOfRange,
    /// The file does not support the operation (e.g. `direct_map`).
    Unsupported,
    /// `check_access` refused the credentials.
    Denied,
}

impl IoError {
    pub fn to_errno(self) -> i64 {
        match self {
            IoError::Device => -5,       // EIO
            IoError::OutOfRange => -6,   // ENXIO
            IoError::Unsupported => -19, // ENODEV
            IoError::Denied => -13,      // EACCES
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Identity a mapping operation is performed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub const KERNEL: Credentials = Credentials { uid: 0, gid: 0 };

    pub const fn is_privileged(&self) -> bool {
        self.uid == 0
    }
}

pub trait BackingFile: Send + Sync {
    /// Stable key used by the page cache.
    fn id(&self) -> FileId;

    fn lock(&self);
    fn unlock(&self);

    /// Physical frame backing `offset` for uncached (device) files. Called
    /// with the file lock held.
    fn direct_map(&self, offset: u64) -> Result<PhysAddr, IoError> {
        let _ = offset;
        Err(IoError::Unsupported)
    }

    /// Fills one page-sized buffer with the file contents at `offset`.
    /// Bytes past end of file must be zero.
    fn fill_page(&self, offset: u64, page: &mut [u8]) -> Result<(), IoError>;

    /// Writes one page back at `offset`.
    fn write_page(&self, offset: u64, page: &[u8]) -> Result<(), IoError>;

    fn set_modified(&self, now: u64);

    fn check_access(&self, cred: &Credentials, access: Access) -> Result<(), IoError>;
}

/// Holds the file lock for its lifetime.
pub struct FileLock<'a> {
    file: &'a dyn BackingFile,
}

impl<'a> FileLock<'a> {
    pub fn new(file: &'a dyn BackingFile) -> Self {
        file.lock();
        FileLock { file }
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFile;

    #[test]
    fn file_lock_is_released_on_drop() {
        let file = MockFile::new(3, 4096);
        {
            let _guard = FileLock::new(&*file);
            assert!(file.is_locked());
        }
        assert!(!file.is_locked());
    }

    #[test]
    fn direct_map_defaults_to_unsupported() {
        let file = MockFile::new(9, 4096);
        assert_eq!(file.direct_map(0), Err(IoError::Unsupported));
        assert_eq!(IoError::Unsupported.to_errno(), -19);
    }
}
