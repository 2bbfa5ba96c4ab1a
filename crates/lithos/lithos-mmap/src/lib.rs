//! Named shared-memory segments backed by memory-mapped files.
//!
//! A segment is identified by a filesystem path. Placing it under `/dev/shm`
//! keeps it in RAM (tmpfs); any other path works the same way but is backed by
//! the page cache of that filesystem.
//!
//! Dropping a [`ShmSegment`] only unmaps this process's view. The named object
//! survives until [`ShmSegment::destroy`] is called, so attached processes can
//! come and go independently of whoever created it.

use memmap2::MmapMut;
use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
};
use tracing::{debug, warn};

/// How [`ShmSegment::create_or_open`] obtained its mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attach {
    /// A fresh, zero-filled segment was created by this call.
    Created,
    /// A segment with that name already existed and was mapped as-is.
    Opened,
}

pub struct ShmSegment {
    _file: File,
    mmap: MmapMut,
}

impl ShmSegment {
    /// Create a new zero-filled segment of `size_bytes` and map it read-write.
    ///
    /// Fails with [`io::ErrorKind::AlreadyExists`] if the name is taken.
    pub fn create<P: AsRef<Path>>(path: P, size_bytes: u64) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        // a failed create must not leave a named segment behind for the next
        // opener to trip over
        let mapped = file
            .set_len(size_bytes)
            .and_then(|()| unsafe { MmapMut::map_mut(&file) });
        let mmap = match mapped {
            Ok(mmap) => mmap,
            Err(e) => {
                let _ = std::fs::remove_file(path);
                return Err(e);
            }
        };
        debug!(path = %path.display(), size_bytes, "created shm segment");

        Ok(Self { _file: file, mmap })
    }

    /// Open an existing segment and map its full current length read-write.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        debug!(path = %path.display(), len = mmap.len(), "opened shm segment");

        Ok(Self { _file: file, mmap })
    }

    /// Create the segment, or open it if one with that name already exists.
    ///
    /// An opened segment keeps its existing length; `size_bytes` only applies
    /// when the segment is created here.
    pub fn create_or_open<P: AsRef<Path>>(path: P, size_bytes: u64) -> io::Result<(Self, Attach)> {
        let path = path.as_ref();
        match Self::create(path, size_bytes) {
            Ok(seg) => Ok((seg, Attach::Created)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Ok((Self::open(path)?, Attach::Opened))
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "shm create failed");
                Err(e)
            }
        }
    }

    /// Remove the named segment.
    ///
    /// Existing mappings stay valid until they are dropped; new opens fail.
    pub fn destroy<P: AsRef<Path>>(path: P) -> io::Result<()> {
        let path = path.as_ref();
        std::fs::remove_file(path)?;
        debug!(path = %path.display(), "destroyed shm segment");
        Ok(())
    }

    /// Raw pointer to the start of the mapping. Stable for the life of `self`.
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_is_zero_filled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");

        let seg = ShmSegment::create(&path, 4096).unwrap();
        assert_eq!(seg.len(), 4096);
        let bytes = unsafe { std::slice::from_raw_parts(seg.as_ptr(), seg.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn create_twice_reports_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");

        let _first = ShmSegment::create(&path, 128).unwrap();
        let err = ShmSegment::create(&path, 128).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn failed_create_leaves_no_segment_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");

        assert!(ShmSegment::create(&path, u64::MAX).is_err());
        assert!(!path.exists());

        let (seg, how) = ShmSegment::create_or_open(&path, 64).unwrap();
        assert_eq!(how, Attach::Created);
        assert_eq!(seg.len(), 64);
    }

    #[test]
    fn create_or_open_attaches_existing_and_keeps_its_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");

        let (mut a, how) = ShmSegment::create_or_open(&path, 256).unwrap();
        assert_eq!(how, Attach::Created);
        unsafe { a.as_mut_ptr().add(10).write(0xAB) };

        let (b, how) = ShmSegment::create_or_open(&path, 8192).unwrap();
        assert_eq!(how, Attach::Opened);
        assert_eq!(b.len(), 256);
        assert_eq!(unsafe { b.as_ptr().add(10).read() }, 0xAB);
    }

    #[test]
    fn segment_outlives_its_mappings_until_destroyed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");

        let (mut a, _) = ShmSegment::create_or_open(&path, 64).unwrap();
        unsafe { a.as_mut_ptr().write(7) };
        drop(a);

        let b = ShmSegment::open(&path).unwrap();
        assert_eq!(unsafe { b.as_ptr().read() }, 7);
        drop(b);

        ShmSegment::destroy(&path).unwrap();
        assert_eq!(
            ShmSegment::open(&path).err().unwrap().kind(),
            io::ErrorKind::NotFound
        );
    }
}
