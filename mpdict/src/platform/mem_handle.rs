// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use nix::errno::Errno;
#[cfg(target_os = "linux")]
use nix::fcntl::posix_fallocate;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
#[cfg(not(target_os = "linux"))]
use nix::unistd::getpid;
use std::ffi::{c_void, CStr, CString};
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
#[cfg(target_os = "linux")]
use std::os::fd::AsRawFd;
use std::os::fd::{AsFd, OwnedFd};
use std::ptr::NonNull;

/// A shared memory file descriptor together with the size it was truncated to.
#[derive(Debug)]
pub struct ShmHandle {
    fd: OwnedFd,
    size: usize,
}

/// A shared memory object reachable through a name in the OS shm namespace.
///
/// Dropping this does not unlink the name; see [`NamedShmHandle::unlink`].
#[derive(Debug)]
pub struct NamedShmHandle {
    inner: ShmHandle,
    path: CString,
}

/// A live `MAP_SHARED` read/write mapping of a handle. Unmapped on drop.
pub struct MappedMem<T>
where
    T: FileBackedHandle,
{
    ptr: NonNull<c_void>,
    mem: T,
}

pub trait FileBackedHandle
where
    Self: Sized,
{
    fn map(self) -> io::Result<MappedMem<Self>>;
    fn get_shm(&self) -> &ShmHandle;
    fn get_size(&self) -> usize {
        self.get_shm().size
    }
}

fn mmap_handle<T: FileBackedHandle>(handle: T) -> io::Result<MappedMem<T>> {
    let size = NonZeroUsize::new(handle.get_size()).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "cannot map a zero-sized region")
    })?;
    let ptr = unsafe {
        mmap(
            None,
            size,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            handle.get_shm().fd.as_fd(),
            0,
        )?
    };
    Ok(MappedMem { ptr, mem: handle })
}

/// Sizes `fd` to `size` bytes. On Linux the pages are also allocated up front, so a region
/// beyond the shm quota fails here with `ENOSPC` instead of faulting on first touch. Elsewhere
/// the object is only truncated and pages are committed lazily.
fn reserve(fd: &OwnedFd, size: usize) -> io::Result<()> {
    let len = libc::off_t::try_from(size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "region size exceeds off_t"))?;
    ftruncate(fd.as_fd(), len)?;
    #[cfg(target_os = "linux")]
    {
        if len > 0 {
            match posix_fallocate(fd.as_raw_fd(), 0, len) {
                Ok(()) | Err(Errno::EOPNOTSUPP) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}

fn size_of_fd(fd: OwnedFd) -> io::Result<(OwnedFd, usize)> {
    let file = File::from(fd);
    let size = usize::try_from(file.metadata()?.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "region larger than usize"))?;
    Ok((OwnedFd::from(file), size))
}

impl FileBackedHandle for ShmHandle {
    fn map(self) -> io::Result<MappedMem<ShmHandle>> {
        mmap_handle(self)
    }

    fn get_shm(&self) -> &ShmHandle {
        self
    }
}

impl FileBackedHandle for NamedShmHandle {
    fn map(self) -> io::Result<MappedMem<NamedShmHandle>> {
        mmap_handle(self)
    }

    fn get_shm(&self) -> &ShmHandle {
        &self.inner
    }
}

impl ShmHandle {
    #[cfg(target_os = "linux")]
    fn open_anon_shm() -> io::Result<OwnedFd> {
        let memfd = memfd::MemfdOptions::default()
            .create("mpdict-anon-arena")
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(OwnedFd::from(memfd.into_file()))
    }

    #[cfg(not(target_os = "linux"))]
    fn open_anon_shm() -> io::Result<OwnedFd> {
        use std::sync::atomic::{AtomicU32, Ordering};
        static SEQ: AtomicU32 = AtomicU32::new(0);
        let path = format!(
            "/mpdict-anon-{}-{}",
            getpid(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let result = shm_open(
            path.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        );
        _ = shm_unlink(path.as_str());
        Ok(result?)
    }

    /// Creates an unnamed shared memory object of `size` bytes. It can only be shared through
    /// descriptor or mapping inheritance.
    pub fn new(size: usize) -> io::Result<ShmHandle> {
        let fd = Self::open_anon_shm()?;
        reserve(&fd, size)?;
        Ok(ShmHandle { fd, size })
    }
}

impl NamedShmHandle {
    /// Creates `path` exclusively. Fails with [`io::ErrorKind::AlreadyExists`] if the name is
    /// taken. If the object cannot be sized and reserved, the name is removed again.
    pub fn create_exclusive(path: CString, size: usize) -> io::Result<NamedShmHandle> {
        let fd = shm_open(
            path.as_c_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IWUSR
                | Mode::S_IRUSR
                | Mode::S_IRGRP
                | Mode::S_IWGRP
                | Mode::S_IROTH
                | Mode::S_IWOTH,
        )?;
        if let Err(e) = reserve(&fd, size) {
            _ = shm_unlink(path.as_c_str());
            return Err(e);
        }
        Ok(NamedShmHandle {
            inner: ShmHandle { fd, size },
            path,
        })
    }

    /// Opens an existing object read/write. The size is whatever the creator truncated it to,
    /// which may still be zero if the creator has not gotten that far.
    pub fn open(path: CString) -> io::Result<NamedShmHandle> {
        let fd = shm_open(path.as_c_str(), OFlag::O_RDWR, Mode::empty())?;
        let (fd, size) = size_of_fd(fd)?;
        Ok(NamedShmHandle {
            inner: ShmHandle { fd, size },
            path,
        })
    }

    /// Removes `path` from the shm namespace. Existing mappings stay valid. A missing name is
    /// not an error.
    pub fn unlink(path: &CStr) -> io::Result<()> {
        match shm_unlink(path) {
            Ok(()) | Err(Errno::ENOENT) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_path(&self) -> &CStr {
        &self.path
    }
}

impl<T: FileBackedHandle> MappedMem<T> {
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr.cast()
    }

    pub fn get_size(&self) -> usize {
        self.mem.get_size()
    }

    pub fn handle(&self) -> &T {
        &self.mem
    }
}

impl<T> Drop for MappedMem<T>
where
    T: FileBackedHandle,
{
    fn drop(&mut self) {
        unsafe {
            _ = munmap(self.ptr, self.mem.get_size());
        }
    }
}

unsafe impl<T> Sync for MappedMem<T> where T: FileBackedHandle {}
unsafe impl<T> Send for MappedMem<T> where T: FileBackedHandle {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::unique_shm_path;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_anon_shm() {
        let shm = ShmHandle::new(4096).unwrap();
        let mapped = shm.map().unwrap();
        assert_eq!(mapped.get_size(), 4096);
        unsafe {
            let bytes = std::slice::from_raw_parts_mut(mapped.as_ptr().as_ptr(), 4096);
            assert!(bytes.iter().all(|b| *b == 0));
            bytes[..5].copy_from_slice(&[1, 2, 3, 4, 5]);
            assert_eq!(&bytes[..5], &[1, 2, 3, 4, 5]);
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_named_shm() {
        let path = unique_shm_path("mem-handle");
        let shm = NamedShmHandle::create_exclusive(path.clone(), 8192).unwrap();
        let mapped = shm.map().unwrap();
        unsafe {
            std::slice::from_raw_parts_mut(mapped.as_ptr().as_ptr(), 5)
                .copy_from_slice(&[1, 2, 3, 4, 5]);
        }

        let other = NamedShmHandle::open(path.clone()).unwrap().map().unwrap();
        assert_eq!(other.get_size(), 8192);
        let seen = unsafe { std::slice::from_raw_parts(other.as_ptr().as_ptr(), 5) };
        assert_eq!(seen, &[1, 2, 3, 4, 5]);

        NamedShmHandle::unlink(&path).unwrap();
        // Unlinking twice is fine.
        NamedShmHandle::unlink(&path).unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn create_exclusive_conflicts() {
        let path = unique_shm_path("mem-handle-excl");
        let _first = NamedShmHandle::create_exclusive(path.clone(), 4096).unwrap();
        let err = NamedShmHandle::create_exclusive(path.clone(), 4096).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        NamedShmHandle::unlink(&path).unwrap();
    }

    #[test]
    #[cfg(target_os = "linux")]
    #[cfg_attr(miri, ignore)]
    fn oversized_named_region_is_refused_and_removed() {
        let path = unique_shm_path("mem-handle-quota");
        let err = NamedShmHandle::create_exclusive(path.clone(), 1 << 50).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOSPC));
        let err = NamedShmHandle::open(path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn open_missing_is_not_found() {
        let path = unique_shm_path("mem-handle-missing");
        let err = NamedShmHandle::open(path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
