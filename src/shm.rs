//! SysV shared-memory segments with a typed view.
//!
//! A [`Segment<T>`] maps one fixed-layout `repr(C)` struct. The first
//! creator zeroes the region before anyone else can see it (attachers are
//! gated by the semaphore handshake in `semset`, not by anything in here).
//! Dropping a segment only detaches it; the kernel reaps the memory after
//! the last detach once someone has explicitly marked it for removal.

use std::marker::PhantomData;
use std::ptr::NonNull;

use log::warn;

use crate::error::{Error, Result};

#[derive(Debug)]
pub(crate) struct Segment<T> {
    shmid: libc::c_int,
    ptr: NonNull<T>,
    key: i32,
    _marker: PhantomData<T>,
}

// The pointee lives in shared memory and is mutated by many processes at
// once; all access goes through raw pointers under an external lock, so
// moving the handle between threads is no worse than sharing the segment
// between processes.
unsafe impl<T> Send for Segment<T> {}
unsafe impl<T> Sync for Segment<T> {}

impl<T> Segment<T> {
    /// Exclusive-create (zeroing the region) or attach to the existing
    /// segment for `key`. Returns whether this process created it.
    pub(crate) fn create_or_attach(key: i32, permissions: u32) -> Result<(Self, bool)> {
        let size = std::mem::size_of::<T>();
        let flags = libc::IPC_CREAT | libc::IPC_EXCL | permissions as libc::c_int;

        let mut created = true;
        let mut shmid = unsafe { libc::shmget(key, size, flags) };
        if shmid == -1 {
            let err = Error::syscall("shmget()");
            if err.is_errno(libc::ENOMEM) || err.is_errno(libc::ENOSPC) {
                return Err(Error::internal(
                    "insufficient system resources for shared memory; \
                     consider raising kernel.shmmax / kernel.shmmni",
                ));
            }
            if !err.is_errno(libc::EEXIST) {
                return Err(err);
            }
            created = false;
            shmid = unsafe { libc::shmget(key, size, permissions as libc::c_int) };
            if shmid == -1 {
                return Err(Error::syscall("shmget()"));
            }
        }

        let addr = unsafe { libc::shmat(shmid, std::ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(Error::syscall("shmat()"));
        }
        if created {
            unsafe { std::ptr::write_bytes(addr as *mut u8, 0, size) };
        }

        Ok((
            Segment {
                shmid,
                // shmat never returns null on success.
                ptr: NonNull::new(addr as *mut T).unwrap(),
                key,
                _marker: PhantomData,
            },
            created,
        ))
    }

    /// Raw pointer into the mapping. Callers serialize access themselves,
    /// normally with the owning resource's META_LOCK.
    pub(crate) fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    pub(crate) fn shmid(&self) -> i32 {
        self.shmid
    }

    pub(crate) fn key(&self) -> i32 {
        self.key
    }

    /// Mark the segment for deletion. Existing attachments stay valid; the
    /// kernel frees the memory when the last one detaches. Already-removed
    /// segments count as success.
    pub(crate) fn mark_removed(&self) -> Result<()> {
        let rc = unsafe { libc::shmctl(self.shmid, libc::IPC_RMID, std::ptr::null_mut()) };
        if rc == -1 {
            let err = Error::syscall("shmctl(IPC_RMID)");
            if err.is_errno(libc::EINVAL) || err.is_errno(libc::EIDRM) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

impl<T> Drop for Segment<T> {
    fn drop(&mut self) {
        let rc = unsafe { libc::shmdt(self.ptr.as_ptr() as *const libc::c_void) };
        if rc == -1 {
            warn!(
                "shmdt failed for shmid {}: {}",
                self.shmid,
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Payload {
        a: i64,
        b: [i64; 8],
    }

    fn unique_key(tag: &str) -> i32 {
        crate::key::aux_key(
            &format!("shm-test-{tag}-{}", std::process::id()),
            "_segment",
        )
    }

    #[test]
    fn creator_sees_zeroed_memory() {
        let key = unique_key("zero");
        let (seg, created) = Segment::<Payload>::create_or_attach(key, 0o660).unwrap();
        assert!(created);
        unsafe {
            assert_eq!((*seg.as_ptr()).a, 0);
            assert_eq!((*seg.as_ptr()).b[7], 0);
        }
        seg.mark_removed().unwrap();
    }

    #[test]
    fn attacher_sees_creator_writes() {
        let key = unique_key("attach");
        let (seg, created) = Segment::<Payload>::create_or_attach(key, 0o660).unwrap();
        assert!(created);
        unsafe { (*seg.as_ptr()).a = 42 };

        let (other, created) = Segment::<Payload>::create_or_attach(key, 0o660).unwrap();
        assert!(!created);
        unsafe { assert_eq!((*other.as_ptr()).a, 42) };

        seg.mark_removed().unwrap();
    }

    #[test]
    fn mark_removed_twice_is_success() {
        let key = unique_key("rm");
        let (seg, _) = Segment::<Payload>::create_or_attach(key, 0o660).unwrap();
        seg.mark_removed().unwrap();
        seg.mark_removed().unwrap();
    }
}
