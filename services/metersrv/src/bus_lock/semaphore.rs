//! POSIX named-semaphore bus lock
//!
//! One host-wide semaphore with initial value 1. `sem_trywait` takes the
//! bus, `sem_post` hands it back. Recovery unlinks the name and creates a
//! fresh semaphore, so processes still holding the old one no longer
//! exclude us.
//!
//! Every attempt made while not holding the bus reopens the name first.
//! After a recovery all contenders, including a holder that was only slow,
//! therefore wait on the recreated semaphore from their next attempt on.

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::LockBackend;
use crate::error::BusLockError;

struct SemHandle(*mut libc::sem_t);

// The handle is a process-wide kernel object reference; access goes through a Mutex.
unsafe impl Send for SemHandle {}

/// Named-semaphore backend
pub struct SemaphoreBackend {
    name: String,
    c_name: CString,
    handle: Mutex<SemHandle>,
    held: AtomicBool,
}

fn open_semaphore(c_name: &CString) -> Result<SemHandle, BusLockError> {
    // SAFETY: c_name is a valid NUL-terminated string; mode and value are passed as c_uint
    // as sem_open's variadic arguments expect.
    let sem = unsafe {
        libc::sem_open(
            c_name.as_ptr(),
            libc::O_CREAT,
            0o666 as libc::c_uint,
            1 as libc::c_uint,
        )
    };
    if sem == libc::SEM_FAILED {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(SemHandle(sem))
}

/// Close `handle` and point it at whatever the name refers to now
fn reopen(c_name: &CString, handle: &mut SemHandle) -> Result<(), BusLockError> {
    let fresh = open_semaphore(c_name)?;
    // SAFETY: handle.0 came from a successful sem_open and is replaced right after,
    // while the caller holds the mutex guarding it.
    unsafe {
        libc::sem_close(handle.0);
    }
    *handle = fresh;
    Ok(())
}

impl SemaphoreBackend {
    /// Open (or create) the semaphore `name`, e.g. `/rs485`
    pub fn open(name: &str) -> Result<Self, BusLockError> {
        let name = if name.starts_with('/') {
            name.to_string()
        } else {
            format!("/{}", name)
        };
        let c_name = CString::new(name.clone())
            .map_err(|_| BusLockError::Unsupported(format!("invalid semaphore name {:?}", name)))?;
        let handle = open_semaphore(&c_name)?;
        debug!("Opened semaphore {}", name);
        Ok(Self {
            name,
            c_name,
            handle: Mutex::new(handle),
            held: AtomicBool::new(false),
        })
    }

    /// Remove the name from the system
    pub fn unlink(&self) -> Result<(), BusLockError> {
        // SAFETY: c_name is a valid NUL-terminated string.
        let rc = unsafe { libc::sem_unlink(self.c_name.as_ptr()) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err.into());
            }
        }
        Ok(())
    }
}

impl LockBackend for SemaphoreBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_acquire(&self, _identity: &str) -> Result<bool, BusLockError> {
        let mut handle = self.handle.lock();
        // the name may have been recreated by another process since our last attempt;
        // while holding, release must post to the semaphore we took
        if !self.held.load(Ordering::SeqCst) {
            reopen(&self.c_name, &mut handle)?;
        }
        // SAFETY: handle.0 came from a successful sem_open and is closed only in
        // reopen/recover/drop, all of which hold the same mutex.
        let rc = unsafe { libc::sem_trywait(handle.0) };
        if rc == 0 {
            self.held.store(true, Ordering::SeqCst);
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(false),
            _ => Err(err.into()),
        }
    }

    fn release(&self, _identity: &str) -> Result<(), BusLockError> {
        if !self.held.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let handle = self.handle.lock();
        // SAFETY: see try_acquire.
        let rc = unsafe { libc::sem_post(handle.0) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn recover(&self, _identity: &str) -> Result<(), BusLockError> {
        let mut handle = self.handle.lock();
        warn!("Recreating semaphore {}", self.name);
        self.unlink()?;
        reopen(&self.c_name, &mut handle)?;
        self.held.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for SemaphoreBackend {
    fn drop(&mut self) {
        let handle = self.handle.get_mut();
        // SAFETY: last use of the handle.
        unsafe {
            libc::sem_close(handle.0);
        }
    }
}

impl std::fmt::Debug for SemaphoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemaphoreBackend")
            .field("name", &self.name)
            .field("held", &self.held.load(Ordering::SeqCst))
            .finish()
    }
}
