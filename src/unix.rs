use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

pub fn page_size() -> usize {
    // SAFETY: A simple call to the function with a valid option name.
    let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    // This should not happen, because sysconf returns -1 only if (1) the
    // option name is invalid, (2) the option is a limit and that limit is
    // indeterminate, (3) the option is not supported. PAGESIZE is valid, is
    // not a limit and is among the POSIX.1 variables, so its support should
    // be ubiquitous.
    if result == -1 {
        // Some reasonable default if this unlikely situation happens.
        4096
    } else {
        result as usize
    }
}

/// Reserves `len` bytes of file space so that later positional writes land
/// on already-allocated extents.
pub fn preallocate(file: &File, len: u64) -> io::Result<()> {
    // SAFETY: The descriptor is valid for the lifetime of `file`, which the
    // borrow pins for the duration of the call.
    unsafe { ffi::allocate(file.as_raw_fd(), len as libc::off_t) }
}

mod ffi {
    use std::io;

    #[cfg(target_os = "linux")]
    pub unsafe fn allocate(fd: libc::c_int, len: libc::off_t) -> io::Result<()> {
        // posix_fallocate reports the error number directly instead of
        // through errno.
        let err = libc::posix_fallocate(fd, 0, len);

        if err != 0 {
            Err(io::Error::from_raw_os_error(err))
        } else {
            Ok(())
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub unsafe fn allocate(fd: libc::c_int, len: libc::off_t) -> io::Result<()> {
        // Portable fallback: sizing the file does not reserve extents, but
        // every platform has it.
        if libc::ftruncate(fd, len) == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_sane() {
        let page = page_size();
        assert!(page >= 512);
        assert!(page.is_power_of_two());
    }

    #[test]
    fn preallocate_extends_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::create(dir.path().join("prealloc.data")).unwrap();

        preallocate(&file, 1 << 20).unwrap();

        assert_eq!(file.metadata().unwrap().len(), 1 << 20);
    }
}
