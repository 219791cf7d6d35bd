//! [`HostMemory`] backed by `mmap`/`madvise`/`mlock` from libc.

use crate::driver::HostMemory;

/// Host memory primitives of the running OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcHostMemory;

#[cfg(unix)]
impl HostMemory for LibcHostMemory {
    fn map(&self, size: usize) -> std::io::Result<u64> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                map_flags(),
                -1,
                0,
            )
        };
        if ptr.is_null() || ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(ptr as u64)
    }

    #[cfg(target_os = "linux")]
    fn advise_huge_pages(&self, addr: u64, size: usize) -> std::io::Result<()> {
        let ret = unsafe { libc::madvise(addr as *mut libc::c_void, size, libc::MADV_HUGEPAGE) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn advise_huge_pages(&self, _addr: u64, _size: usize) -> std::io::Result<()> {
        Ok(())
    }

    fn lock(&self, addr: u64, size: usize) -> std::io::Result<()> {
        let ret = unsafe { libc::mlock(addr as *const libc::c_void, size) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn unmap(&self, addr: u64, size: usize) -> std::io::Result<()> {
        let ret = unsafe { libc::munmap(addr as *mut libc::c_void, size) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn map_flags() -> libc::c_int {
    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE
}

#[cfg(all(unix, not(target_os = "linux")))]
fn map_flags() -> libc::c_int {
    libc::MAP_PRIVATE | libc::MAP_ANON
}

#[cfg(not(unix))]
impl HostMemory for LibcHostMemory {
    fn map(&self, _size: usize) -> std::io::Result<u64> {
        Err(unsupported())
    }

    fn advise_huge_pages(&self, _addr: u64, _size: usize) -> std::io::Result<()> {
        Err(unsupported())
    }

    fn lock(&self, _addr: u64, _size: usize) -> std::io::Result<()> {
        Err(unsupported())
    }

    fn unmap(&self, _addr: u64, _size: usize) -> std::io::Result<()> {
        Err(unsupported())
    }
}

#[cfg(not(unix))]
fn unsupported() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "anonymous page mapping requires a unix host",
    )
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn test_map_and_unmap_page() {
        let mem = LibcHostMemory;
        let size = 4096;
        let addr = mem.map(size).expect("mmap");
        assert_ne!(addr, 0);
        assert_eq!(addr % 4096, 0);
        // Huge-page advice is best effort on hosts without THP.
        let _ = mem.advise_huge_pages(addr, size);
        unsafe {
            std::ptr::write_bytes(addr as *mut u8, 0xab, size);
            assert_eq!(*(addr as *const u8).add(size - 1), 0xab);
        }
        mem.unmap(addr, size).expect("munmap");
    }
}
