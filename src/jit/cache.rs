//! The executable arena holding compiled blocks: an anonymous mapping with
//! an append cursor, flipped between read/write (while the emitter appends)
//! and read/execute (while blocks run). Reset is the only reclamation.

use std::io;
use std::ptr;

use crate::error::{CoreError, CoreResult};

pub struct CodeCache {
    base: *mut u8,
    capacity: usize,
    len: usize,
    executable: bool,
}

// The cache is a raw mapping owned exclusively by its JitCore; nothing is
// shared, so moving it across threads with the core is fine.
unsafe impl Send for CodeCache {}

impl CodeCache {
    pub fn new(capacity: usize) -> CoreResult<Self> {
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(CoreError::ExecutableMap(io::Error::last_os_error()));
        }
        Ok(CodeCache {
            base: base as *mut u8,
            capacity,
            len: 0,
            executable: false,
        })
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.capacity - self.len
    }

    /// Drops all compiled code by rewinding the cursor. The mapping itself
    /// is reused.
    pub fn reset(&mut self) {
        self.len = 0;
    }

    /// Copies `code` to the cursor and returns its offset. The caller
    /// checks `remaining()` first; blocks are bounded well below capacity.
    pub fn append(&mut self, code: &[u8]) -> usize {
        assert!(code.len() <= self.remaining(), "code cache overflow");
        self.protect(false);
        let offset = self.len;
        unsafe {
            ptr::copy_nonoverlapping(code.as_ptr(), self.base.add(offset), code.len());
        }
        self.len += code.len();
        offset
    }

    /// Borrow of a compiled block's bytes (the mapping is always readable).
    pub fn code(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.len);
        unsafe { std::slice::from_raw_parts(self.base.add(offset), len) }
    }

    /// Flips the arena executable if needed and runs the block at `offset`
    /// under the host C ABI, returning its executed-opcode count.
    ///
    /// Safety relies on the emitter: every appended block is a complete
    /// `extern "C" fn() -> u64` with balanced stack effects, and the
    /// absolute pointers baked into it (guest state, block table) outlive
    /// the cache because the core owns all three.
    pub fn call(&mut self, offset: usize) -> u64 {
        debug_assert!(offset < self.len);
        self.protect(true);
        let entry: extern "C" fn() -> u64 =
            unsafe { std::mem::transmute(self.base.add(offset)) };
        entry()
    }

    fn protect(&mut self, executable: bool) {
        if self.executable == executable {
            return;
        }
        let prot = if executable {
            libc::PROT_READ | libc::PROT_EXEC
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        let ret = unsafe { libc::mprotect(self.base as *mut libc::c_void, self.capacity, prot) };
        assert_eq!(ret, 0, "mprotect failed on the code cache");
        self.executable = executable;
    }
}

impl Drop for CodeCache {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.capacity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_tracks_offsets_and_reset_rewinds() {
        let mut cache = CodeCache::new(4096).unwrap();
        assert_eq!(cache.append(&[0x90]), 0);
        assert_eq!(cache.append(&[0x90, 0x90]), 1);
        assert_eq!(cache.size(), 3);
        cache.reset();
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.remaining(), 4096);
    }

    #[test]
    fn calls_appended_code() {
        // mov eax, 7; ret
        let mut cache = CodeCache::new(4096).unwrap();
        let off = cache.append(&[0xB8, 0x07, 0x00, 0x00, 0x00, 0xC3]);
        assert_eq!(cache.call(off), 7);
        // Appending after a call flips back to writable.
        let off2 = cache.append(&[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]);
        assert_eq!(cache.call(off2), 42);
    }
}
