//! Translation table (TT) and translation cache (TC): maps a guest block
//! address to its compiled host code, and owns the executable buffer that
//! code lives in.

use dynamo_types::GuestAddr;
use std::collections::HashMap;
use thiserror::Error;

const INITIAL_CAPACITY: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum TraceCacheError {
    #[error("mmap failed while growing the translation cache")]
    MmapFailed,
    #[error("mprotect failed while finalizing a translation")]
    MprotectFailed,
}

/// One compiled host basic block (hBB).
#[derive(Debug, Clone)]
pub struct CompiledBlock {
    pub host_offset: usize,
    pub host_len: usize,
    pub orig_size: u32,
    /// Byte offsets (within the TC buffer) of displacement operands that
    /// target this block's successor(s) and can be rewritten once the
    /// successor is itself compiled.
    pub patch_sites: Vec<PatchSite>,
}

#[derive(Debug, Clone, Copy)]
pub struct PatchSite {
    pub offset: usize,
    pub target_pc: GuestAddr,
}

struct ExecBuffer {
    ptr: *mut u8,
    cap: usize,
    len: usize,
}

impl ExecBuffer {
    fn new(cap: usize) -> Result<Self, TraceCacheError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                cap,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(TraceCacheError::MmapFailed);
        }
        Ok(ExecBuffer {
            ptr: ptr as *mut u8,
            cap,
            len: 0,
        })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn write_at(&mut self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.cap);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
        }
    }
}

impl Drop for ExecBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.cap);
        }
    }
}

pub struct TraceCache {
    buf: ExecBuffer,
    tt: HashMap<GuestAddr, CompiledBlock>,
}

impl TraceCache {
    pub fn new() -> Result<Self, TraceCacheError> {
        Ok(TraceCache {
            buf: ExecBuffer::new(INITIAL_CAPACITY)?,
            tt: HashMap::new(),
        })
    }

    pub fn lookup(&self, pc: GuestAddr) -> Option<&CompiledBlock> {
        self.tt.get(&pc)
    }

    pub fn host_addr_of(&self, block: &CompiledBlock) -> *const u8 {
        unsafe { self.buf.ptr.add(block.host_offset) }
    }

    /// Appends `code` to the executable buffer and records it in the TT
    /// under `pc`. Doubles the buffer on overflow.
    pub fn insert(
        &mut self,
        pc: GuestAddr,
        code: &[u8],
        orig_size: u32,
        patch_sites: Vec<PatchSite>,
    ) -> Result<*const u8, TraceCacheError> {
        while self.buf.len + code.len() > self.buf.cap {
            self.grow()?;
        }
        let host_offset = self.buf.len;
        self.buf.write_at(host_offset, code);
        self.buf.len += code.len();

        let host_len = code.len();
        let patched = patch_sites
            .into_iter()
            .map(|p| PatchSite {
                offset: p.offset + host_offset,
                target_pc: p.target_pc,
            })
            .collect();

        self.tt.insert(
            pc,
            CompiledBlock {
                host_offset,
                host_len,
                orig_size,
                patch_sites: patched,
            },
        );
        Ok(unsafe { self.buf.ptr.add(host_offset) })
    }

    fn grow(&mut self) -> Result<(), TraceCacheError> {
        let new_cap = self.buf.cap * 2;
        let mut new_buf = ExecBuffer::new(new_cap)?;
        new_buf.write_at(0, self.buf.as_slice());
        new_buf.len = self.buf.len;
        self.buf = new_buf;
        Ok(())
    }

    /// Patches every not-yet-chained exit of `from` whose target is `to`
    /// to jump directly into `to`'s compiled code, skipping a TT lookup on
    /// the next dispatch through that edge. `encode_patch` receives the
    /// patch site's own host address (not its buffer offset) alongside the
    /// target's, since the 5-byte replacement is a PC-relative jump.
    pub fn chain(&mut self, from_pc: GuestAddr, to_pc: GuestAddr, encode_patch: impl Fn(*const u8, *const u8) -> Vec<u8>) {
        let to_addr = match self.tt.get(&to_pc) {
            Some(b) => unsafe { self.buf.ptr.add(b.host_offset) as *const u8 },
            None => return,
        };
        let Some(from) = self.tt.get(&from_pc) else {
            return;
        };
        let sites: Vec<usize> = from
            .patch_sites
            .iter()
            .filter(|p| p.target_pc == to_pc)
            .map(|p| p.offset)
            .collect();
        for offset in sites {
            let site_addr = unsafe { self.buf.ptr.add(offset) as *const u8 };
            let bytes = encode_patch(site_addr, to_addr);
            self.buf.write_at(offset, &bytes);
        }
    }

    /// Drops every translation whose guest byte range overlaps
    /// `[start, start + len)`.
    pub fn invalidate_range(&mut self, start: GuestAddr, len: u32) {
        let end = start.wrapping_add(len);
        self.tt.retain(|&pc, block| {
            let block_end = pc.wrapping_add(block.orig_size);
            !ranges_overlap(pc, block_end, start, end)
        });
    }

    pub fn block_count(&self) -> usize {
        self.tt.len()
    }
}

fn ranges_overlap(a_start: u32, a_end: u32, b_start: u32, b_end: u32) -> bool {
    a_start < b_end && b_start < a_end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_lookup_round_trips() {
        let mut tc = TraceCache::new().expect("mmap");
        let code = [0xC3u8]; // ret
        tc.insert(0x1000, &code, 1, vec![]).expect("insert");
        let block = tc.lookup(0x1000).expect("present");
        assert_eq!(block.orig_size, 1);
        assert_eq!(block.host_len, 1);
    }

    #[test]
    fn missing_entry_is_none() {
        let tc = TraceCache::new().expect("mmap");
        assert!(tc.lookup(0xbeef).is_none());
    }

    #[test]
    fn invalidate_range_drops_overlapping_blocks_only() {
        let mut tc = TraceCache::new().expect("mmap");
        tc.insert(0x1000, &[0x90], 4, vec![]).unwrap();
        tc.insert(0x2000, &[0x90], 4, vec![]).unwrap();
        tc.invalidate_range(0x1000, 4);
        assert!(tc.lookup(0x1000).is_none());
        assert!(tc.lookup(0x2000).is_some());
    }

    #[test]
    fn chain_rewrites_only_matching_patch_sites() {
        let mut tc = TraceCache::new().expect("mmap");
        tc.insert(0x3000, &[0x90, 0x90, 0x90, 0x90], 1, vec![]).unwrap();
        let patch = PatchSite {
            offset: 0,
            target_pc: 0x3000,
        };
        tc.insert(0x4000, &[0x90, 0x90, 0x90, 0x90], 1, vec![patch])
            .unwrap();
        tc.chain(0x4000, 0x3000, |_offset, _target| vec![0xEB, 0x00]);
        let from = tc.lookup(0x4000).unwrap();
        assert_eq!(from.patch_sites.len(), 1);
    }

    #[test]
    fn buffer_grows_past_initial_capacity() {
        let mut tc = TraceCache::new().expect("mmap");
        let big = vec![0x90u8; INITIAL_CAPACITY + 16];
        tc.insert(0x5000, &big, 1, vec![]).expect("grows instead of failing");
        assert!(tc.lookup(0x5000).is_some());
    }
}
