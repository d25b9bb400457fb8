//! Message buffers.
//!
//! A `MsgBuffer` is a contiguous region laid out as
//! `[hdr_0 | payload_0 | hdr_1 | payload_1 | ...]`: one fixed-size packet
//! header slot per packet, each directly followed by that packet's payload
//! chunk, so any single packet is one contiguous wire region. Payload
//! chunks are `max_data_per_pkt` bytes except the last.
//!
//! Dynamic buffers are owned by the endpoint's huge-page allocator and
//! carry the magic tag in header zero; non-dynamic buffers wrap a
//! transport receive-ring slot and must never be freed.

use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::packet::{PktHdr, PKT_HDR_SIZE, PKT_HDR_MAGIC};

/// A message buffer with interleaved per-packet header slots.
pub struct MsgBuffer {
    /// Start of the region (header zero). Null for invalid buffers.
    buf: *mut u8,
    /// Bytes owned at `buf` (the allocator size class for dynamic buffers,
    /// the wrapped packet span for ring wrappers).
    alloc_bytes: usize,
    /// Capacity in payload bytes, excluding headers.
    max_data_size: usize,
    /// Current logical payload size.
    data_size: usize,
    /// Header slots carved at allocation time.
    max_num_pkts: usize,
    /// Packets for the current `data_size`.
    num_pkts: usize,
    /// Payload bytes per packet of the owning transport.
    max_data_per_pkt: usize,
    /// Allocator-owned (true) vs receive-ring wrapper (false).
    dynamic: bool,
}

impl MsgBuffer {
    /// The invalid buffer, returned by `alloc_msg_buffer` on out-of-memory.
    pub fn invalid() -> Self {
        Self {
            buf: std::ptr::null_mut(),
            alloc_bytes: 0,
            max_data_size: 0,
            data_size: 0,
            max_num_pkts: 0,
            num_pkts: 0,
            max_data_per_pkt: 0,
            dynamic: false,
        }
    }

    /// Build a dynamic buffer over an allocator-owned region.
    ///
    /// Writes the magic tag into header zero so that stray values can be
    /// told apart from engine-produced buffers.
    pub(crate) fn dynamic(
        buf: NonNull<u8>,
        alloc_bytes: usize,
        max_data_size: usize,
        max_num_pkts: usize,
        max_data_per_pkt: usize,
    ) -> Self {
        debug_assert!(alloc_bytes >= max_data_size + max_num_pkts * PKT_HDR_SIZE);
        let mut mb = Self {
            buf: buf.as_ptr(),
            alloc_bytes,
            max_data_size,
            data_size: max_data_size,
            max_num_pkts,
            num_pkts: max_num_pkts,
            max_data_per_pkt,
            dynamic: true,
        };
        // Stamp the magic; the remaining header fields are filled at
        // transmission time.
        unsafe {
            let zeroed = PktHdr::new(0, 0, 0, crate::packet::PktType::Req, 0, 0);
            zeroed.write_to(mb.buf);
        }
        mb.num_pkts = Self::pkts_for(max_data_size, max_data_per_pkt);
        mb
    }

    /// Engine-internal shallow copy. The clone aliases the same storage;
    /// exactly one of the copies may be passed to `free_msg_buffer`.
    pub(crate) fn clone_view(&self) -> Self {
        Self {
            buf: self.buf,
            alloc_bytes: self.alloc_bytes,
            max_data_size: self.max_data_size,
            data_size: self.data_size,
            max_num_pkts: self.max_num_pkts,
            num_pkts: self.num_pkts,
            max_data_per_pkt: self.max_data_per_pkt,
            dynamic: self.dynamic,
        }
    }

    #[inline]
    fn pkts_for(data_size: usize, max_data_per_pkt: usize) -> usize {
        PktHdr::calc_num_pkts(data_size, max_data_per_pkt)
    }

    #[inline]
    fn stride(&self) -> usize {
        PKT_HDR_SIZE + self.max_data_per_pkt
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.buf.is_null()
    }

    /// Check the magic tag in header zero.
    #[inline]
    pub fn check_magic(&self) -> bool {
        if self.buf.is_null() {
            return false;
        }
        unsafe { *self.buf.add(PKT_HDR_SIZE - 1) == PKT_HDR_MAGIC }
    }

    #[inline]
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    #[inline]
    pub fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    #[inline]
    pub fn num_pkts(&self) -> usize {
        self.num_pkts
    }

    pub(crate) fn alloc_bytes(&self) -> usize {
        self.alloc_bytes
    }

    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.buf
    }

    /// Shrink the logical payload size. Recomputes the packet count but
    /// never reallocates.
    pub fn resize(&mut self, new_data_size: usize) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::InvalidMsgBuffer);
        }
        if new_data_size > self.max_data_size {
            return Err(Error::MessageTooLarge {
                size: new_data_size,
                max: self.max_data_size,
            });
        }
        self.data_size = new_data_size;
        self.num_pkts = Self::pkts_for(new_data_size, self.max_data_per_pkt);
        Ok(())
    }

    /// Payload bytes carried by packet `i`.
    #[inline]
    pub fn chunk_len(&self, i: usize) -> usize {
        debug_assert!(i < self.num_pkts);
        let start = i * self.max_data_per_pkt;
        (self.data_size - start).min(self.max_data_per_pkt)
    }

    #[inline]
    pub(crate) fn hdr_ptr(&self, i: usize) -> *mut u8 {
        debug_assert!(i < self.max_num_pkts);
        unsafe { self.buf.add(i * self.stride()) }
    }

    #[inline]
    fn data_ptr(&self, i: usize) -> *mut u8 {
        unsafe { self.hdr_ptr(i).add(PKT_HDR_SIZE) }
    }

    /// Write packet header `i`.
    pub(crate) fn set_hdr(&mut self, i: usize, hdr: &PktHdr) {
        unsafe { hdr.write_to(self.hdr_ptr(i)) };
    }

    /// The wire region of packet `i`: header plus payload, contiguous.
    pub(crate) fn pkt_region(&self, i: usize) -> (*const u8, usize) {
        (self.hdr_ptr(i) as *const u8, PKT_HDR_SIZE + self.chunk_len(i))
    }

    /// Payload chunk of packet `i`.
    #[inline]
    pub fn chunk(&self, i: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data_ptr(i), self.chunk_len(i)) }
    }

    /// Mutable payload chunk of packet `i`.
    #[inline]
    pub fn chunk_mut(&mut self, i: usize) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data_ptr(i), self.chunk_len(i)) }
    }

    /// The whole payload, when it fits in a single packet.
    pub fn contiguous_data(&self) -> Option<&[u8]> {
        if self.num_pkts == 1 {
            Some(self.chunk(0))
        } else {
            None
        }
    }

    /// Scatter `src` across the payload chunks, starting at payload byte 0.
    pub fn copy_in_data(&mut self, src: &[u8]) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::InvalidMsgBuffer);
        }
        if src.len() > self.data_size {
            return Err(Error::MessageTooLarge {
                size: src.len(),
                max: self.data_size,
            });
        }
        let mdp = self.max_data_per_pkt;
        for (i, part) in src.chunks(mdp).enumerate() {
            self.chunk_mut(i)[..part.len()].copy_from_slice(part);
        }
        Ok(())
    }

    /// Gather the payload chunks into one `Vec`.
    pub fn copy_out_data(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data_size);
        for i in 0..self.num_pkts {
            out.extend_from_slice(self.chunk(i));
        }
        out
    }

    /// Copy one received fragment into chunk `i` of a reassembly buffer.
    pub(crate) fn copy_in_chunk(&mut self, i: usize, src: &[u8]) {
        let dst = self.chunk_mut(i);
        let n = dst.len().min(src.len());
        dst[..n].copy_from_slice(&src[..n]);
    }
}

// The buffer owns (or borrows, for the engine-internal lifetime of a ring
// wrapper) raw memory that no other thread mutates concurrently.
unsafe impl Send for MsgBuffer {}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_dynamic(max_data: usize, mdp: usize) -> (Vec<u8>, MsgBuffer) {
        let num_pkts = PktHdr::calc_num_pkts(max_data, mdp);
        let bytes = max_data + num_pkts * PKT_HDR_SIZE;
        let mut storage = vec![0u8; bytes];
        let ptr = NonNull::new(storage.as_mut_ptr()).unwrap();
        let mb = MsgBuffer::dynamic(ptr, bytes, max_data, num_pkts, mdp);
        (storage, mb)
    }

    #[test]
    fn test_fragmentation_law() {
        let mdp = 1024;
        for size in [0, 1, 64, 1023, 1024, 1025, 4096, 4097] {
            let (_s, mb) = make_dynamic(size, mdp);
            let expect = if size <= mdp { 1 } else { (size + mdp - 1) / mdp };
            assert_eq!(mb.num_pkts(), expect, "size {}", size);
        }
    }

    #[test]
    fn test_magic_stamped() {
        let (_s, mb) = make_dynamic(128, 1024);
        assert!(mb.check_magic());
        assert!(mb.is_dynamic());
    }

    #[test]
    fn test_scatter_gather_roundtrip() {
        let mdp = 64;
        let (_s, mut mb) = make_dynamic(300, mdp);
        let src: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        mb.copy_in_data(&src).unwrap();
        assert_eq!(mb.copy_out_data(), src);
        assert_eq!(mb.num_pkts(), 5);
        assert_eq!(mb.chunk_len(4), 300 - 4 * 64);
    }

    #[test]
    fn test_resize_shrinks_pkts() {
        let mdp = 1024;
        let (_s, mut mb) = make_dynamic(4096, mdp);
        assert_eq!(mb.num_pkts(), 4);
        mb.resize(1000).unwrap();
        assert_eq!(mb.num_pkts(), 1);
        assert_eq!(mb.data_size(), 1000);
        assert!(mb.resize(5000).is_err());
        // Capacity is unchanged; growing back within it is fine.
        mb.resize(4096).unwrap();
        assert_eq!(mb.num_pkts(), 4);
    }

    #[test]
    fn test_single_pkt_contiguous() {
        let (_s, mut mb) = make_dynamic(100, 1024);
        mb.copy_in_data(&[7u8; 100]).unwrap();
        assert_eq!(mb.contiguous_data().unwrap(), &[7u8; 100][..]);

        let (_s2, mb2) = make_dynamic(3000, 1024);
        assert!(mb2.contiguous_data().is_none());
    }

    #[test]
    fn test_invalid_buffer() {
        let mb = MsgBuffer::invalid();
        assert!(!mb.is_valid());
        assert!(!mb.check_magic());
    }
}
