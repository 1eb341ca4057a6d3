//! Message buffers with inline packet headers.
//!
//! A `MsgBuffer` frames a contiguous region as: header 0 (prepended), data
//! bytes rounded up to word alignment, then headers 1..n-1 packed after the
//! data. The same layout serves the sender (zero-copy packetization: header
//! n and data fragment n are handed to the transport as a scatter pair) and
//! the receiver (fragments land at their final offset during reassembly).

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::packet::{PKT_HDR_MAGIC, PKT_HDR_SIZE, PktHdr};

/// Word alignment for the data region; trailing headers start at the next
/// aligned byte after `max_data_size`.
pub const DATA_ALIGN: usize = 8;

/// Allocation granularity of the buffer pool.
pub const POOL_PAGE_SIZE: usize = 4096;

#[inline]
fn round_up(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}

/// Backing storage of a `MsgBuffer`.
enum Backing {
    /// Dynamically allocated region owned through the buffer pool.
    Owned { base: *mut u8, capacity: usize },
    /// No backing: the buffer aliases a received packet ("fake" buffer)
    /// or has been buried.
    Fake,
}

/// A message buffer.
///
/// `buf` points at the first data byte, never at the allocation start;
/// header 0 lives immediately before it. A buffer is valid iff `buf` is
/// non-null and header 0 carries the magic; dynamic iff it owns a backing
/// allocation; buried iff fully released.
pub struct MsgBuffer {
    /// Pointer to the first data byte. Null iff invalid/buried.
    buf: *mut u8,
    backing: Backing,
    /// Maximum data bytes the allocation can hold.
    max_data_size: usize,
    /// Current data bytes.
    data_size: usize,
    /// Maximum number of packets the allocation has headers for.
    max_num_pkts: u16,
    /// Current number of packets.
    num_pkts: u16,
}

// The buffer owns its backing region outright; raw pointers are the only
// reason auto-Send is lost.
unsafe impl Send for MsgBuffer {}

impl MsgBuffer {
    /// Bytes of backing storage needed for `max_data_size` data bytes and
    /// `max_num_pkts` packet headers.
    pub fn required_capacity(max_data_size: usize, max_num_pkts: u16) -> usize {
        PKT_HDR_SIZE
            + round_up(max_data_size, DATA_ALIGN)
            + (max_num_pkts as usize - 1) * PKT_HDR_SIZE
    }

    /// Construct a dynamic MsgBuffer over an allocation of `capacity` bytes
    /// starting at `base`. Header 0 is stamped with the magic and its
    /// headroom bytes are cleared; trailing headers get the magic too.
    ///
    /// # Safety
    /// `base` must point to at least `capacity` writable bytes, and
    /// `capacity >= required_capacity(max_data_size, max_num_pkts)`.
    pub unsafe fn owned(
        base: *mut u8,
        capacity: usize,
        max_data_size: usize,
        max_num_pkts: u16,
    ) -> Self {
        debug_assert!(max_num_pkts >= 1);
        debug_assert!(capacity >= Self::required_capacity(max_data_size, max_num_pkts));

        let mut mb = Self {
            buf: unsafe { base.add(PKT_HDR_SIZE) },
            backing: Backing::Owned { base, capacity },
            max_data_size,
            data_size: max_data_size,
            max_num_pkts,
            num_pkts: max_num_pkts,
        };

        for n in 0..max_num_pkts {
            let hdr = mb.pkthdr_mut(n);
            unsafe {
                (*hdr).magic = PKT_HDR_MAGIC;
                (*hdr).headroom = [0; crate::packet::PKT_HEADROOM];
            }
        }
        mb
    }

    /// Construct a single-packet "fake" MsgBuffer aliasing a received
    /// packet. `hdr` points at the packet's header; the data follows it.
    /// Freeing a fake buffer is a no-op.
    ///
    /// # Safety
    /// `hdr` must point at a validated `PktHdr` followed by at least
    /// `data_size` readable bytes, live for the duration of use.
    pub unsafe fn fake_from_pkt(hdr: *mut u8, data_size: usize) -> Self {
        debug_assert!(unsafe { PktHdr::read_from(hdr) }.check_magic());
        Self {
            buf: unsafe { hdr.add(PKT_HDR_SIZE) },
            backing: Backing::Fake,
            max_data_size: data_size,
            data_size,
            max_num_pkts: 1,
            num_pkts: 1,
        }
    }

    /// Basic validity check that every usable MsgBuffer must satisfy.
    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.buf.is_null() && unsafe { (*self.pkthdr(0)).check_magic() }
    }

    /// True iff this MsgBuffer owns a dynamically allocated backing.
    #[inline]
    pub fn is_dynamic(&self) -> bool {
        matches!(self.backing, Backing::Owned { .. })
    }

    /// True iff this MsgBuffer has been fully released.
    #[inline]
    pub fn is_buried(&self) -> bool {
        self.buf.is_null() && !self.is_dynamic()
    }

    /// Pointer to the nth packet header. Header 0 is prepended; headers
    /// n > 0 live after the word-aligned data region, packed contiguously.
    /// Located from the buffer fields alone.
    #[inline]
    pub fn pkthdr(&self, n: u16) -> *const PktHdr {
        debug_assert!(n < self.max_num_pkts);
        debug_assert!(!self.buf.is_null());
        if n == 0 {
            unsafe { self.buf.sub(PKT_HDR_SIZE) as *const PktHdr }
        } else {
            unsafe {
                self.buf
                    .add(round_up(self.max_data_size, DATA_ALIGN))
                    .add((n as usize - 1) * PKT_HDR_SIZE) as *const PktHdr
            }
        }
    }

    /// Mutable pointer to the nth packet header.
    #[inline]
    pub fn pkthdr_mut(&mut self, n: u16) -> *mut PktHdr {
        self.pkthdr(n) as *mut PktHdr
    }

    /// Check if header 0's `req_type` and `req_num` match `hdr`.
    pub fn matches(&self, hdr: &PktHdr) -> bool {
        let h0 = unsafe { &*self.pkthdr(0) };
        h0.req_type == hdr.req_type && { h0.req_num } == { hdr.req_num }
    }

    /// Current amount of data in the buffer.
    #[inline]
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Maximum data capacity of the allocation.
    #[inline]
    pub fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    /// Current number of packets.
    #[inline]
    pub fn num_pkts(&self) -> u16 {
        self.num_pkts
    }

    /// Maximum number of packets.
    #[inline]
    pub fn max_num_pkts(&self) -> u16 {
        self.max_num_pkts
    }

    /// Pointer to the first data byte.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.buf
    }

    /// Mutable pointer to the first data byte.
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.buf
    }

    /// The data region as a slice of `data_size` bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        debug_assert!(!self.buf.is_null());
        unsafe { std::slice::from_raw_parts(self.buf, self.data_size) }
    }

    /// The data region as a mutable slice of `data_size` bytes.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        debug_assert!(!self.buf.is_null());
        unsafe { std::slice::from_raw_parts_mut(self.buf, self.data_size) }
    }

    /// Resize to any size not exceeding the original allocation. Only the
    /// bookkeeping changes; the allocation is untouched.
    pub(crate) fn resize(&mut self, new_data_size: usize, new_num_pkts: u16) {
        assert!(new_data_size <= self.max_data_size);
        assert!(new_num_pkts <= self.max_num_pkts);
        self.data_size = new_data_size;
        self.num_pkts = new_num_pkts;
    }

    /// Release the backing allocation, leaving the buffer buried.
    /// Returns `None` for fake buffers.
    pub(crate) fn take_backing(&mut self) -> Option<(*mut u8, usize)> {
        self.buf = std::ptr::null_mut();
        match std::mem::replace(&mut self.backing, Backing::Fake) {
            Backing::Owned { base, capacity } => Some((base, capacity)),
            Backing::Fake => None,
        }
    }

    /// Shallow descriptor of this buffer's geometry, used by the engine to
    /// reference an application-owned request buffer without taking
    /// ownership.
    pub(crate) fn desc(&self) -> MsgBufferDesc {
        MsgBufferDesc {
            buf: self.buf,
            max_data_size: self.max_data_size,
            data_size: self.data_size,
            num_pkts: self.num_pkts,
        }
    }
}

/// Shallow, non-owning descriptor of a MsgBuffer. The referenced memory is
/// owned by the application, which must keep it alive and unmodified until
/// the engine releases the borrow.
#[derive(Clone, Copy)]
pub(crate) struct MsgBufferDesc {
    pub buf: *mut u8,
    pub max_data_size: usize,
    pub data_size: usize,
    pub num_pkts: u16,
}

impl MsgBufferDesc {
    /// Reconstruct a non-owning view with the original geometry, so header
    /// accessors work. Freeing the view is a no-op.
    pub fn as_view(&self) -> MsgBuffer {
        MsgBuffer {
            buf: self.buf,
            backing: Backing::Fake,
            max_data_size: self.max_data_size,
            data_size: self.data_size,
            max_num_pkts: self.num_pkts,
            num_pkts: self.num_pkts,
        }
    }
}

/// Allocate a page-aligned region of at least `capacity` bytes. Returns the
/// pointer and the rounded capacity.
pub(crate) fn raw_alloc(capacity: usize) -> Result<(*mut u8, usize)> {
    let capacity = round_up(capacity.max(1), POOL_PAGE_SIZE);
    let mut ptr: *mut libc::c_void = std::ptr::null_mut();
    let ret = unsafe { libc::posix_memalign(&mut ptr, POOL_PAGE_SIZE, capacity) };
    if ret != 0 {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::OutOfMemory,
            format!("posix_memalign failed: {}", ret),
        )));
    }
    Ok((ptr as *mut u8, capacity))
}

/// A pool of page-aligned buffer backings, recycled by capacity class.
///
/// Freed backings are kept on per-class free lists so steady-state
/// allocation does not touch the system allocator.
pub struct BufferPool {
    free: HashMap<usize, Vec<*mut u8>>,
    total_bytes: usize,
    outstanding: usize,
}

/// A backing region handed out by the pool.
pub struct Slab {
    pub base: *mut u8,
    pub capacity: usize,
    /// True if this region was newly minted (and may need registration
    /// with the transport), false if recycled.
    pub fresh: bool,
}

unsafe impl Send for BufferPool {}

impl BufferPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            free: HashMap::new(),
            total_bytes: 0,
            outstanding: 0,
        }
    }

    /// Capacity class for a requested size.
    #[inline]
    pub fn class_of(capacity: usize) -> usize {
        round_up(capacity.max(1), POOL_PAGE_SIZE)
    }

    /// Obtain a backing of at least `capacity` bytes.
    pub fn alloc(&mut self, capacity: usize) -> Result<Slab> {
        let class = Self::class_of(capacity);
        if let Some(list) = self.free.get_mut(&class)
            && let Some(base) = list.pop()
        {
            self.outstanding += 1;
            return Ok(Slab {
                base,
                capacity: class,
                fresh: false,
            });
        }
        let (base, capacity) = raw_alloc(class)?;
        self.total_bytes += capacity;
        self.outstanding += 1;
        Ok(Slab {
            base,
            capacity,
            fresh: true,
        })
    }

    /// Return a backing to the pool. Backings minted outside the pool by
    /// the same allocator (background responses) are adopted transparently,
    /// so `outstanding` under-counts by the number of adoptions.
    pub fn free(&mut self, base: *mut u8, capacity: usize) {
        debug_assert_eq!(capacity, Self::class_of(capacity));
        self.outstanding = self.outstanding.saturating_sub(1);
        self.free.entry(capacity).or_default().push(base);
    }

    /// Number of backings currently handed out.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Total bytes ever minted by this pool.
    #[inline]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        for (_, list) in self.free.drain() {
            for base in list {
                unsafe { libc::free(base as *mut libc::c_void) };
            }
        }
    }
}

/// Allocate a standalone dynamic MsgBuffer outside any pool. Used by
/// background request handlers, which cannot touch the endpoint's pool.
pub(crate) fn alloc_standalone(
    data_size: usize,
    max_data_per_pkt: usize,
) -> Result<MsgBuffer> {
    let num_pkts = PktHdr::calc_num_pkts(data_size, max_data_per_pkt);
    let needed = MsgBuffer::required_capacity(data_size, num_pkts);
    let (base, capacity) = raw_alloc(needed)?;
    Ok(unsafe { MsgBuffer::owned(base, capacity, data_size, num_pkts) })
}
