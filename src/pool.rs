//! RX buffer pool.
//!
//! The pool carves one contiguous DMA region into a fixed number of
//! equally-sized slots. A slot is addressed by its **index**, never by raw
//! pointer: the index is the handle exchanged between the pool, the channel
//! and the driver, and side arithmetic maps it to the virtual and physical
//! addresses when the hardware needs one. This keeps address conversions in
//! exactly two functions instead of scattered pointer arithmetic.
//!
//! At any instant a buffer is owned by exactly one of: the pool free list,
//! the RX ring (hardware), or a client that received a packet in it.
//! The channel counts hand-outs so teardown can prove the three add up.
//!
//! The head of each slot is a small [`BufMeta`] bookkeeping area; the DMA
//! data region starts [`BUF_META_ROOM`] bytes in. Hardware only ever sees
//! data-region addresses.

use alloc::vec::Vec;
use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::hal::{DmaBlock, HifHal, PhysAddr};
use crate::header::HIF_HEADER_SIZE;
use crate::{HifError, HifResult};

/// Bytes reserved at the head of every pool slot for the metadata area.
///
/// Cache-line sized so the DMA data region starts on its own line.
pub const BUF_META_ROOM: usize = 64;

/// Per-buffer bookkeeping slot, colocated with the buffer itself.
///
/// Written by the RX job when a packet lands in the buffer; the pointer
/// handed out by [`Channel::rx`](crate::Channel::rx) stays valid until the
/// buffer is released back into circulation.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BufMeta {
    /// Owning client id while the buffer is handed out.
    pub client: u8,
    /// Client RX queue the packet was dispatched to.
    pub queue: u8,
    /// Copy of the RX header flag bits.
    pub flags: u16,
    /// Payload length in bytes (wire header excluded).
    pub len: u16,
}

/// Index of a slot inside a [`BufferPool`].
pub type BufIndex = usize;

/// A fixed-size, DMA-capable buffer arena.
pub struct BufferPool<H: HifHal> {
    region: DmaBlock<H>,
    entries: usize,
    entry_size: usize,
    free: Mutex<Vec<BufIndex>>,
    /// Buffers currently held outside both the free list and the hardware
    /// ring (by packet owners).
    handed_out: AtomicUsize,
}

/// Return path for handed-out buffers; object-safe so a packet can carry it
/// without knowing the HAL type parameter.
pub(crate) trait BufReturn: Send + Sync {
    /// Returns a handed-out buffer to the free list and settles the
    /// hand-out count.
    fn return_buf(&self, index: BufIndex);
}

impl<H: HifHal> BufReturn for BufferPool<H> {
    fn return_buf(&self, index: BufIndex) {
        self.free(index);
        self.note_returned();
    }
}

impl<H: HifHal> BufferPool<H> {
    /// Allocates a pool of `entries` slots of `entry_size` bytes each.
    ///
    /// # Errors
    ///
    /// - [`HifError::InvalidArgument`] - zero entries, or `entry_size` not a
    ///   multiple of [`BUF_META_ROOM`] (alignment of the data region).
    /// - [`HifError::NoMemory`] - the metadata room cannot hold [`BufMeta`]
    ///   plus a wire header's worth of parse scratch, or the backing DMA
    ///   allocation failed.
    pub fn allocate(entries: usize, entry_size: usize) -> HifResult<BufferPool<H>> {
        if entries == 0 || entry_size == 0 || entry_size % BUF_META_ROOM != 0 {
            error!(
                "pool geometry invalid: {} entries of {} bytes",
                entries, entry_size
            );
            return Err(HifError::InvalidArgument);
        }
        if BUF_META_ROOM < size_of::<BufMeta>() || entry_size <= BUF_META_ROOM + HIF_HEADER_SIZE {
            error!("pool entry size {} leaves no payload room", entry_size);
            return Err(HifError::NoMemory);
        }

        let region = DmaBlock::allocate(entries * entry_size)?;
        let mut free = Vec::with_capacity(entries);
        free.extend(0..entries);

        Ok(BufferPool {
            region,
            entries,
            entry_size,
            free: Mutex::new(free),
            handed_out: AtomicUsize::new(0),
        })
    }

    /// Takes a free slot out of the pool, or `None` if the pool is empty.
    pub fn alloc(&self) -> Option<BufIndex> {
        self.free.lock().pop()
    }

    /// Returns a slot to the pool.
    ///
    /// # Panics
    ///
    /// Panics on an out-of-range index or a double free; both are ownership
    /// bugs, not runtime conditions.
    pub fn free(&self, index: BufIndex) {
        assert!(index < self.entries, "buffer outside of pool, index {index}");
        let mut free = self.free.lock();
        assert!(
            !free.contains(&index),
            "free: buffer {index} already in pool"
        );
        free.push(index);
    }

    /// Number of slots currently in the free list.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Number of buffers currently held by packet owners.
    pub fn handed_out(&self) -> usize {
        self.handed_out.load(Ordering::Relaxed)
    }

    /// Records a buffer leaving circulation for a packet owner.
    pub(crate) fn note_handed_out(&self) {
        self.handed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a handed-out buffer coming back (to the free list or the
    /// hardware ring).
    pub(crate) fn note_returned(&self) {
        self.handed_out.fetch_sub(1, Ordering::Relaxed);
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.entries
    }

    /// Size of a slot's DMA data region in bytes.
    pub fn data_size(&self) -> usize {
        self.entry_size - BUF_META_ROOM
    }

    /// Virtual address of a slot's data region.
    pub fn data_virt(&self, index: BufIndex) -> NonNull<u8> {
        assert!(index < self.entries, "buffer outside of pool, index {index}");
        unsafe {
            NonNull::new_unchecked(
                self.region
                    .virt()
                    .as_ptr()
                    .add(index * self.entry_size + BUF_META_ROOM),
            )
        }
    }

    /// Physical address of a slot's data region, as programmed into the
    /// hardware ring.
    pub fn data_phys(&self, index: BufIndex) -> PhysAddr {
        assert!(index < self.entries, "buffer outside of pool, index {index}");
        self.region.phys() + index * self.entry_size + BUF_META_ROOM
    }

    /// Pointer to a slot's metadata area.
    pub fn meta(&self, index: BufIndex) -> NonNull<BufMeta> {
        assert!(index < self.entries, "buffer outside of pool, index {index}");
        unsafe {
            NonNull::new_unchecked(
                self.region.virt().as_ptr().add(index * self.entry_size) as *mut BufMeta
            )
        }
    }

    /// Resolves a data-region physical address back to its slot index.
    ///
    /// Returns `None` for addresses outside the pool or not on a slot's data
    /// offset - e.g. the dedicated flush buffer, which is not pool memory.
    pub fn index_of_phys(&self, paddr: PhysAddr) -> Option<BufIndex> {
        let base = self.region.phys();
        if paddr < base + BUF_META_ROOM || paddr >= base + self.entries * self.entry_size {
            return None;
        }
        let offset = paddr - base;
        if offset % self.entry_size != BUF_META_ROOM {
            return None;
        }
        Some(offset / self.entry_size)
    }

    /// Consumes the pool and frees its DMA region.
    pub fn destroy(self) {
        self.region.free();
    }
}

// The raw region pointer is only dereferenced through index-checked accessors
// and the free list is internally locked.
unsafe impl<H: HifHal> Send for BufferPool<H> {}
unsafe impl<H: HifHal> Sync for BufferPool<H> {}
