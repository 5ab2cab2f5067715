//! Hardware abstraction layer for the HIF driver.
//!
//! The driver itself is platform-agnostic: everything it needs from the
//! surrounding system comes in through the [`HifHal`] trait. A platform
//! (kernel, hypervisor, test harness) implements it once and passes the type
//! as a generic parameter to [`Channel`](crate::Channel) and
//! [`HifDriver`](crate::HifDriver).

use core::marker::PhantomData;
use core::ptr::NonNull;

use crate::{HifError, HifResult};

/// Physical address in system memory, as seen by the accelerator's DMA engine.
pub type PhysAddr = usize;
/// Virtual address in system memory, as seen by the host CPU.
pub type VirtAddr = usize;

/// Platform services required by the HIF driver.
///
/// # Safety
///
/// The implementor must guarantee:
///
/// - `dma_alloc` returns memory that is physically **contiguous**, valid for
///   DMA by the accelerator, and stays mapped until `dma_dealloc`.
/// - The `(phys, virt)` pair returned by `dma_alloc` refers to the same
///   memory, and `mmio_virt_to_phys` is consistent with it.
/// - `sleep_us` actually yields for roughly the requested time; the driver
///   uses it for bounded hardware polls, not for precise timing.
pub unsafe trait HifHal: 'static {
    /// Allocates DMA-capable memory and returns `(physical, virtual)`.
    fn dma_alloc(size: usize) -> (PhysAddr, NonNull<u8>);

    /// Deallocates memory previously returned by [`HifHal::dma_alloc`].
    ///
    /// Returns 0 on success.
    ///
    /// # Safety
    ///
    /// The arguments must describe exactly one prior `dma_alloc` result, and
    /// the hardware must no longer reference the region.
    unsafe fn dma_dealloc(paddr: PhysAddr, vaddr: NonNull<u8>, size: usize) -> i32;

    /// Translates a virtual address inside a DMA region to its physical
    /// address.
    ///
    /// # Safety
    ///
    /// `vaddr` must point into a live mapping of at least `size` bytes.
    unsafe fn mmio_virt_to_phys(vaddr: NonNull<u8>, size: usize) -> PhysAddr;

    /// Sleeps for approximately `us` microseconds.
    ///
    /// Called from bounded polls (DMA-idle wait, shutdown flush); a busy-wait
    /// is an acceptable implementation.
    fn sleep_us(us: u32);
}

/// An owned DMA-capable memory block.
///
/// Thin RAII-less wrapper over one [`HifHal::dma_alloc`] result; the owner
/// frees it explicitly with [`DmaBlock::free`] during teardown, once the
/// hardware is known to be quiescent. Dropping without freeing leaks the
/// block, which is the safe default while descriptors may still reference it.
pub struct DmaBlock<H: HifHal> {
    virt: NonNull<u8>,
    phys: PhysAddr,
    size: usize,
    _marker: PhantomData<H>,
}

impl<H: HifHal> DmaBlock<H> {
    /// Allocates a new DMA block of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`HifError::NoMemory`] for a zero-sized request. Allocation
    /// failure itself is surfaced by the HAL (typically by panicking in test
    /// harnesses, or returning a dedicated poison address).
    pub fn allocate(size: usize) -> HifResult<DmaBlock<H>> {
        if size == 0 {
            return Err(HifError::NoMemory);
        }
        let (phys, virt) = H::dma_alloc(size);
        debug!(
            "allocated DMA block @pa: {:#x}, va: {:#x}, size: {:#x}",
            phys,
            virt.as_ptr() as usize,
            size
        );
        Ok(DmaBlock {
            virt,
            phys,
            size,
            _marker: PhantomData,
        })
    }

    /// Virtual base address of the block.
    pub fn virt(&self) -> NonNull<u8> {
        self.virt
    }

    /// Physical base address of the block.
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    /// Size of the block in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the block to the platform allocator.
    ///
    /// The caller must ensure the hardware holds no references into the
    /// block; the channel teardown sequence establishes that before calling
    /// this.
    pub fn free(self) {
        let rc = unsafe { H::dma_dealloc(self.phys, self.virt, self.size) };
        if rc != 0 {
            warn!("dma_dealloc failed (rc {}) @pa {:#x}", rc, self.phys);
        }
    }
}

// A DmaBlock is a unique owner of its region; the raw pointer inside does not
// alias anything the type system knows about.
unsafe impl<H: HifHal> Send for DmaBlock<H> {}
unsafe impl<H: HifHal> Sync for DmaBlock<H> {}
