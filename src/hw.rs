//! Hardware collaborator contracts.
//!
//! The accelerator exposes two things per channel that this crate consumes
//! but does not reimplement: the buffer-descriptor rings and the channel
//! control registers. Both are hidden behind object-safe traits so the exact
//! MMIO offsets and binary descriptor layout stay in the platform crate (and
//! so the whole data path can run against scripted mocks in tests).

use bitflags::bitflags;

use crate::hal::PhysAddr;
use crate::HifResult;

/// One buffer-descriptor ring entry as seen by software.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BdEntry {
    /// Physical address of the buffer.
    pub addr: PhysAddr,
    /// Transfer length in bytes.
    pub len: u16,
    /// Last-in-frame marker: set on the final chunk of a multi-chunk frame.
    pub lifm: bool,
}

/// A bounded FIFO of pending buffer-descriptor transfers.
///
/// # Contract
///
/// - `capacity()` is a hardware-reported power of two and never changes.
/// - The ring holds at most `capacity() - 1` entries; one slot is always
///   reserved so the hardware can distinguish full from empty. `enqueue` at
///   that fill level fails with [`crate::HifError::NoSpace`].
/// - `dequeue` yields only entries the hardware has finished with, in
///   exactly the order they were enqueued.
/// - `drain` removes the oldest entry regardless of completion state; it is
///   only legal while DMA for this direction is disabled (teardown and
///   recovery paths).
pub trait BdRing: Send {
    /// Total slot count (power of two).
    fn capacity(&self) -> usize;

    /// Number of currently occupied slots.
    fn fill_level(&self) -> usize;

    /// Hands one buffer to the hardware.
    fn enqueue(&mut self, addr: PhysAddr, len: u16, lifm: bool) -> HifResult<()>;

    /// Takes the oldest completed entry, if any.
    fn dequeue(&mut self) -> Option<BdEntry>;

    /// Forcibly removes the oldest entry, completed or not.
    fn drain(&mut self) -> Option<BdEntry>;
}

bitflags! {
    /// Per-channel interrupt events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IrqEvents: u32 {
        /// One or more RX descriptors have completed.
        const RX_PACKET = 1 << 0;
        /// One or more TX descriptors have completed.
        const TX_COMPLETE = 1 << 1;
    }
}

/// Per-channel DMA and interrupt control registers.
///
/// Implementations wrap the channel's MMIO block. All methods are expected to
/// be cheap register accesses; the driver serializes calls through its
/// control lock, so implementations need not be internally synchronized.
pub trait ChannelHw: Send {
    /// Hardware-reported ring depth for this channel (power of two).
    fn ring_depth(&self) -> usize;

    /// Starts the RX DMA engine.
    fn rx_dma_enable(&mut self);
    /// Requests the RX DMA engine to stop. Completion is observed through
    /// [`ChannelHw::rx_dma_active`].
    fn rx_dma_disable(&mut self);
    /// Whether the RX DMA engine is still processing descriptors.
    fn rx_dma_active(&self) -> bool;

    /// Starts the TX DMA engine.
    fn tx_dma_enable(&mut self);
    /// Requests the TX DMA engine to stop.
    fn tx_dma_disable(&mut self);
    /// Whether the TX DMA engine is still processing descriptors.
    fn tx_dma_active(&self) -> bool;

    /// Rings the TX doorbell: tells the hardware new descriptors are ready.
    fn tx_dma_start(&mut self);

    /// Whether the channel's internal descriptor look-ahead FIFO is empty.
    ///
    /// The engine pre-fetches descriptors into an internal FIFO that a plain
    /// DMA disable does not clear; the shutdown flush loops until this reads
    /// `true` before a different ring may be attached to the channel.
    fn bd_fetch_empty(&self) -> bool;

    /// Reads and clears the pending interrupt events.
    fn irq_status(&mut self) -> IrqEvents;
    /// Masks (suppresses) the given events.
    fn irq_mask(&mut self, events: IrqEvents);
    /// Unmasks the given events.
    fn irq_unmask(&mut self, events: IrqEvents);
}
