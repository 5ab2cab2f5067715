//! HIF channel: one hardware DMA context.
//!
//! A [`Channel`] owns the RX and TX buffer-descriptor rings, the RX buffer
//! pool, and the channel's DMA/IRQ control state. It provides the
//! flow-control predicates every supply/transmit call checks first, the
//! buffer supply/receive/release cycle, and the shutdown-flush procedure
//! that clears the engine's internal descriptor look-ahead FIFO before a
//! different ring may be attached to the hardware channel.
//!
//! Internal locking is split by execution context: the RX ring (deferred RX
//! job), the TX ring (transmitters and the TX-confirmation job, already
//! serialized by the driver's TX lock), and the control registers, which
//! both the control plane and the deferred jobs touch and therefore get
//! their own lock.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::hal::{DmaBlock, HifHal, PhysAddr};
use crate::header::{TxFlags, TxHeader, HIF_HEADER_SIZE};
use crate::hw::{BdRing, ChannelHw};
use crate::pool::{BufIndex, BufMeta, BufReturn, BufferPool};
use crate::{HifError, HifResult};

/// Bounded DMA-idle poll after a direction disable: retry count.
const DMA_IDLE_RETRIES: u32 = 10;
/// Bounded DMA-idle poll: sleep between retries, microseconds.
const DMA_IDLE_POLL_US: u32 = 100;
/// Sleep between shutdown-flush iterations, microseconds.
const FLUSH_POLL_US: u32 = 100;
/// Length of the dummy self-addressed flush frame.
const FLUSH_FRAME_LEN: u16 = 64;

/// Channel creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    /// Number of RX pool buffers. `0` selects the maximum the RX ring can
    /// hold (`ring capacity - 1`), so the hardware always has receive
    /// capacity.
    pub pool_entries: usize,
    /// Size of each pool buffer in bytes, metadata room included.
    pub entry_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            pool_entries: 0,
            entry_size: 2048,
        }
    }
}

/// One received chunk, as handed to the RX job.
#[derive(Debug)]
pub struct RxChunk {
    /// Pool slot holding the data.
    pub index: BufIndex,
    /// Virtual address of the chunk data (wire header included on the first
    /// chunk of a frame).
    pub virt: NonNull<u8>,
    /// Physical address of the chunk data.
    pub phys: PhysAddr,
    /// Chunk length in bytes.
    pub len: u16,
    /// Last-in-frame marker.
    pub lifm: bool,
    /// The buffer's colocated metadata slot, valid until the buffer is
    /// released back into circulation.
    pub meta: NonNull<BufMeta>,
}

unsafe impl Send for RxChunk {}

/// One hardware DMA context: rings, pool, DMA/IRQ control.
pub struct Channel<H: HifHal> {
    id: u8,
    rx_ring: Mutex<Box<dyn BdRing>>,
    tx_ring: Mutex<Box<dyn BdRing>>,
    hw: Mutex<Box<dyn ChannelHw>>,
    /// Shared so packet owners can carry the pool's return path; the channel
    /// itself holds the only long-lived reference.
    pool: Arc<BufferPool<H>>,
    /// Dedicated buffer for shutdown-flush dummy traffic; never part of the
    /// pool so flushing cannot depend on pool occupancy.
    flush_buf: DmaBlock<H>,
    rx_enabled: AtomicBool,
    tx_enabled: AtomicBool,
}

impl<H: HifHal> Channel<H> {
    /// Creates and initializes a channel: allocates the buffer pool sized by
    /// `config` and pre-populates the RX ring with all of it.
    ///
    /// The rings and register block come from the platform; both rings must
    /// report the hardware's power-of-two depth.
    ///
    /// # Errors
    ///
    /// - [`HifError::InvalidArgument`] - ring depths inconsistent or not a
    ///   power of two, or `pool_entries` exceeds `ring capacity - 1`.
    /// - [`HifError::NoMemory`] - the per-buffer metadata room requirement
    ///   is unmet, or DMA allocation failed.
    pub fn create(
        id: u8,
        hw: Box<dyn ChannelHw>,
        rx_ring: Box<dyn BdRing>,
        tx_ring: Box<dyn BdRing>,
        config: ChannelConfig,
    ) -> HifResult<Channel<H>> {
        let depth = hw.ring_depth();
        if !depth.is_power_of_two()
            || rx_ring.capacity() != depth
            || tx_ring.capacity() != depth
        {
            error!(
                "hif{}: ring depth mismatch (hw {}, rx {}, tx {})",
                id,
                depth,
                rx_ring.capacity(),
                tx_ring.capacity()
            );
            return Err(HifError::InvalidArgument);
        }

        let pool_entries = match config.pool_entries {
            0 => depth - 1,
            n => n,
        };
        if pool_entries > depth - 1 {
            error!(
                "hif{}: pool of {} buffers cannot fit a ring of depth {}",
                id, pool_entries, depth
            );
            return Err(HifError::InvalidArgument);
        }

        let pool = BufferPool::<H>::allocate(pool_entries, config.entry_size)?;
        let flush_buf = match DmaBlock::<H>::allocate(config.entry_size) {
            Ok(block) => block,
            Err(err) => {
                pool.destroy();
                return Err(err);
            }
        };

        let channel = Channel {
            id,
            rx_ring: Mutex::new(rx_ring),
            tx_ring: Mutex::new(tx_ring),
            hw: Mutex::new(hw),
            pool: Arc::new(pool),
            flush_buf,
            rx_enabled: AtomicBool::new(false),
            tx_enabled: AtomicBool::new(false),
        };

        // Hand the whole pool to the hardware up front so it always has
        // receive capacity.
        {
            let mut ring = channel.rx_ring.lock();
            let len = channel.pool.data_size() as u16;
            while let Some(index) = channel.pool.alloc() {
                if let Err(err) = ring.enqueue(channel.pool.data_phys(index), len, false) {
                    error!(
                        "hif{}: rx ring rejected buffer {} during setup",
                        id, index
                    );
                    drop(ring);
                    let Channel { pool, flush_buf, .. } = channel;
                    if let Ok(pool) = Arc::try_unwrap(pool) {
                        pool.destroy();
                    }
                    flush_buf.free();
                    return Err(err);
                }
            }
        }

        info!(
            "hif{}: channel ready, ring depth {}, {} pool buffers of {} bytes",
            id, depth, pool_entries, config.entry_size
        );
        Ok(channel)
    }

    /// Hardware channel id.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// RX ring capacity.
    pub fn rx_capacity(&self) -> usize {
        self.rx_ring.lock().capacity()
    }

    /// TX ring capacity.
    pub fn tx_capacity(&self) -> usize {
        self.tx_ring.lock().capacity()
    }

    /// Pool depth.
    pub fn pool_capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Free pool buffers right now.
    pub fn pool_available(&self) -> usize {
        self.pool.available()
    }

    /// Buffers currently handed out to clients.
    pub fn buffers_handed_out(&self) -> usize {
        self.pool.handed_out()
    }

    /// Return path for handed-out buffers, carried by every packet so a
    /// buffer finds its way back to the pool no matter where the packet is
    /// dropped.
    pub(crate) fn buf_return(&self) -> Arc<dyn BufReturn> {
        Arc::clone(&self.pool) as Arc<dyn BufReturn>
    }

    /// Whether the RX ring can take one more buffer.
    pub fn can_accept_rx_buf(&self) -> bool {
        let ring = self.rx_ring.lock();
        ring.fill_level() < ring.capacity() - 1
    }

    /// Whether the TX ring can take `n` more chunks.
    pub fn can_accept_tx_num(&self, n: usize) -> bool {
        let ring = self.tx_ring.lock();
        ring.fill_level() + n <= ring.capacity() - 1
    }

    /// Current RX ring fill level.
    pub fn rx_fill_level(&self) -> usize {
        self.rx_ring.lock().fill_level()
    }

    /// Current TX ring fill level.
    pub fn tx_fill_level(&self) -> usize {
        self.tx_ring.lock().fill_level()
    }

    /// Hands one pool buffer to the hardware for reception.
    ///
    /// Serialized against [`Channel::rx_disable`] by the RX ring lock.
    pub fn supply_rx_buf(&self, index: BufIndex, len: u16) -> HifResult<()> {
        #[cfg(feature = "strict-args")]
        {
            if index >= self.pool.capacity() || len as usize > self.pool.data_size() {
                error!("hif{}: supply_rx_buf({index}, {len}) out of range", self.id);
                return Err(HifError::InvalidArgument);
            }
        }
        self.rx_ring
            .lock()
            .enqueue(self.pool.data_phys(index), len, false)
    }

    /// Tops the RX ring back up from the pool free list.
    ///
    /// Returns the number of buffers supplied.
    pub fn refill_rx(&self) -> usize {
        let mut ring = self.rx_ring.lock();
        let len = self.pool.data_size() as u16;
        let mut supplied = 0;
        while ring.fill_level() < ring.capacity() - 1 {
            match self.pool.alloc() {
                Some(index) => {
                    if ring.enqueue(self.pool.data_phys(index), len, false).is_err() {
                        self.pool.free(index);
                        break;
                    }
                    supplied += 1;
                }
                None => break,
            }
        }
        supplied
    }

    /// Dequeues one received chunk, resolving its pool slot and metadata
    /// area. Returns `None` when nothing has completed.
    ///
    /// Ownership of the buffer transfers to the caller; it comes back
    /// through [`Channel::release_buf`].
    pub fn rx(&self) -> Option<RxChunk> {
        let mut ring = self.rx_ring.lock();
        while let Some(entry) = ring.dequeue() {
            match self.pool.index_of_phys(entry.addr) {
                Some(index) => {
                    self.pool.note_handed_out();
                    return Some(RxChunk {
                        index,
                        virt: self.pool.data_virt(index),
                        phys: entry.addr,
                        len: entry.len,
                        lifm: entry.lifm,
                        meta: self.pool.meta(index),
                    });
                }
                None => {
                    // A completion for memory we never supplied; skip it
                    // rather than fabricate a pool slot.
                    error!(
                        "hif{}: rx completion for unknown address {:#x}",
                        self.id, entry.addr
                    );
                }
            }
        }
        None
    }

    /// Returns a previously received buffer to circulation: straight back to
    /// the RX ring while reception is running and the ring has room,
    /// otherwise to the pool free list.
    pub fn release_buf(&self, index: BufIndex) -> HifResult<()> {
        #[cfg(feature = "strict-args")]
        {
            if index >= self.pool.capacity() {
                error!("hif{}: release_buf({index}) out of range", self.id);
                return Err(HifError::InvalidArgument);
            }
        }
        self.pool.note_returned();
        if self.rx_enabled.load(Ordering::Relaxed) {
            let mut ring = self.rx_ring.lock();
            if ring.fill_level() < ring.capacity() - 1 {
                return ring.enqueue(
                    self.pool.data_phys(index),
                    self.pool.data_size() as u16,
                    false,
                );
            }
        }
        self.pool.free(index);
        Ok(())
    }

    /// Enqueues one chunk for transmission, ringing the doorbell on the
    /// last chunk of a frame.
    ///
    /// Not reentrant: callers serialize through the driver's TX lock. The
    /// caller is expected to have checked [`Channel::can_accept_tx_num`];
    /// a full ring still fails safe with [`HifError::NoSpace`].
    pub fn tx(&self, addr: PhysAddr, len: u16, lifm: bool) -> HifResult<()> {
        if !self.tx_enabled.load(Ordering::Relaxed) {
            return Err(HifError::NotPermitted);
        }
        self.tx_ring.lock().enqueue(addr, len, lifm)?;
        if lifm {
            self.hw.lock().tx_dma_start();
        }
        Ok(())
    }

    /// Dequeues completed TX entries, silently consuming intermediate
    /// chunks; reports the completion address only at a last-in-frame
    /// boundary.
    pub fn get_tx_conf(&self) -> Option<PhysAddr> {
        let mut ring = self.tx_ring.lock();
        while let Some(entry) = ring.dequeue() {
            if entry.lifm {
                return Some(entry.addr);
            }
        }
        None
    }

    /// Whether RX DMA is enabled.
    pub fn rx_is_enabled(&self) -> bool {
        self.rx_enabled.load(Ordering::Relaxed)
    }

    /// Whether TX DMA is enabled.
    pub fn tx_is_enabled(&self) -> bool {
        self.tx_enabled.load(Ordering::Relaxed)
    }

    /// Starts RX DMA.
    pub fn rx_enable(&self) {
        self.hw.lock().rx_dma_enable();
        self.rx_enabled.store(true, Ordering::Relaxed);
    }

    /// Stops RX DMA with a bounded best-effort drain: poll the DMA-active
    /// flag a fixed number of times with short sleeps, then proceed
    /// regardless, logging on timeout.
    pub fn rx_disable(&self) {
        self.rx_enabled.store(false, Ordering::Relaxed);
        // Holding the ring lock here excludes a concurrent supply_rx_buf.
        let _ring = self.rx_ring.lock();
        let mut hw = self.hw.lock();
        hw.rx_dma_disable();
        for _ in 0..DMA_IDLE_RETRIES {
            if !hw.rx_dma_active() {
                return;
            }
            H::sleep_us(DMA_IDLE_POLL_US);
        }
        warn!("hif{}: rx DMA still active after disable poll", self.id);
    }

    /// Starts TX DMA.
    pub fn tx_enable(&self) {
        self.hw.lock().tx_dma_enable();
        self.tx_enabled.store(true, Ordering::Relaxed);
    }

    /// Stops TX DMA; same bounded-poll discipline as [`Channel::rx_disable`].
    pub fn tx_disable(&self) {
        self.tx_enabled.store(false, Ordering::Relaxed);
        let mut hw = self.hw.lock();
        hw.tx_dma_disable();
        for _ in 0..DMA_IDLE_RETRIES {
            if !hw.tx_dma_active() {
                return;
            }
            H::sleep_us(DMA_IDLE_POLL_US);
        }
        warn!("hif{}: tx DMA still active after disable poll", self.id);
    }

    /// Unconditionally empties the TX ring. Only legal with TX DMA disabled;
    /// used by the driver's stuck-transmit recovery.
    pub(crate) fn purge_tx(&self) -> usize {
        let mut ring = self.tx_ring.lock();
        let mut purged = 0;
        while ring.drain().is_some() {
            purged += 1;
        }
        purged
    }

    /// Masks the given IRQ events.
    pub fn irq_mask(&self, events: crate::hw::IrqEvents) {
        self.hw.lock().irq_mask(events);
    }

    /// Unmasks the given IRQ events.
    pub fn irq_unmask(&self, events: crate::hw::IrqEvents) {
        self.hw.lock().irq_unmask(events);
    }

    /// Reads and clears the pending IRQ events.
    pub fn irq_status(&self) -> crate::hw::IrqEvents {
        self.hw.lock().irq_status()
    }

    /// Tears the channel down: disables DMA, reconciles every buffer back to
    /// the pool, flushes the engine's internal descriptor fetch FIFO, and
    /// frees the rings' backing memory.
    ///
    /// # Errors
    ///
    /// - [`HifError::BufferLeak`] - pool reconciliation failed: some buffer
    ///   is neither in the pool, nor in a ring, nor accounted as handed out.
    /// - [`HifError::HwTimeout`] - the fetch FIFO never emptied; the
    ///   hardware channel must not be reattached to another ring.
    pub fn destroy(self) -> HifResult<()> {
        self.rx_disable();
        self.tx_disable();

        // Reclaim everything the hardware still holds.
        {
            let mut ring = self.rx_ring.lock();
            while let Some(entry) = ring.drain() {
                if let Some(index) = self.pool.index_of_phys(entry.addr) {
                    self.pool.free(index);
                }
            }
        }
        {
            let mut ring = self.tx_ring.lock();
            while ring.drain().is_some() {}
        }

        let available = self.pool.available();
        let handed_out = self.pool.handed_out();
        let leak = if available + handed_out != self.pool.capacity() || handed_out != 0 {
            error!(
                "hif{}: buffer leak at teardown: {} free + {} handed out of {}",
                self.id,
                available,
                handed_out,
                self.pool.capacity()
            );
            Err(HifError::BufferLeak)
        } else {
            Ok(())
        };

        let flushed = self.flush();

        let Channel { id, pool, flush_buf, .. } = self;
        match Arc::try_unwrap(pool) {
            Ok(pool) => pool.destroy(),
            // A live packet still carries the return path; its region must
            // stay mapped, so it leaks along with the packet.
            Err(_) => warn!("hif{}: pool still referenced at teardown, leaking region", id),
        }
        flush_buf.free();
        info!("hif{}: channel destroyed", id);
        leak.and(flushed)
    }

    /// Shutdown flush: clears the engine's internal look-ahead FIFO of
    /// pre-fetched descriptors, which a plain DMA disable does not touch.
    ///
    /// Re-enables both directions and feeds dummy traffic - one RX buffer
    /// whenever the RX ring runs empty, one self-addressed TX frame per
    /// iteration - until the hardware reports its fetch FIFO empty, bounded
    /// by the ring depth. Any entries left in the rings afterwards are
    /// drained unconditionally.
    fn flush(&self) -> HifResult<()> {
        {
            let mut hw = self.hw.lock();
            hw.rx_dma_enable();
            hw.tx_dma_enable();
        }

        // The flush frame loops back through our own channel.
        let header = TxHeader {
            egress: self.id,
            queue: 0,
            flags: TxFlags::INJECT,
            vlan: 0,
            ts_ref: 0,
        };
        let flush_frame =
            unsafe { core::slice::from_raw_parts_mut(self.flush_buf.virt().as_ptr(), HIF_HEADER_SIZE) };
        header.write(flush_frame);

        let depth = self.tx_ring.lock().capacity();
        let mut clean = false;
        for _ in 0..depth {
            if self.hw.lock().bd_fetch_empty() {
                clean = true;
                break;
            }
            {
                let mut ring = self.rx_ring.lock();
                if ring.fill_level() == 0 {
                    let _ = ring.enqueue(self.flush_buf.phys(), FLUSH_FRAME_LEN, false);
                }
            }
            {
                let mut ring = self.tx_ring.lock();
                if ring.enqueue(self.flush_buf.phys(), FLUSH_FRAME_LEN, true).is_ok() {
                    drop(ring);
                    self.hw.lock().tx_dma_start();
                }
            }
            H::sleep_us(FLUSH_POLL_US);
            {
                let mut ring = self.tx_ring.lock();
                while ring.dequeue().is_some() {}
            }
            {
                let mut ring = self.rx_ring.lock();
                while ring.dequeue().is_some() {}
            }
        }

        // Clean or not, leave the rings empty.
        {
            let mut ring = self.rx_ring.lock();
            while ring.drain().is_some() {}
        }
        {
            let mut ring = self.tx_ring.lock();
            while ring.drain().is_some() {}
        }
        {
            let mut hw = self.hw.lock();
            hw.rx_dma_disable();
            hw.tx_dma_disable();
        }

        if clean {
            Ok(())
        } else {
            error!(
                "hif{}: descriptor fetch FIFO did not empty within {} flush iterations",
                self.id, depth
            );
            Err(HifError::HwTimeout)
        }
    }
}
