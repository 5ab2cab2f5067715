//! HIF driver: multi-client dispatch over one channel.
//!
//! The [`HifDriver`] multiplexes a [`Channel`] across registered clients.
//! It owns the client table, the TX metadata ring that matches asynchronous
//! completions back to the frames (and clients) that produced them, and the
//! two deferred jobs - RX dispatch and TX-confirmation dispatch - that the
//! platform runs from its deferred-work context when [`HifDriver::irq`]
//! reports pending events.
//!
//! Locking:
//!
//! - The **TX lock** serializes every `xmit_sg` call end to end (header
//!   reservation through last-chunk enqueue) and the confirmation drain.
//!   It is the only serialization point between concurrent transmitters, so
//!   one frame's chunks are always contiguous in the ring.
//! - The **client table** is a readers/writer lock: dispatch takes it
//!   shared, registration takes it exclusive. Dispatch can never observe a
//!   half-published client, and registration does not stop traffic.
//! - Per-client FIFOs carry no lock at all; see [`crate::spsc`].

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, RwLock};

use crate::channel::Channel;
use crate::client::{
    ClientConfig, ClientEvent, ClientEventSink, ClientHandle, ClientShared, RxPacket,
    TxConfirmation,
};
use crate::hal::{DmaBlock, HifHal, PhysAddr};
use crate::header::{RxHeader, TxFlags, TxHeader, HIF_HEADER_SIZE};
use crate::hw::IrqEvents;
use crate::pool::BufMeta;
use crate::spsc;
use crate::stats::{HifStats, StatsSnapshot};
use crate::{HifError, HifResult};

/// Size of the client table; interface ids index into it.
pub const MAX_CLIENTS: usize = 16;
/// Hard per-client maximum of RX or TX queues.
pub const MAX_CLIENT_QUEUES: usize = 8;
/// Reserved table slot for the inter-core (IHC) client. Frames whose wire
/// header carries the IHC flag are routed here regardless of ingress
/// interface.
pub const IHC_CLIENT_ID: u8 = (MAX_CLIENTS - 1) as u8;

/// One scatter-gather element of a transmit request.
#[derive(Debug, Clone, Copy)]
pub struct SgChunk {
    /// Physical address of the chunk data. The memory must stay valid until
    /// the frame's TX confirmation arrives.
    pub phys: PhysAddr,
    /// Chunk length in bytes.
    pub len: u16,
}

/// Per-frame transmit instructions, copied into the frame's wire header.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxOptions {
    /// Instruction flags (inject, IHC, VLAN tag, checksum offload,
    /// timestamp request).
    pub flags: TxFlags,
    /// VLAN id, used with [`TxFlags::VLAN_TAG`].
    pub vlan: u16,
    /// Timestamp reference, used with [`TxFlags::TS_REQUEST`]; echoed in
    /// [`ClientEvent::TimestampAvailable`].
    pub ts_ref: u16,
}

/// Driver tuning parameters.
#[derive(Debug, Clone, Copy)]
pub struct DriverConfig {
    /// Maximum RX chunks consumed per [`HifDriver::rx_job`] invocation.
    pub rx_poll_budget: usize,
    /// Maximum confirmations consumed per [`HifDriver::tx_conf_job`]
    /// invocation.
    pub tx_conf_budget: usize,
    /// TX metadata ring depth; `0` matches the channel's TX ring capacity.
    pub tx_slots: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            rx_poll_budget: 64,
            tx_conf_budget: 64,
            tx_slots: 0,
        }
    }
}

/// Driver lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Resources allocated, DMA stopped.
    Initialized,
    /// Both directions enabled, IRQs unmasked.
    Started,
    /// Both directions disabled, pending work drained.
    Stopped,
}

/// TX metadata slot: everything needed to route one in-flight frame's
/// confirmation back to its owner.
#[derive(Debug, Clone, Copy, Default)]
struct TxSlot {
    client: u8,
    generation: u64,
    queue: u8,
    ref_ptr: usize,
    last_phys: PhysAddr,
    flags: TxFlags,
    ts_ref: u16,
}

/// TX metadata ring: capacity-sized slot array indexed by monotonic
/// write/read counters. Invariant: `wr - rd <= capacity`.
struct TxTracker {
    slots: Vec<TxSlot>,
    wr: u64,
    rd: u64,
    /// Set when the hardware rejected a chunk mid-frame; cleared only by
    /// [`HifDriver::recover_tx`].
    stuck: bool,
}

impl TxTracker {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn in_flight(&self) -> usize {
        (self.wr - self.rd) as usize
    }

    fn slot_index(&self, counter: u64) -> usize {
        (counter % self.slots.len() as u64) as usize
    }
}

/// Routing decision for the frame currently being reassembled by the RX
/// job; persists across poll-budget boundaries.
#[derive(Clone, Copy)]
enum FrameTarget {
    Deliver {
        client: u8,
        queue: u8,
        ifid: u8,
        csum: crate::header::RxFlags,
    },
    Discard,
}

struct RxJobState {
    cur: Option<FrameTarget>,
}

type Notification = (Arc<dyn ClientEventSink>, ClientEvent);
type TouchedMap = [[bool; MAX_CLIENT_QUEUES]; MAX_CLIENTS];

/// The host-interface driver instance.
///
/// This is the explicit context object for one channel: every entry point
/// hangs off it and its lifetime is plain construction/destruction - there
/// is no global state.
pub struct HifDriver<H: HifHal> {
    channel: Channel<H>,
    clients: RwLock<Vec<Option<Arc<ClientShared>>>>,
    tx: Mutex<TxTracker>,
    /// One wire header per TX metadata slot, carved from a single DMA block
    /// (`slot i` at byte offset `i * HIF_HEADER_SIZE`). Per-frame fields
    /// like VLAN and checksum-request differ frame to frame, so each
    /// in-flight frame needs its own physical header instance.
    headers: DmaBlock<H>,
    rx_state: Mutex<RxJobState>,
    state: Mutex<DriverState>,
    next_generation: AtomicU64,
    config: DriverConfig,
    stats: HifStats,
}

impl<H: HifHal> HifDriver<H> {
    /// Builds a driver over an initialized channel.
    pub fn new(channel: Channel<H>, config: DriverConfig) -> HifResult<HifDriver<H>> {
        let tx_slots = match config.tx_slots {
            0 => channel.tx_capacity(),
            n => n,
        };
        if tx_slots == 0 || config.rx_poll_budget == 0 || config.tx_conf_budget == 0 {
            let _ = channel.destroy();
            return Err(HifError::InvalidArgument);
        }
        let headers = match DmaBlock::<H>::allocate(tx_slots * HIF_HEADER_SIZE) {
            Ok(block) => block,
            Err(err) => {
                let _ = channel.destroy();
                return Err(err);
            }
        };

        Ok(HifDriver {
            channel,
            clients: RwLock::new(vec![None; MAX_CLIENTS]),
            tx: Mutex::new(TxTracker {
                slots: vec![TxSlot::default(); tx_slots],
                wr: 0,
                rd: 0,
                stuck: false,
            }),
            headers,
            rx_state: Mutex::new(RxJobState { cur: None }),
            state: Mutex::new(DriverState::Initialized),
            next_generation: AtomicU64::new(1),
            config,
            stats: HifStats::default(),
        })
    }

    /// The underlying channel.
    pub fn channel(&self) -> &Channel<H> {
        &self.channel
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DriverState {
        *self.state.lock()
    }

    /// Snapshot of the driver counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Enables both directions and unmasks the channel IRQs.
    pub fn start(&self) {
        let mut state = self.state.lock();
        self.channel.rx_enable();
        self.channel.tx_enable();
        self.channel.irq_unmask(IrqEvents::all());
        *state = DriverState::Started;
        info!("hif{}: driver started", self.channel.id());
    }

    /// Disables both directions, masks the IRQs, and drains pending work
    /// through the dispatch paths so nothing is stranded on the rings.
    ///
    /// Event sinks may still fire during the drain; they must not call
    /// [`HifDriver::start`] or [`HifDriver::stop`] reentrantly.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        self.channel.irq_mask(IrqEvents::all());
        self.channel.rx_disable();
        self.channel.tx_disable();
        while self.rx_dispatch() > 0 {}
        while self.tx_conf_dispatch() > 0 {}
        *state = DriverState::Stopped;
        info!("hif{}: driver stopped", self.channel.id());
    }

    /// Stops the driver and tears the channel down.
    pub fn exit(self) -> HifResult<()> {
        self.stop();
        let HifDriver {
            channel, headers, ..
        } = self;
        headers.free();
        channel.destroy()
    }

    /// Interrupt entry point: reads and clears the channel's IRQ status,
    /// masks the raised events, and returns them so the platform can
    /// schedule the matching deferred jobs. Never touches ring state.
    pub fn irq(&self) -> IrqEvents {
        let events = self.channel.irq_status();
        if !events.is_empty() {
            self.channel.irq_mask(events);
        }
        events
    }

    // ------------------------------------------------------------------
    // Client lifecycle
    // ------------------------------------------------------------------

    /// Registers a client at table index `ifid`.
    ///
    /// Queue counts beyond [`MAX_CLIENT_QUEUES`] are clamped with a
    /// warning. The event sink is mandatory by construction.
    ///
    /// # Errors
    ///
    /// - [`HifError::InvalidArgument`] - `ifid` out of table bounds, zero RX
    ///   queues, or a zero queue depth.
    /// - [`HifError::NotPermitted`] - the slot is already occupied.
    pub fn client_register(
        &self,
        ifid: u8,
        config: ClientConfig,
        events: Arc<dyn ClientEventSink>,
    ) -> HifResult<ClientHandle> {
        if ifid as usize >= MAX_CLIENTS {
            error!("client_register: interface id {ifid} out of range");
            return Err(HifError::InvalidArgument);
        }
        if config.rx_queues == 0 || config.rx_depth == 0 {
            error!("client_register: client {ifid} must have at least one rx queue");
            return Err(HifError::InvalidArgument);
        }
        if config.tx_queues > 0 && config.tx_depth == 0 {
            error!("client_register: client {ifid} has tx queues of depth 0");
            return Err(HifError::InvalidArgument);
        }

        let mut rx_queues = config.rx_queues;
        if rx_queues > MAX_CLIENT_QUEUES {
            warn!(
                "client {ifid}: clamping {} rx queues to {}",
                rx_queues, MAX_CLIENT_QUEUES
            );
            rx_queues = MAX_CLIENT_QUEUES;
        }
        let mut tx_queues = config.tx_queues;
        if tx_queues > MAX_CLIENT_QUEUES {
            warn!(
                "client {ifid}: clamping {} tx queues to {}",
                tx_queues, MAX_CLIENT_QUEUES
            );
            tx_queues = MAX_CLIENT_QUEUES;
        }

        let mut rx_prod = Vec::with_capacity(rx_queues);
        let mut rx_cons = Vec::with_capacity(rx_queues);
        for _ in 0..rx_queues {
            let (p, c) = spsc::channel(config.rx_depth);
            rx_prod.push(p);
            rx_cons.push(c);
        }
        let mut tx_prod = Vec::with_capacity(tx_queues);
        let mut tx_cons = Vec::with_capacity(tx_queues);
        for _ in 0..tx_queues {
            let (p, c) = spsc::channel(config.tx_depth);
            tx_prod.push(p);
            tx_cons.push(c);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(ClientShared {
            id: ifid,
            generation,
            events,
            rx_prod: Mutex::new(rx_prod),
            tx_conf_prod: Mutex::new(tx_prod),
            rx_watermark: config.rx_watermark,
        });

        {
            let mut table = self.clients.write();
            if table[ifid as usize].is_some() {
                warn!("client_register: interface id {ifid} already registered");
                return Err(HifError::NotPermitted);
            }
            table[ifid as usize] = Some(shared);
        }

        info!(
            "client {ifid} registered: {} rx / {} tx queues",
            rx_queues, tx_queues
        );
        Ok(ClientHandle {
            id: ifid,
            generation,
            rx: rx_cons,
            tx_conf: tx_cons,
        })
    }

    /// Unregisters a client, draining and freeing its queues.
    ///
    /// Packets still sitting in the FIFOs are released back to the channel
    /// with a warning - a non-empty drain is noteworthy, not an error.
    pub fn client_unregister(&self, mut handle: ClientHandle) -> HifResult<()> {
        let ifid = handle.id;
        {
            let mut table = self.clients.write();
            match &table[ifid as usize] {
                Some(client) if client.generation == handle.generation => {
                    table[ifid as usize] = None;
                }
                _ => {
                    error!("client_unregister: interface id {ifid} is not this registration");
                    return Err(HifError::InvalidArgument);
                }
            }
        }

        let mut leftover = 0usize;
        for queue in handle.rx.iter_mut() {
            // Dropping the packet returns its buffer to the pool.
            while queue.pop().is_some() {
                leftover += 1;
            }
        }
        for queue in handle.tx_conf.iter_mut() {
            while queue.pop().is_some() {
                leftover += 1;
            }
        }
        if leftover > 0 {
            warn!("client {ifid}: {leftover} queued entries dropped at unregister");
        }
        info!("client {ifid} unregistered");
        Ok(())
    }

    fn lookup(&self, id: u8) -> Option<Arc<ClientShared>> {
        self.clients.read()[id as usize].clone()
    }

    fn lookup_generation(&self, id: u8, generation: u64) -> Option<Arc<ClientShared>> {
        self.lookup(id).filter(|c| c.generation == generation)
    }

    // ------------------------------------------------------------------
    // Transmit path
    // ------------------------------------------------------------------

    /// Transmits one frame given as a scatter-gather list.
    ///
    /// Holds the TX lock for the whole call: header-slot reservation, header
    /// chunk, payload chunks (only the last marked last-in-frame, which
    /// rings the doorbell), metadata recording. `ref_ptr` is opaque and
    /// comes back unchanged in the frame's [`TxConfirmation`].
    ///
    /// # Errors
    ///
    /// - [`HifError::InvalidArgument`] - empty chunk list, zero-length
    ///   chunk, or `queue` outside the client's configured TX range.
    /// - [`HifError::NotPermitted`] - client not registered, TX disabled, or
    ///   the TX path is stuck pending [`HifDriver::recover_tx`].
    /// - [`HifError::NoSpace`] - not enough ring or metadata capacity;
    ///   retry after confirmations drain.
    /// - [`HifError::Cancelled`] - the hardware rejected a chunk after the
    ///   header chunk was already accepted. The frame is not recoverable
    ///   and the TX path needs [`HifDriver::recover_tx`].
    pub fn xmit_sg(
        &self,
        ifid: u8,
        queue: u8,
        chunks: &[SgChunk],
        options: &TxOptions,
        ref_ptr: usize,
    ) -> HifResult<()> {
        #[cfg(feature = "strict-args")]
        {
            if chunks.is_empty() || chunks.iter().any(|c| c.len == 0) {
                error!("xmit_sg: client {ifid} passed an empty chunk");
                return Err(HifError::InvalidArgument);
            }
        }
        let client = match self.lookup(ifid) {
            Some(c) => c,
            None => return Err(HifError::NotPermitted),
        };
        if queue as usize >= client.tx_queue_count() {
            return Err(HifError::InvalidArgument);
        }
        if !self.channel.tx_is_enabled() {
            return Err(HifError::NotPermitted);
        }

        let mut notes: Vec<Notification> = Vec::new();
        let result = {
            let mut t = self.tx.lock();
            if t.stuck {
                return Err(HifError::NotPermitted);
            }
            // Opportunistic confirmation drain when the metadata ring is
            // full; frees slots without waiting for the deferred job.
            if t.in_flight() == t.capacity() {
                let (_, mut drained_notes) = self.drain_confs(&mut t, self.config.tx_conf_budget);
                notes.append(&mut drained_notes);
            }
            self.xmit_locked(&mut t, &client, queue, chunks, options, ref_ptr)
        };
        for (sink, event) in notes {
            sink.event(event);
        }
        result
    }

    /// Single-buffer convenience form of [`HifDriver::xmit_sg`].
    pub fn xmit_pkt(
        &self,
        ifid: u8,
        queue: u8,
        phys: PhysAddr,
        len: u16,
        options: &TxOptions,
        ref_ptr: usize,
    ) -> HifResult<()> {
        self.xmit_sg(ifid, queue, &[SgChunk { phys, len }], options, ref_ptr)
    }

    fn xmit_locked(
        &self,
        t: &mut TxTracker,
        client: &Arc<ClientShared>,
        queue: u8,
        chunks: &[SgChunk],
        options: &TxOptions,
        ref_ptr: usize,
    ) -> HifResult<()> {
        if t.in_flight() == t.capacity() {
            return Err(HifError::NoSpace);
        }
        // One ring slot per payload chunk plus one for the header.
        if !self.channel.can_accept_tx_num(chunks.len() + 1) {
            return Err(HifError::NoSpace);
        }

        let slot_index = t.slot_index(t.wr);
        let header = TxHeader {
            egress: client.id,
            queue,
            flags: options.flags,
            vlan: options.vlan,
            ts_ref: options.ts_ref,
        };
        let header_virt = unsafe {
            self.headers
                .virt()
                .as_ptr()
                .add(slot_index * HIF_HEADER_SIZE)
        };
        let header_phys = self.headers.phys() + slot_index * HIF_HEADER_SIZE;
        header.write(unsafe { core::slice::from_raw_parts_mut(header_virt, HIF_HEADER_SIZE) });

        // The header chunk is never last; chunks is non-empty.
        self.channel.tx(header_phys, HIF_HEADER_SIZE as u16, false)?;
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.iter().enumerate() {
            if let Err(err) = self.channel.tx(chunk.phys, chunk.len, i == last) {
                // The header (and possibly earlier chunks) already belong to
                // the hardware; the ring now holds a truncated frame.
                error!(
                    "hif{}: chunk {} of {} rejected mid-frame ({err:?}); tx path stuck",
                    self.channel.id(),
                    i,
                    chunks.len()
                );
                t.stuck = true;
                return Err(HifError::Cancelled);
            }
        }

        t.slots[slot_index] = TxSlot {
            client: client.id,
            generation: client.generation,
            queue,
            ref_ptr,
            last_phys: chunks[last].phys,
            flags: options.flags,
            ts_ref: options.ts_ref,
        };
        t.wr += 1;
        HifStats::bump(&self.stats.tx_frames);
        Ok(())
    }

    /// Explicit recovery from a stuck TX path (a mid-frame hardware
    /// rejection leaves a truncated frame in the ring with no completion
    /// coming).
    ///
    /// Disables TX, purges the ring unconditionally, discards all in-flight
    /// metadata (their confirmations are counted as dropped), and re-enables
    /// TX if it was enabled before. Also safe to call when not stuck, as a
    /// hard TX reset.
    pub fn recover_tx(&self) -> HifResult<()> {
        let was_enabled = self.channel.tx_is_enabled();
        self.channel.tx_disable();

        let mut t = self.tx.lock();
        let purged = self.channel.purge_tx();
        let dropped = t.in_flight() as u64;
        HifStats::add(&self.stats.tx_conf_drops, dropped);
        t.rd = t.wr;
        t.stuck = false;
        drop(t);

        if was_enabled {
            self.channel.tx_enable();
        }
        warn!(
            "hif{}: tx recovery purged {purged} ring entries, dropped {dropped} in-flight frames",
            self.channel.id()
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Deferred jobs
    // ------------------------------------------------------------------

    /// Deferred RX job. Drains the channel up to the poll budget, dispatches
    /// to client FIFOs, tops the RX ring back up from the pool, and fires
    /// one edge-triggered event per client queue that changed in this pass.
    ///
    /// Returns the number of chunks processed. A full budget's worth
    /// indicates more work is pending and the job should be rescheduled.
    pub fn rx_job(&self) -> usize {
        if !self.channel.rx_is_enabled() {
            return 0;
        }
        let processed = self.rx_dispatch();
        self.channel.irq_unmask(IrqEvents::RX_PACKET);
        processed
    }

    /// Deferred TX-confirmation job; same budget/notification discipline as
    /// [`HifDriver::rx_job`].
    pub fn tx_conf_job(&self) -> usize {
        if !self.channel.tx_is_enabled() {
            return 0;
        }
        let processed = self.tx_conf_dispatch();
        self.channel.irq_unmask(IrqEvents::TX_COMPLETE);
        processed
    }

    fn rx_dispatch(&self) -> usize {
        let mut st = self.rx_state.lock();
        let mut touched: TouchedMap = [[false; MAX_CLIENT_QUEUES]; MAX_CLIENTS];
        let mut processed = 0;

        while processed < self.config.rx_poll_budget {
            let chunk = match self.channel.rx() {
                Some(c) => c,
                None => break,
            };
            processed += 1;
            HifStats::bump(&self.stats.rx_chunks);
            let lifm = chunk.lifm;

            let target = match st.cur {
                None => self.dispatch_first_chunk(chunk, &mut touched),
                Some(target) => self.dispatch_continuation(chunk, target, &mut touched),
            };
            if lifm {
                if matches!(target, FrameTarget::Deliver { .. }) {
                    HifStats::bump(&self.stats.rx_frames);
                }
                st.cur = None;
            } else {
                st.cur = Some(target);
            }
        }

        self.channel.refill_rx();
        let out_of_buffers =
            self.channel.pool_available() == 0 && self.channel.rx_fill_level() == 0;
        if out_of_buffers {
            HifStats::bump(&self.stats.rx_pool_empty);
        }

        let notes = self.collect_rx_notifications(&touched, out_of_buffers);
        drop(st);
        for (sink, event) in notes {
            sink.event(event);
        }
        processed
    }

    /// Routes the first chunk of a frame: parses the wire header, resolves
    /// the target client, validates the queue, and delivers or drops.
    fn dispatch_first_chunk(
        &self,
        chunk: crate::channel::RxChunk,
        touched: &mut TouchedMap,
    ) -> FrameTarget {
        let raw = unsafe { core::slice::from_raw_parts(chunk.virt.as_ptr(), chunk.len as usize) };
        let header = match RxHeader::parse(raw) {
            Some(h) => h,
            None => {
                warn!(
                    "hif{}: runt first chunk ({} bytes), dropping frame",
                    self.channel.id(),
                    chunk.len
                );
                HifStats::bump(&self.stats.rx_drop_bad_header);
                let _ = self.channel.release_buf(chunk.index);
                return FrameTarget::Discard;
            }
        };

        let target_id = if header.flags.contains(crate::header::RxFlags::IHC) {
            IHC_CLIENT_ID
        } else {
            header.ifid
        };
        let client = match self.lookup(target_id) {
            Some(c) => c,
            None => {
                HifStats::bump(&self.stats.rx_drop_no_client);
                let _ = self.channel.release_buf(chunk.index);
                return FrameTarget::Discard;
            }
        };
        if header.queue as usize >= client.rx_queue_count() {
            HifStats::bump(&self.stats.rx_drop_bad_queue);
            let _ = self.channel.release_buf(chunk.index);
            return FrameTarget::Discard;
        }

        let payload_len = chunk.len - HIF_HEADER_SIZE as u16;
        unsafe {
            chunk.meta.as_ptr().write(BufMeta {
                client: target_id,
                queue: header.queue,
                flags: header.flags.bits(),
                len: payload_len,
            });
        }
        let packet = RxPacket {
            index: chunk.index,
            data: unsafe {
                NonNull::new_unchecked(chunk.virt.as_ptr().add(HIF_HEADER_SIZE))
            },
            phys: chunk.phys + HIF_HEADER_SIZE,
            len: payload_len,
            ifid: header.ifid,
            queue: header.queue,
            lifm: chunk.lifm,
            csum: header.flags,
            reclaim: Some(self.channel.buf_return()),
        };
        // Bound before matching so the producer-vector guard is released
        // on both arms.
        let pushed = client.rx_prod.lock()[header.queue as usize].push(packet);
        match pushed {
            Ok(()) => {
                touched[target_id as usize][header.queue as usize] = true;
                FrameTarget::Deliver {
                    client: target_id,
                    queue: header.queue,
                    ifid: header.ifid,
                    csum: header.flags,
                }
            }
            Err(packet) => {
                HifStats::bump(&self.stats.rx_drop_queue_full);
                drop(packet);
                FrameTarget::Discard
            }
        }
    }

    /// Delivers a continuation chunk of an already-routed frame.
    fn dispatch_continuation(
        &self,
        chunk: crate::channel::RxChunk,
        target: FrameTarget,
        touched: &mut TouchedMap,
    ) -> FrameTarget {
        let (client_id, queue, ifid, csum) = match target {
            FrameTarget::Discard => {
                let _ = self.channel.release_buf(chunk.index);
                return FrameTarget::Discard;
            }
            FrameTarget::Deliver {
                client,
                queue,
                ifid,
                csum,
            } => (client, queue, ifid, csum),
        };
        let client = match self.lookup(client_id) {
            Some(c) => c,
            None => {
                // Client unregistered mid-frame; drop the rest.
                let _ = self.channel.release_buf(chunk.index);
                return FrameTarget::Discard;
            }
        };

        unsafe {
            chunk.meta.as_ptr().write(BufMeta {
                client: client_id,
                queue,
                flags: csum.bits(),
                len: chunk.len,
            });
        }
        let packet = RxPacket {
            index: chunk.index,
            data: chunk.virt,
            phys: chunk.phys,
            len: chunk.len,
            ifid,
            queue,
            lifm: chunk.lifm,
            csum,
            reclaim: Some(self.channel.buf_return()),
        };
        let pushed = client.rx_prod.lock()[queue as usize].push(packet);
        match pushed {
            Ok(()) => {
                touched[client_id as usize][queue as usize] = true;
                target
            }
            Err(packet) => {
                HifStats::bump(&self.stats.rx_drop_queue_full);
                drop(packet);
                FrameTarget::Discard
            }
        }
    }

    /// One edge-triggered notification per client queue touched in this
    /// pass, plus watermark and out-of-buffers conditions. Sinks are cloned
    /// out under the read lock and invoked after it is released.
    fn collect_rx_notifications(
        &self,
        touched: &TouchedMap,
        out_of_buffers: bool,
    ) -> Vec<Notification> {
        let mut notes: Vec<Notification> = Vec::new();
        let table = self.clients.read();
        for (id, slot) in table.iter().enumerate() {
            let client = match slot {
                Some(c) => c,
                None => continue,
            };
            for (queue, hit) in touched[id].iter().enumerate() {
                if !*hit {
                    continue;
                }
                notes.push((
                    client.events.clone(),
                    ClientEvent::RxPacketAvailable { queue: queue as u8 },
                ));
                if let Some(watermark) = client.rx_watermark {
                    if client.rx_prod.lock()[queue].len() >= watermark {
                        notes.push((
                            client.events.clone(),
                            ClientEvent::RxHighWatermark { queue: queue as u8 },
                        ));
                    }
                }
            }
            if out_of_buffers {
                notes.push((client.events.clone(), ClientEvent::RxOutOfBuffers));
            }
        }
        notes
    }

    fn tx_conf_dispatch(&self) -> usize {
        let mut t = self.tx.lock();
        let (processed, notes) = self.drain_confs(&mut t, self.config.tx_conf_budget);
        drop(t);
        for (sink, event) in notes {
            sink.event(event);
        }
        processed
    }

    /// Drains TX completions up to `budget`, matching each last-in-frame
    /// completion to the metadata slot at the read index. Called with the
    /// TX lock held; returns notifications for the caller to fire after
    /// releasing it.
    fn drain_confs(&self, t: &mut TxTracker, budget: usize) -> (usize, Vec<Notification>) {
        let mut notes: Vec<Notification> = Vec::new();
        let mut touched: TouchedMap = [[false; MAX_CLIENT_QUEUES]; MAX_CLIENTS];
        let mut processed = 0;

        while processed < budget {
            let addr = match self.channel.get_tx_conf() {
                Some(a) => a,
                None => break,
            };
            processed += 1;

            if t.rd == t.wr {
                error!(
                    "hif{}: completion {:#x} with no in-flight frame",
                    self.channel.id(),
                    addr
                );
                HifStats::bump(&self.stats.tx_conf_spurious);
                continue;
            }
            let slot = t.slots[t.slot_index(t.rd)];
            t.rd += 1;
            if addr != slot.last_phys {
                warn!(
                    "hif{}: completion address {:#x} does not match slot ({:#x})",
                    self.channel.id(),
                    addr,
                    slot.last_phys
                );
            }

            match self.lookup_generation(slot.client, slot.generation) {
                None => {
                    // Owner unregistered while the frame was in flight.
                    HifStats::bump(&self.stats.tx_conf_drops);
                }
                Some(client) => {
                    let conf = TxConfirmation {
                        ref_ptr: slot.ref_ptr,
                        queue: slot.queue,
                    };
                    match client.tx_conf_prod.lock()[slot.queue as usize].push(conf) {
                        Ok(()) => {
                            touched[slot.client as usize][slot.queue as usize] = true;
                            HifStats::bump(&self.stats.tx_confs);
                        }
                        Err(_) => HifStats::bump(&self.stats.tx_conf_drops),
                    }
                    if slot.flags.contains(TxFlags::TS_REQUEST) {
                        notes.push((
                            client.events.clone(),
                            ClientEvent::TimestampAvailable {
                                ts_ref: slot.ts_ref,
                            },
                        ));
                    }
                }
            }
        }

        let table = self.clients.read();
        for (id, slot) in table.iter().enumerate() {
            let client = match slot {
                Some(c) => c,
                None => continue,
            };
            for (queue, hit) in touched[id].iter().enumerate() {
                if *hit {
                    notes.push((
                        client.events.clone(),
                        ClientEvent::TxDone { queue: queue as u8 },
                    ));
                }
            }
        }
        (processed, notes)
    }

    // ------------------------------------------------------------------
    // Receive-side client services
    // ------------------------------------------------------------------

    /// Returns a received packet's buffer to circulation, preferring the
    /// hardware ring over the pool free list.
    pub fn release_buf(&self, mut packet: RxPacket) -> HifResult<()> {
        // Disarm the drop path; the channel settles the hand-out count.
        packet.reclaim = None;
        self.channel.release_buf(packet.index)
    }
}
