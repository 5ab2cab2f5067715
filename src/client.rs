//! Registered channel clients.
//!
//! A client is one consumer of a logical or physical interface's traffic:
//! it registers with the driver under its interface id, gets bounded
//! per-queue RX and TX-confirmation FIFOs, and is notified edge-triggered
//! through its [`ClientEventSink`]. The driver keeps the producer ends of
//! the FIFOs; the registrant keeps the consumer ends inside the
//! non-cloneable [`ClientHandle`], so the single-consumer discipline is a
//! type-system fact rather than a convention.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;

use spin::Mutex;

use crate::hal::PhysAddr;
use crate::header::RxFlags;
use crate::pool::{BufIndex, BufReturn};
use crate::spsc;

/// Events delivered to a client's [`ClientEventSink`].
///
/// All events are edge-triggered: one notification per job pass per queue
/// that changed, not one per packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// New packets are available in the given RX queue.
    RxPacketAvailable {
        /// RX queue number.
        queue: u8,
    },
    /// New confirmations are available in the given TX queue.
    TxDone {
        /// TX queue number.
        queue: u8,
    },
    /// The given RX queue crossed its configured high watermark.
    RxHighWatermark {
        /// RX queue number.
        queue: u8,
    },
    /// The channel's RX buffer pool ran empty during the last dispatch pass.
    RxOutOfBuffers,
    /// An egress timestamp for the given reference number is available.
    TimestampAvailable {
        /// Reference number from the transmit request's TX options.
        ts_ref: u16,
    },
}

/// Capability interface for client notifications.
///
/// Implementations are invoked from the deferred job context and must not
/// block; the usual implementation wakes the client's own thread. A sink is
/// mandatory at registration - there is no null-callback state.
pub trait ClientEventSink: Send + Sync {
    /// Delivers one event.
    fn event(&self, event: ClientEvent);
}

/// Client registration parameters.
#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    /// Number of RX queues (clamped to [`crate::MAX_CLIENT_QUEUES`]).
    pub rx_queues: usize,
    /// Number of TX(-confirmation) queues (clamped likewise).
    pub tx_queues: usize,
    /// Depth of each RX FIFO.
    pub rx_depth: usize,
    /// Depth of each TX-confirmation FIFO.
    pub tx_depth: usize,
    /// Optional RX high-watermark; crossing it raises
    /// [`ClientEvent::RxHighWatermark`] in addition to the packet event.
    pub rx_watermark: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            rx_queues: 1,
            tx_queues: 1,
            rx_depth: 64,
            tx_depth: 64,
            rx_watermark: None,
        }
    }
}

/// A received packet, as delivered to a client RX FIFO.
///
/// Holds one pool buffer. Return it with
/// [`HifDriver::release_buf`](crate::HifDriver::release_buf) once consumed -
/// that puts the buffer straight back on the hardware ring. A packet that is
/// simply dropped (client unregistered, queue torn down) returns its buffer
/// to the pool free list instead, so no path loses a buffer.
/// On the first chunk of a frame the wire header has already been parsed and
/// stripped; `data`/`len` cover the payload only.
pub struct RxPacket {
    /// Pool slot backing this chunk.
    pub index: BufIndex,
    /// Payload virtual address.
    pub data: NonNull<u8>,
    /// Payload physical address.
    pub phys: PhysAddr,
    /// Payload length in bytes.
    pub len: u16,
    /// Ingress physical interface id (from the frame's wire header).
    pub ifid: u8,
    /// Firmware-assigned queue number.
    pub queue: u8,
    /// Last chunk of the frame.
    pub lifm: bool,
    /// Checksum-valid flags from the wire header.
    pub csum: RxFlags,
    /// Return path to the owning pool; disarmed by `release_buf`, which
    /// hands the buffer back through the channel instead.
    pub(crate) reclaim: Option<Arc<dyn BufReturn>>,
}

unsafe impl Send for RxPacket {}

impl RxPacket {
    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.data.as_ptr(), self.len as usize) }
    }
}

impl Drop for RxPacket {
    fn drop(&mut self) {
        if let Some(reclaim) = self.reclaim.take() {
            reclaim.return_buf(self.index);
        }
    }
}

/// Asynchronous notice that a previously transmitted frame has been
/// consumed by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxConfirmation {
    /// The opaque reference passed to `xmit_sg`, returned unchanged.
    pub ref_ptr: usize,
    /// The TX queue the frame was submitted on.
    pub queue: u8,
}

/// Driver-side client record.
///
/// Holds the producer ends of the client's FIFOs and its event sink. The
/// producer vectors are guarded by a mutex because the table hands out
/// shared references; each is only ever pushed from its single deferred job,
/// so the lock is uncontended - the FIFOs themselves stay lock-free.
pub(crate) struct ClientShared {
    pub(crate) id: u8,
    /// Registration generation, to tell a re-registered id apart from the
    /// client an old TX metadata slot refers to.
    pub(crate) generation: u64,
    pub(crate) events: Arc<dyn ClientEventSink>,
    pub(crate) rx_prod: Mutex<Vec<spsc::Producer<RxPacket>>>,
    pub(crate) tx_conf_prod: Mutex<Vec<spsc::Producer<TxConfirmation>>>,
    pub(crate) rx_watermark: Option<usize>,
}

impl ClientShared {
    pub(crate) fn rx_queue_count(&self) -> usize {
        self.rx_prod.lock().len()
    }

    pub(crate) fn tx_queue_count(&self) -> usize {
        self.tx_conf_prod.lock().len()
    }
}

/// The registrant's end of a client registration.
///
/// Owns the consumer halves of the per-queue FIFOs. Deliberately not
/// `Clone`; to spread queues across threads, move the consumers out of the
/// public vectors.
pub struct ClientHandle {
    /// Interface id this client is registered under.
    pub id: u8,
    pub(crate) generation: u64,
    /// RX queue consumers, indexed by queue number.
    pub rx: Vec<spsc::Consumer<RxPacket>>,
    /// TX-confirmation queue consumers, indexed by queue number.
    pub tx_conf: Vec<spsc::Consumer<TxConfirmation>>,
}

impl ClientHandle {
    /// Pulls one packet from the given RX queue.
    pub fn receive(&mut self, queue: usize) -> Option<RxPacket> {
        self.rx.get_mut(queue)?.pop()
    }

    /// Pulls one confirmation from the given TX queue.
    pub fn receive_tx_conf(&mut self, queue: usize) -> Option<TxConfirmation> {
        self.tx_conf.get_mut(queue)?.pop()
    }

    /// Whether the given RX queue has packets waiting.
    pub fn has_rx_pkt(&self, queue: usize) -> bool {
        self.rx.get(queue).map_or(false, |q| !q.is_empty())
    }
}
