//! # hif-driver
//!
//! A `no_std` driver for the Host Interface (HIF) of a fixed-function
//! packet-forwarding accelerator: the DMA front door between host software
//! and the hardware engine.
//!
//! The crate is built from two layers:
//!
//! - [`Channel`]: one hardware DMA context. Owns the RX and TX buffer
//!   descriptor rings, the RX buffer pool, and the DMA/IRQ control state.
//! - [`HifDriver`]: multiplexes one channel across many registered
//!   [clients](client), tracks in-flight transmissions, and runs the deferred
//!   RX and TX-confirmation jobs that fan completed work out to clients.
//!
//! ## Basic Usage
//!
//! ```rust,ignore
//! use hif_driver::{Channel, ChannelConfig, DriverConfig, HifDriver, HifHal};
//!
//! // First, implement the HifHal trait for your platform, and the BdRing /
//! // ChannelHw traits over the accelerator's descriptor rings and registers.
//! struct MyHal;
//! unsafe impl HifHal for MyHal { /* ... */ }
//!
//! let channel = Channel::<MyHal>::create(0, hw, rx_ring, tx_ring, ChannelConfig::default())?;
//! let driver = HifDriver::new(channel, DriverConfig::default())?;
//!
//! let handle = driver.client_register(3, ClientConfig::default(), events)?;
//! driver.start();
//!
//! // From the platform's deferred-work context:
//! driver.rx_job();
//! driver.tx_conf_job();
//! ```
//!
//! ## Execution contexts
//!
//! Three contexts cooperate, and the locking is carved along that boundary:
//!
//! - The hardware ISR calls only [`HifDriver::irq`], which masks the raised
//!   events and reports which deferred jobs to schedule. It never touches
//!   ring or FIFO state.
//! - The deferred jobs ([`HifDriver::rx_job`], [`HifDriver::tx_conf_job`])
//!   do all ring draining and client dispatch, bounded by a poll budget.
//! - Client threads transmit through [`HifDriver::xmit_sg`] (serialized by
//!   the TX lock) and consume their per-queue FIFOs through the non-cloneable
//!   [`ClientHandle`](client::ClientHandle) - the single-consumer discipline
//!   is enforced by the type system, not by convention.
//!
//! ## Hardware Abstraction
//!
//! Platform services come in through the [`HifHal`] trait (DMA allocation,
//! address translation, short sleeps). The accelerator's descriptor rings and
//! per-channel control registers are consumed through the [`BdRing`](hw::BdRing)
//! and [`ChannelHw`](hw::ChannelHw) traits; their MMIO layout is the
//! platform's business.

#![no_std]

extern crate alloc;
#[macro_use]
extern crate log;
#[cfg(test)]
extern crate std;

pub mod channel;
pub mod client;
pub mod driver;
pub mod hal;
pub mod header;
pub mod hw;
pub mod pool;
pub mod spsc;
pub mod stats;

pub use channel::{Channel, ChannelConfig, RxChunk};
pub use client::{
    ClientConfig, ClientEvent, ClientEventSink, ClientHandle, RxPacket, TxConfirmation,
};
pub use driver::{
    DriverConfig, DriverState, HifDriver, SgChunk, TxOptions, IHC_CLIENT_ID, MAX_CLIENTS,
    MAX_CLIENT_QUEUES,
};
pub use hal::{DmaBlock, HifHal, PhysAddr, VirtAddr};
pub use header::{RxFlags, RxHeader, TxFlags, TxHeader, HIF_HEADER_SIZE};
pub use hw::{BdEntry, BdRing, ChannelHw, IrqEvents};
pub use pool::{BufIndex, BufMeta, BufferPool, BUF_META_ROOM};
pub use stats::{HifStats, StatsSnapshot};

/// Error type for HIF driver operations.
///
/// The variants map onto the classic errno taxonomy the accelerator's host
/// API uses: argument errors are caught at entry and returned without side
/// effects, `NoSpace` is retryable back-pressure, and the hardware-timeout
/// and leak variants only surface during channel teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HifError {
    /// An argument was out of range or otherwise invalid (EINVAL).
    InvalidArgument,
    /// The operation is not permitted in the current state (EPERM):
    /// the direction is disabled, the client slot is occupied, or the TX
    /// path is stuck pending [`HifDriver::recover_tx`].
    NotPermitted,
    /// Not enough ring or metadata capacity right now (ENOSPC).
    ///
    /// Transient back-pressure; the caller should retry after completions
    /// have been drained.
    NoSpace,
    /// A setup-time allocation failed (ENOMEM).
    NoMemory,
    /// The hardware rejected a buffer mid-transmit after the header chunk
    /// was already accepted (ECANCELED). The TX path is stuck until
    /// [`HifDriver::recover_tx`] runs.
    Cancelled,
    /// A bounded hardware poll (DMA idle, descriptor fetch FIFO) did not
    /// converge. Logged and reported, never retried indefinitely.
    HwTimeout,
    /// Teardown reconciliation found buffers unaccounted for:
    /// `pool available + ring fill + handed out != pool depth`.
    BufferLeak,
}

/// Result type for HIF driver functions.
pub type HifResult<T = ()> = Result<T, HifError>;

impl core::fmt::Display for HifError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            HifError::InvalidArgument => "invalid argument",
            HifError::NotPermitted => "operation not permitted",
            HifError::NoSpace => "no ring capacity",
            HifError::NoMemory => "out of memory",
            HifError::Cancelled => "transmit cancelled by hardware",
            HifError::HwTimeout => "hardware poll timed out",
            HifError::BufferLeak => "buffer leak detected at teardown",
        };
        f.write_str(s)
    }
}
