//! Per-frame wire header.
//!
//! Every frame crossing the HIF carries a small hardware-defined header in
//! front of the payload: on receive it tells the host where the frame came
//! from and which classification queue the firmware picked; on transmit it
//! carries per-frame instructions (egress interface, VLAN tag, checksum
//! offload, inter-core routing, timestamp request). Only the semantic fields
//! are consumed by this crate; the byte layout below is this crate's own
//! canonical encoding of them.

use bitflags::bitflags;

/// Size of the wire header in bytes, on both directions.
pub const HIF_HEADER_SIZE: usize = 16;

bitflags! {
    /// RX header flags reported by the hardware.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RxFlags: u16 {
        /// The frame is an inter-core control message and must be routed to
        /// the reserved IHC client, not the ingress interface's client.
        const IHC = 1 << 0;
        /// IPv4 header checksum validated by hardware.
        const IP_CSUM_OK = 1 << 1;
        /// TCP checksum validated by hardware.
        const TCP_CSUM_OK = 1 << 2;
        /// UDP checksum validated by hardware.
        const UDP_CSUM_OK = 1 << 3;
    }
}

bitflags! {
    /// TX header instruction flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TxFlags: u16 {
        /// Inject the frame into the processing pipeline instead of sending
        /// it straight to the egress port.
        const INJECT = 1 << 0;
        /// Inter-core control message.
        const IHC = 1 << 1;
        /// Tag the frame with the VLAN id carried in the header.
        const VLAN_TAG = 1 << 2;
        /// Request L3/L4 checksum offload.
        const CSUM_OFFLOAD = 1 << 3;
        /// Request an egress timestamp; the reference number in the header
        /// is echoed back through the asynchronous timestamp mechanism.
        const TS_REQUEST = 1 << 4;
    }
}

/// Parsed RX wire header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxHeader {
    /// Ingress physical interface id.
    pub ifid: u8,
    /// Firmware-assigned classification queue number.
    pub queue: u8,
    /// Hardware-reported flags.
    pub flags: RxFlags,
}

impl RxHeader {
    /// Parses the header from the start of a received first chunk.
    ///
    /// Returns `None` if the chunk is too short to carry a header.
    pub fn parse(data: &[u8]) -> Option<RxHeader> {
        if data.len() < HIF_HEADER_SIZE {
            return None;
        }
        let flags = u16::from_le_bytes([data[2], data[3]]);
        Some(RxHeader {
            ifid: data[0],
            queue: data[1],
            flags: RxFlags::from_bits_truncate(flags),
        })
    }

    /// Encodes the header into `buf` (test and loopback support).
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`HIF_HEADER_SIZE`].
    pub fn write(&self, buf: &mut [u8]) {
        assert!(buf.len() >= HIF_HEADER_SIZE);
        buf[..HIF_HEADER_SIZE].fill(0);
        buf[0] = self.ifid;
        buf[1] = self.queue;
        buf[2..4].copy_from_slice(&self.flags.bits().to_le_bytes());
    }
}

/// TX wire header, built per frame into the metadata slot's header buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxHeader {
    /// Egress physical interface id.
    pub egress: u8,
    /// Egress queue number.
    pub queue: u8,
    /// Instruction flags.
    pub flags: TxFlags,
    /// VLAN id, meaningful when [`TxFlags::VLAN_TAG`] is set.
    pub vlan: u16,
    /// Timestamp reference number, meaningful when [`TxFlags::TS_REQUEST`]
    /// is set.
    pub ts_ref: u16,
}

impl TxHeader {
    /// Encodes the header into `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`HIF_HEADER_SIZE`].
    pub fn write(&self, buf: &mut [u8]) {
        assert!(buf.len() >= HIF_HEADER_SIZE);
        buf[..HIF_HEADER_SIZE].fill(0);
        buf[0] = self.egress;
        buf[1] = self.queue;
        buf[2..4].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[4..6].copy_from_slice(&self.vlan.to_le_bytes());
        buf[6..8].copy_from_slice(&self.ts_ref.to_le_bytes());
    }

    /// Decodes a header previously encoded with [`TxHeader::write`].
    pub fn parse(data: &[u8]) -> Option<TxHeader> {
        if data.len() < HIF_HEADER_SIZE {
            return None;
        }
        Some(TxHeader {
            egress: data[0],
            queue: data[1],
            flags: TxFlags::from_bits_truncate(u16::from_le_bytes([data[2], data[3]])),
            vlan: u16::from_le_bytes([data[4], data[5]]),
            ts_ref: u16::from_le_bytes([data[6], data[7]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rx_header_roundtrip() {
        let hdr = RxHeader {
            ifid: 3,
            queue: 1,
            flags: RxFlags::IP_CSUM_OK | RxFlags::TCP_CSUM_OK,
        };
        let mut buf = [0xAAu8; HIF_HEADER_SIZE];
        hdr.write(&mut buf);
        assert_eq!(RxHeader::parse(&buf), Some(hdr));
    }

    #[test]
    fn test_rx_header_too_short() {
        let buf = [0u8; HIF_HEADER_SIZE - 1];
        assert_eq!(RxHeader::parse(&buf), None);
    }

    #[test]
    fn test_rx_header_unknown_flags_ignored() {
        let mut buf = [0u8; HIF_HEADER_SIZE];
        buf[2] = 0xFF;
        buf[3] = 0xFF;
        let hdr = RxHeader::parse(&buf).unwrap();
        assert_eq!(hdr.flags.bits() & !RxFlags::all().bits(), 0);
    }

    #[test]
    fn test_tx_header_roundtrip() {
        let hdr = TxHeader {
            egress: 2,
            queue: 0,
            flags: TxFlags::VLAN_TAG | TxFlags::TS_REQUEST,
            vlan: 100,
            ts_ref: 0xBEEF,
        };
        let mut buf = [0u8; HIF_HEADER_SIZE];
        hdr.write(&mut buf);
        assert_eq!(TxHeader::parse(&buf), Some(hdr));
    }
}
