//! Wire representation of the packets the engine exchanges.
//!
//! Every packet starts with a 16-byte header: source port, destination port, type, option flags,
//! checksum, the 6-byte GSI and the TSDU length, all big-endian. The type-specific body follows.

pub mod serial;

use crate::skb::Tsi;
use crate::sqn::Sqn;

pub use serial::{read, write};

/// Maximum number of sequence numbers carried by one NAK or NCF.
pub const NAK_LIST_MAX: usize = 63;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketType {
    Spm,
    Odata,
    Rdata,
    Nak,
    Ncf,
    Spmr,
}

/// Original or repair data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DataPacket<'a> {
    pub sqn: Sqn,
    /// Trailing edge of the sender's transmit window.
    pub trail: Sqn,
    /// Payload is FEC parity for the group `sqn & tg_mask`, with parity index `sqn & !tg_mask`.
    pub parity: bool,
    /// Parity blocks carry a 2-byte source length trailer.
    pub var_pktlen: bool,
    pub payload: &'a [u8],
}

/// Source path message: the sender's window advertisement.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Spm {
    pub spm_sqn: Sqn,
    pub trail: Sqn,
    pub lead: Sqn,
}

/// A repair request or its confirmation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Nak {
    /// Requested sequence numbers, or `tg_sqn | count` when `parity` is set.
    pub sqns: Vec<Sqn>,
    pub parity: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Packet<'a> {
    Spm(Spm),
    Odata(DataPacket<'a>),
    Rdata(DataPacket<'a>),
    Nak(Nak),
    Ncf(Nak),
    Spmr,
}

impl<'a> Packet<'a> {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Spm(_) => PacketType::Spm,
            Self::Odata(_) => PacketType::Odata,
            Self::Rdata(_) => PacketType::Rdata,
            Self::Nak(_) => PacketType::Nak,
            Self::Ncf(_) => PacketType::Ncf,
            Self::Spmr => PacketType::Spmr,
        }
    }
}

/// A packet together with the session it belongs to.
///
/// `tsi` always names the data source, and `dport` the data-destination port, regardless of the
/// direction the packet travels.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Datagram<'a> {
    pub tsi: Tsi,
    pub dport: u16,
    pub packet: Packet<'a>,
}

/// Internet checksum (one's complement sum of 16-bit words).
pub fn checksum(bytes: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut chunks = bytes.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}
