use super::*;

use crate::error::PacketError;

pub const HEADER_SIZE: usize = 16;
pub const DATA_HEADER_SIZE: usize = 8;
/// Offset of the TSDU within an ODATA or RDATA packet.
pub const DATA_OFFSET: usize = HEADER_SIZE + DATA_HEADER_SIZE;

const SPM_SIZE: usize = 12;
const NAK_SIZE: usize = 4;

const TYPE_SPM: u8 = 0x00;
const TYPE_ODATA: u8 = 0x04;
const TYPE_RDATA: u8 = 0x05;
const TYPE_NAK: u8 = 0x08;
const TYPE_NCF: u8 = 0x0a;
const TYPE_SPMR: u8 = 0x0c;

const OPT_PRESENT: u8 = 0x01;
const OPT_VAR_PKTLEN: u8 = 0x40;
const OPT_PARITY: u8 = 0x80;

const CHECKSUM_OFFSET: usize = 6;

pub struct Reader<'a> {
    buffer: &'a [u8],
    bytes_read: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            bytes_read: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.bytes_read
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PacketError> {
        if self.remaining() < n {
            return Err(PacketError::Truncated);
        }
        let bytes = &self.buffer[self.bytes_read..self.bytes_read + n];
        self.bytes_read += n;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8, PacketError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, PacketError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, PacketError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_slice(&mut self, n: usize) -> Result<&'a [u8], PacketError> {
        self.take(n)
    }
}

pub struct Writer {
    buffer: Vec<u8>,
}

impl Writer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_slice(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn finish(self) -> Vec<u8> {
        self.buffer
    }
}

/// Fixed-size packet sections.
pub trait BlockSerial {
    const SIZE: usize;

    fn read(rd: &mut Reader) -> Result<Self, PacketError>
    where
        Self: Sized;

    fn write(wr: &mut Writer, obj: &Self);
}

struct Header {
    sport: u16,
    dport: u16,
    type_: u8,
    options: u8,
    checksum: u16,
    gsi: [u8; 6],
    tsdu_length: u16,
}

impl BlockSerial for Header {
    const SIZE: usize = HEADER_SIZE;

    fn read(rd: &mut Reader) -> Result<Self, PacketError> {
        let sport = rd.read_u16()?;
        let dport = rd.read_u16()?;
        let type_ = rd.read_u8()?;
        let options = rd.read_u8()?;
        let checksum = rd.read_u16()?;
        let mut gsi = [0; 6];
        gsi.copy_from_slice(rd.read_slice(6)?);
        let tsdu_length = rd.read_u16()?;

        Ok(Self {
            sport,
            dport,
            type_,
            options,
            checksum,
            gsi,
            tsdu_length,
        })
    }

    fn write(wr: &mut Writer, obj: &Self) {
        wr.write_u16(obj.sport);
        wr.write_u16(obj.dport);
        wr.write_u8(obj.type_);
        wr.write_u8(obj.options);
        wr.write_u16(obj.checksum);
        wr.write_slice(&obj.gsi);
        wr.write_u16(obj.tsdu_length);
    }
}

impl BlockSerial for Spm {
    const SIZE: usize = SPM_SIZE;

    fn read(rd: &mut Reader) -> Result<Self, PacketError> {
        let spm_sqn = rd.read_u32()?;
        let trail = rd.read_u32()?;
        let lead = rd.read_u32()?;

        Ok(Self {
            spm_sqn,
            trail,
            lead,
        })
    }

    fn write(wr: &mut Writer, obj: &Self) {
        wr.write_u32(obj.spm_sqn);
        wr.write_u32(obj.trail);
        wr.write_u32(obj.lead);
    }
}

fn read_nak(rd: &mut Reader, options: u8) -> Result<Nak, PacketError> {
    let mut sqns = vec![rd.read_u32()?];

    if options & OPT_PRESENT != 0 {
        let count = rd.read_u8()? as usize;
        for _ in 0..count.min(NAK_LIST_MAX - 1) {
            sqns.push(rd.read_u32()?);
        }
    }

    Ok(Nak {
        sqns,
        parity: options & OPT_PARITY != 0,
    })
}

fn write_nak(wr: &mut Writer, nak: &Nak) {
    debug_assert!(!nak.sqns.is_empty() && nak.sqns.len() <= NAK_LIST_MAX);

    wr.write_u32(nak.sqns[0]);
    if nak.sqns.len() > 1 {
        wr.write_u8((nak.sqns.len() - 1) as u8);
        for &sqn in &nak.sqns[1..] {
            wr.write_u32(sqn);
        }
    }
}

/// Encodes a datagram, computing its checksum.
pub fn write(datagram: &Datagram) -> Vec<u8> {
    let (type_, mut options, tsdu_length) = match &datagram.packet {
        Packet::Spm(_) => (TYPE_SPM, 0, 0),
        Packet::Odata(data) => (TYPE_ODATA, 0, data.payload.len()),
        Packet::Rdata(data) => (TYPE_RDATA, 0, data.payload.len()),
        Packet::Nak(_) => (TYPE_NAK, 0, 0),
        Packet::Ncf(_) => (TYPE_NCF, 0, 0),
        Packet::Spmr => (TYPE_SPMR, 0, 0),
    };

    match &datagram.packet {
        Packet::Odata(data) | Packet::Rdata(data) => {
            if data.parity {
                options |= OPT_PARITY;
            }
            if data.var_pktlen {
                options |= OPT_VAR_PKTLEN;
            }
        }
        Packet::Nak(nak) | Packet::Ncf(nak) => {
            if nak.parity {
                options |= OPT_PARITY;
            }
            if nak.sqns.len() > 1 {
                options |= OPT_PRESENT;
            }
        }
        _ => (),
    }

    // NAKs travel from receiver to source, so the ports are swapped
    let (sport, dport) = match datagram.packet {
        Packet::Nak(_) | Packet::Spmr => (datagram.dport, datagram.tsi.sport),
        _ => (datagram.tsi.sport, datagram.dport),
    };

    let mut wr = Writer::with_capacity(DATA_OFFSET + tsdu_length);

    Header::write(
        &mut wr,
        &Header {
            sport,
            dport,
            type_,
            options,
            checksum: 0,
            gsi: datagram.tsi.gsi,
            tsdu_length: tsdu_length as u16,
        },
    );

    match &datagram.packet {
        Packet::Spm(spm) => Spm::write(&mut wr, spm),
        Packet::Odata(data) | Packet::Rdata(data) => {
            wr.write_u32(data.sqn);
            wr.write_u32(data.trail);
            wr.write_slice(data.payload);
        }
        Packet::Nak(nak) | Packet::Ncf(nak) => write_nak(&mut wr, nak),
        Packet::Spmr => (),
    }

    let mut bytes = wr.finish();
    let sum = checksum(&bytes);
    bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&sum.to_be_bytes());
    bytes
}

/// Decodes and validates a datagram. Data payloads borrow from `bytes`.
pub fn read(bytes: &[u8]) -> Result<Datagram<'_>, PacketError> {
    let mut rd = Reader::new(bytes);
    let header = Header::read(&mut rd)?;

    let mut zeroed = bytes.to_vec();
    zeroed[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].fill(0);
    if checksum(&zeroed) != header.checksum {
        return Err(PacketError::Checksum);
    }

    let (tsi, dport) = match header.type_ {
        TYPE_NAK | TYPE_SPMR => (Tsi::new(header.gsi, header.dport), header.sport),
        _ => (Tsi::new(header.gsi, header.sport), header.dport),
    };

    let packet = match header.type_ {
        TYPE_SPM => Packet::Spm(Spm::read(&mut rd)?),
        TYPE_ODATA | TYPE_RDATA => {
            let sqn = rd.read_u32()?;
            let trail = rd.read_u32()?;
            let tsdu_length = header.tsdu_length as usize;

            if rd.remaining() != tsdu_length {
                return Err(PacketError::Length {
                    declared: tsdu_length,
                    actual: rd.remaining(),
                });
            }

            let data = DataPacket {
                sqn,
                trail,
                parity: header.options & OPT_PARITY != 0,
                var_pktlen: header.options & OPT_VAR_PKTLEN != 0,
                payload: rd.read_slice(tsdu_length)?,
            };

            if header.type_ == TYPE_ODATA {
                Packet::Odata(data)
            } else {
                Packet::Rdata(data)
            }
        }
        TYPE_NAK => Packet::Nak(read_nak(&mut rd, header.options)?),
        TYPE_NCF => Packet::Ncf(read_nak(&mut rd, header.options)?),
        TYPE_SPMR => Packet::Spmr,
        other => return Err(PacketError::UnknownType(other)),
    };

    Ok(Datagram { tsi, dport, packet })
}
