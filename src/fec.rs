//! Forward error correction over transmission groups.
//!
//! The erasure code itself is a collaborator behind [`FecCodec`]. This module turns the
//! variable-length payloads of a transmission group into equal-length codec blocks and back. When
//! the payloads of a group differ in length, every block is zero padded to the longest payload and
//! carries the original length as a 2-byte big-endian trailer.

use crate::error::FecError;
use crate::sqn::Sqn;

pub trait FecCodec: Send + Sync {
    /// Number of source packets per transmission group.
    fn k(&self) -> usize;

    /// Number of source plus parity packets per transmission group.
    fn n(&self) -> usize;

    /// Computes the parity block with index `index` (`k <= index < n`) of equal-length `sources`
    /// into `parity`.
    fn encode(&self, sources: &[&[u8]], index: usize, parity: &mut [u8]) -> Result<(), FecError>;

    /// Recovers erased source blocks in place. `blocks[i]` holds source block `i` when
    /// `offsets[i] == i`, and otherwise the parity block with index `offsets[i]`.
    fn decode(&self, blocks: &mut [Vec<u8>], offsets: &[usize]) -> Result<(), FecError>;
}

/// Single-parity code: the one parity block is the XOR of all source blocks, so any one erasure per
/// group can be repaired.
#[derive(Clone, Copy, Debug)]
pub struct XorParity {
    k: usize,
}

impl XorParity {
    pub fn new(k: usize) -> Self {
        assert!(k > 0, "invalid fec configuration: k == 0");
        Self { k }
    }
}

impl FecCodec for XorParity {
    fn k(&self) -> usize {
        self.k
    }

    fn n(&self) -> usize {
        self.k + 1
    }

    fn encode(&self, sources: &[&[u8]], index: usize, parity: &mut [u8]) -> Result<(), FecError> {
        if index != self.k {
            return Err(FecError::ParityIndex(index));
        }

        parity.fill(0);
        for source in sources {
            for (p, s) in parity.iter_mut().zip(source.iter()) {
                *p ^= s;
            }
        }

        Ok(())
    }

    fn decode(&self, blocks: &mut [Vec<u8>], offsets: &[usize]) -> Result<(), FecError> {
        let mut erased = offsets.iter().enumerate().filter(|&(i, &o)| i != o);

        let erasure = match (erased.next(), erased.next()) {
            (None, _) => return Ok(()),
            (Some((i, &o)), None) => {
                if o != self.k {
                    return Err(FecError::ParityIndex(o));
                }
                i
            }
            (Some(_), Some(_)) => {
                return Err(FecError::Codec(
                    "xor parity cannot repair more than one erasure".into(),
                ))
            }
        };

        let mut recovered = std::mem::take(&mut blocks[erasure]);
        for (i, block) in blocks.iter().enumerate() {
            if i != erasure {
                for (r, b) in recovered.iter_mut().zip(block.iter()) {
                    *r ^= b;
                }
            }
        }
        blocks[erasure] = recovered;

        Ok(())
    }
}

/// A parity packet payload for one transmission group.
#[derive(Debug, Eq, PartialEq)]
pub struct Parity {
    pub bytes: Vec<u8>,
    /// Source payloads differed in length and blocks carry a length trailer.
    pub var_pktlen: bool,
}

fn to_block(payload: &[u8], block_len: usize, var_pktlen: bool) -> Vec<u8> {
    let mut block = payload.to_vec();
    if var_pktlen {
        block.resize(block_len - 2, 0);
        block.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        block.resize(block_len, 0);
    }
    block
}

/// Computes parity block `h` (counted from zero) of a transmission group.
pub fn encode_group(
    codec: &dyn FecCodec,
    sources: &[Vec<u8>],
    h: usize,
) -> Result<Parity, FecError> {
    let max_len = sources.iter().map(Vec::len).max().unwrap_or(0);
    let var_pktlen = sources.iter().any(|s| s.len() != max_len);
    let block_len = if var_pktlen { max_len + 2 } else { max_len };

    let blocks: Vec<Vec<u8>> = sources
        .iter()
        .map(|s| to_block(s, block_len, var_pktlen))
        .collect();
    let refs: Vec<&[u8]> = blocks.iter().map(Vec::as_slice).collect();

    let mut bytes = vec![0; block_len];
    codec.encode(&refs, codec.k() + h, &mut bytes)?;

    Ok(Parity { bytes, var_pktlen })
}

/// Recovers the missing source payloads of a transmission group.
///
/// `sources` is indexed by packet offset within the group. `parity` holds `(h, bytes)` pairs. Returns
/// the recovered `(offset, payload)` pairs for every source that was `None`.
pub fn decode_group(
    codec: &dyn FecCodec,
    tg_sqn: Sqn,
    sources: &[Option<Vec<u8>>],
    parity: &[(usize, Vec<u8>)],
    var_pktlen: bool,
) -> Result<Vec<(usize, Vec<u8>)>, FecError> {
    let k = codec.k();
    let present = sources.iter().filter(|s| s.is_some()).count();

    if present + parity.len() < k {
        return Err(FecError::Incomplete {
            tg_sqn,
            present: present + parity.len(),
            required: k,
        });
    }

    let block_len = match parity.first() {
        Some((_, bytes)) => bytes.len(),
        None => return Ok(Vec::new()),
    };

    let mut blocks = Vec::with_capacity(k);
    let mut offsets = Vec::with_capacity(k);
    let mut spare = parity.iter();
    let mut erased = Vec::new();

    for (i, source) in sources.iter().enumerate().take(k) {
        match source {
            Some(payload) => {
                blocks.push(to_block(payload, block_len, var_pktlen));
                offsets.push(i);
            }
            None => {
                let (h, bytes) = spare.next().ok_or(FecError::Incomplete {
                    tg_sqn,
                    present: present + parity.len(),
                    required: k,
                })?;
                blocks.push(bytes.clone());
                offsets.push(k + h);
                erased.push(i);
            }
        }
    }

    codec.decode(&mut blocks, &offsets)?;

    Ok(erased
        .into_iter()
        .map(|i| {
            let mut block = std::mem::take(&mut blocks[i]);
            if var_pktlen && block.len() >= 2 {
                let trailer = block.len() - 2;
                let len = u16::from_be_bytes([block[trailer], block[trailer + 1]]) as usize;
                block.truncate(len.min(trailer));
            }
            (i, block)
        })
        .collect())
}
