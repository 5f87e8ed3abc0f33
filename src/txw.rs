//! Transmit window.
//!
//! A fixed-capacity circular array of sent packets, addressed by `sequence % capacity`. The window
//! is empty when `lead == trail - 1`; a new window starts at `trail = 0, lead = -1` so that
//! transmission groups align with sequence zero.
//!
//! Repair requests are kept in a FIFO retransmit queue: requests enter at the front and are served
//! from the back. A sequence number is queued at most once; repeated requests are counted as
//! eliminated NAKs. Parity requests are queued against the first packet of their transmission group
//! and generate parity lazily when served.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{trace, warn};

use crate::error::FecError;
use crate::fec::{self, FecCodec};
use crate::skb::{SkBuff, Tsi};
use crate::sqn::{self, GroupMask, Sqn};

/// Window edges, readable without holding the window's lock.
#[derive(Debug)]
pub struct Edges {
    lead: AtomicU32,
    trail: AtomicU32,
}

impl Edges {
    pub fn lead(&self) -> Sqn {
        self.lead.load(Ordering::Acquire)
    }

    pub fn trail(&self) -> Sqn {
        self.trail.load(Ordering::Acquire)
    }
}

/// Per-slot repair bookkeeping.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TxState {
    pub waiting_retransmit: bool,
    /// Repairs sent for this slot, selective or parity.
    pub retransmit_count: u32,
    /// Requests absorbed while already queued.
    pub nak_elimination_count: u32,
    pub pkt_cnt_requested: u32,
    pub pkt_cnt_sent: u32,
}

struct TxSlot {
    skb: SkBuff,
    tstamp: u64,
    state: TxState,
}

struct TxFec {
    codec: Box<dyn FecCodec>,
    mask: GroupMask,
}

/// A repair ready to be sent.
#[derive(Debug)]
pub enum Retransmit {
    /// The original packet, to be resent as RDATA.
    Selective(SkBuff),
    /// A freshly generated parity packet for the group starting at `tg_sqn`.
    Parity {
        tg_sqn: Sqn,
        /// Parity index within the group.
        h: u32,
        skb: SkBuff,
        var_pktlen: bool,
    },
}

impl Retransmit {
    /// Sequence number carried on the wire.
    pub fn sequence(&self) -> Sqn {
        match self {
            Self::Selective(skb) => skb.sequence(),
            Self::Parity { tg_sqn, h, .. } => tg_sqn | h,
        }
    }

    pub fn skb(&self) -> &SkBuff {
        match self {
            Self::Selective(skb) => skb,
            Self::Parity { skb, .. } => skb,
        }
    }
}

pub struct TransmitWindow {
    tsi: Tsi,
    max_tpdu: usize,
    slots: Box<[Option<TxSlot>]>,
    edges: Arc<Edges>,
    retransmit_queue: VecDeque<Sqn>,
    fec: Option<TxFec>,
    // Bytes of payload held
    size: usize,
}

impl TransmitWindow {
    /// Creates a window of `sqns` slots, or when `sqns` is zero, enough slots to hold `secs`
    /// seconds of traffic at `max_rte` bytes per second.
    pub fn new(
        tsi: Tsi,
        max_tpdu: usize,
        sqns: u32,
        secs: u32,
        max_rte: u64,
        fec: Option<Box<dyn FecCodec>>,
    ) -> Self {
        assert!(max_tpdu > 0, "invalid transmit window: max_tpdu == 0");

        let alloc_sqns = if sqns > 0 {
            sqns as u64
        } else {
            assert!(
                secs > 0 && max_rte > 0,
                "invalid transmit window: sqns == 0 requires secs and max_rte"
            );
            secs as u64 * max_rte / max_tpdu as u64
        };

        assert!(
            alloc_sqns > 0 && alloc_sqns < (u32::MAX / 2) as u64,
            "invalid transmit window: {} sequence numbers",
            alloc_sqns
        );

        let fec = fec.map(|codec| {
            assert!(
                codec.n() > codec.k(),
                "invalid transmit window: fec n must exceed k"
            );
            let mask = GroupMask::new(codec.k() as u32);
            TxFec { codec, mask }
        });

        let lead = u32::MAX;

        trace!(%tsi, max_tpdu, alloc_sqns, fec = fec.is_some(), "create transmit window");

        Self {
            tsi,
            max_tpdu,
            slots: (0..alloc_sqns).map(|_| None).collect(),
            edges: Arc::new(Edges {
                lead: AtomicU32::new(lead),
                trail: AtomicU32::new(lead.wrapping_add(1)),
            }),
            retransmit_queue: VecDeque::new(),
            fec,
            size: 0,
        }
    }

    pub fn tsi(&self) -> Tsi {
        self.tsi
    }

    pub fn max_tpdu(&self) -> usize {
        self.max_tpdu
    }

    pub fn edges(&self) -> Arc<Edges> {
        Arc::clone(&self.edges)
    }

    pub fn lead(&self) -> Sqn {
        self.edges.lead()
    }

    pub fn trail(&self) -> Sqn {
        self.edges.trail()
    }

    pub fn next_lead(&self) -> Sqn {
        self.lead().wrapping_add(1)
    }

    pub fn max_length(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn length(&self) -> u32 {
        sqn::span(self.trail(), self.lead())
    }

    pub fn is_empty(&self) -> bool {
        self.length() == 0
    }

    pub fn is_full(&self) -> bool {
        self.length() == self.max_length()
    }

    /// Bytes of payload currently held.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn group_mask(&self) -> Option<GroupMask> {
        self.fec.as_ref().map(|fec| fec.mask)
    }

    fn index(&self, sqn: Sqn) -> usize {
        (sqn % self.max_length()) as usize
    }

    fn in_window(&self, sqn: Sqn) -> bool {
        !self.is_empty() && sqn::gte(sqn, self.trail()) && sqn::lte(sqn, self.lead())
    }

    fn slot(&self, sqn: Sqn) -> Option<&TxSlot> {
        if !self.in_window(sqn) {
            return None;
        }
        self.slots[self.index(sqn)].as_ref()
    }

    fn slot_mut(&mut self, sqn: Sqn) -> Option<&mut TxSlot> {
        if !self.in_window(sqn) {
            return None;
        }
        let index = self.index(sqn);
        self.slots[index].as_mut()
    }

    /// Takes ownership of `skb`, assigning it the next sequence number. The oldest packet is
    /// evicted when the window is full.
    pub fn add(&mut self, skb: SkBuff, now: u64) -> Sqn {
        if self.is_full() {
            self.remove_tail();
        }

        let sqn = self.next_lead();
        skb.set_sequence(sqn);
        skb.set_tsi(self.tsi);
        skb.set_tstamp(now);

        self.size += skb.len();

        let index = self.index(sqn);
        self.slots[index] = Some(TxSlot {
            skb,
            tstamp: now,
            state: TxState::default(),
        });

        self.edges.lead.store(sqn, Ordering::Release);

        trace!(sqn, "txw add");

        sqn
    }

    /// Returns the packet with sequence number `sqn`, if still held.
    pub fn peek(&self, sqn: Sqn) -> Option<&SkBuff> {
        self.slot(sqn).map(|slot| &slot.skb)
    }

    pub fn state(&self, sqn: Sqn) -> Option<&TxState> {
        self.slot(sqn).map(|slot| &slot.state)
    }

    /// Time at which `sqn` was added.
    pub fn tstamp(&self, sqn: Sqn) -> Option<u64> {
        self.slot(sqn).map(|slot| slot.tstamp)
    }

    /// Removes the packet at the trailing edge, unlinking any queued repair for it.
    pub fn remove_tail(&mut self) {
        assert!(!self.is_empty(), "remove_tail on empty transmit window");

        let trail = self.trail();
        let index = self.index(trail);

        if let Some(slot) = self.slots[index].take() {
            if slot.state.waiting_retransmit {
                self.retransmit_queue.retain(|&sqn| sqn != trail);
            }
            self.size -= slot.skb.len();
            slot.skb.release();
        }

        self.edges
            .trail
            .store(trail.wrapping_add(1), Ordering::Release);

        trace!(sqn = trail, "txw remove tail");
    }

    /// Advances the trailing edge up to but excluding `trail`.
    pub fn trim(&mut self, trail: Sqn) {
        while !self.is_empty() && sqn::lt(self.trail(), trail) {
            self.remove_tail();
        }
    }

    /// Queues a repair. For a parity request `sqn` is `tg_sqn | pkt_cnt`, where `pkt_cnt` is the
    /// number of parity packets requested. Returns false when the request was eliminated or names a
    /// sequence number no longer held.
    pub fn retransmit_push(&mut self, sqn: Sqn, is_parity: bool) -> bool {
        if is_parity {
            match self.fec.as_ref().map(|fec| fec.mask) {
                Some(mask) => self.retransmit_push_parity(sqn, mask),
                None => {
                    warn!(sqn, "parity repair requested without fec");
                    false
                }
            }
        } else {
            self.retransmit_push_selective(sqn)
        }
    }

    fn retransmit_push_parity(&mut self, sqn: Sqn, mask: GroupMask) -> bool {
        let tg_sqn = mask.tg_sqn(sqn);
        let pkt_cnt = mask.pkt_sqn(sqn).max(1);

        let state = match self.slot_mut(tg_sqn) {
            Some(slot) => &mut slot.state,
            None => return false,
        };

        if state.waiting_retransmit {
            let outstanding = state.pkt_cnt_requested - state.pkt_cnt_sent;
            if outstanding < pkt_cnt {
                state.pkt_cnt_requested = state.pkt_cnt_sent + pkt_cnt;
            }
            state.nak_elimination_count += 1;
            return false;
        }

        state.pkt_cnt_requested = state.pkt_cnt_sent + pkt_cnt;
        state.waiting_retransmit = true;
        self.retransmit_queue.push_front(tg_sqn);

        trace!(tg_sqn, pkt_cnt, "txw retransmit push parity");

        true
    }

    fn retransmit_push_selective(&mut self, sqn: Sqn) -> bool {
        let state = match self.slot_mut(sqn) {
            Some(slot) => &mut slot.state,
            None => return false,
        };

        if state.waiting_retransmit {
            state.nak_elimination_count += 1;
            return false;
        }

        state.waiting_retransmit = true;
        self.retransmit_queue.push_front(sqn);

        trace!(sqn, "txw retransmit push selective");

        true
    }

    pub fn retransmit_is_empty(&self) -> bool {
        self.retransmit_queue.is_empty()
    }

    pub fn retransmit_len(&self) -> usize {
        self.retransmit_queue.len()
    }

    /// Returns the oldest queued repair. Parity requests whose group can no longer be encoded are
    /// dropped from the queue.
    pub fn retransmit_try_peek(&mut self) -> Option<Retransmit> {
        loop {
            let sqn = *self.retransmit_queue.back()?;

            let slot = match self.slot(sqn) {
                Some(slot) => slot,
                None => {
                    self.retransmit_queue.pop_back();
                    continue;
                }
            };

            if slot.state.pkt_cnt_requested == 0 {
                return Some(Retransmit::Selective(slot.skb.acquire()));
            }

            match self.generate_parity(sqn, slot.state.pkt_cnt_sent) {
                Ok(retransmit) => return Some(retransmit),
                Err(err) => {
                    warn!(tg_sqn = sqn, %err, "dropping parity repair");
                    self.retransmit_queue.pop_back();
                    if let Some(slot) = self.slot_mut(sqn) {
                        slot.state.waiting_retransmit = false;
                        slot.state.pkt_cnt_requested = slot.state.pkt_cnt_sent;
                    }
                }
            }
        }
    }

    fn generate_parity(&self, tg_sqn: Sqn, pkt_cnt_sent: u32) -> Result<Retransmit, FecError> {
        let fec = match self.fec.as_ref() {
            Some(fec) => fec,
            None => return Err(FecError::Codec("fec disabled".into())),
        };

        let k = fec.codec.k() as u32;
        let h = pkt_cnt_sent % (fec.codec.n() as u32 - k);

        let sources = (0..k)
            .map(|i| {
                let sqn = tg_sqn.wrapping_add(i);
                self.peek(sqn)
                    .map(SkBuff::to_vec)
                    .ok_or(FecError::MissingSource { tg_sqn, sqn })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let parity = fec::encode_group(fec.codec.as_ref(), &sources, h as usize)?;

        let skb = SkBuff::from_bytes(&parity.bytes);
        skb.set_tsi(self.tsi);
        skb.set_sequence(tg_sqn | h);

        Ok(Retransmit::Parity {
            tg_sqn,
            h,
            skb,
            var_pktlen: parity.var_pktlen,
        })
    }

    /// Marks the oldest queued repair as sent. A parity request stays queued until every
    /// requested parity packet has been sent.
    pub fn retransmit_remove_head(&mut self) {
        let Some(&sqn) = self.retransmit_queue.back() else {
            panic!("retransmit_remove_head on empty queue");
        };

        let mut unlink = true;

        if let Some(slot) = self.slot_mut(sqn) {
            let state = &mut slot.state;
            state.retransmit_count += 1;

            if state.pkt_cnt_requested > 0 {
                state.pkt_cnt_sent += 1;
                unlink = state.pkt_cnt_sent >= state.pkt_cnt_requested;
            }

            if unlink {
                state.waiting_retransmit = false;
            }
        }

        if unlink {
            self.retransmit_queue.pop_back();
        }
    }

    /// Releases every held packet. References held elsewhere remain valid.
    pub fn shutdown(&mut self) {
        while !self.is_empty() {
            self.remove_tail();
        }
        self.retransmit_queue.clear();
    }
}

impl Drop for TransmitWindow {
    fn drop(&mut self) {
        self.shutdown();
    }
}
