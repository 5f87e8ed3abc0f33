//! Receive window.
//!
//! A fixed-capacity circular array of per-sequence-number repair state, addressed by
//! `sequence % capacity`. Three edges partition the window:
//!
//!   trail <= commit_lead <= lead + 1
//!
//! `[trail, commit_lead)` holds slots already handed to the application and awaiting
//! `remove_commit`, `[commit_lead, lead]` holds slots still being repaired or waiting to be read.
//! The window is undefined until the first data packet or SPM arrives, at which point it starts at
//! that packet.
//!
//! A sequence number observed beyond `lead` implies every sequence number in between was lost in
//! transit. Those are created in `BackOff` with a randomized expiry so that receivers sharing a loss
//! do not NAK in unison. The slots waiting on a timer are indexed by expiry in one queue per state,
//! so the earliest timer of each state is always at the front of its queue.
//!
//! The sender's advertised trailing edge bounds what can still be repaired. Slots that fall behind
//! it without data are marked lost and reported to the application in sequence order.

use std::collections::BTreeSet;

use tracing::{trace, warn};

use crate::fec::{self, FecCodec};
use crate::skb::{SkBuff, Tsi};
use crate::sqn::{self, GroupMask, Sqn};

/// Sequence numbers further than this from the trailing edge are rejected.
const MAX_SPAN: u32 = u32::MAX / 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PktState {
    /// Missing; a NAK will be sent when the back-off timer expires.
    BackOff,
    /// NAK sent; waiting for the sender's confirmation.
    WaitNcf,
    /// NAK confirmed; waiting for the repair.
    WaitData,
    /// Data present, not yet read.
    HaveData,
    /// Holds a parity packet of its transmission group in place of the missing data.
    HaveParity,
    /// Read by the application, awaiting removal.
    CommitData,
    /// Repair abandoned.
    LostData,
}

impl PktState {
    fn is_timed(&self) -> bool {
        matches!(self, Self::BackOff | Self::WaitNcf | Self::WaitData)
    }

    fn is_missing(&self) -> bool {
        matches!(
            self,
            Self::BackOff | Self::WaitNcf | Self::WaitData | Self::LostData
        )
    }
}

/// Outcome of adding a data packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddResult {
    /// Packet was the next expected sequence number.
    Appended,
    /// Packet filled a hole.
    Inserted,
    /// Packet was appended beyond a gap; placeholders were created for the gap.
    Missing,
    Duplicate,
    /// Payload exceeds the maximum TSDU.
    Malformed,
    /// Sequence number lies outside the window, or the window is full of unreleased data.
    Bounds,
}

/// Outcome of processing an NCF.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConfirmResult {
    /// Window was extended to the confirmed sequence number.
    Appended,
    /// An outstanding slot is now waiting for data.
    Updated,
    /// Data for the sequence number is already present.
    Duplicate,
    Bounds,
}

/// Result of a read from the window.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadOutcome {
    /// Nothing is ready.
    Empty,
    /// `msgs` contiguous packets totalling `bytes` were read.
    Data { bytes: usize, msgs: usize },
    /// `count` sequence numbers starting at `first` were abandoned.
    Loss { first: Sqn, count: u32 },
}

/// Per-slot NAK bookkeeping.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RepairState {
    pub nak_transmit_count: u32,
    pub ncf_retry_count: u32,
    pub data_retry_count: u32,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RxwStats {
    /// Slots currently lost and not yet reported.
    pub lost_count: u32,
    /// Slots read and not yet removed.
    pub committed_count: u32,
    pub cumulative_losses: u32,
    pub bytes_delivered: u64,
    pub msgs_delivered: u64,
    /// Packets reconstructed from parity.
    pub fec_recovered: u32,
}

struct RxSlot {
    state: PktState,
    skb: Option<SkBuff>,
    timer_expiry: u64,
    repair: RepairState,
    // Parity index and length-trailer flag when holding parity
    parity: Option<(usize, bool)>,
}

impl RxSlot {
    fn placeholder(state: PktState, timer_expiry: u64) -> Self {
        Self {
            state,
            skb: None,
            timer_expiry,
            repair: RepairState::default(),
            parity: None,
        }
    }

    fn data(skb: SkBuff) -> Self {
        Self {
            state: PktState::HaveData,
            skb: Some(skb),
            timer_expiry: 0,
            repair: RepairState::default(),
            parity: None,
        }
    }
}

struct RxFec {
    codec: Box<dyn FecCodec>,
    mask: GroupMask,
}

#[derive(Default)]
struct TimerQueues {
    backoff: BTreeSet<(u64, Sqn)>,
    wait_ncf: BTreeSet<(u64, Sqn)>,
    wait_data: BTreeSet<(u64, Sqn)>,
}

impl TimerQueues {
    fn get(&self, state: PktState) -> Option<&BTreeSet<(u64, Sqn)>> {
        match state {
            PktState::BackOff => Some(&self.backoff),
            PktState::WaitNcf => Some(&self.wait_ncf),
            PktState::WaitData => Some(&self.wait_data),
            _ => None,
        }
    }

    fn get_mut(&mut self, state: PktState) -> Option<&mut BTreeSet<(u64, Sqn)>> {
        match state {
            PktState::BackOff => Some(&mut self.backoff),
            PktState::WaitNcf => Some(&mut self.wait_ncf),
            PktState::WaitData => Some(&mut self.wait_data),
            _ => None,
        }
    }
}

pub struct ReceiveWindow {
    tsi: Tsi,
    max_tsdu: usize,
    slots: Box<[Option<RxSlot>]>,
    lead: Sqn,
    trail: Sqn,
    commit_lead: Sqn,
    // Slots in `[trail, released)` were freed by `remove_commit` and are only kept for parity
    // reconstruction
    released: Sqn,
    // Sender's advertised trailing edge
    rxw_trail: Sqn,
    is_defined: bool,
    timers: TimerQueues,
    fec: Option<RxFec>,
    // Sequence numbers dropped from the trailing edge and not yet reported
    skipped: Option<(Sqn, u32)>,
    size: usize,
    stats: RxwStats,
}

impl ReceiveWindow {
    /// Creates a window of `sqns` slots, or when `sqns` is zero, enough slots to hold `secs`
    /// seconds of traffic at `max_rte` bytes per second.
    pub fn new(
        tsi: Tsi,
        max_tsdu: usize,
        sqns: u32,
        secs: u32,
        max_rte: u64,
        fec: Option<Box<dyn FecCodec>>,
    ) -> Self {
        assert!(max_tsdu > 0, "invalid receive window: max_tsdu == 0");

        let alloc_sqns = if sqns > 0 {
            sqns as u64
        } else {
            assert!(
                secs > 0 && max_rte > 0,
                "invalid receive window: sqns == 0 requires secs and max_rte"
            );
            secs as u64 * max_rte / max_tsdu as u64
        };

        assert!(
            alloc_sqns > 0 && alloc_sqns < MAX_SPAN as u64,
            "invalid receive window: {} sequence numbers",
            alloc_sqns
        );

        let fec = fec.map(|codec| {
            let mask = GroupMask::new(codec.k() as u32);
            RxFec { codec, mask }
        });

        Self {
            tsi,
            max_tsdu,
            slots: (0..alloc_sqns).map(|_| None).collect(),
            lead: u32::MAX,
            trail: 0,
            commit_lead: 0,
            released: 0,
            rxw_trail: 0,
            is_defined: false,
            timers: TimerQueues::default(),
            fec,
            skipped: None,
            size: 0,
            stats: RxwStats::default(),
        }
    }

    pub fn tsi(&self) -> Tsi {
        self.tsi
    }

    pub fn lead(&self) -> Sqn {
        self.lead
    }

    pub fn next_lead(&self) -> Sqn {
        self.lead.wrapping_add(1)
    }

    pub fn trail(&self) -> Sqn {
        self.trail
    }

    pub fn commit_lead(&self) -> Sqn {
        self.commit_lead
    }

    pub fn rxw_trail(&self) -> Sqn {
        self.rxw_trail
    }

    pub fn is_defined(&self) -> bool {
        self.is_defined
    }

    pub fn max_length(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn length(&self) -> u32 {
        sqn::span(self.trail, self.lead)
    }

    pub fn is_empty(&self) -> bool {
        self.length() == 0
    }

    pub fn is_full(&self) -> bool {
        self.length() == self.max_length()
    }

    /// Number of slots read but not yet removed.
    pub fn commit_length(&self) -> u32 {
        self.commit_lead.wrapping_sub(self.trail)
    }

    /// Bytes of data held, including parity.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn stats(&self) -> RxwStats {
        self.stats
    }

    pub fn group_mask(&self) -> Option<GroupMask> {
        self.fec.as_ref().map(|fec| fec.mask)
    }

    /// Erasures per transmission group the codec can repair.
    pub fn parity_capacity(&self) -> u32 {
        self.fec
            .as_ref()
            .map_or(0, |fec| (fec.codec.n() - fec.codec.k()) as u32)
    }

    fn index(&self, sqn: Sqn) -> usize {
        (sqn % self.max_length()) as usize
    }

    fn in_window(&self, sqn: Sqn) -> bool {
        !self.is_empty() && sqn::gte(sqn, self.trail) && sqn::lte(sqn, self.lead)
    }

    fn slot(&self, sqn: Sqn) -> Option<&RxSlot> {
        if !self.in_window(sqn) {
            return None;
        }
        self.slots[self.index(sqn)].as_ref()
    }

    fn slot_mut(&mut self, sqn: Sqn) -> Option<&mut RxSlot> {
        if !self.in_window(sqn) {
            return None;
        }
        let index = self.index(sqn);
        self.slots[index].as_mut()
    }

    pub fn state(&self, sqn: Sqn) -> Option<PktState> {
        self.slot(sqn).map(|slot| slot.state)
    }

    pub fn peek(&self, sqn: Sqn) -> Option<&SkBuff> {
        self.slot(sqn).and_then(|slot| slot.skb.as_ref())
    }

    pub fn repair(&self, sqn: Sqn) -> Option<&RepairState> {
        self.slot(sqn).map(|slot| &slot.repair)
    }

    pub fn repair_mut(&mut self, sqn: Sqn) -> Option<&mut RepairState> {
        self.slot_mut(sqn).map(|slot| &mut slot.repair)
    }

    pub fn timer_expiry(&self, sqn: Sqn) -> Option<u64> {
        self.slot(sqn)
            .filter(|slot| slot.state.is_timed())
            .map(|slot| slot.timer_expiry)
    }

    fn define(&mut self, lead: Sqn) {
        self.lead = lead;
        self.trail = lead.wrapping_add(1);
        self.commit_lead = self.trail;
        self.released = self.trail;
        self.rxw_trail = self.trail;
        self.is_defined = true;

        trace!(tsi = %self.tsi, trail = self.trail, "rxw defined");
    }

    // Changes the state of a slot, keeping the timer queues in step
    fn set_state(&mut self, sqn: Sqn, state: PktState, expiry: u64) {
        let index = self.index(sqn);
        let Some(slot) = self.slots[index].as_mut() else {
            return;
        };

        let (old_state, old_expiry) = (slot.state, slot.timer_expiry);

        if old_state == PktState::LostData && state != PktState::LostData {
            self.stats.lost_count -= 1;
        }
        if old_state == PktState::HaveParity {
            slot.parity = None;
        }

        slot.state = state;
        slot.timer_expiry = expiry;

        if let Some(queue) = self.timers.get_mut(old_state) {
            queue.remove(&(old_expiry, sqn));
        }
        if let Some(queue) = self.timers.get_mut(state) {
            queue.insert((expiry, sqn));
        }

        trace!(sqn, ?old_state, ?state, "rxw state");
    }

    /// Moves a slot awaiting repair into `state`, which must be `BackOff`, `WaitNcf` or
    /// `WaitData`, arming its timer for `expiry`.
    pub fn transition(&mut self, sqn: Sqn, state: PktState, expiry: u64) {
        assert!(state.is_timed(), "invalid rxw transition to {:?}", state);

        if self.slot(sqn).map_or(false, |slot| slot.state.is_timed()) {
            self.set_state(sqn, state, expiry);
        }
    }

    /// Earliest armed timer across all states.
    pub fn next_expiry(&self) -> Option<u64> {
        [PktState::BackOff, PktState::WaitNcf, PktState::WaitData]
            .iter()
            .filter_map(|&state| self.state_expiry(state))
            .min()
    }

    /// Earliest armed timer of `state`.
    pub fn state_expiry(&self, state: PktState) -> Option<u64> {
        self.timers
            .get(state)
            .and_then(|queue| queue.first())
            .map(|&(expiry, _)| expiry)
    }

    /// Returns the slot in `state` whose timer expired first, if any has expired by `now`.
    pub fn first_expired(&self, state: PktState, now: u64) -> Option<Sqn> {
        self.timers
            .get(state)
            .and_then(|queue| queue.first())
            .filter(|&&(expiry, _)| expiry <= now)
            .map(|&(_, sqn)| sqn)
    }

    /// Slots in `state` whose timers expired by `now`, earliest first, at most `max` of them.
    pub fn expired(&self, state: PktState, now: u64, max: usize) -> Vec<Sqn> {
        match self.timers.get(state) {
            Some(queue) => queue
                .iter()
                .take_while(|&&(expiry, _)| expiry <= now)
                .take(max)
                .map(|&(_, sqn)| sqn)
                .collect(),
            None => Vec::new(),
        }
    }

    // Frees space at the trailing edge. Fails while read data awaits removal.
    fn make_room(&mut self) -> bool {
        if !self.is_full() {
            return true;
        }
        if sqn::lt(self.trail, self.released) {
            self.remove_trail();
            return true;
        }
        if self.commit_length() > 0 {
            return false;
        }

        let trail = self.trail;
        let index = self.index(trail);
        if let Some(slot) = self.slots[index].take() {
            if let Some(queue) = self.timers.get_mut(slot.state) {
                queue.remove(&(slot.timer_expiry, trail));
            }
            match slot.state {
                PktState::LostData => self.stats.lost_count -= 1,
                _ => self.stats.cumulative_losses += 1,
            }
            if let Some(skb) = slot.skb {
                self.size -= skb.len();
            }
        }

        self.skip(trail, 1);
        self.trail = trail.wrapping_add(1);
        self.commit_lead = self.trail;

        true
    }

    fn skip(&mut self, first: Sqn, count: u32) {
        self.skipped = match self.skipped {
            Some((skipped_first, skipped_count)) => Some((skipped_first, skipped_count + count)),
            None => Some((first, count)),
        };
        warn!(tsi = %self.tsi, first, count, "rxw dropped unrecoverable sequence numbers");
    }

    // Appends one slot at `lead + 1`
    fn push(&mut self, slot: RxSlot) -> bool {
        if !self.make_room() {
            return false;
        }

        let sqn = self.next_lead();
        let index = self.index(sqn);
        let (state, expiry) = (slot.state, slot.timer_expiry);

        if let Some(skb) = &slot.skb {
            self.size += skb.len();
        }

        self.slots[index] = Some(slot);
        self.lead = sqn;

        if state == PktState::LostData {
            self.stats.lost_count += 1;
            self.stats.cumulative_losses += 1;
        }
        if let Some(queue) = self.timers.get_mut(state) {
            queue.insert((expiry, sqn));
        }

        true
    }

    // Creates placeholders up to but excluding `sqn`. Returns how many were created.
    fn push_placeholders(&mut self, sqn: Sqn, nak_rb_expiry: u64) -> Option<u32> {
        let mut count = 0;

        while sqn::lt(self.next_lead(), sqn) {
            let state = if sqn::lt(self.next_lead(), self.rxw_trail) {
                PktState::LostData
            } else {
                PktState::BackOff
            };

            if !self.push(RxSlot::placeholder(state, nak_rb_expiry)) {
                return None;
            }
            count += 1;
        }

        Some(count)
    }

    fn is_beyond_bounds(&self, sqn: Sqn) -> bool {
        sqn::lt(sqn, self.trail) || sqn.wrapping_sub(self.trail) >= MAX_SPAN
    }

    // Applies a trailing edge advertised by the sender
    fn update_trail(&mut self, txw_trail: Sqn) {
        if sqn::lte(txw_trail, self.rxw_trail) {
            return;
        }
        if txw_trail.wrapping_sub(self.trail) >= MAX_SPAN {
            return;
        }

        self.rxw_trail = txw_trail;

        if sqn::lte(self.rxw_trail, self.commit_lead) {
            return;
        }

        if self.commit_lead == self.next_lead() {
            while sqn::lt(self.trail, self.released) {
                self.remove_trail();
            }

            // Nothing outstanding: jump the empty region
            if self.is_empty() {
                let distance = self.rxw_trail.wrapping_sub(self.trail);
                self.skip(self.trail, distance);
                self.stats.cumulative_losses += distance;
                self.trail = self.rxw_trail;
                self.commit_lead = self.rxw_trail;
                self.lead = self.rxw_trail.wrapping_sub(1);
            }
            return;
        }

        let mut sqn = self.commit_lead;
        while sqn::lte(sqn, self.lead) && sqn::lt(sqn, self.rxw_trail) {
            match self.state(sqn) {
                Some(PktState::BackOff)
                | Some(PktState::WaitNcf)
                | Some(PktState::WaitData)
                | Some(PktState::HaveParity) => self.lost(sqn),
                _ => (),
            }
            sqn = sqn.wrapping_add(1);
        }
    }

    /// Adds a received data packet. `skb` holds the TSDU and carries its sequence number. `trail`
    /// is the sender's trailing edge as carried by the packet.
    pub fn add(&mut self, skb: SkBuff, trail: Sqn, nak_rb_expiry: u64) -> AddResult {
        let sqn = skb.sequence();

        if skb.len() > self.max_tsdu {
            return AddResult::Malformed;
        }

        if !self.is_defined {
            self.define(sqn.wrapping_sub(1));
        } else if self.is_beyond_bounds(sqn) {
            trace!(sqn, trail = self.trail, "rxw add out of bounds");
            return AddResult::Bounds;
        } else {
            self.update_trail(trail);
        }

        if sqn::lt(sqn, self.commit_lead) {
            return AddResult::Duplicate;
        }

        let result = if sqn::lte(sqn, self.lead) {
            match self.state(sqn) {
                Some(PktState::HaveData) | Some(PktState::CommitData) => AddResult::Duplicate,
                _ => {
                    self.set_state(sqn, PktState::HaveData, 0);
                    let index = self.index(sqn);
                    if let Some(slot) = self.slots[index].as_mut() {
                        if let Some(old) = slot.skb.replace(skb.acquire()) {
                            self.size -= old.len();
                        }
                        self.size += skb.len();
                    }
                    AddResult::Inserted
                }
            }
        } else {
            let missing = match self.push_placeholders(sqn, nak_rb_expiry) {
                Some(count) => count,
                None => return AddResult::Bounds,
            };

            if !self.push(RxSlot::data(skb.acquire())) {
                return AddResult::Bounds;
            }

            if missing > 0 {
                AddResult::Missing
            } else {
                AddResult::Appended
            }
        };

        trace!(sqn, ?result, "rxw add");

        if result != AddResult::Duplicate {
            if let Some(mask) = self.group_mask() {
                self.try_reconstruct(mask.tg_sqn(sqn));
            }
        }

        result
    }

    /// Adds a received parity packet. `skb` holds the parity block and carries `tg_sqn | h`.
    pub fn add_parity(
        &mut self,
        skb: SkBuff,
        trail: Sqn,
        var_pktlen: bool,
        nak_rb_expiry: u64,
    ) -> AddResult {
        let mask = match self.group_mask() {
            Some(mask) => mask,
            None => return AddResult::Malformed,
        };

        let tg_sqn = mask.tg_sqn(skb.sequence());
        let h = mask.pkt_sqn(skb.sequence()) as usize;
        let tg_last = tg_sqn.wrapping_add(mask.group_size() - 1);

        if !self.is_defined || self.is_beyond_bounds(tg_sqn) {
            return AddResult::Bounds;
        }

        self.update_trail(trail);

        if sqn::lt(tg_last, self.commit_lead) {
            return AddResult::Duplicate;
        }

        let mut result = AddResult::Inserted;
        if sqn::gt(tg_last, self.lead) {
            match self.push_placeholders(tg_last.wrapping_add(1), nak_rb_expiry) {
                Some(count) if count > 0 => result = AddResult::Missing,
                Some(_) => (),
                None => return AddResult::Bounds,
            }
        }

        let target = (0..mask.group_size())
            .map(|i| tg_sqn.wrapping_add(i))
            .find(|&sqn| self.state(sqn).map_or(false, |state| state.is_missing()));

        let Some(target) = target else {
            return AddResult::Duplicate;
        };

        self.set_state(target, PktState::HaveParity, 0);
        let index = self.index(target);
        if let Some(slot) = self.slots[index].as_mut() {
            slot.parity = Some((h, var_pktlen));
            if let Some(old) = slot.skb.replace(skb.acquire()) {
                self.size -= old.len();
            }
            self.size += skb.len();
        }

        trace!(tg_sqn, h, target, "rxw add parity");

        self.try_reconstruct(tg_sqn);

        result
    }

    // Recovers missing packets of a group once enough data and parity is present
    fn try_reconstruct(&mut self, tg_sqn: Sqn) {
        let Some(fec) = self.fec.as_ref() else {
            return;
        };

        let k = fec.codec.k();
        if sqn::lt(tg_sqn, self.trail) || sqn::gt(tg_sqn.wrapping_add(k as u32 - 1), self.lead) {
            return;
        }

        let mut sources = Vec::with_capacity(k);
        let mut parity = Vec::new();
        let mut var_pktlen = false;

        for i in 0..k as u32 {
            let sqn = tg_sqn.wrapping_add(i);
            let Some(slot) = self.slot(sqn) else {
                return;
            };

            match (slot.state, &slot.skb, slot.parity) {
                (PktState::HaveData | PktState::CommitData, Some(skb), _) => {
                    sources.push(Some(skb.to_vec()));
                }
                (PktState::HaveParity, Some(skb), Some((h, var))) => {
                    sources.push(None);
                    parity.push((h, skb.to_vec()));
                    var_pktlen |= var;
                }
                _ => sources.push(None),
            }
        }

        let present = sources.iter().filter(|s| s.is_some()).count();
        if parity.is_empty() || present + parity.len() < k {
            return;
        }

        let recovered =
            match fec::decode_group(fec.codec.as_ref(), tg_sqn, &sources, &parity, var_pktlen) {
                Ok(recovered) => recovered,
                Err(err) => {
                    warn!(tg_sqn, %err, "parity reconstruction failed");
                    return;
                }
            };

        for (offset, payload) in recovered {
            let sqn = tg_sqn.wrapping_add(offset as u32);
            let skb = SkBuff::from_bytes(&payload);
            skb.set_sequence(sqn);
            skb.set_tsi(self.tsi);

            self.set_state(sqn, PktState::HaveData, 0);
            let index = self.index(sqn);
            if let Some(slot) = self.slots[index].as_mut() {
                if let Some(old) = slot.skb.replace(skb) {
                    self.size -= old.len();
                }
                self.size += payload.len();
            }
            self.stats.fec_recovered += 1;
        }

        trace!(tg_sqn, "rxw reconstructed transmission group");
    }

    /// Processes an NCF for `sqn`: the sender has seen a NAK and a repair is on its way.
    /// Slots that are already lost stay lost.
    pub fn confirm(&mut self, sqn: Sqn, nak_rdata_expiry: u64, nak_rb_expiry: u64) -> ConfirmResult {
        if !self.is_defined || self.is_beyond_bounds(sqn) || sqn::lt(sqn, self.commit_lead) {
            return ConfirmResult::Bounds;
        }

        if sqn::lte(sqn, self.lead) {
            return match self.state(sqn) {
                Some(PktState::HaveData)
                | Some(PktState::HaveParity)
                | Some(PktState::CommitData)
                | Some(PktState::LostData)
                | None => ConfirmResult::Duplicate,
                Some(state) => {
                    if state == PktState::WaitData {
                        if let Some(repair) = self.repair_mut(sqn) {
                            repair.ncf_retry_count += 1;
                        }
                    }
                    self.set_state(sqn, PktState::WaitData, nak_rdata_expiry);
                    ConfirmResult::Updated
                }
            };
        }

        if self.push_placeholders(sqn, nak_rb_expiry).is_none() {
            return ConfirmResult::Bounds;
        }
        if !self.push(RxSlot::placeholder(PktState::WaitData, nak_rdata_expiry)) {
            return ConfirmResult::Bounds;
        }

        ConfirmResult::Appended
    }

    /// Applies an SPM advertisement, defining the window if necessary. Returns the number of
    /// placeholders created.
    pub fn update(&mut self, txw_lead: Sqn, txw_trail: Sqn, nak_rb_expiry: u64) -> u32 {
        if !self.is_defined {
            self.define(txw_lead);
            return 0;
        }

        self.update_trail(txw_trail);

        if !sqn::gt(txw_lead, self.lead) {
            return 0;
        }
        if txw_lead.wrapping_sub(self.trail) >= MAX_SPAN {
            warn!(txw_lead, trail = self.trail, "rxw update out of bounds");
            return 0;
        }

        self.push_placeholders(txw_lead.wrapping_add(1), nak_rb_expiry)
            .unwrap_or(0)
    }

    /// Abandons repair of `sqn`.
    pub fn lost(&mut self, sqn: Sqn) {
        match self.state(sqn) {
            Some(PktState::HaveData) | Some(PktState::CommitData) | Some(PktState::LostData) => {
                return
            }
            None => return,
            _ => (),
        }

        self.set_state(sqn, PktState::LostData, 0);
        self.stats.lost_count += 1;
        self.stats.cumulative_losses += 1;

        warn!(tsi = %self.tsi, sqn, "rxw lost data");

        if let Some(mask) = self.group_mask() {
            self.abandon_parity(mask.tg_sqn(sqn));
        }
    }

    // Parity held for a group with no outstanding repairs can never be decoded
    fn abandon_parity(&mut self, tg_sqn: Sqn) {
        let Some(mask) = self.group_mask() else {
            return;
        };

        let group: Vec<Sqn> = (0..mask.group_size())
            .map(|i| tg_sqn.wrapping_add(i))
            .collect();

        if group
            .iter()
            .any(|&sqn| self.state(sqn).map_or(false, |state| state.is_timed()))
        {
            return;
        }

        for sqn in group {
            if self.state(sqn) == Some(PktState::HaveParity) {
                self.set_state(sqn, PktState::LostData, 0);
                self.stats.lost_count += 1;
                self.stats.cumulative_losses += 1;
                warn!(tsi = %self.tsi, sqn, "rxw lost data, parity unusable");
            }
        }
    }

    /// Reads up to `max_msgs` contiguous packets into `out`, in sequence order. Lost sequence
    /// numbers are reported on their own, never mixed with data.
    pub fn readv(&mut self, out: &mut Vec<SkBuff>, max_msgs: usize) -> ReadOutcome {
        if let Some((first, count)) = self.skipped.take() {
            return ReadOutcome::Loss { first, count };
        }

        let mut bytes = 0;
        let mut msgs = 0;

        while msgs < max_msgs && self.commit_lead != self.next_lead() {
            let sqn = self.commit_lead;
            match self.state(sqn) {
                Some(PktState::HaveData) => {
                    self.set_state(sqn, PktState::CommitData, 0);
                    if let Some(skb) = self.peek(sqn) {
                        bytes += skb.len();
                        out.push(skb.acquire());
                    }
                    msgs += 1;
                    self.stats.committed_count += 1;
                    self.commit_lead = sqn.wrapping_add(1);
                }
                Some(PktState::LostData) if msgs == 0 => {
                    let mut count = 0;
                    while self.commit_lead != self.next_lead()
                        && self.state(self.commit_lead) == Some(PktState::LostData)
                    {
                        self.commit_lead = self.commit_lead.wrapping_add(1);
                        count += 1;
                    }
                    self.stats.lost_count -= count;
                    self.stats.committed_count += count;
                    return ReadOutcome::Loss { first: sqn, count };
                }
                _ => break,
            }
        }

        if msgs == 0 {
            return ReadOutcome::Empty;
        }

        self.stats.bytes_delivered += bytes as u64;
        self.stats.msgs_delivered += msgs as u64;

        ReadOutcome::Data { bytes, msgs }
    }

    // Frees the committed slot at the trailing edge
    fn remove_trail(&mut self) {
        let index = self.index(self.trail);
        if let Some(slot) = self.slots[index].take() {
            if let Some(skb) = slot.skb {
                self.size -= skb.len();
            }
        }
        self.trail = self.trail.wrapping_add(1);
        self.stats.committed_count -= 1;
    }

    /// Frees every slot already read, advancing the trailing edge to `commit_lead`. With FEC, read
    /// slots of the transmission group containing `commit_lead` stay in the window until the group
    /// has been read in full, so that parity can still rebuild the rest of it.
    pub fn remove_commit(&mut self) -> u32 {
        let target = match self.group_mask() {
            Some(mask) if sqn::gt(mask.tg_sqn(self.commit_lead), self.trail) => {
                mask.tg_sqn(self.commit_lead)
            }
            Some(_) => self.trail,
            None => self.commit_lead,
        };

        let mut count = 0;
        while self.trail != target {
            self.remove_trail();
            count += 1;
        }

        self.released = self.commit_lead;
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fec::XorParity;

    const TSI: Tsi = Tsi::new([1, 2, 3, 4, 5, 6], 1000);
    const ID_SWEEP_SIZE: u32 = 16;
    const NAK_RB_EXPIRY: u64 = 2;
    const NAK_RDATA_EXPIRY: u64 = 3;

    fn window(sqns: u32) -> ReceiveWindow {
        ReceiveWindow::new(TSI, 1000, sqns, 0, 0, None)
    }

    fn data(sqn: Sqn, len: usize) -> SkBuff {
        let skb = SkBuff::allocate(len);
        skb.append(&vec![(sqn % 251) as u8; len]);
        skb.set_sequence(sqn);
        skb
    }

    fn add(rxw: &mut ReceiveWindow, sqn: Sqn) -> AddResult {
        rxw.add(data(sqn, 10), rxw.rxw_trail(), NAK_RB_EXPIRY)
    }

    fn read_all(rxw: &mut ReceiveWindow) -> Vec<Sqn> {
        let mut out = Vec::new();
        rxw.readv(&mut out, usize::MAX);
        rxw.remove_commit();
        out.iter().map(SkBuff::sequence).collect()
    }

    fn base(i: u32) -> Sqn {
        0_u32.wrapping_sub(ID_SWEEP_SIZE / 2).wrapping_add(i)
    }

    #[test]
    fn first_packet_defines_window() {
        let mut rxw = window(100);

        assert!(!rxw.is_defined());
        assert_eq!(add(&mut rxw, 500), AddResult::Appended);
        assert_eq!(rxw.trail(), 500);
        assert_eq!(rxw.lead(), 500);
        assert_eq!(rxw.commit_lead(), 500);
        assert_eq!(rxw.length(), 1);
        assert_eq!(rxw.size(), 10);
    }

    #[test]
    fn gap_detection() {
        for i in 0..ID_SWEEP_SIZE {
            let b = base(i);
            let mut rxw = window(100);

            assert_eq!(add(&mut rxw, b), AddResult::Appended);
            assert_eq!(add(&mut rxw, b.wrapping_add(5)), AddResult::Missing);

            for j in 1..5 {
                assert_eq!(rxw.state(b.wrapping_add(j)), Some(PktState::BackOff));
                assert_eq!(rxw.timer_expiry(b.wrapping_add(j)), Some(NAK_RB_EXPIRY));
            }
            assert_eq!(rxw.state(b.wrapping_add(5)), Some(PktState::HaveData));
            assert_eq!(rxw.next_expiry(), Some(NAK_RB_EXPIRY));

            assert_eq!(add(&mut rxw, b.wrapping_add(3)), AddResult::Inserted);
            assert_eq!(rxw.state(b.wrapping_add(3)), Some(PktState::HaveData));
        }
    }

    #[test]
    fn commit_ordering() {
        for i in 0..ID_SWEEP_SIZE {
            let b = base(i);
            let mut rxw = window(100);
            let mut out = Vec::new();

            // Define the window at b via an SPM, then receive 2 ahead of 0 and 1
            rxw.update(b.wrapping_sub(1), b, NAK_RB_EXPIRY);
            assert_eq!(add(&mut rxw, b.wrapping_add(2)), AddResult::Missing);
            assert_eq!(rxw.readv(&mut out, 10), ReadOutcome::Empty);

            assert_eq!(add(&mut rxw, b.wrapping_add(1)), AddResult::Inserted);
            assert_eq!(rxw.readv(&mut out, 10), ReadOutcome::Empty);

            assert_eq!(add(&mut rxw, b), AddResult::Inserted);
            assert_eq!(add(&mut rxw, b.wrapping_add(3)), AddResult::Appended);
            assert_eq!(add(&mut rxw, b.wrapping_add(4)), AddResult::Appended);

            assert_eq!(
                rxw.readv(&mut out, 10),
                ReadOutcome::Data {
                    bytes: 50,
                    msgs: 5
                }
            );
            let order: Vec<Sqn> = out.iter().map(SkBuff::sequence).collect();
            assert_eq!(order, (0..5).map(|j| b.wrapping_add(j)).collect::<Vec<_>>());
            assert_eq!(rxw.commit_length(), 5);

            assert_eq!(rxw.remove_commit(), 5);
            assert!(rxw.is_empty());
            assert_eq!(rxw.size(), 0);
        }
    }

    #[test]
    fn duplicates() {
        let mut rxw = window(100);

        assert_eq!(add(&mut rxw, 0), AddResult::Appended);
        assert_eq!(add(&mut rxw, 0), AddResult::Duplicate);
        assert_eq!(add(&mut rxw, 1), AddResult::Appended);

        read_all(&mut rxw);
        assert_eq!(add(&mut rxw, 1), AddResult::Bounds);

        let mut out = Vec::new();
        assert_eq!(add(&mut rxw, 2), AddResult::Appended);
        rxw.readv(&mut out, 1);
        assert_eq!(add(&mut rxw, 2), AddResult::Duplicate);
    }

    #[test]
    fn malformed() {
        let mut rxw = window(100);
        assert_eq!(
            rxw.add(data(0, 1001), 0, NAK_RB_EXPIRY),
            AddResult::Malformed
        );
        assert!(!rxw.is_defined());
    }

    #[test]
    fn bounds() {
        let mut rxw = window(100);

        assert_eq!(rxw.add(data(0, 10), 0_u32.wrapping_sub(10), 2), AddResult::Appended);
        assert_eq!(add(&mut rxw, u32::MAX), AddResult::Bounds);
        assert_eq!(add(&mut rxw, 1), AddResult::Appended);
        assert_eq!(
            rxw.add(data(100 + u32::MAX / 2, 10), u32::MAX / 2, 2),
            AddResult::Bounds
        );
        assert_eq!(add(&mut rxw, 2), AddResult::Appended);
    }

    #[test]
    fn full_window_evicts_unread_trail() {
        let mut rxw = window(10);

        for j in 0..15 {
            assert_eq!(add(&mut rxw, j), AddResult::Appended);
        }
        assert_eq!(rxw.length(), 10);
        assert_eq!(rxw.trail(), 5);

        let mut out = Vec::new();
        assert_eq!(
            rxw.readv(&mut out, 100),
            ReadOutcome::Loss { first: 0, count: 5 }
        );
        assert_eq!(
            rxw.readv(&mut out, 100),
            ReadOutcome::Data {
                bytes: 100,
                msgs: 10
            }
        );
        assert_eq!(rxw.stats().cumulative_losses, 5);
    }

    #[test]
    fn full_window_with_unremoved_commit() {
        let mut rxw = window(10);

        for j in 0..10 {
            add(&mut rxw, j);
        }

        let mut out = Vec::new();
        rxw.readv(&mut out, 1);

        assert_eq!(add(&mut rxw, 10), AddResult::Bounds);
        assert_eq!(rxw.confirm(10, NAK_RDATA_EXPIRY, NAK_RB_EXPIRY), ConfirmResult::Bounds);

        rxw.remove_commit();
        assert_eq!(add(&mut rxw, 10), AddResult::Appended);
    }

    #[test]
    fn confirm() {
        let mut rxw = window(100);

        assert_eq!(rxw.confirm(0, NAK_RDATA_EXPIRY, NAK_RB_EXPIRY), ConfirmResult::Bounds);

        add(&mut rxw, 100);
        assert_eq!(rxw.confirm(99, NAK_RDATA_EXPIRY, NAK_RB_EXPIRY), ConfirmResult::Bounds);
        assert_eq!(rxw.confirm(100, NAK_RDATA_EXPIRY, NAK_RB_EXPIRY), ConfirmResult::Duplicate);
        assert_eq!(rxw.confirm(101, NAK_RDATA_EXPIRY, NAK_RB_EXPIRY), ConfirmResult::Appended);
        assert_eq!(rxw.state(101), Some(PktState::WaitData));
        assert_eq!(rxw.timer_expiry(101), Some(NAK_RDATA_EXPIRY));

        assert_eq!(rxw.confirm(101, 7, NAK_RB_EXPIRY), ConfirmResult::Updated);
        assert_eq!(rxw.repair(101).unwrap().ncf_retry_count, 1);
        assert_eq!(rxw.timer_expiry(101), Some(7));

        assert_eq!(add(&mut rxw, 101), AddResult::Inserted);
        assert_eq!(rxw.next_expiry(), None);
        assert_eq!(read_all(&mut rxw), vec![100, 101]);
    }

    #[test]
    fn confirm_beyond_lead_creates_backoff() {
        let mut rxw = window(100);
        add(&mut rxw, 0);

        assert_eq!(rxw.confirm(4, NAK_RDATA_EXPIRY, NAK_RB_EXPIRY), ConfirmResult::Appended);
        for j in 1..4 {
            assert_eq!(rxw.state(j), Some(PktState::BackOff));
        }
        assert_eq!(rxw.state(4), Some(PktState::WaitData));
        assert_eq!(rxw.state_expiry(PktState::BackOff), Some(NAK_RB_EXPIRY));
        assert_eq!(rxw.state_expiry(PktState::WaitData), Some(NAK_RDATA_EXPIRY));
    }

    #[test]
    fn update_from_spm() {
        let mut rxw = window(100);

        assert_eq!(rxw.update(100, 99, NAK_RB_EXPIRY), 0);
        assert_eq!(rxw.update(100, 99, NAK_RB_EXPIRY), 0);

        assert_eq!(add(&mut rxw, 100), AddResult::Bounds);
        assert_eq!(add(&mut rxw, 101), AddResult::Appended);
        assert_eq!(read_all(&mut rxw), vec![101]);

        assert_eq!(rxw.update(102, 99, NAK_RB_EXPIRY), 1);
        assert_eq!(rxw.state(102), Some(PktState::BackOff));
        assert_eq!(add(&mut rxw, 102), AddResult::Inserted);
    }

    #[test]
    fn advancing_sender_trail_loses_outstanding() {
        let mut rxw = window(100);

        add(&mut rxw, 0);
        add(&mut rxw, 4);
        rxw.transition(1, PktState::WaitNcf, 10);

        // Sender no longer holds 0..=2
        assert_eq!(rxw.update(4, 3, NAK_RB_EXPIRY), 0);

        assert_eq!(rxw.state(1), Some(PktState::LostData));
        assert_eq!(rxw.state(2), Some(PktState::LostData));
        assert_eq!(rxw.state(3), Some(PktState::BackOff));
        assert_eq!(rxw.stats().lost_count, 2);

        let mut out = Vec::new();
        assert_eq!(
            rxw.readv(&mut out, 10),
            ReadOutcome::Data { bytes: 10, msgs: 1 }
        );
        assert_eq!(
            rxw.readv(&mut out, 10),
            ReadOutcome::Loss { first: 1, count: 2 }
        );
        assert_eq!(rxw.readv(&mut out, 10), ReadOutcome::Empty);

        assert_eq!(add(&mut rxw, 3), AddResult::Inserted);
        out.clear();
        assert_eq!(
            rxw.readv(&mut out, 10),
            ReadOutcome::Data { bytes: 20, msgs: 2 }
        );
        assert_eq!(rxw.stats().cumulative_losses, 2);
        assert_eq!(rxw.stats().lost_count, 0);
    }

    #[test]
    fn trail_jump_on_empty_window() {
        let mut rxw = window(100);

        add(&mut rxw, 0);
        read_all(&mut rxw);

        rxw.update(0, 50, NAK_RB_EXPIRY);
        assert_eq!(rxw.trail(), 50);
        assert_eq!(rxw.lead(), 49);

        let mut out = Vec::new();
        assert_eq!(
            rxw.readv(&mut out, 10),
            ReadOutcome::Loss { first: 1, count: 49 }
        );
        assert_eq!(add(&mut rxw, 50), AddResult::Appended);
    }

    #[test]
    fn lost_data_is_skipped() {
        let mut rxw = window(100);

        add(&mut rxw, 0);
        add(&mut rxw, 3);
        rxw.lost(1);
        rxw.lost(2);
        rxw.lost(3);

        assert_eq!(rxw.state(3), Some(PktState::HaveData));
        assert_eq!(rxw.stats().lost_count, 2);

        let mut out = Vec::new();
        assert_eq!(rxw.readv(&mut out, 10), ReadOutcome::Data { bytes: 10, msgs: 1 });
        assert_eq!(rxw.readv(&mut out, 10), ReadOutcome::Loss { first: 1, count: 2 });
        assert_eq!(rxw.readv(&mut out, 10), ReadOutcome::Data { bytes: 10, msgs: 1 });

        let order: Vec<Sqn> = out.iter().map(SkBuff::sequence).collect();
        assert_eq!(order, vec![0, 3]);
        assert_eq!(rxw.remove_commit(), 4);
    }

    #[test]
    fn timer_queues() {
        let mut rxw = window(100);

        add(&mut rxw, 0);
        rxw.add(data(3, 10), 0, 50);

        assert_eq!(rxw.first_expired(PktState::BackOff, 49), None);
        assert_eq!(rxw.first_expired(PktState::BackOff, 50), Some(1));

        assert_eq!(rxw.expired(PktState::BackOff, 50, 10), vec![1, 2]);
        assert_eq!(rxw.expired(PktState::BackOff, 50, 1), vec![1]);

        rxw.transition(1, PktState::WaitNcf, 40);
        assert_eq!(rxw.first_expired(PktState::BackOff, 50), Some(2));
        assert_eq!(rxw.first_expired(PktState::WaitNcf, 50), Some(1));
        assert_eq!(rxw.next_expiry(), Some(40));

        // Transitions of slots holding data are ignored
        rxw.transition(3, PktState::BackOff, 1);
        assert_eq!(rxw.state(3), Some(PktState::HaveData));

        add(&mut rxw, 1);
        add(&mut rxw, 2);
        assert_eq!(rxw.next_expiry(), None);
    }

    #[test]
    #[should_panic(expected = "invalid rxw transition")]
    fn transition_to_untimed_state() {
        let mut rxw = window(100);
        add(&mut rxw, 0);
        rxw.transition(0, PktState::HaveData, 0);
    }

    #[test]
    fn parity_reconstruction() {
        let codec = XorParity::new(4);
        let mut rxw = ReceiveWindow::new(TSI, 1000, 64, 0, 0, Some(Box::new(codec)));

        let payloads: Vec<Vec<u8>> = vec![b"zero".to_vec(), b"one".to_vec(), b"2".to_vec(), b"three!".to_vec()];
        let parity = fec::encode_group(&codec, &payloads, 0).unwrap();

        for sqn in [0, 1, 3] {
            let skb = SkBuff::from_bytes(&payloads[sqn as usize]);
            skb.set_sequence(sqn);
            rxw.add(skb, 0, NAK_RB_EXPIRY);
        }
        assert_eq!(rxw.state(2), Some(PktState::BackOff));

        let parity_skb = SkBuff::from_bytes(&parity.bytes);
        parity_skb.set_sequence(0);
        assert_eq!(
            rxw.add_parity(parity_skb, 0, parity.var_pktlen, NAK_RB_EXPIRY),
            AddResult::Inserted
        );

        assert_eq!(rxw.state(2), Some(PktState::HaveData));
        assert_eq!(rxw.peek(2).unwrap().to_vec(), b"2");
        assert_eq!(rxw.stats().fec_recovered, 1);
        assert_eq!(rxw.next_expiry(), None);

        let mut out = Vec::new();
        rxw.readv(&mut out, 10);
        let read: Vec<Vec<u8>> = out.iter().map(SkBuff::to_vec).collect();
        assert_eq!(read, payloads);
    }

    #[test]
    fn parity_waits_for_group() {
        let codec = XorParity::new(4);
        let mut rxw = ReceiveWindow::new(TSI, 1000, 64, 0, 0, Some(Box::new(codec)));

        rxw.update(u32::MAX, 0, NAK_RB_EXPIRY);
        add(&mut rxw, 0);

        let parity_skb = SkBuff::from_bytes(&[0; 10]);
        parity_skb.set_sequence(0);
        assert_eq!(
            rxw.add_parity(parity_skb, 0, false, NAK_RB_EXPIRY),
            AddResult::Missing
        );
        assert_eq!(rxw.state(1), Some(PktState::HaveParity));
        assert_eq!(rxw.state(2), Some(PktState::BackOff));
        assert_eq!(rxw.state(3), Some(PktState::BackOff));
        assert_eq!(rxw.lead(), 3);
    }

    #[test]
    fn parity_after_partial_read() {
        let codec = XorParity::new(4);
        let mut rxw = ReceiveWindow::new(TSI, 1000, 64, 0, 0, Some(Box::new(codec)));

        let payloads: Vec<Vec<u8>> = (0..4).map(|sqn| data(sqn, 10).to_vec()).collect();
        let parity = fec::encode_group(&codec, &payloads, 0).unwrap();

        add(&mut rxw, 0);
        assert_eq!(read_all(&mut rxw), vec![0]);

        // The read packet stays until its group is complete
        assert_eq!(rxw.trail(), 0);
        assert_eq!(rxw.state(0), Some(PktState::CommitData));

        add(&mut rxw, 2);
        add(&mut rxw, 3);
        assert_eq!(rxw.state(1), Some(PktState::BackOff));

        let parity_skb = SkBuff::from_bytes(&parity.bytes);
        parity_skb.set_sequence(0);
        rxw.add_parity(parity_skb, 0, parity.var_pktlen, NAK_RB_EXPIRY);

        assert_eq!(rxw.stats().fec_recovered, 1);
        assert_eq!(read_all(&mut rxw), vec![1, 2, 3]);
        assert_eq!(rxw.trail(), 4);
        assert!(rxw.is_empty());
    }

    #[test]
    fn unusable_parity_is_lost() {
        let codec = XorParity::new(4);
        let mut rxw = ReceiveWindow::new(TSI, 1000, 64, 0, 0, Some(Box::new(codec)));

        rxw.update(u32::MAX, 0, NAK_RB_EXPIRY);
        add(&mut rxw, 2);
        add(&mut rxw, 3);

        let parity_skb = SkBuff::from_bytes(&[0; 10]);
        parity_skb.set_sequence(0);
        rxw.add_parity(parity_skb, 0, false, NAK_RB_EXPIRY);
        assert_eq!(rxw.state(0), Some(PktState::HaveParity));
        assert_eq!(rxw.state(1), Some(PktState::BackOff));

        rxw.lost(1);
        assert_eq!(rxw.state(0), Some(PktState::LostData));

        let mut out = Vec::new();
        assert_eq!(
            rxw.readv(&mut out, usize::MAX),
            ReadOutcome::Loss { first: 0, count: 2 }
        );
        assert_eq!(read_all(&mut rxw), vec![2, 3]);
    }

    #[test]
    fn confirm_leaves_lost_data() {
        let mut rxw = window(64);

        add(&mut rxw, 0);
        add(&mut rxw, 3);
        rxw.lost(1);

        assert_eq!(
            rxw.confirm(1, NAK_RDATA_EXPIRY, NAK_RB_EXPIRY),
            ConfirmResult::Duplicate
        );
        assert_eq!(rxw.state(1), Some(PktState::LostData));
        assert_eq!(rxw.timer_expiry(1), None);

        rxw.lost(1);
        assert_eq!(rxw.stats().lost_count, 1);
        assert_eq!(rxw.stats().cumulative_losses, 1);
    }
}
