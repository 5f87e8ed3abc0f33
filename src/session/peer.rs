use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, trace, warn};

use super::{Destination, Event, Transport};
use crate::config::Config;
use crate::fec::FecCodec;
use crate::packet::{self, DataPacket, Datagram, Nak, Packet, Spm, NAK_LIST_MAX};
use crate::rate::RateBucket;
use crate::rxw::{AddResult, PktState, ReadOutcome, ReceiveWindow, RxwStats};
use crate::skb::{SkBuff, Tsi};
use crate::sqn::{self, GroupMask, Sqn};

/// Everything a peer needs from its session while handling a packet or a timer.
pub(super) struct PeerContext<'a> {
    pub config: &'a Config,
    // Charged for every NAK
    pub rate: &'a RateBucket,
    pub transport: &'a dyn Transport,
    // Events produced for the application
    pub events: &'a mut Vec<Event>,
}

struct PeerState {
    rxw: ReceiveWindow,
    // Liveness deadline, refreshed by SPMs and data
    expiry: u64,
    // Set until an SPM is seen
    spmr_expiry: Option<u64>,
    // Most recent SPM, used to discard reordered SPMs
    spm_sqn: Option<Sqn>,
    ondemand_parity: bool,
    // Earliest time a rate-limited NAK may be retried
    nak_blocked_until: u64,
}

/// Receiving half of a session for one remote source.
pub(super) struct Peer {
    tsi: Tsi,
    state: Mutex<PeerState>,
}

/// Random NAK back-off, uniform in `[1, nak_bo_ivl]`.
fn nak_rb_ivl(config: &Config) -> u64 {
    rand::thread_rng().gen_range(1..=config.nak_bo_ivl)
}

impl Peer {
    pub fn new(tsi: Tsi, config: &Config, codec: Option<Box<dyn FecCodec>>, now: u64) -> Self {
        let rxw = ReceiveWindow::new(
            tsi,
            config.max_tpdu - packet::serial::DATA_OFFSET,
            config.rxw_sqns,
            config.rxw_secs,
            config.rxw_max_rte,
            codec,
        );

        let ondemand_parity = config.fec.as_ref().map_or(false, |fec| fec.ondemand);

        debug!(%tsi, "new peer");

        Self {
            tsi,
            state: Mutex::new(PeerState {
                rxw,
                expiry: now + config.peer_expiry,
                spmr_expiry: Some(now + config.spmr_expiry),
                spm_sqn: None,
                ondemand_parity,
                nak_blocked_until: 0,
            }),
        }
    }

    pub fn tsi(&self) -> Tsi {
        self.tsi
    }

    pub fn stats(&self) -> RxwStats {
        self.state.lock().rxw.stats()
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.state.lock().expiry
    }

    /// Earliest time at which `dispatch` has work to do.
    pub fn next_deadline(&self) -> u64 {
        let state = self.state.lock();
        let rxw = &state.rxw;

        let backoff = rxw
            .state_expiry(PktState::BackOff)
            .map(|expiry| expiry.max(state.nak_blocked_until));

        [
            Some(state.expiry),
            state.spmr_expiry,
            backoff,
            rxw.state_expiry(PktState::WaitNcf),
            rxw.state_expiry(PktState::WaitData),
        ]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(state.expiry)
    }

    fn send(&self, ctx: &PeerContext, packet: Packet) -> bool {
        let bytes = packet::write(&Datagram {
            tsi: self.tsi,
            dport: ctx.config.dport,
            packet,
        });

        match ctx.transport.send(&bytes, Destination::Source(self.tsi)) {
            Ok(()) => true,
            Err(err) => {
                warn!(tsi = %self.tsi, %err, "failed to send to source");
                false
            }
        }
    }

    pub fn on_spm(&self, ctx: &mut PeerContext, spm: &Spm, now: u64) {
        let mut state = self.state.lock();

        if let Some(last) = state.spm_sqn {
            if !sqn::gt(spm.spm_sqn, last) {
                trace!(tsi = %self.tsi, spm_sqn = spm.spm_sqn, "discarding stale spm");
                return;
            }
        }

        state.spm_sqn = Some(spm.spm_sqn);
        state.expiry = now + ctx.config.peer_expiry;
        state.spmr_expiry = None;

        let created = state
            .rxw
            .update(spm.lead, spm.trail, now + nak_rb_ivl(ctx.config));

        trace!(
            tsi = %self.tsi,
            spm_sqn = spm.spm_sqn,
            lead = spm.lead,
            trail = spm.trail,
            created,
            "received spm"
        );

        state.drain(self.tsi, ctx.events);
    }

    pub fn on_data(&self, ctx: &mut PeerContext, data: &DataPacket, now: u64) {
        let mut state = self.state.lock();

        state.expiry = now + ctx.config.peer_expiry;

        let skb = SkBuff::from_bytes(data.payload);
        skb.set_tsi(self.tsi);
        skb.set_sequence(data.sqn);
        skb.set_tstamp(now);

        let nak_rb_expiry = now + nak_rb_ivl(ctx.config);

        let result = if data.parity {
            state
                .rxw
                .add_parity(skb, data.trail, data.var_pktlen, nak_rb_expiry)
        } else {
            state.rxw.add(skb, data.trail, nak_rb_expiry)
        };

        match result {
            AddResult::Malformed => {
                warn!(tsi = %self.tsi, sqn = data.sqn, len = data.payload.len(), "discarding oversized data")
            }
            _ => trace!(tsi = %self.tsi, sqn = data.sqn, parity = data.parity, ?result, "received data"),
        }

        state.drain(self.tsi, ctx.events);
    }

    /// Processes a NAK confirmation: the repair is on its way, so NAKs for the confirmed sequence
    /// numbers are suppressed.
    pub fn on_ncf(&self, ctx: &mut PeerContext, ncf: &Nak, now: u64) {
        let mut state = self.state.lock();

        let nak_rdata_expiry = now + ctx.config.nak_rdata_ivl;
        let nak_rb_expiry = now + nak_rb_ivl(ctx.config);

        for &sqn in &ncf.sqns {
            if ncf.parity {
                let Some(mask) = state.rxw.group_mask() else {
                    continue;
                };

                let tg_sqn = mask.tg_sqn(sqn);
                for i in 0..mask.group_size() {
                    let sqn = tg_sqn.wrapping_add(i);
                    if matches!(
                        state.rxw.state(sqn),
                        Some(PktState::BackOff | PktState::WaitNcf | PktState::WaitData)
                    ) {
                        state.rxw.confirm(sqn, nak_rdata_expiry, nak_rb_expiry);
                    }
                }
            } else {
                let result = state.rxw.confirm(sqn, nak_rdata_expiry, nak_rb_expiry);
                trace!(tsi = %self.tsi, sqn, ?result, "received ncf");
            }
        }

        state.drain(self.tsi, ctx.events);
    }

    /// Another receiver solicited an SPM on our behalf.
    pub fn on_spmr(&self) {
        self.state.lock().spmr_expiry = None;
    }

    /// Runs expired timers.
    pub fn dispatch(&self, ctx: &mut PeerContext, now: u64) {
        let mut state = self.state.lock();

        if let Some(spmr_expiry) = state.spmr_expiry {
            if now >= spmr_expiry {
                if self.send(ctx, Packet::Spmr) {
                    debug!(tsi = %self.tsi, "sent spmr");
                }
                state.spmr_expiry = None;
            }
        }

        if now >= state.nak_blocked_until {
            self.nak_rb_state(&mut state, ctx, now);
        }
        self.nak_rpt_state(&mut state, ctx.config, now);
        self.nak_rdata_state(&mut state, ctx.config, now);

        state.drain(self.tsi, ctx.events);
    }

    // Parity can repair an expired slot when its group is complete and the codec covers every
    // expired slot of the group
    fn parity_group(state: &PeerState, mask: GroupMask, sqn: Sqn, now: u64) -> Option<Vec<Sqn>> {
        let tg_sqn = mask.tg_sqn(sqn);
        let tg_last = tg_sqn.wrapping_add(mask.group_size() - 1);

        if sqn::lt(state.rxw.lead(), tg_last) {
            return None;
        }

        let group: Vec<Sqn> = state
            .rxw
            .expired(PktState::BackOff, now, usize::MAX)
            .into_iter()
            .filter(|&sqn| mask.tg_sqn(sqn) == tg_sqn)
            .collect();

        if group.len() as u32 > state.rxw.parity_capacity() {
            return None;
        }

        Some(group)
    }

    // Sends NAKs for every slot whose back-off expired
    fn nak_rb_state(&self, state: &mut PeerState, ctx: &mut PeerContext, now: u64) {
        let mask = if state.ondemand_parity {
            state.rxw.group_mask()
        } else {
            None
        };

        loop {
            let Some(&first) = state.rxw.expired(PktState::BackOff, now, 1).first() else {
                break;
            };

            let parity_group = mask.and_then(|mask| Self::parity_group(state, mask, first, now));

            let (sqns, nak) = match (mask, parity_group) {
                (Some(mask), Some(group)) => {
                    let nak = Nak {
                        sqns: vec![mask.tg_sqn(first) | group.len() as u32],
                        parity: true,
                    };
                    (group, nak)
                }
                _ => {
                    let sqns = state.rxw.expired(PktState::BackOff, now, NAK_LIST_MAX);
                    let nak = Nak {
                        sqns: sqns.clone(),
                        parity: false,
                    };
                    (sqns, nak)
                }
            };

            let bytes = packet::write(&Datagram {
                tsi: self.tsi,
                dport: ctx.config.dport,
                packet: Packet::Nak(nak),
            });

            if ctx.rate.try_check(bytes.len(), now).is_err() {
                let wait = ctx.rate.remaining(bytes.len(), now).max(1);
                state.nak_blocked_until = now + wait;
                trace!(tsi = %self.tsi, wait, "nak rate limited");
                break;
            }

            for &sqn in &sqns {
                state
                    .rxw
                    .transition(sqn, PktState::WaitNcf, now + ctx.config.nak_rpt_ivl);
                if let Some(repair) = state.rxw.repair_mut(sqn) {
                    repair.nak_transmit_count += 1;
                }
            }

            if let Err(err) = ctx.transport.send(&bytes, Destination::Source(self.tsi)) {
                warn!(tsi = %self.tsi, %err, "failed to send nak");
                break;
            }

            debug!(tsi = %self.tsi, ?sqns, "sent nak");
        }
    }

    // NAKs that went unconfirmed are retried, up to the NCF retry limit
    fn nak_rpt_state(&self, state: &mut PeerState, config: &Config, now: u64) {
        while let Some(sqn) = state.rxw.first_expired(PktState::WaitNcf, now) {
            let Some(repair) = state.rxw.repair_mut(sqn) else {
                break;
            };

            repair.ncf_retry_count += 1;

            if repair.ncf_retry_count >= config.nak_ncf_retries {
                state.rxw.lost(sqn);
            } else {
                state
                    .rxw
                    .transition(sqn, PktState::BackOff, now + nak_rb_ivl(config));
            }
        }
    }

    // Confirmed repairs that never arrived are requested again, up to the data retry limit
    fn nak_rdata_state(&self, state: &mut PeerState, config: &Config, now: u64) {
        while let Some(sqn) = state.rxw.first_expired(PktState::WaitData, now) {
            let Some(repair) = state.rxw.repair_mut(sqn) else {
                break;
            };

            repair.data_retry_count += 1;

            if repair.data_retry_count >= config.nak_data_retries {
                state.rxw.lost(sqn);
            } else {
                state
                    .rxw
                    .transition(sqn, PktState::BackOff, now + nak_rb_ivl(config));
            }
        }
    }
}

impl PeerState {
    // Moves everything readable from the window into `events`
    fn drain(&mut self, tsi: Tsi, events: &mut Vec<Event>) {
        let mut skbs = Vec::new();

        loop {
            match self.rxw.readv(&mut skbs, usize::MAX) {
                ReadOutcome::Empty => break,
                ReadOutcome::Data { .. } => {
                    events.extend(skbs.drain(..).map(|skb| Event::Data {
                        tsi,
                        sequence: skb.sequence(),
                        payload: skb.to_vec().into_boxed_slice(),
                    }));
                }
                ReadOutcome::Loss { first, count } => {
                    warn!(%tsi, first, count, "unrecoverable data loss");
                    events.push(Event::Loss { tsi, first, count });
                }
            }
        }

        self.rxw.remove_commit();
    }
}
