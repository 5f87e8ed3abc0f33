use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::{Destination, Epoch, Transport};
use crate::config::Config;
use crate::error::SendError;
use crate::fec::FecCodec;
use crate::packet::{self, serial::DATA_OFFSET, DataPacket, Datagram, Nak, Packet, Spm};
use crate::rate::{self, RateBucket};
use crate::skb::{SkBuff, Tsi};
use crate::sqn::Sqn;
use crate::txw::{Edges, Retransmit, TransmitWindow};

/// SPM timing: an ambient interval, plus a heartbeat schedule restarted by every data packet.
struct SpmSchedule {
    spm_sqn: Sqn,
    ambient_interval: u64,
    heartbeat_intervals: Vec<u64>,
    next_ambient: u64,
    // Index of the next heartbeat interval, and the pending heartbeat's expiry
    heartbeat: Option<(usize, u64)>,
}

impl SpmSchedule {
    fn new(config: &Config) -> Self {
        Self {
            spm_sqn: 0,
            ambient_interval: config.spm_ambient_interval,
            heartbeat_intervals: config.spm_heartbeat_intervals.clone(),
            // Announce the source on the first dispatch
            next_ambient: 0,
            heartbeat: None,
        }
    }

    fn reset_heartbeat(&mut self, now: u64) {
        self.heartbeat = self
            .heartbeat_intervals
            .first()
            .map(|&interval| (1, now + interval));
    }

    fn next_expiry(&self) -> u64 {
        match self.heartbeat {
            Some((_, expiry)) => expiry.min(self.next_ambient),
            None => self.next_ambient,
        }
    }

    /// Returns true if an SPM is due at `now`, advancing the schedule.
    fn poll(&mut self, now: u64) -> bool {
        let mut due = false;

        if now >= self.next_ambient {
            self.next_ambient = now + self.ambient_interval;
            due = true;
        }

        // One SPM covers both timers when they coincide
        if let Some((index, expiry)) = self.heartbeat {
            if now >= expiry {
                self.heartbeat = self
                    .heartbeat_intervals
                    .get(index)
                    .map(|&interval| (index + 1, now + interval));
                due = true;
            }
        }

        due
    }

    fn next_spm_sqn(&mut self) -> Sqn {
        let spm_sqn = self.spm_sqn;
        self.spm_sqn = spm_sqn.wrapping_add(1);
        spm_sqn
    }
}

/// Sending half of a session.
pub(super) struct Source {
    tsi: Tsi,
    dport: u16,
    max_tsdu: usize,
    proactive_h: u32,
    txw: Mutex<TransmitWindow>,
    edges: Arc<Edges>,
    // Every packet sent, shared with the receive side
    rate: Arc<RateBucket>,
    // Repairs only
    rdata_rate: RateBucket,
    spm: Mutex<SpmSchedule>,
    // Earliest time a rate-limited repair may be retried
    rdata_blocked_until: AtomicU64,
}

impl Source {
    pub fn new(
        config: &Config,
        epoch: Epoch,
        rate: Arc<RateBucket>,
        codec: Option<Box<dyn FecCodec>>,
    ) -> Self {
        let txw = TransmitWindow::new(
            config.tsi,
            config.max_tpdu,
            config.txw_sqns,
            config.txw_secs,
            config.txw_max_rte,
            codec,
        );
        let edges = txw.edges();

        Self {
            tsi: config.tsi,
            dport: config.dport,
            max_tsdu: config.max_tsdu(),
            proactive_h: config.fec.as_ref().map_or(0, |fec| fec.proactive_h),
            txw: Mutex::new(txw),
            edges,
            rate,
            rdata_rate: RateBucket::new(
                config.rdata_rate_per_sec,
                config.iphdr_len,
                config.max_tpdu,
                epoch,
            ),
            spm: Mutex::new(SpmSchedule::new(config)),
            rdata_blocked_until: AtomicU64::new(0),
        }
    }

    pub fn lead(&self) -> Sqn {
        self.edges.lead()
    }

    pub fn trail(&self) -> Sqn {
        self.edges.trail()
    }

    pub fn txw(&self) -> &Mutex<TransmitWindow> {
        &self.txw
    }

    fn datagram<'a>(&self, packet: Packet<'a>) -> Datagram<'a> {
        Datagram {
            tsi: self.tsi,
            dport: self.dport,
            packet,
        }
    }

    /// Sends `payload` as original data. Returns the sequence number assigned.
    pub fn send(
        &self,
        transport: &dyn Transport,
        payload: &[u8],
        now: u64,
        allow_block: bool,
    ) -> Result<Sqn, SendError> {
        if payload.len() > self.max_tsdu {
            return Err(SendError::MessageTooLarge {
                len: payload.len(),
                max: self.max_tsdu,
            });
        }

        let tpdu_len = DATA_OFFSET + payload.len();
        if allow_block {
            self.rate.check(tpdu_len, true)?;
        } else {
            self.rate.try_check(tpdu_len, now)?;
        }

        let skb = SkBuff::allocate(payload.len());
        skb.append(payload);

        let (sqn, trail) = {
            let mut txw = self.txw.lock();
            let sqn = txw.add(skb, now);

            if self.proactive_h > 0 {
                if let Some(mask) = txw.group_mask() {
                    if mask.is_last_of_group(sqn) {
                        txw.retransmit_push(mask.tg_sqn(sqn) | self.proactive_h, true);
                    }
                }
            }

            (sqn, txw.trail())
        };

        self.spm.lock().reset_heartbeat(now);

        let bytes = packet::write(&self.datagram(Packet::Odata(DataPacket {
            sqn,
            trail,
            parity: false,
            var_pktlen: false,
            payload,
        })));
        transport.send(&bytes, Destination::Group)?;

        trace!(sqn, len = payload.len(), "sent odata");

        Ok(sqn)
    }

    fn send_spm(&self, transport: &dyn Transport, spm_sqn: Sqn) {
        let spm = Spm {
            spm_sqn,
            trail: self.trail(),
            lead: self.lead(),
        };

        let bytes = packet::write(&self.datagram(Packet::Spm(spm)));
        if let Err(err) = transport.send(&bytes, Destination::Group) {
            warn!(%err, "failed to send spm");
            return;
        }

        debug!(spm_sqn, trail = spm.trail, lead = spm.lead, "sent spm");
    }

    /// Answers a repair request. Sequence numbers still held are confirmed with an NCF and queued
    /// for repair. Requests for evicted data are answered with an SPM so that receivers learn the
    /// current trailing edge.
    pub fn on_nak(&self, transport: &dyn Transport, nak: &Nak) {
        let mut confirmed = Vec::with_capacity(nak.sqns.len());
        let mut evicted = false;

        {
            let mut txw = self.txw.lock();
            let mask = txw.group_mask();

            for &sqn in &nak.sqns {
                let held = match (nak.parity, mask) {
                    (true, Some(mask)) => txw.peek(mask.tg_sqn(sqn)).is_some(),
                    (true, None) => false,
                    (false, _) => txw.peek(sqn).is_some(),
                };

                if held {
                    txw.retransmit_push(sqn, nak.parity);
                    confirmed.push(sqn);
                } else {
                    evicted = true;
                }
            }
        }

        debug!(
            sqns = ?nak.sqns,
            parity = nak.parity,
            confirmed = confirmed.len(),
            "received nak"
        );

        if !confirmed.is_empty() {
            let bytes = packet::write(&self.datagram(Packet::Ncf(Nak {
                sqns: confirmed,
                parity: nak.parity,
            })));
            if let Err(err) = transport.send(&bytes, Destination::Group) {
                warn!(%err, "failed to send ncf");
            }
        }

        if evicted {
            let spm_sqn = self.spm.lock().next_spm_sqn();
            self.send_spm(transport, spm_sqn);
        }
    }

    /// Answers a request for an SPM.
    pub fn on_spmr(&self, transport: &dyn Transport) {
        debug!("received spmr");

        let spm_sqn = self.spm.lock().next_spm_sqn();
        self.send_spm(transport, spm_sqn);
    }

    // Sends queued repairs until the queue is empty or the rate limit is reached
    fn drain_retransmits(&self, transport: &dyn Transport, now: u64) {
        if now < self.rdata_blocked_until.load(Ordering::Acquire) {
            return;
        }

        loop {
            let (retransmit, trail) = {
                let mut txw = self.txw.lock();

                let Some(retransmit) = txw.retransmit_try_peek() else {
                    return;
                };

                let tpdu_len = DATA_OFFSET + retransmit.skb().len();
                if rate::try_check_pair(&self.rate, &self.rdata_rate, tpdu_len, now).is_err() {
                    let wait = self
                        .rate
                        .remaining(tpdu_len, now)
                        .max(self.rdata_rate.remaining(tpdu_len, now))
                        .max(1);
                    self.rdata_blocked_until.store(now + wait, Ordering::Release);

                    trace!(sqn = retransmit.sequence(), wait, "rdata rate limited");
                    return;
                }

                txw.retransmit_remove_head();
                (retransmit, txw.trail())
            };

            let (parity, var_pktlen) = match &retransmit {
                Retransmit::Selective(_) => (false, false),
                Retransmit::Parity { var_pktlen, .. } => (true, *var_pktlen),
            };

            let payload = retransmit.skb().to_vec();
            let bytes = packet::write(&self.datagram(Packet::Rdata(DataPacket {
                sqn: retransmit.sequence(),
                trail,
                parity,
                var_pktlen,
                payload: &payload,
            })));

            if let Err(err) = transport.send(&bytes, Destination::Group) {
                warn!(%err, "failed to send rdata");
                return;
            }

            debug!(sqn = retransmit.sequence(), parity, "sent rdata");
        }
    }

    /// Sends due repairs and SPMs.
    pub fn dispatch(&self, transport: &dyn Transport, now: u64) {
        self.drain_retransmits(transport, now);

        let spm_sqn = {
            let mut spm = self.spm.lock();
            if spm.poll(now) {
                Some(spm.next_spm_sqn())
            } else {
                None
            }
        };

        if let Some(spm_sqn) = spm_sqn {
            self.send_spm(transport, spm_sqn);
        }
    }

    /// Time of the next scheduled SPM or repair.
    pub fn next_deadline(&self) -> u64 {
        let spm_expiry = self.spm.lock().next_expiry();

        if self.txw.lock().retransmit_is_empty() {
            spm_expiry
        } else {
            spm_expiry.min(self.rdata_blocked_until.load(Ordering::Acquire))
        }
    }
}
