//! The protocol engine.
//!
//! A [`Session`] is both a data source and a receiver for any number of remote sources. Inbound
//! datagrams are handed to [`Session::handle_packet`], and time-driven work (repairs, NAKs, SPMs,
//! peer expiry) happens in [`Session::dispatch`]. [`Session::next_deadline`] reports when
//! `dispatch` next has work to do, so a single thread can sleep on it; see
//! [`Coordinator`](crate::coordinator::Coordinator).
//!
//! The session performs no I/O of its own. Outbound packets go through a [`Transport`].

mod epoch;
mod peer;
mod source;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{info, warn};

use crate::config::{Config, FecConfig};
use crate::error::{Result, SendError};
use crate::fec::{FecCodec, XorParity};
use crate::notify::Notify;
use crate::packet::{self, Packet};
use crate::rate::RateBucket;
use crate::rxw::RxwStats;
use crate::skb::Tsi;
use crate::sqn::Sqn;

pub use epoch::Epoch;

use peer::{Peer, PeerContext};
use source::Source;

/// Where an outbound packet is headed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Destination {
    /// Every member of the session.
    Group,
    /// The named data source.
    Source(Tsi),
}

/// Datagram substrate for a session.
pub trait Transport: Send + Sync {
    fn send(&self, bytes: &[u8], dest: Destination) -> std::io::Result<()>;
}

/// Represents a session event.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    /// Data from a remote source, delivered in sequence order.
    Data {
        tsi: Tsi,
        sequence: Sqn,
        payload: Box<[u8]>,
    },
    /// `count` packets from a remote source, starting at `first`, could not be recovered.
    Loss { tsi: Tsi, first: Sqn, count: u32 },
    /// A remote source went silent and was forgotten.
    PeerExpired(Tsi),
}

/// Constructs the FEC codec for a configuration.
pub type CodecFactory = fn(&FecConfig) -> Box<dyn FecCodec>;

fn xor_parity(fec: &FecConfig) -> Box<dyn FecCodec> {
    Box::new(XorParity::new(fec.rs_k as usize))
}

pub struct Session {
    // Saved configuration
    config: Config,
    // Source of integer timestamps
    epoch: Epoch,
    // Outbound packet sink
    transport: Arc<dyn Transport>,
    codec_factory: CodecFactory,
    // Shared by everything the session sends
    rate: Arc<RateBucket>,
    // Present when the session sends data
    source: Option<Source>,
    // Table of remote sources
    peers: RwLock<HashMap<Tsi, Arc<Peer>>>,
    // Queue of pending events
    events: Mutex<VecDeque<Event>>,
    events_ready: Condvar,
    // Wakes a coordinator whenever new timers may have been armed
    notify: Notify,
}

impl Session {
    /// Creates a session using the built-in single-parity codec when FEC is enabled.
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::with_codec(config, transport, xor_parity)
    }

    /// Creates a session whose FEC codec is built by `codec_factory`.
    pub fn with_codec(
        config: Config,
        transport: Arc<dyn Transport>,
        codec_factory: CodecFactory,
    ) -> Result<Self> {
        config.validate();

        let epoch = Epoch::new();
        let notify = Notify::new()?;

        let rate = Arc::new(RateBucket::new(
            config.rate_per_sec,
            config.iphdr_len,
            config.max_tpdu,
            epoch,
        ));

        let source = if config.can_send_data {
            let codec = config.fec.as_ref().map(codec_factory);
            Some(Source::new(&config, epoch, Arc::clone(&rate), codec))
        } else {
            None
        };

        info!(tsi = %config.tsi, dport = config.dport, "session created");

        Ok(Self {
            config,
            epoch,
            transport,
            codec_factory,
            rate,
            source,
            peers: Default::default(),
            events: Default::default(),
            events_ready: Condvar::new(),
            notify,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tsi(&self) -> Tsi {
        self.config.tsi
    }

    /// Current time on the session's clock, in microseconds.
    pub fn now(&self) -> u64 {
        self.epoch.time_now_us()
    }

    pub(crate) fn notify(&self) -> &Notify {
        &self.notify
    }

    /// Leading edge of the transmit window, readable without locking it.
    pub fn txw_lead(&self) -> Option<Sqn> {
        self.source.as_ref().map(Source::lead)
    }

    /// Trailing edge of the transmit window, readable without locking it.
    pub fn txw_trail(&self) -> Option<Sqn> {
        self.source.as_ref().map(Source::trail)
    }

    /// Number of repairs waiting to be sent.
    pub fn retransmit_len(&self) -> usize {
        self.source
            .as_ref()
            .map_or(0, |source| source.txw().lock().retransmit_len())
    }

    /// Receive statistics for a remote source.
    pub fn peer_stats(&self, tsi: &Tsi) -> Option<RxwStats> {
        self.peers.read().get(tsi).map(|peer| peer.stats())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Sends `payload` as a single data packet. When `allow_block` is set, the call waits for the
    /// rate limit instead of failing with [`SendError::WouldBlock`].
    ///
    /// Panics if the session was configured not to send data.
    pub fn send(
        &self,
        payload: &[u8],
        now: u64,
        allow_block: bool,
    ) -> std::result::Result<Sqn, SendError> {
        let source = match self.source.as_ref() {
            Some(source) => source,
            None => panic!("send on a session configured with can_send_data == false"),
        };

        let sqn = source.send(&*self.transport, payload, now, allow_block)?;

        // The heartbeat schedule was reset
        self.notify.notify();

        Ok(sqn)
    }

    fn find_or_create_peer(&self, tsi: Tsi, now: u64) -> Arc<Peer> {
        if let Some(peer) = self.peers.read().get(&tsi) {
            return Arc::clone(peer);
        }

        let mut peers = self.peers.write();
        let peer = peers.entry(tsi).or_insert_with(|| {
            let codec = self.config.fec.as_ref().map(self.codec_factory);
            Arc::new(Peer::new(tsi, &self.config, codec, now))
        });

        Arc::clone(peer)
    }

    fn find_peer(&self, tsi: &Tsi) -> Option<Arc<Peer>> {
        self.peers.read().get(tsi).map(Arc::clone)
    }

    fn push_events(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }

        self.events.lock().extend(events);
        self.events_ready.notify_all();
    }

    fn peer_context<'a>(&'a self, events: &'a mut Vec<Event>) -> PeerContext<'a> {
        PeerContext {
            config: &self.config,
            rate: &self.rate,
            transport: &*self.transport,
            events,
        }
    }

    /// Processes one inbound datagram received at time `now`. Malformed datagrams and datagrams
    /// for other sessions are discarded.
    pub fn handle_packet(&self, bytes: &[u8], now: u64) {
        let datagram = match packet::read(bytes) {
            Ok(datagram) => datagram,
            Err(err) => {
                warn!(%err, len = bytes.len(), "discarding malformed packet");
                return;
            }
        };

        if datagram.dport != self.config.dport {
            return;
        }

        let is_local = datagram.tsi == self.config.tsi;
        let mut events = Vec::new();

        match (&datagram.packet, is_local) {
            (Packet::Nak(nak), true) => {
                if let Some(source) = &self.source {
                    source.on_nak(&*self.transport, nak);
                }
            }
            (Packet::Spmr, true) => {
                if let Some(source) = &self.source {
                    source.on_spmr(&*self.transport);
                }
            }
            (Packet::Spmr, false) => {
                if let Some(peer) = self.find_peer(&datagram.tsi) {
                    peer.on_spmr();
                }
            }
            (Packet::Spm(spm), false) if self.config.can_recv_data => {
                let peer = self.find_or_create_peer(datagram.tsi, now);
                peer.on_spm(&mut self.peer_context(&mut events), spm, now);
            }
            (Packet::Odata(data) | Packet::Rdata(data), false) if self.config.can_recv_data => {
                let peer = self.find_or_create_peer(datagram.tsi, now);
                peer.on_data(&mut self.peer_context(&mut events), data, now);
            }
            (Packet::Ncf(ncf), false) => {
                if let Some(peer) = self.find_peer(&datagram.tsi) {
                    peer.on_ncf(&mut self.peer_context(&mut events), ncf, now);
                }
            }
            _ => return,
        }

        self.push_events(events);

        // New timers may be due earlier than the coordinator expects
        self.notify.notify();
    }

    /// Performs all work due at time `now`: sends queued repairs and scheduled SPMs, advances
    /// every expired repair timer, and forgets silent peers.
    pub fn dispatch(&self, now: u64) {
        if let Some(source) = &self.source {
            source.dispatch(&*self.transport, now);
        }

        let peers: Vec<Arc<Peer>> = self.peers.read().values().map(Arc::clone).collect();
        let mut events = Vec::new();

        for peer in peers {
            peer.dispatch(&mut self.peer_context(&mut events), now);

            if peer.is_expired(now) {
                self.peers.write().remove(&peer.tsi());
                info!(tsi = %peer.tsi(), "peer expired");
                events.push(Event::PeerExpired(peer.tsi()));
            }
        }

        self.push_events(events);
    }

    /// Time at which `dispatch` next has work to do, or `None` if nothing is scheduled.
    pub fn next_deadline(&self) -> Option<u64> {
        let source = self.source.as_ref().map(Source::next_deadline);
        let peers = self
            .peers
            .read()
            .values()
            .map(|peer| peer.next_deadline())
            .min();

        source.into_iter().chain(peers).min()
    }

    /// Returns the next event, if any.
    pub fn recv(&self) -> Option<Event> {
        self.events.lock().pop_front()
    }

    /// Returns the next event, waiting up to `timeout` for one to arrive.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Event> {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock();

        loop {
            if let Some(event) = events.pop_front() {
                return Some(event);
            }

            if self
                .events_ready
                .wait_until(&mut events, deadline)
                .timed_out()
            {
                return events.pop_front();
            }
        }
    }
}
