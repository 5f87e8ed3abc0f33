use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use pgm_engine::packet::{self, Datagram, PacketType};
use pgm_engine::{Config, Destination, Event, Session, Transport, Tsi};

type Filter = Box<dyn Fn(usize, &Datagram) -> bool + Send + Sync>;

#[derive(Default)]
struct NetworkState {
    // One queue per member, in join order
    inboxes: Vec<VecDeque<Vec<u8>>>,
    // Every packet offered to the network, dropped or not
    log: Vec<(usize, PacketType)>,
}

/// An in-memory multicast segment. Every packet sent by a member is queued for every other member
/// and only delivered by `pump`, so that no session ever handles a packet while another is still
/// sending.
#[derive(Default)]
pub struct Network {
    state: Mutex<NetworkState>,
    filter: Mutex<Option<Filter>>,
}

pub struct LoopbackTransport {
    network: Arc<Network>,
    id: usize,
}

impl Transport for LoopbackTransport {
    fn send(&self, bytes: &[u8], _dest: Destination) -> std::io::Result<()> {
        self.network.transmit(self.id, bytes);
        Ok(())
    }
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a member. Members must be passed to `pump` in the order they joined.
    pub fn join(self: &Arc<Self>) -> Arc<LoopbackTransport> {
        let mut state = self.state.lock();
        state.inboxes.push(VecDeque::new());

        Arc::new(LoopbackTransport {
            network: Arc::clone(self),
            id: state.inboxes.len() - 1,
        })
    }

    /// Drops every packet for which `filter` returns true. The filter receives the sender's id.
    pub fn set_filter<F>(&self, filter: F)
    where
        F: Fn(usize, &Datagram) -> bool + Send + Sync + 'static,
    {
        *self.filter.lock() = Some(Box::new(filter));
    }

    pub fn clear_filter(&self) {
        *self.filter.lock() = None;
    }

    fn transmit(&self, from: usize, bytes: &[u8]) {
        let datagram = packet::read(bytes).expect("malformed packet on the wire");

        let mut state = self.state.lock();
        state.log.push((from, datagram.packet.packet_type()));

        if let Some(filter) = self.filter.lock().as_ref() {
            if filter(from, &datagram) {
                return;
            }
        }

        for (id, inbox) in state.inboxes.iter_mut().enumerate() {
            if id != from {
                inbox.push_back(bytes.to_vec());
            }
        }
    }

    /// Delivers queued packets at time `now` until every inbox is empty. Returns the number of
    /// packets delivered.
    pub fn pump(&self, sessions: &[&Session], now: u64) -> usize {
        let mut count = 0;

        loop {
            let mut delivered = false;

            for (id, session) in sessions.iter().enumerate() {
                let next = self.state.lock().inboxes[id].pop_front();

                if let Some(bytes) = next {
                    session.handle_packet(&bytes, now);
                    delivered = true;
                    count += 1;
                }
            }

            if !delivered {
                return count;
            }
        }
    }

    /// Number of packets of type `packet_type` sent by member `from`.
    pub fn sent(&self, from: usize, packet_type: PacketType) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|&&entry| entry == (from, packet_type))
            .count()
    }
}

pub fn config(id: u8) -> Config {
    Config {
        tsi: Tsi::new([10, 0, 0, 0, 0, id], 1000 + id as u16),
        txw_sqns: 64,
        rxw_sqns: 64,
        ..Default::default()
    }
}

pub fn receiver_config(id: u8) -> Config {
    Config {
        can_send_data: false,
        ..config(id)
    }
}

/// Deterministic payload of varying length.
pub fn payload(i: usize) -> Vec<u8> {
    (0..100 + i * 7).map(|j| (i * 31 + j) as u8).collect()
}

pub fn events(session: &Session) -> Vec<Event> {
    std::iter::from_fn(|| session.recv()).collect()
}

/// Payloads of every `Event::Data` in `events`, panicking on anything else.
pub fn data_payloads(events: &[Event]) -> Vec<Vec<u8>> {
    events
        .iter()
        .map(|event| match event {
            Event::Data { payload, .. } => payload.to_vec(),
            _ => panic!("expected data, got {:?}", event),
        })
        .collect()
}

pub fn digest<'a, I>(payloads: I) -> md5::Digest
where
    I: IntoIterator<Item = &'a Vec<u8>>,
{
    let mut ctx = md5::Context::new();
    for payload in payloads {
        ctx.consume(payload);
    }
    ctx.compute()
}
