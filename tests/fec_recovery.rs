#[allow(dead_code)]
mod common;

use common::Network;

use pgm_engine::packet::{Datagram, Packet, PacketType};
use pgm_engine::{Config, FecConfig, Session};

const PACKET_COUNT: usize = 8;

fn fec_config(config: Config, proactive_h: u32, ondemand: bool) -> Config {
    Config {
        fec: Some(FecConfig {
            rs_n: 5,
            rs_k: 4,
            proactive_h,
            ondemand,
        }),
        ..config
    }
}

fn drops_odata(sqns: &'static [u32]) -> impl Fn(usize, &Datagram) -> bool + Send + Sync + 'static {
    move |_: usize, datagram: &Datagram| {
        matches!(datagram.packet, Packet::Odata(data) if sqns.contains(&data.sqn))
    }
}

#[test]
fn proactive_parity() {
    let network = Network::new();
    let source = Session::new(fec_config(common::config(1), 1, false), network.join()).unwrap();
    let receiver =
        Session::new(fec_config(common::receiver_config(2), 1, false), network.join()).unwrap();
    let sessions = [&source, &receiver];

    // One loss in each transmission group
    network.set_filter(drops_odata(&[1, 5]));

    let payloads: Vec<Vec<u8>> = (0..PACKET_COUNT).map(common::payload).collect();
    for payload in &payloads {
        source.send(payload, 0, false).unwrap();
    }
    network.pump(&sessions, 0);

    assert_eq!(common::events(&receiver).len(), 1);

    // Parity goes out with the first dispatch
    source.dispatch(0);
    network.pump(&sessions, 0);

    let received = common::data_payloads(&common::events(&receiver));
    assert_eq!(common::digest(&received), common::digest(&payloads[1..]));

    assert_eq!(network.sent(0, PacketType::Rdata), 2);
    assert_eq!(network.sent(1, PacketType::Nak), 0);

    let stats = receiver.peer_stats(&source.tsi()).unwrap();
    assert_eq!(stats.fec_recovered, 2);
    assert_eq!(stats.msgs_delivered, PACKET_COUNT as u64);
}

#[test]
fn ondemand_parity() {
    let network = Network::new();
    let source = Session::new(fec_config(common::config(1), 0, true), network.join()).unwrap();
    let receiver = Session::new(
        Config {
            nak_bo_ivl: 100,
            ..fec_config(common::receiver_config(2), 0, true)
        },
        network.join(),
    )
    .unwrap();
    let sessions = [&source, &receiver];

    network.set_filter(drops_odata(&[1]));

    source.dispatch(0);
    let payloads: Vec<Vec<u8>> = (0..PACKET_COUNT).map(common::payload).collect();
    for payload in &payloads {
        source.send(payload, 0, false).unwrap();
    }
    network.pump(&sessions, 0);

    assert_eq!(common::events(&receiver).len(), 1);

    receiver.dispatch(100);
    network.pump(&sessions, 100);
    source.dispatch(100);
    network.pump(&sessions, 100);

    let received = common::data_payloads(&common::events(&receiver));
    assert_eq!(common::digest(&received), common::digest(&payloads[1..]));

    assert_eq!(network.sent(1, PacketType::Nak), 1);
    assert_eq!(network.sent(0, PacketType::Ncf), 1);
    assert_eq!(network.sent(0, PacketType::Rdata), 1);

    let stats = receiver.peer_stats(&source.tsi()).unwrap();
    assert_eq!(stats.fec_recovered, 1);
}
