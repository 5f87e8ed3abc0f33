/*

# Overview

A session multicasts a stream of sequenced data packets (ODATA) to a group. Receivers detect gaps in
the sequence and ask for repairs with NAKs sent back to the source. The source acknowledges each NAK
with a multicast NCF, which also suppresses duplicate NAKs from other receivers, and then
retransmits the missing packets as RDATA. Data is delivered to the application strictly in sequence
order; anything that cannot be repaired is reported as a loss and skipped.

# Windows

The source keeps every packet it sent in a transmit window bounded by a packet count, a duration
times a rate, or both. Packets which fall off the trailing edge can no longer be repaired. The edges
of the window are advertised in periodic SPMs so that receivers can tell a late packet from one that
is gone for good.

The receive window holds packets between the source's trailing edge and the most recent sequence
number seen. A slot for a missing packet walks through the following states:

  BackOff -> WaitNcf -> WaitData -> HaveData -> CommitData
     ^          |          |
     +----------+----------+ (timeout, until a retry ceiling is reached, then LostData)

A NAK is only sent after a random back-off in [1, nak_bo_ivl], which is what lets a single NCF
suppress the NAKs of every other receiver that lost the same packet.

# SPM schedule

After each data packet, SPMs are sent at a series of increasing heartbeat intervals, so that loss of
the last packet in a burst is detected quickly. When the heartbeat series is exhausted, or no data is
being sent, SPMs continue at the ambient interval.

# Message size

Each message travels in a single data packet. A payload larger than `Config::max_tsdu()` is
rejected with `SendError::MessageTooLarge`; messages are never fragmented across packets.

# Forward error correction

With FEC enabled, packets are organized into transmission groups of k source packets. The source may
send h parity packets after every group (proactive parity), and receivers may ask for parity instead
of selective repairs (on-demand parity). Any parity packet can stand in for any missing packet of
its group, so a single RDATA may repair different losses at different receivers.

# Throttling algorithm

Sends are throttled by a leaky bucket. The bucket holds up to one second's worth of tokens, or one
millisecond's at rates of at least one maximum-size packet per millisecond. Every packet is charged
its size plus the configured IP header length. Repairs are charged against both the session bucket
and a separate RDATA bucket.

*/

pub mod config;
pub mod coordinator;
pub mod error;
pub mod fec;
mod notify;
pub mod packet;
pub mod rate;
pub mod rxw;
pub mod session;
pub mod skb;
pub mod socket;
pub mod sqn;
pub mod txw;

pub use config::{Config, FecConfig};
pub use coordinator::Coordinator;
pub use error::{Error, Result, SendError};
pub use session::{Destination, Event, Session, Transport};
pub use skb::Tsi;
pub use socket::{UdpReceiver, UdpTransport};
pub use sqn::Sqn;
