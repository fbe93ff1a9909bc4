/*!
Packet-relay engine of the mixnet.

Builds, relays and delivers fixed-size onion packets over circuits of
one to seven hops. The wire formats live in `mixnet_packet`; this crate
holds the state machines around them: the onion codec, the replay
guard, the delay scheduler, the circuit builder, the batch pipeline,
the transport adapter and the orchestration bridge.
*/

#![forbid(unsafe_code)]

pub mod bridge;
pub mod circuit;
pub mod delay;
pub mod directory;
pub mod onion;
pub mod pipeline;
pub mod replay;
pub mod stats;
pub mod time;
pub mod transport;
