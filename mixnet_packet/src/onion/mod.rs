/*! The fixed-size onion packet.

Every packet on the wire has exactly the same length regardless of the
number of hops, the position of the current hop in the path and the
length of the application payload, so an observer cannot distinguish
packets by size. The layered construction that fills these fields lives
in `mixnet_core::onion`.
*/

use cookie_factory::{do_gen, gen_be_u32, gen_be_u8, gen_call, gen_cond, gen_slice};
use nom::bytes::streaming::tag;
use nom::combinator::map;
use nom::number::streaming::be_u32;
use nom::IResult;

use mixnet_binary_io::*;
use mixnet_crypto::{MAC_SIZE, SEED_SIZE};

use crate::ip_port::SIZE_IPPORT;

/// Maximum number of hops a circuit can have.
pub const MAX_HOPS: usize = 7;

/// Size of one route entry inside the routing header: flag, next hop
/// address, next link id, next seed, next header MAC.
pub const SIZE_ROUTE_ENTRY: usize = 1 + SIZE_IPPORT + 4 + SEED_SIZE + MAC_SIZE;

/// Size of the routing header (`beta`). Holds `MAX_HOPS` route entries.
pub const BETA_SIZE: usize = MAX_HOPS * SIZE_ROUTE_ENTRY;

/// Size of the end-to-end payload digest checked by the exit hop.
pub const PAYLOAD_DIGEST_SIZE: usize = 16;

/// Maximum size of the application payload carried by one packet.
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// Size of the onion-encrypted payload block (`delta`): digest, length
/// prefix, payload capacity.
pub const DELTA_SIZE: usize = PAYLOAD_DIGEST_SIZE + 2 + MAX_PAYLOAD_SIZE;

/// Route entry flag: the packet should be forwarded to the next hop.
pub const ROUTE_FLAG_FORWARD: u8 = 0x01;

/// Route entry flag: this hop is the exit, deliver the payload.
pub const ROUTE_FLAG_DELIVER: u8 = 0x00;

/// Size of a serialized `MixPacket`: kind, link id, seed, header MAC,
/// routing header, payload block.
pub const MIX_PACKET_SIZE: usize = 1 + 4 + SEED_SIZE + MAC_SIZE + BETA_SIZE + DELTA_SIZE;

/// Size of the replay tag derived from a packet header.
pub const REPLAY_TAG_SIZE: usize = 32;

/// Deterministic fingerprint of a packet as seen at one hop, used for
/// duplicate detection. The same packet always produces the same tag at
/// a given hop; after a hop is peeled every header field changes, so
/// tags are not linkable across hops.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ReplayTag(pub [u8; REPLAY_TAG_SIZE]);

/** One onion-layer packet.

Each relay verifies `gamma` over `beta`, strips one layer and produces
a *new* packet of exactly the same size for the next hop; no field of
the incoming packet survives to the outgoing one.

Serialized form:

Length | Content
------ | ------
`1`    | `0x01`
`4`    | Link id (BE), link-local circuit handle at the receiving hop
`16`   | Per-packet seed
`16`   | Header MAC (`gamma`)
`392`  | Routing header (`beta`)
`1042` | Payload block (`delta`)

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MixPacket {
    /// Link-local circuit id at the receiving hop.
    pub link_id: u32,
    /// Per-packet seed the hop keys are derived from.
    pub seed: [u8; SEED_SIZE],
    /// MAC over `beta` under the hop's MAC key.
    pub gamma: [u8; MAC_SIZE],
    /// Routing header, exactly [`BETA_SIZE`] bytes.
    pub beta: Vec<u8>,
    /// Payload block, exactly [`DELTA_SIZE`] bytes.
    pub delta: Vec<u8>,
}

impl MixPacket {
    /// Replay tag of this packet as seen by the receiving hop.
    pub fn replay_tag(&self) -> ReplayTag {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.seed);
        hasher.update(&self.gamma);
        hasher.update(&self.beta);
        ReplayTag(*hasher.finalize().as_bytes())
    }
}

impl FromBytes for MixPacket {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&[0x01][..])(input)?;
        let (input, link_id) = be_u32(input)?;
        let (input, seed) = <[u8; SEED_SIZE]>::from_bytes(input)?;
        let (input, gamma) = <[u8; MAC_SIZE]>::from_bytes(input)?;
        let (input, beta) = map(nom::bytes::streaming::take(BETA_SIZE), |bytes: &[u8]| {
            bytes.to_vec()
        })(input)?;
        let (input, delta) = map(nom::bytes::streaming::take(DELTA_SIZE), |bytes: &[u8]| {
            bytes.to_vec()
        })(input)?;
        Ok((
            input,
            MixPacket {
                link_id,
                seed,
                gamma,
                beta,
                delta,
            },
        ))
    }
}

impl ToBytes for MixPacket {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_cond!(self.beta.len() != BETA_SIZE, |buf| gen_error(buf, 0)) >>
            gen_cond!(self.delta.len() != DELTA_SIZE, |buf| gen_error(buf, 1)) >>
            gen_be_u8!(0x01) >>
            gen_be_u32!(self.link_id) >>
            gen_slice!(self.seed.as_ref()) >>
            gen_slice!(self.gamma.as_ref()) >>
            gen_slice!(self.beta.as_slice()) >>
            gen_slice!(self.delta.as_slice()) >>
            gen_len_limit(MIX_PACKET_SIZE)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use mixnet_binary_io::encode_decode_test;

    encode_decode_test!(
        mix_packet_encode_decode,
        MixPacket {
            link_id: 42,
            seed: [42; SEED_SIZE],
            gamma: [43; MAC_SIZE],
            beta: vec![44; BETA_SIZE],
            delta: vec![45; DELTA_SIZE],
        }
    );

    #[test]
    fn mix_packet_rejects_wrong_beta_size() {
        let packet = MixPacket {
            link_id: 42,
            seed: [42; SEED_SIZE],
            gamma: [43; MAC_SIZE],
            beta: vec![44; BETA_SIZE - 1],
            delta: vec![45; DELTA_SIZE],
        };
        let mut buf = [0; MIX_PACKET_SIZE];
        assert!(packet.to_bytes((&mut buf, 0)).is_err());
    }

    #[test]
    fn mix_packet_serialized_size_is_constant() {
        let packet = MixPacket {
            link_id: 1,
            seed: [0; SEED_SIZE],
            gamma: [0; MAC_SIZE],
            beta: vec![0; BETA_SIZE],
            delta: vec![0; DELTA_SIZE],
        };
        let mut buf = [0; MIX_PACKET_SIZE];
        let (_, size) = packet.to_bytes((&mut buf, 0)).unwrap();
        assert_eq!(size, MIX_PACKET_SIZE);
    }

    #[test]
    fn replay_tag_changes_with_header() {
        let packet_1 = MixPacket {
            link_id: 1,
            seed: [0; SEED_SIZE],
            gamma: [0; MAC_SIZE],
            beta: vec![0; BETA_SIZE],
            delta: vec![0; DELTA_SIZE],
        };
        let mut packet_2 = packet_1.clone();
        packet_2.seed = [1; SEED_SIZE];
        assert_ne!(packet_1.replay_tag(), packet_2.replay_tag());
    }

    #[test]
    fn replay_tag_ignores_delta() {
        // the payload block is rewritten at every hop; the tag covers
        // only the authenticated header
        let packet_1 = MixPacket {
            link_id: 1,
            seed: [0; SEED_SIZE],
            gamma: [0; MAC_SIZE],
            beta: vec![0; BETA_SIZE],
            delta: vec![0; DELTA_SIZE],
        };
        let mut packet_2 = packet_1.clone();
        packet_2.delta = vec![9; DELTA_SIZE];
        assert_eq!(packet_1.replay_tag(), packet_2.replay_tag());
    }
}
