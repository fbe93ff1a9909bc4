/*!
Layered construction of [`MixPacket`]s.

The circuit owner shares a session key with every hop and derives all
per-hop keystreams itself, so it can build the whole onion locally:
the routing header (`beta`) carries one encrypted route entry per hop
and keystream-generated filler that keeps the header at a fixed size,
the payload block (`delta`) is wrapped in one XOR layer per hop with an
end-to-end digest underneath.

A relay peels exactly one layer with [`peel`]: it checks the header MAC,
decrypts its route entry, shifts the header and re-randomizes every
field of the outgoing packet. Incoming and outgoing packets share no
bytes, so a passive observer cannot match them up across a hop.
*/

use std::net::SocketAddr;

use cookie_factory::{do_gen, gen_be_u32, gen_be_u8, gen_call, gen_slice};
use nom::combinator::verify;
use nom::number::streaming::{be_u16, be_u32, le_u8};
use nom::IResult;
use rand::{CryptoRng, Rng};
use thiserror::Error;

use mixnet_binary_io::*;
use mixnet_crypto::{header_mac, packet_keys, PacketKeys, SessionKey, MAC_SIZE, SEED_SIZE};
use mixnet_packet::ip_port::{IpPort, IpPortPadding};
use mixnet_packet::onion::*;

/// Length of one header keystream: enough to decrypt `beta` and to
/// refill the tail that the shift exposes.
const HEADER_STREAM_SIZE: usize = BETA_SIZE + SIZE_ROUTE_ENTRY;

/// One hop of a circuit as known to the circuit owner.
#[derive(Clone)]
pub struct PathHop {
    /// Socket address of the hop.
    pub saddr: SocketAddr,
    /// Link id the hop assigned to this circuit.
    pub link_id: u32,
    /// Session key shared with the hop.
    pub session_key: SessionKey,
}

/// Error that can happen when building an onion packet.
#[derive(Debug, Error)]
pub enum OnionBuildError {
    /// Path has no hops or more than `MAX_HOPS`.
    #[error("Path length should be in range 1..=7: {} hops", len)]
    BadPathLength {
        /// Number of hops in the rejected path.
        len: usize,
    },
    /// Payload exceeds the per-packet capacity.
    #[error("Payload should not be longer than 1024 bytes: {} bytes", len)]
    PayloadTooBig {
        /// Length of the rejected payload.
        len: usize,
    },
}

/// Error that can happen when peeling an onion packet.
#[derive(Debug, Error)]
pub enum OnionPeelError {
    /// Header MAC check failed.
    #[error("Header MAC check failed")]
    InvalidMac,
    /// Decrypted route entry can't be parsed.
    #[error("Invalid route entry")]
    InvalidEntry,
    /// Payload digest check failed at the exit.
    #[error("Payload digest check failed")]
    InvalidDigest,
}

/// Result of peeling one layer off a packet.
pub enum PeeledPacket {
    /// Packet should be forwarded to the next hop.
    Forward {
        /// Address of the next hop.
        saddr: SocketAddr,
        /// Re-randomized packet for the next hop.
        packet: MixPacket,
    },
    /// This hop is the exit; the payload is verified and extracted.
    Deliver {
        /// Application payload.
        payload: Vec<u8>,
    },
}

/// Decrypted route entry of one hop.
struct RouteEntry {
    flag: u8,
    next_saddr: SocketAddr,
    next_link_id: u32,
    next_seed: [u8; SEED_SIZE],
    next_gamma: [u8; MAC_SIZE],
}

impl RouteEntry {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], RouteEntry> {
        let (input, flag) = verify(le_u8, |flag| {
            *flag == ROUTE_FLAG_FORWARD || *flag == ROUTE_FLAG_DELIVER
        })(input)?;
        let (input, ip_port) = IpPort::from_bytes(input, IpPortPadding::WithPadding)?;
        let (input, next_link_id) = be_u32(input)?;
        let (input, next_seed) = <[u8; SEED_SIZE]>::from_bytes(input)?;
        let (input, next_gamma) = <[u8; MAC_SIZE]>::from_bytes(input)?;
        Ok((
            input,
            RouteEntry {
                flag,
                next_saddr: ip_port.to_saddr(),
                next_link_id,
                next_seed,
                next_gamma,
            },
        ))
    }

    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(self.flag) >>
            gen_call!(|buf, ip_port| IpPort::to_bytes(ip_port, buf, IpPortPadding::WithPadding), &IpPort::from_saddr(self.next_saddr)) >>
            gen_be_u32!(self.next_link_id) >>
            gen_slice!(self.next_seed.as_ref()) >>
            gen_slice!(self.next_gamma.as_ref())
        )
    }

    fn deliver() -> RouteEntry {
        RouteEntry {
            flag: ROUTE_FLAG_DELIVER,
            next_saddr: "0.0.0.0:0".parse().unwrap(),
            next_link_id: 0,
            next_seed: [0; SEED_SIZE],
            next_gamma: [0; MAC_SIZE],
        }
    }
}

fn xor_in_place(buf: &mut [u8], stream: &[u8]) {
    for (b, s) in buf.iter_mut().zip(stream) {
        *b ^= s;
    }
}

fn payload_digest(covered: &[u8]) -> [u8; PAYLOAD_DIGEST_SIZE] {
    let hash = blake3::hash(covered);
    let mut digest = [0; PAYLOAD_DIGEST_SIZE];
    digest.copy_from_slice(&hash.as_bytes()[..PAYLOAD_DIGEST_SIZE]);
    digest
}

/// Plaintext payload block: digest, length, payload, zero padding. The
/// digest covers everything after itself, padding included, so no bit
/// of the block can be flipped in transit without detection.
fn pack_delta(payload: &[u8]) -> Result<Vec<u8>, OnionBuildError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(OnionBuildError::PayloadTooBig { len: payload.len() });
    }
    let mut delta = vec![0; DELTA_SIZE];
    delta[PAYLOAD_DIGEST_SIZE..PAYLOAD_DIGEST_SIZE + 2]
        .copy_from_slice(&(payload.len() as u16).to_be_bytes());
    delta[PAYLOAD_DIGEST_SIZE + 2..PAYLOAD_DIGEST_SIZE + 2 + payload.len()]
        .copy_from_slice(payload);
    let digest = payload_digest(&delta[PAYLOAD_DIGEST_SIZE..]);
    delta[..PAYLOAD_DIGEST_SIZE].copy_from_slice(&digest);
    Ok(delta)
}

fn unpack_delta(delta: &[u8]) -> Result<Vec<u8>, OnionPeelError> {
    let (rest, digest) =
        <[u8; PAYLOAD_DIGEST_SIZE]>::from_bytes(delta).map_err(|_| OnionPeelError::InvalidDigest)?;
    if digest != payload_digest(rest) {
        return Err(OnionPeelError::InvalidDigest);
    }
    let (rest, len) = be_u16::<_, nom::error::Error<&[u8]>>(rest)
        .map_err(|_| OnionPeelError::InvalidDigest)?;
    if len as usize > rest.len() {
        return Err(OnionPeelError::InvalidDigest);
    }
    Ok(rest[..len as usize].to_vec())
}

/** Build a complete onion packet for the given path.

Returns the address of the first hop together with the packet to send
there. Every build draws fresh per-hop seeds, so two packets for the
same circuit share no observable bytes.
*/
pub fn build_packet<R: Rng + CryptoRng>(
    rng: &mut R,
    hops: &[PathHop],
    payload: &[u8],
) -> Result<(SocketAddr, MixPacket), OnionBuildError> {
    let n = hops.len();
    if n == 0 || n > MAX_HOPS {
        return Err(OnionBuildError::BadPathLength { len: n });
    }

    let mut seeds = Vec::with_capacity(n);
    for _ in 0..n {
        let mut seed = [0; SEED_SIZE];
        rng.fill_bytes(&mut seed);
        seeds.push(seed);
    }
    let keys: Vec<PacketKeys> = hops
        .iter()
        .zip(&seeds)
        .map(|(hop, seed)| packet_keys(&hop.session_key, seed))
        .collect();
    let streams: Vec<Vec<u8>> = keys
        .iter()
        .map(|keys| keys.header.keystream(HEADER_STREAM_SIZE))
        .collect();

    // Filler: the part of the exit header that earlier hops force by
    // refilling the tail with their keystreams as the header shifts.
    let mut filler: Vec<u8> = Vec::with_capacity((n - 1) * SIZE_ROUTE_ENTRY);
    for stream in streams.iter().take(n - 1) {
        filler.extend_from_slice(&[0; SIZE_ROUTE_ENTRY]);
        let forced = &stream[HEADER_STREAM_SIZE - filler.len()..];
        xor_in_place(&mut filler, forced);
    }

    // Innermost header: the deliver entry for the exit, keystream
    // padding, then the forced filler tail.
    let head_size = BETA_SIZE - filler.len();
    let mut beta = vec![0; BETA_SIZE];
    RouteEntry::deliver()
        .to_bytes((&mut beta[..SIZE_ROUTE_ENTRY], 0))
        .expect("route entry always fits");
    xor_in_place(&mut beta[..head_size], &streams[n - 1][..head_size]);
    beta[head_size..].copy_from_slice(&filler);
    let mut gamma = header_mac(&keys[n - 1].mac_key, &beta);

    // Wrap the remaining layers back to front.
    for i in (0..n - 1).rev() {
        let entry = RouteEntry {
            flag: ROUTE_FLAG_FORWARD,
            next_saddr: hops[i + 1].saddr,
            next_link_id: hops[i + 1].link_id,
            next_seed: seeds[i + 1],
            next_gamma: gamma,
        };
        let mut next_beta = vec![0; BETA_SIZE];
        entry
            .to_bytes((&mut next_beta[..SIZE_ROUTE_ENTRY], 0))
            .expect("route entry always fits");
        next_beta[SIZE_ROUTE_ENTRY..].copy_from_slice(&beta[..BETA_SIZE - SIZE_ROUTE_ENTRY]);
        xor_in_place(&mut next_beta, &streams[i][..BETA_SIZE]);
        beta = next_beta;
        gamma = header_mac(&keys[i].mac_key, &beta);
    }

    let mut delta = pack_delta(payload)?;
    for hop_keys in &keys {
        hop_keys.payload.apply(&mut delta);
    }

    let packet = MixPacket {
        link_id: hops[0].link_id,
        seed: seeds[0],
        gamma,
        beta,
        delta,
    };
    Ok((hops[0].saddr, packet))
}

/** Peel one layer off a packet with the hop's session key.

Checks the header MAC first; a packet failing the check yields
[`OnionPeelError::InvalidMac`] and nothing about it is processed
further. On success either the re-randomized packet for the next hop or
the verified application payload is returned.
*/
pub fn peel(packet: &MixPacket, session_key: &SessionKey) -> Result<PeeledPacket, OnionPeelError> {
    let keys = packet_keys(session_key, &packet.seed);

    if header_mac(&keys.mac_key, &packet.beta) != packet.gamma {
        return Err(OnionPeelError::InvalidMac);
    }

    // Decrypt the header and extend it with raw keystream; the tail
    // becomes the new header's tail after the shift.
    let stream = keys.header.keystream(HEADER_STREAM_SIZE);
    let mut decrypted = packet.beta.clone();
    xor_in_place(&mut decrypted, &stream[..BETA_SIZE]);
    decrypted.extend_from_slice(&stream[BETA_SIZE..]);

    let entry = match RouteEntry::from_bytes(&decrypted[..SIZE_ROUTE_ENTRY]) {
        Ok((_, entry)) => entry,
        Err(_) => return Err(OnionPeelError::InvalidEntry),
    };

    let mut delta = packet.delta.clone();
    keys.payload.apply(&mut delta);

    if entry.flag == ROUTE_FLAG_DELIVER {
        let payload = unpack_delta(&delta)?;
        return Ok(PeeledPacket::Deliver { payload });
    }

    let packet = MixPacket {
        link_id: entry.next_link_id,
        seed: entry.next_seed,
        gamma: entry.next_gamma,
        beta: decrypted[SIZE_ROUTE_ENTRY..].to_vec(),
        delta,
    };
    Ok(PeeledPacket::Forward {
        saddr: entry.next_saddr,
        packet,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    fn path(n: usize) -> Vec<PathHop> {
        (0..n)
            .map(|i| PathHop {
                saddr: format!("127.0.0.{}:334{:02}", i + 1, i).parse().unwrap(),
                link_id: 1000 + i as u32,
                session_key: SessionKey::generate(&mut thread_rng()),
            })
            .collect()
    }

    fn relay_to_exit(hops: &[PathHop], mut packet: MixPacket) -> Vec<u8> {
        for (i, hop) in hops.iter().enumerate() {
            match peel(&packet, &hop.session_key).unwrap() {
                PeeledPacket::Forward {
                    saddr,
                    packet: next,
                } => {
                    assert!(i < hops.len() - 1, "forward out of the path");
                    assert_eq!(saddr, hops[i + 1].saddr);
                    assert_eq!(next.link_id, hops[i + 1].link_id);
                    packet = next;
                }
                PeeledPacket::Deliver { payload } => {
                    assert_eq!(i, hops.len() - 1, "delivered before the exit");
                    return payload;
                }
            }
        }
        unreachable!("exit hop never delivered");
    }

    #[test]
    fn single_hop_roundtrip() {
        let hops = path(1);
        let payload = b"direct delivery".to_vec();
        let (saddr, packet) = build_packet(&mut thread_rng(), &hops, &payload).unwrap();
        assert_eq!(saddr, hops[0].saddr);
        assert_eq!(relay_to_exit(&hops, packet), payload);
    }

    #[test]
    fn three_hop_roundtrip() {
        let hops = path(3);
        let payload = vec![42; MAX_PAYLOAD_SIZE];
        let (_, packet) = build_packet(&mut thread_rng(), &hops, &payload).unwrap();
        assert_eq!(relay_to_exit(&hops, packet), payload);
    }

    #[test]
    fn max_hop_roundtrip() {
        let hops = path(MAX_HOPS);
        let payload = b"seven layers deep".to_vec();
        let (_, packet) = build_packet(&mut thread_rng(), &hops, &payload).unwrap();
        assert_eq!(relay_to_exit(&hops, packet), payload);
    }

    #[test]
    fn empty_payload_roundtrip() {
        let hops = path(2);
        let (_, packet) = build_packet(&mut thread_rng(), &hops, &[]).unwrap();
        assert_eq!(relay_to_exit(&hops, packet), Vec::<u8>::new());
    }

    #[test]
    fn bad_path_length_rejected() {
        assert!(matches!(
            build_packet(&mut thread_rng(), &[], b"payload"),
            Err(OnionBuildError::BadPathLength { len: 0 })
        ));
        assert!(matches!(
            build_packet(&mut thread_rng(), &path(MAX_HOPS + 1), b"payload"),
            Err(OnionBuildError::BadPathLength { len: 8 })
        ));
    }

    #[test]
    fn oversized_payload_rejected() {
        let payload = vec![0; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(
            build_packet(&mut thread_rng(), &path(3), &payload),
            Err(OnionBuildError::PayloadTooBig { len }) if len == MAX_PAYLOAD_SIZE + 1
        ));
    }

    #[test]
    fn packet_fields_change_at_every_hop() {
        let hops = path(3);
        let (_, packet) = build_packet(&mut thread_rng(), &hops, b"payload").unwrap();
        let next = match peel(&packet, &hops[0].session_key).unwrap() {
            PeeledPacket::Forward { packet, .. } => packet,
            PeeledPacket::Deliver { .. } => panic!("delivered at the first hop"),
        };
        assert_ne!(packet.seed, next.seed);
        assert_ne!(packet.gamma, next.gamma);
        assert_ne!(packet.beta, next.beta);
        assert_ne!(packet.delta, next.delta);
        assert_ne!(packet.replay_tag(), next.replay_tag());
    }

    #[test]
    fn tampered_header_rejected() {
        let hops = path(3);
        let (_, mut packet) = build_packet(&mut thread_rng(), &hops, b"payload").unwrap();
        packet.beta[0] ^= 1;
        assert!(matches!(
            peel(&packet, &hops[0].session_key),
            Err(OnionPeelError::InvalidMac)
        ));
    }

    #[test]
    fn tampered_payload_rejected_at_exit() {
        let hops = path(2);
        let (_, mut packet) = build_packet(&mut thread_rng(), &hops, b"payload").unwrap();
        packet.delta[100] ^= 1;
        let packet = match peel(&packet, &hops[0].session_key).unwrap() {
            PeeledPacket::Forward { packet, .. } => packet,
            PeeledPacket::Deliver { .. } => panic!("delivered at the first hop"),
        };
        assert!(matches!(
            peel(&packet, &hops[1].session_key),
            Err(OnionPeelError::InvalidDigest)
        ));
    }

    #[test]
    fn tampered_padding_rejected_at_exit() {
        // padding bits are covered by the digest too, a flipped one
        // must not turn into a relay-controlled marker
        let hops = path(2);
        let (_, mut packet) = build_packet(&mut thread_rng(), &hops, b"payload").unwrap();
        packet.delta[DELTA_SIZE - 1] ^= 1;
        let packet = match peel(&packet, &hops[0].session_key).unwrap() {
            PeeledPacket::Forward { packet, .. } => packet,
            PeeledPacket::Deliver { .. } => panic!("delivered at the first hop"),
        };
        assert!(matches!(
            peel(&packet, &hops[1].session_key),
            Err(OnionPeelError::InvalidDigest)
        ));
    }

    #[test]
    fn bad_route_flag_rejected() {
        let session_key = SessionKey::generate(&mut thread_rng());
        let seed = [7; SEED_SIZE];
        let keys = packet_keys(&session_key, &seed);
        let stream = keys.header.keystream(HEADER_STREAM_SIZE);

        // a route entry with a flag no hop ever writes
        let mut beta = vec![0; BETA_SIZE];
        beta[0] = 0x02;
        xor_in_place(&mut beta, &stream[..BETA_SIZE]);
        let gamma = header_mac(&keys.mac_key, &beta);

        let packet = MixPacket {
            link_id: 1,
            seed,
            gamma,
            beta,
            delta: vec![0; DELTA_SIZE],
        };
        assert!(matches!(
            peel(&packet, &session_key),
            Err(OnionPeelError::InvalidEntry)
        ));
    }

    #[test]
    fn wrong_session_key_rejected() {
        let hops = path(2);
        let (_, packet) = build_packet(&mut thread_rng(), &hops, b"payload").unwrap();
        let wrong_key = SessionKey::generate(&mut thread_rng());
        assert!(matches!(
            peel(&packet, &wrong_key),
            Err(OnionPeelError::InvalidMac)
        ));
    }

    #[test]
    fn rebuilds_differ_for_same_circuit() {
        let hops = path(3);
        let (_, packet_1) = build_packet(&mut thread_rng(), &hops, b"payload").unwrap();
        let (_, packet_2) = build_packet(&mut thread_rng(), &hops, b"payload").unwrap();
        assert_ne!(packet_1.seed, packet_2.seed);
        assert_ne!(packet_1.beta, packet_2.beta);
        assert_ne!(packet_1.replay_tag(), packet_2.replay_tag());
    }
}
