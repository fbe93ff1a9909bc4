/*! Top-level packet of the mixnet wire protocol.
*/

use cookie_factory::{do_gen, gen_call};
use nom::branch::alt;
use nom::combinator::map;
use nom::IResult;

use mixnet_binary_io::*;

use crate::circuit::{CircuitRequest, CircuitResponse};
use crate::onion::MixPacket;

/** Any packet a relay can receive on a link.

The first byte selects the variant:

Byte   | Packet
------ | ------
`0x01` | [`MixPacket`](../onion/struct.MixPacket.html)
`0x02` | [`CircuitRequest`](../circuit/struct.CircuitRequest.html)
`0x03` | [`CircuitResponse`](../circuit/struct.CircuitResponse.html)

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Packet {
    /// [`MixPacket`](../onion/struct.MixPacket.html) structure.
    Mix(MixPacket),
    /// [`CircuitRequest`](../circuit/struct.CircuitRequest.html) structure.
    CircuitRequest(CircuitRequest),
    /// [`CircuitResponse`](../circuit/struct.CircuitResponse.html) structure.
    CircuitResponse(CircuitResponse),
}

impl FromBytes for Packet {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        alt((
            map(MixPacket::from_bytes, Packet::Mix),
            map(CircuitRequest::from_bytes, Packet::CircuitRequest),
            map(CircuitResponse::from_bytes, Packet::CircuitResponse),
        ))(input)
    }
}

impl ToBytes for Packet {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        match self {
            Packet::Mix(ref p) => do_gen!(buf, gen_call!(|buf, packet| MixPacket::to_bytes(packet, buf), p)),
            Packet::CircuitRequest(ref p) => do_gen!(buf, gen_call!(|buf, packet| CircuitRequest::to_bytes(packet, buf), p)),
            Packet::CircuitResponse(ref p) => do_gen!(buf, gen_call!(|buf, packet| CircuitResponse::to_bytes(packet, buf), p)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CIRCUIT_REQUEST_ENC_PAYLOAD_SIZE, CIRCUIT_RESPONSE_MAC_SIZE};
    use crate::onion::{BETA_SIZE, DELTA_SIZE};
    use crypto_box::SecretKey;
    use mixnet_crypto::{MAC_SIZE, NONCEBYTES, SEED_SIZE};
    use rand::thread_rng;

    use mixnet_binary_io::encode_decode_test;

    encode_decode_test!(
        packet_mix_encode_decode,
        Packet::Mix(MixPacket {
            link_id: 42,
            seed: [42; SEED_SIZE],
            gamma: [43; MAC_SIZE],
            beta: vec![44; BETA_SIZE],
            delta: vec![45; DELTA_SIZE],
        })
    );

    encode_decode_test!(
        packet_circuit_request_encode_decode,
        Packet::CircuitRequest(CircuitRequest {
            link_id: 42,
            nonce: [42; NONCEBYTES],
            temporary_pk: SecretKey::generate(&mut thread_rng()).public_key(),
            payload: vec![42; CIRCUIT_REQUEST_ENC_PAYLOAD_SIZE],
        })
    );

    encode_decode_test!(
        packet_circuit_response_encode_decode,
        Packet::CircuitResponse(CircuitResponse {
            link_id: 42,
            mac: [42; CIRCUIT_RESPONSE_MAC_SIZE],
        })
    );

    #[test]
    fn packet_unknown_kind_rejected() {
        assert!(Packet::from_bytes(&[0x7f; 32]).is_err());
    }
}
