/*! Circuit handshake packets.

The circuit owner generates the hop session key and delivers it to the
hop encrypted under the hop's public key; the hop confirms with a MAC
keyed by the session key. One request/response pair per hop.
*/

use aead::{Aead, AeadCore};
use cookie_factory::{do_gen, gen_be_u32, gen_be_u64, gen_be_u8, gen_call, gen_cond, gen_slice};
use crypto_box::aead::generic_array::typenum::marker_traits::Unsigned;
use crypto_box::SalsaBox;
use nom::bytes::streaming::tag;
use nom::combinator::{rest, verify};
use nom::number::streaming::{be_u32, be_u64};
use nom::IResult;

use mixnet_binary_io::*;
use mixnet_crypto::{Nonce, PublicKey, SessionKey, NONCEBYTES, SESSION_KEY_SIZE};

use crate::errors::GetPayloadError;

/// Size of the serialized `CircuitRequestPayload`.
pub const CIRCUIT_REQUEST_PAYLOAD_SIZE: usize = SESSION_KEY_SIZE + 8;

/// Size of the encrypted `CircuitRequestPayload` with the `SalsaBox` tag.
pub const CIRCUIT_REQUEST_ENC_PAYLOAD_SIZE: usize =
    CIRCUIT_REQUEST_PAYLOAD_SIZE + <SalsaBox as AeadCore>::TagSize::USIZE;

/// Size of the circuit response MAC.
pub const CIRCUIT_RESPONSE_MAC_SIZE: usize = 32;

const CIRCUIT_ACCEPT_CONTEXT: &str = "mixnet v1 circuit accept";

/** Request to extend a circuit to the receiving hop.

Payload is encrypted with a `SalsaBox` derived from the ephemeral
secret key of the circuit owner and the public key of the hop.

Serialized form:

Length   | Content
-------- | ------
`1`      | `0x02`
`4`      | Link id (BE) the circuit owner picked for this hop
`24`     | `Nonce`
`32`     | Ephemeral `PublicKey` of the circuit owner
`56`     | Encrypted [`CircuitRequestPayload`](./struct.CircuitRequestPayload.html)

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CircuitRequest {
    /// Link-local circuit id picked by the circuit owner.
    pub link_id: u32,
    /// Nonce for the encrypted payload.
    pub nonce: Nonce,
    /// Ephemeral `PublicKey` of the circuit owner.
    pub temporary_pk: PublicKey,
    /// Encrypted payload.
    pub payload: Vec<u8>,
}

impl FromBytes for CircuitRequest {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&[0x02][..])(input)?;
        let (input, link_id) = be_u32(input)?;
        let (input, nonce) = <[u8; NONCEBYTES]>::from_bytes(input)?;
        let (input, temporary_pk) = PublicKey::from_bytes(input)?;
        let (input, payload) = verify(rest, |payload: &[u8]| {
            payload.len() == CIRCUIT_REQUEST_ENC_PAYLOAD_SIZE
        })(input)?;
        Ok((
            input,
            CircuitRequest {
                link_id,
                nonce,
                temporary_pk,
                payload: payload.to_vec(),
            },
        ))
    }
}

impl ToBytes for CircuitRequest {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_cond!(
                self.payload.len() != CIRCUIT_REQUEST_ENC_PAYLOAD_SIZE,
                |buf| gen_error(buf, 0)
            ) >>
            gen_be_u8!(0x02) >>
            gen_be_u32!(self.link_id) >>
            gen_slice!(self.nonce.as_ref()) >>
            gen_slice!(self.temporary_pk.as_ref()) >>
            gen_slice!(self.payload.as_slice())
        )
    }
}

impl CircuitRequest {
    /// Create new `CircuitRequest` object.
    pub fn new(
        shared_secret: &SalsaBox,
        link_id: u32,
        temporary_pk: PublicKey,
        payload: &CircuitRequestPayload,
    ) -> CircuitRequest {
        let nonce = SalsaBox::generate_nonce(&mut rand::thread_rng());
        let mut buf = [0; CIRCUIT_REQUEST_PAYLOAD_SIZE];
        let (_, size) = payload.to_bytes((&mut buf, 0)).unwrap();
        let payload = shared_secret.encrypt(&nonce, &buf[..size]).unwrap();

        CircuitRequest {
            link_id,
            nonce: nonce.into(),
            temporary_pk,
            payload,
        }
    }

    /** Decrypt payload and try to parse it as `CircuitRequestPayload`.

    Returns `Error` in case of failure:

    - fails to decrypt
    - fails to parse as `CircuitRequestPayload`
    */
    pub fn get_payload(
        &self,
        shared_secret: &SalsaBox,
    ) -> Result<CircuitRequestPayload, GetPayloadError> {
        let decrypted = shared_secret
            .decrypt((&self.nonce).into(), self.payload.as_slice())
            .map_err(|_| GetPayloadError::decrypt())?;
        match CircuitRequestPayload::from_bytes(&decrypted) {
            Err(error) => Err(GetPayloadError::deserialize(error, decrypted.clone())),
            Ok((_, payload)) => Ok(payload),
        }
    }
}

/** Unencrypted payload of `CircuitRequest` packet.

Serialized form:

Length | Content
------ | ------
`32`   | Session key for this hop
`8`    | Unix time (seconds) the circuit expires at

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CircuitRequestPayload {
    /// Session key for this hop.
    pub session_key: SessionKey,
    /// Unix time in seconds when the circuit expires.
    pub expires_at: u64,
}

impl FromBytes for CircuitRequestPayload {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, key_bytes) = <[u8; SESSION_KEY_SIZE]>::from_bytes(input)?;
        let (input, expires_at) = be_u64(input)?;
        Ok((
            input,
            CircuitRequestPayload {
                session_key: SessionKey::from_bytes(key_bytes),
                expires_at,
            },
        ))
    }
}

impl ToBytes for CircuitRequestPayload {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(self.session_key.as_bytes()) >>
            gen_be_u64!(self.expires_at)
        )
    }
}

/** Confirmation that the receiving hop accepted the circuit.

The MAC proves the hop decrypted the session key; it is keyed by the
session key itself, so only the intended hop can produce it.

Serialized form:

Length | Content
------ | ------
`1`    | `0x03`
`4`    | Link id (BE)
`32`   | MAC keyed by the session key

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CircuitResponse {
    /// Link-local circuit id the response refers to.
    pub link_id: u32,
    /// MAC keyed by the session key.
    pub mac: [u8; CIRCUIT_RESPONSE_MAC_SIZE],
}

impl FromBytes for CircuitResponse {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&[0x03][..])(input)?;
        let (input, link_id) = be_u32(input)?;
        let (input, mac) = <[u8; CIRCUIT_RESPONSE_MAC_SIZE]>::from_bytes(input)?;
        Ok((input, CircuitResponse { link_id, mac }))
    }
}

impl ToBytes for CircuitResponse {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(0x03) >>
            gen_be_u32!(self.link_id) >>
            gen_slice!(self.mac.as_ref())
        )
    }
}

impl CircuitResponse {
    /// Create new `CircuitResponse` confirming the session key.
    pub fn new(session_key: &SessionKey, link_id: u32) -> CircuitResponse {
        CircuitResponse {
            link_id,
            mac: CircuitResponse::expected_mac(session_key, link_id),
        }
    }

    /// Check that the MAC confirms the given session key and link id.
    pub fn is_valid(&self, session_key: &SessionKey) -> bool {
        self.mac == CircuitResponse::expected_mac(session_key, self.link_id)
    }

    fn expected_mac(session_key: &SessionKey, link_id: u32) -> [u8; CIRCUIT_RESPONSE_MAC_SIZE] {
        let key = blake3::derive_key(CIRCUIT_ACCEPT_CONTEXT, session_key.as_bytes());
        *blake3::keyed_hash(&key, &link_id.to_be_bytes()).as_bytes()
    }
}
