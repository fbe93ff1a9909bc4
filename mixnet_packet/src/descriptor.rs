/*! Signed service descriptors.

A hidden service publishes a descriptor listing the relay nodes that
agreed to act as its introduction points. Clients address the service
by the content-derived descriptor id and resolve it to an introduction
point from their local descriptor store.
*/

use cookie_factory::{do_gen, gen_be_u64, gen_be_u8, gen_call, gen_cond, gen_many_ref, gen_slice};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey, SIGNATURE_LENGTH};
use nom::combinator::{map_res, verify};
use nom::multi::count;
use nom::number::streaming::{be_u64, le_u8};
use nom::IResult;

use mixnet_binary_io::*;

use crate::relay_node::RelayNode;

/// Maximum number of introduction points one descriptor can list.
pub const MAX_INTRO_POINTS: usize = 8;

const DESCRIPTOR_ID_CONTEXT: &str = "mixnet v1 descriptor id";

/// Content-derived identifier of a service descriptor. Stable across
/// descriptor refreshes because it depends only on the service key.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct DescriptorId(pub [u8; 32]);

impl DescriptorId {
    /// Derive the descriptor id of a service key.
    pub fn from_pk(pk: &VerifyingKey) -> DescriptorId {
        DescriptorId(blake3::derive_key(DESCRIPTOR_ID_CONTEXT, pk.as_bytes()))
    }
}

impl FromBytes for DescriptorId {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, bytes) = <[u8; 32]>::from_bytes(input)?;
        Ok((input, DescriptorId(bytes)))
    }
}

impl ToBytes for DescriptorId {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        gen_slice!(buf, self.0.as_ref())
    }
}

/** Descriptor of a hidden service, signed by the service key.

The signature covers every field before it. A parsed descriptor is not
trusted until [`is_valid`](Self::is_valid) passes.

Serialized form:

Length   | Content
-------- | ------
`32`     | Service `VerifyingKey` (ed25519)
`8`      | Unix time (seconds) the descriptor was published at
`1`      | Number of introduction points (up to 8)
`[88]`   | Introduction points
`64`     | Signature by the service key

*/
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Long-term key of the service.
    pub service_pk: VerifyingKey,
    /// Relay nodes accepting introductions for the service.
    pub intro_points: Vec<RelayNode>,
    /// Unix time in seconds the descriptor was published at.
    pub timestamp: u64,
    /// Signature by the service key over all preceding fields.
    pub signature: Signature,
}

impl FromBytes for ServiceDescriptor {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, service_pk) = map_res(<[u8; 32]>::from_bytes, |bytes| {
            VerifyingKey::from_bytes(&bytes)
        })(input)?;
        let (input, timestamp) = be_u64(input)?;
        let (input, intro_points_len) =
            verify(le_u8, |len| *len as usize <= MAX_INTRO_POINTS)(input)?;
        let (input, intro_points) = count(RelayNode::from_bytes, intro_points_len as usize)(input)?;
        let (input, signature) = <[u8; SIGNATURE_LENGTH]>::from_bytes(input)?;
        Ok((
            input,
            ServiceDescriptor {
                service_pk,
                intro_points,
                timestamp,
                signature: Signature::from_bytes(&signature),
            },
        ))
    }
}

impl ToBytes for ServiceDescriptor {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_call!(|buf, descriptor| ServiceDescriptor::signed_part(descriptor, buf), self) >>
            gen_slice!(self.signature.to_bytes().as_ref())
        )
    }
}

impl ServiceDescriptor {
    /// Create and sign a new `ServiceDescriptor`.
    pub fn new(
        signing_key: &SigningKey,
        intro_points: Vec<RelayNode>,
        timestamp: u64,
    ) -> ServiceDescriptor {
        assert!(intro_points.len() <= MAX_INTRO_POINTS);
        let mut descriptor = ServiceDescriptor {
            service_pk: signing_key.verifying_key(),
            intro_points,
            timestamp,
            signature: Signature::from_bytes(&[0; SIGNATURE_LENGTH]),
        };
        let mut buf = [0; ENCODE_DECODE_BUF_SIZE];
        let (_, size) = descriptor.signed_part((&mut buf, 0)).unwrap();
        descriptor.signature = signing_key.sign(&buf[..size]);
        descriptor
    }

    /// Check the signature against the service key.
    pub fn is_valid(&self) -> bool {
        let mut buf = [0; ENCODE_DECODE_BUF_SIZE];
        let size = match self.signed_part((&mut buf, 0)) {
            Ok((_, size)) => size,
            Err(_) => return false,
        };
        self.service_pk
            .verify_strict(&buf[..size], &self.signature)
            .is_ok()
    }

    /// Content-derived id of this descriptor.
    pub fn id(&self) -> DescriptorId {
        DescriptorId::from_pk(&self.service_pk)
    }

    fn signed_part<'a>(
        &self,
        buf: (&'a mut [u8], usize),
    ) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_cond!(
                self.intro_points.len() > MAX_INTRO_POINTS,
                |buf| gen_error(buf, 0)
            ) >>
            gen_slice!(self.service_pk.as_bytes()) >>
            gen_be_u64!(self.timestamp) >>
            gen_be_u8!(self.intro_points.len() as u8) >>
            gen_many_ref!(&self.intro_points, |buf, node| RelayNode::to_bytes(node, buf))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay_node::{NodeRole, OperatorId};
    use crypto_box::SecretKey;
    use rand::thread_rng;

    use mixnet_binary_io::encode_decode_test;

    fn node(addr: &str, operator: u8) -> RelayNode {
        RelayNode::new(
            addr.parse().unwrap(),
            SecretKey::generate(&mut thread_rng()).public_key(),
            OperatorId([operator; 32]),
            NodeRole::Middle,
            25_000,
        )
    }

    encode_decode_test!(
        service_descriptor_encode_decode,
        ServiceDescriptor::new(
            &SigningKey::generate(&mut thread_rng()),
            vec![node("5.6.7.8:12345", 1), node("[2001:db8::2:1]:12345", 2)],
            1700000000
        )
    );

    #[test]
    fn service_descriptor_is_valid() {
        let signing_key = SigningKey::generate(&mut thread_rng());
        let descriptor =
            ServiceDescriptor::new(&signing_key, vec![node("5.6.7.8:12345", 1)], 1700000000);
        assert!(descriptor.is_valid());
    }

    #[test]
    fn service_descriptor_rejects_tampered_timestamp() {
        let signing_key = SigningKey::generate(&mut thread_rng());
        let mut descriptor =
            ServiceDescriptor::new(&signing_key, vec![node("5.6.7.8:12345", 1)], 1700000000);
        descriptor.timestamp += 1;
        assert!(!descriptor.is_valid());
    }

    #[test]
    fn service_descriptor_rejects_tampered_intro_points() {
        let signing_key = SigningKey::generate(&mut thread_rng());
        let mut descriptor =
            ServiceDescriptor::new(&signing_key, vec![node("5.6.7.8:12345", 1)], 1700000000);
        descriptor.intro_points[0] = node("1.2.3.4:80", 9);
        assert!(!descriptor.is_valid());
    }

    #[test]
    fn descriptor_id_stable_across_refreshes() {
        let signing_key = SigningKey::generate(&mut thread_rng());
        let descriptor_1 =
            ServiceDescriptor::new(&signing_key, vec![node("5.6.7.8:12345", 1)], 1700000000);
        let descriptor_2 =
            ServiceDescriptor::new(&signing_key, vec![node("1.2.3.4:80", 2)], 1700000600);
        assert_eq!(descriptor_1.id(), descriptor_2.id());
    }

    #[test]
    fn descriptor_too_many_intro_points_rejected() {
        let nodes: Vec<_> = (0..=MAX_INTRO_POINTS as u8)
            .map(|i| node("5.6.7.8:12345", i))
            .collect();
        let signing_key = SigningKey::generate(&mut thread_rng());
        let descriptor = ServiceDescriptor {
            service_pk: signing_key.verifying_key(),
            intro_points: nodes,
            timestamp: 1700000000,
            signature: Signature::from_bytes(&[0; SIGNATURE_LENGTH]),
        };
        let mut buf = [0; ENCODE_DECODE_BUF_SIZE];
        assert!(descriptor.to_bytes((&mut buf, 0)).is_err());
    }
}
