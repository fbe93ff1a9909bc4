//! Relay node info as published by the node directory.

use std::net::SocketAddr;

use cookie_factory::{do_gen, gen_be_u32, gen_be_u8, gen_call, gen_slice};
use nom::number::streaming::{be_u32, le_u8};
use nom::IResult;

use mixnet_binary_io::*;
use mixnet_crypto::PublicKey;

use crate::ip_port::*;

/// Declared operator identity of a relay. Two relays run by the same
/// operator share the same `OperatorId`; path selection never puts them
/// on one circuit.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct OperatorId(pub [u8; 32]);

impl FromBytes for OperatorId {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, bytes) = <[u8; 32]>::from_bytes(input)?;
        Ok((input, OperatorId(bytes)))
    }
}

impl ToBytes for OperatorId {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        gen_slice!(buf, self.0.as_ref())
    }
}

/// Declared role of a relay node in the network.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeRole {
    /// First hop of a circuit.
    Entry = 0,
    /// Intermediate hop.
    Middle = 1,
    /// Last hop of a circuit.
    Exit = 2,
}

impl FromBytes for NodeRole {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (rest, role) = le_u8(input)?;
        let role = match role {
            0 => NodeRole::Entry,
            1 => NodeRole::Middle,
            2 => NodeRole::Exit,
            _ => {
                return Err(nom::Err::Error(nom::error::Error::new(
                    input,
                    nom::error::ErrorKind::Switch,
                )))
            }
        };
        Ok((rest, role))
    }
}

impl ToBytes for NodeRole {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        gen_be_u8!(buf, *self as u8)
    }
}

/** Relay node descriptor as distributed by the node directory.

Immutable once published; a directory refresh replaces the whole record.

Serialized form:

Length      | Content
----------- | ------
`1`         | IpType (2 for IPv4, 10 for IPv6)
`4` or `16` | IPv4 or IPv6 address
`0` or `12` | Padding for IPv4
`2`         | Port
`32`        | `PublicKey` of the node
`32`        | `OperatorId`
`1`         | Role
`4`         | Advertised capacity, packets per second

*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RelayNode {
    /// Public key of the node; doubles as its stable identity.
    pub pk: PublicKey,
    /// Socket address of the node.
    pub saddr: SocketAddr,
    /// Declared operator identity.
    pub operator: OperatorId,
    /// Declared role.
    pub role: NodeRole,
    /// Advertised capacity in packets per second.
    pub capacity_pps: u32,
}

impl RelayNode {
    /// Create new `RelayNode`.
    pub fn new(
        saddr: SocketAddr,
        pk: PublicKey,
        operator: OperatorId,
        role: NodeRole,
        capacity_pps: u32,
    ) -> RelayNode {
        RelayNode {
            pk,
            saddr,
            operator,
            role,
            capacity_pps,
        }
    }
}

impl FromBytes for RelayNode {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, ip_port) = IpPort::from_bytes(input, IpPortPadding::WithPadding)?;
        let (input, pk) = PublicKey::from_bytes(input)?;
        let (input, operator) = OperatorId::from_bytes(input)?;
        let (input, role) = NodeRole::from_bytes(input)?;
        let (input, capacity_pps) = be_u32(input)?;
        Ok((
            input,
            RelayNode {
                pk,
                saddr: ip_port.to_saddr(),
                operator,
                role,
                capacity_pps,
            },
        ))
    }
}

impl ToBytes for RelayNode {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_call!(|buf, ip_port| IpPort::to_bytes(ip_port, buf, IpPortPadding::WithPadding), &IpPort::from_saddr(self.saddr)) >>
            gen_slice!(self.pk.as_ref()) >>
            gen_call!(|buf, operator| OperatorId::to_bytes(operator, buf), &self.operator) >>
            gen_call!(|buf, role| NodeRole::to_bytes(role, buf), &self.role) >>
            gen_be_u32!(self.capacity_pps)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto_box::SecretKey;
    use rand::thread_rng;

    use mixnet_binary_io::encode_decode_test;

    encode_decode_test!(
        relay_node_encode_decode,
        RelayNode::new(
            "5.6.7.8:12345".parse().unwrap(),
            SecretKey::generate(&mut thread_rng()).public_key(),
            OperatorId([42; 32]),
            NodeRole::Middle,
            25_000
        )
    );

    encode_decode_test!(
        relay_node_v6_encode_decode,
        RelayNode::new(
            "[2001:db8::2:1]:12345".parse().unwrap(),
            SecretKey::generate(&mut thread_rng()).public_key(),
            OperatorId([7; 32]),
            NodeRole::Exit,
            50_000
        )
    );

    #[test]
    fn node_role_rejects_unknown_byte() {
        assert!(NodeRole::from_bytes(&[3]).is_err());
    }
}
