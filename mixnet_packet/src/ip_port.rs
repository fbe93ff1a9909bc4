//! `IpAddr` with a port number.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use cookie_factory::{do_gen, gen_be_u16, gen_be_u8, gen_call, gen_cond, gen_slice};
use nom::branch::alt;
use nom::bytes::streaming::{tag, take};
use nom::combinator::map;
use nom::number::streaming::be_u16;
use nom::sequence::{preceded, terminated};
use nom::IResult;

use mixnet_binary_io::*;

/// Size of serialized `IpPort` struct.
pub const SIZE_IPPORT: usize = 19;

/// IPv4 can be padded with 12 bytes of zeros so that both IPv4 and IPv6
/// have the same stored size.
pub const IPV4_PADDING_SIZE: usize = 12;

/// Defines whether 12 bytes padding should be inserted after IPv4
/// address to align it with IPv6 address.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IpPortPadding {
    /// Padding should be inserted.
    WithPadding,
    /// Padding should not be inserted.
    NoPadding,
}

/** `IpAddr` with a port number. IPv4 can be padded with 12 bytes of
zeros so that both IPv4 and IPv6 have the same stored size.

Serialized form:

Length      | Content
----------- | ------
`1`         | IpType (2 for IPv4, 10 for IPv6)
`4` or `16` | IPv4 or IPv6 address
`0` or `12` | Padding for IPv4 (if needed)
`2`         | Port

*/
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IpPort {
    /// IP address.
    pub ip_addr: IpAddr,
    /// Port number.
    pub port: u16,
}

impl IpPort {
    fn ip_type(&self) -> u8 {
        if self.ip_addr.is_ipv4() {
            2
        } else {
            10
        }
    }

    /// Parse `IpPort` with optional padding.
    pub fn from_bytes(input: &[u8], padding: IpPortPadding) -> IResult<&[u8], IpPort> {
        let skip_padding = move |input| {
            if padding == IpPortPadding::WithPadding {
                take(IPV4_PADDING_SIZE)(input)
            } else {
                Ok((input, &[][..]))
            }
        };
        let (input, ip_addr) = alt((
            map(
                terminated(preceded(tag(&[2][..]), Ipv4Addr::from_bytes), skip_padding),
                IpAddr::V4,
            ),
            map(preceded(tag(&[10][..]), Ipv6Addr::from_bytes), IpAddr::V6),
        ))(input)?;
        let (input, port) = be_u16(input)?;
        Ok((input, IpPort { ip_addr, port }))
    }

    /// Write `IpPort` with optional padding.
    pub fn to_bytes<'a>(
        &self,
        buf: (&'a mut [u8], usize),
        padding: IpPortPadding,
    ) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_be_u8!(self.ip_type()) >>
            gen_call!(|buf, ip_addr| IpAddr::to_bytes(ip_addr, buf), &self.ip_addr) >>
            gen_cond!(
                padding == IpPortPadding::WithPadding && self.ip_addr.is_ipv4(),
                gen_slice!(&[0; IPV4_PADDING_SIZE])
            ) >>
            gen_be_u16!(self.port)
        )
    }

    /// Create new `IpPort` from `SocketAddr`.
    pub fn from_saddr(saddr: SocketAddr) -> IpPort {
        IpPort {
            ip_addr: saddr.ip(),
            port: saddr.port(),
        }
    }

    /// Convert `IpPort` to `SocketAddr`.
    pub fn to_saddr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_addr, self.port)
    }
}
