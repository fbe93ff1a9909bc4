/*! Serialization/deserialization traits for mixnet wire formats.

Parsing is done with `nom` combinators, serialization with
`cookie-factory` generators. Every wire struct in the workspace
implements [`FromBytes`] and [`ToBytes`].
*/

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub use cookie_factory::GenError;
pub use nom::IResult;

use nom::bytes::streaming::take;
use nom::combinator::{map, map_opt};

#[cfg(feature = "crypto")]
mod crypto;

/// The trait provides method to deserialize struct from raw bytes.
pub trait FromBytes: Sized {
    /// Deserialize struct using `nom` from raw bytes.
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self>;
}

/// The trait provides method to serialize struct into raw bytes.
pub trait ToBytes: Sized {
    /// Serialize struct into raw bytes using `cookie_factory`.
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError>;
}

impl<const N: usize> FromBytes for [u8; N] {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        map_opt(take(N), |bytes: &[u8]| bytes.try_into().ok())(input)
    }
}

impl FromBytes for Ipv4Addr {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        map(<[u8; 4]>::from_bytes, Ipv4Addr::from)(input)
    }
}

impl FromBytes for Ipv6Addr {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        map(<[u8; 16]>::from_bytes, Ipv6Addr::from)(input)
    }
}

impl ToBytes for IpAddr {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        match self {
            IpAddr::V4(addr) => cookie_factory::gen_slice!(buf, addr.octets()),
            IpAddr::V6(addr) => cookie_factory::gen_slice!(buf, addr.octets()),
        }
    }
}

/// Unconditional serialization failure, used with `gen_cond!` to reject
/// invalid values before they hit the wire.
pub fn gen_error<'a>(_buf: (&'a mut [u8], usize), code: u32) -> Result<(&'a mut [u8], usize), GenError> {
    Err(GenError::CustomError(code))
}

/// Fail serialization if the amount of written bytes exceeds the limit.
/// Should be the last element of a `do_gen!` chain.
pub fn gen_len_limit(buf: (&mut [u8], usize), limit: usize) -> Result<(&mut [u8], usize), GenError> {
    if buf.1 <= limit {
        Ok(buf)
    } else {
        Err(GenError::BufferTooBig(buf.1))
    }
}

/// Scratch buffer size for `encode_decode_test!`. Covers the biggest
/// packet in the protocol with room to spare.
pub const ENCODE_DECODE_BUF_SIZE: usize = 4096;

/// Test that serialization followed by deserialization gives back the
/// original value.
#[macro_export]
macro_rules! encode_decode_test (
    ($test:ident, $value:expr) => (
        #[test]
        fn $test() {
            use $crate::{FromBytes, ToBytes};

            // ties the decoded type to the encoded one
            fn redecode<'a, T: FromBytes>(input: &'a [u8], _original: &T) -> (&'a [u8], T) {
                T::from_bytes(input).unwrap()
            }

            let value = $value;
            let mut buf = [0; $crate::ENCODE_DECODE_BUF_SIZE];
            let (_, size) = value.to_bytes((&mut buf, 0)).unwrap();
            let (rest, decoded_value) = redecode(&buf[..size], &value);
            assert!(rest.is_empty());
            assert_eq!(decoded_value, value);
        }
    )
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_from_bytes() {
        let bytes = [42; 32];
        let (rest, array) = <[u8; 16]>::from_bytes(&bytes).unwrap();
        assert_eq!(rest.len(), 16);
        assert_eq!(array, [42; 16]);
    }

    #[test]
    fn array_from_bytes_incomplete() {
        let bytes = [42; 8];
        assert!(<[u8; 16]>::from_bytes(&bytes).is_err());
    }

    #[test]
    fn ipv4_from_bytes() {
        let bytes = [5, 6, 7, 8];
        let (_rest, addr) = Ipv4Addr::from_bytes(&bytes).unwrap();
        assert_eq!(addr, "5.6.7.8".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn ip_addr_to_bytes() {
        let addr: IpAddr = "5.6.7.8".parse().unwrap();
        let mut buf = [0; 4];
        let (_, size) = addr.to_bytes((&mut buf, 0)).unwrap();
        assert_eq!(size, 4);
        assert_eq!(buf, [5, 6, 7, 8]);
    }

    #[test]
    fn gen_len_limit_rejects_overflow() {
        let mut buf = [0; 16];
        assert!(gen_len_limit((&mut buf, 10), 16).is_ok());
        let mut buf = [0; 32];
        assert!(gen_len_limit((&mut buf, 17), 16).is_err());
    }
}
