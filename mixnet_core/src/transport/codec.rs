/*! Codec for length-delimited mixnet frames over TCP.
*/

use std::io::Error as IoError;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use cookie_factory::GenError;
use nom::error::Error as NomError;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use mixnet_binary_io::*;
use mixnet_packet::packet::Packet;

use crate::stats::Stats;

/// Size of the length prefix of a frame.
pub const FRAME_HEADER_SIZE: usize = 4;

/// A frame body should not be longer than 2048 bytes.
pub const MAX_FRAME_SIZE: usize = 2048;

/// Error that can happen when decoding a frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Error indicates that we received too big frame.
    #[error("Frame should not be longer than 2048 bytes: {} bytes", len)]
    TooBigFrame {
        /// Length of received frame.
        len: usize,
    },
    /// Error indicates that received frame can't be parsed as a packet.
    #[error("Deserialize Packet error: {:?}, packet: {:?}", error, packet)]
    Deserialize {
        /// Parsing error.
        error: nom::Err<NomError<Vec<u8>>>,
        /// Received frame body.
        packet: Vec<u8>,
    },
    /// General IO error that can happen with a TCP socket.
    #[error("IO Error")]
    Io(IoError),
}

impl DecodeError {
    pub(crate) fn too_big_frame(len: usize) -> DecodeError {
        DecodeError::TooBigFrame { len }
    }

    pub(crate) fn deserialize(e: nom::Err<NomError<&[u8]>>, packet: Vec<u8>) -> DecodeError {
        DecodeError::Deserialize {
            error: e.map(|e| NomError::new(e.input.to_vec(), e.code)),
            packet,
        }
    }
}

/// Error that can happen when encoding a frame.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Error indicates that `Packet` is invalid and can't be serialized.
    #[error("Serialize Packet error: {:?}", error)]
    Serialize {
        /// Serialization error.
        error: GenError,
    },
    /// Error indicates that a raw frame exceeds the frame size limit.
    #[error("Frame should not be longer than 2048 bytes: {} bytes", len)]
    TooBigFrame {
        /// Length of the rejected frame.
        len: usize,
    },
    /// General IO error that can happen with a TCP socket.
    #[error("IO Error")]
    Io(IoError),
}

impl From<IoError> for DecodeError {
    fn from(error: IoError) -> DecodeError {
        DecodeError::Io(error)
    }
}

impl From<IoError> for EncodeError {
    fn from(error: IoError) -> EncodeError {
        EncodeError::Io(error)
    }
}

/// Struct to use for {de-,}serializing mixnet TCP frames.
#[derive(Clone)]
pub struct FrameCodec {
    stats: Stats,
}

impl FrameCodec {
    /// Make object.
    pub fn new(stats: Stats) -> Self {
        FrameCodec { stats }
    }
}

impl Decoder for FrameCodec {
    type Item = Packet;
    type Error = DecodeError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let mut len_bytes = [0; FRAME_HEADER_SIZE];
        len_bytes.copy_from_slice(&buf[..FRAME_HEADER_SIZE]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(DecodeError::too_big_frame(len));
        }
        if buf.len() < FRAME_HEADER_SIZE + len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let body = buf.split_to(len);

        match Packet::from_bytes(&body) {
            Err(error) => Err(DecodeError::deserialize(error, body.to_vec())),
            Ok((_, packet)) => {
                self.stats.counters.increase_incoming();
                Ok(Some(packet))
            }
        }
    }
}

impl Encoder<Packet> for FrameCodec {
    type Error = EncodeError;

    fn encode(&mut self, packet: Packet, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let mut packet_buf = [0; MAX_FRAME_SIZE];
        packet
            .to_bytes((&mut packet_buf, 0))
            .map(|(packet_buf, size)| {
                self.stats.counters.increase_outgoing();
                buf.reserve(FRAME_HEADER_SIZE + size);
                buf.put_u32(size as u32);
                buf.extend_from_slice(&packet_buf[..size]);
            })
            .map_err(|error| EncodeError::Serialize { error })
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = EncodeError;

    fn encode(&mut self, frame: Bytes, buf: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(EncodeError::TooBigFrame { len: frame.len() });
        }
        self.stats.counters.increase_outgoing();
        buf.reserve(FRAME_HEADER_SIZE + frame.len());
        buf.put_u32(frame.len() as u32);
        buf.extend_from_slice(&frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto_box::SecretKey;
    use rand::thread_rng;

    use mixnet_crypto::{MAC_SIZE, NONCEBYTES, SEED_SIZE};
    use mixnet_packet::circuit::{CircuitRequest, CircuitResponse, CIRCUIT_REQUEST_ENC_PAYLOAD_SIZE, CIRCUIT_RESPONSE_MAC_SIZE};
    use mixnet_packet::onion::{MixPacket, BETA_SIZE, DELTA_SIZE};

    fn codec() -> FrameCodec {
        FrameCodec::new(Stats::new())
    }

    #[test]
    fn encode_decode() {
        let test_packets = vec![
            Packet::Mix(MixPacket {
                link_id: 42,
                seed: [42; SEED_SIZE],
                gamma: [43; MAC_SIZE],
                beta: vec![44; BETA_SIZE],
                delta: vec![45; DELTA_SIZE],
            }),
            Packet::CircuitRequest(CircuitRequest {
                link_id: 42,
                nonce: [42; NONCEBYTES],
                temporary_pk: SecretKey::generate(&mut thread_rng()).public_key(),
                payload: vec![42; CIRCUIT_REQUEST_ENC_PAYLOAD_SIZE],
            }),
            Packet::CircuitResponse(CircuitResponse {
                link_id: 42,
                mac: [42; CIRCUIT_RESPONSE_MAC_SIZE],
            }),
        ];
        let mut codec = codec();
        let mut buf = BytesMut::new();
        for packet in test_packets {
            buf.clear();
            codec.encode(packet.clone(), &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, packet);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn decode_incomplete_frame() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Packet::CircuitResponse(CircuitResponse {
                    link_id: 42,
                    mac: [42; CIRCUIT_RESPONSE_MAC_SIZE],
                }),
                &mut buf,
            )
            .unwrap();
        let full_len = buf.len();
        let mut partial = buf.split_to(full_len - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn decode_too_big_frame() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_SIZE as u32 + 1);
        buf.extend_from_slice(&[0; 16]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(DecodeError::TooBigFrame { .. })
        ));
    }

    #[test]
    fn decode_garbage_body() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.extend_from_slice(&[0x7f, 0x7f, 0x7f]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(DecodeError::Deserialize { .. })
        ));
    }

    #[test]
    fn encode_raw_frame() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        Encoder::<Bytes>::encode(&mut codec, Bytes::from_static(b"ping"), &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 4, b'p', b'i', b'n', b'g']);
    }

    #[test]
    fn encode_raw_frame_too_big() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        let frame = Bytes::from(vec![0; MAX_FRAME_SIZE + 1]);
        assert!(matches!(
            Encoder::<Bytes>::encode(&mut codec, frame, &mut buf),
            Err(EncodeError::TooBigFrame { .. })
        ));
    }
}
