/*! Errors enum for mixnet packets.
*/

use nom::error::Error as NomError;
use thiserror::Error;

/// Error that can happen when calling `get_payload` of a packet.
#[derive(Debug, PartialEq, Error)]
pub enum GetPayloadError {
    /// Error indicates that received payload of encrypted packet can't be decrypted.
    #[error("Decrypt payload error")]
    Decrypt,
    /// Error indicates that decrypted payload of packet can't be parsed.
    #[error("Deserialize payload error: {:?}, payload: {:?}", error, payload)]
    Deserialize {
        /// Parsing error.
        error: nom::Err<NomError<Vec<u8>>>,
        /// Received payload of packet.
        payload: Vec<u8>,
    },
}

impl GetPayloadError {
    pub(crate) fn decrypt() -> GetPayloadError {
        GetPayloadError::Decrypt
    }

    pub(crate) fn deserialize(e: nom::Err<NomError<&[u8]>>, payload: Vec<u8>) -> GetPayloadError {
        GetPayloadError::Deserialize {
            error: e.map(|e| NomError::new(e.input.to_vec(), e.code)),
            payload,
        }
    }
}
