//! Verifiable random function built on deterministic ed25519 signatures.
//!
//! RFC 8032 signatures are deterministic, so `sign(sk, msg)` is a
//! unique value computable only by the key holder, and anyone with the
//! public key can check it. Hashing the signature gives a pseudo-random
//! output that the prover cannot bias without producing an invalid
//! proof. This is the classic VRF-from-unique-signature construction;
//! `verify` uses `verify_strict` to reject malleable encodings.

use thiserror::Error;

pub use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use ed25519_dalek::Signer;

/// Size of a VRF proof in bytes.
pub const PROOF_SIZE: usize = 64;

/// Size of a VRF output in bytes.
pub const OUTPUT_SIZE: usize = 32;

/// VRF output value.
pub type VrfOutput = [u8; OUTPUT_SIZE];

/// Error that can happen when verifying a VRF proof.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum VrfError {
    /// The proof does not verify under the given public key and message.
    #[error("Invalid VRF proof")]
    InvalidProof,
}

/// Compute the VRF output and proof for a message.
pub fn prove(sk: &SigningKey, message: &[u8]) -> (VrfOutput, Signature) {
    let proof = sk.sign(message);
    (output_from_proof(&proof), proof)
}

/// Verify a VRF proof and recover the output.
pub fn verify(pk: &VerifyingKey, message: &[u8], proof: &Signature) -> Result<VrfOutput, VrfError> {
    pk.verify_strict(message, proof)
        .map_err(|_| VrfError::InvalidProof)?;
    Ok(output_from_proof(proof))
}

fn output_from_proof(proof: &Signature) -> VrfOutput {
    *blake3::hash(&proof.to_bytes()).as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    #[test]
    fn prove_verify_roundtrip() {
        let sk = SigningKey::generate(&mut thread_rng());
        let (output, proof) = prove(&sk, b"some tag");
        let verified = verify(&sk.verifying_key(), b"some tag", &proof).unwrap();
        assert_eq!(output, verified);
    }

    #[test]
    fn prove_is_deterministic() {
        let sk = SigningKey::generate(&mut thread_rng());
        let (output_1, proof_1) = prove(&sk, b"some tag");
        let (output_2, proof_2) = prove(&sk, b"some tag");
        assert_eq!(output_1, output_2);
        assert_eq!(proof_1, proof_2);
    }

    #[test]
    fn outputs_differ_per_message() {
        let sk = SigningKey::generate(&mut thread_rng());
        let (output_1, _) = prove(&sk, b"tag one");
        let (output_2, _) = prove(&sk, b"tag two");
        assert_ne!(output_1, output_2);
    }

    #[test]
    fn verify_rejects_wrong_message() {
        let sk = SigningKey::generate(&mut thread_rng());
        let (_, proof) = prove(&sk, b"some tag");
        assert_eq!(
            verify(&sk.verifying_key(), b"other tag", &proof),
            Err(VrfError::InvalidProof)
        );
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let sk = SigningKey::generate(&mut thread_rng());
        let other = SigningKey::generate(&mut thread_rng());
        let (_, proof) = prove(&sk, b"some tag");
        assert_eq!(
            verify(&other.verifying_key(), b"some tag", &proof),
            Err(VrfError::InvalidProof)
        );
    }
}
