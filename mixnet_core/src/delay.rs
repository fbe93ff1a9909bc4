/*!
Verifiable per-packet forwarding delays.

A relay holds every packet for a pseudo-random time before forwarding
it, which destroys timing correlation across the hop. The delay is not
free-running randomness: it is derived from a VRF over the packet's
replay tag, so an auditor holding the relay's public key can check that
the relay neither stretched nor shortened any delay it signed for.

Delays follow an exponential distribution via the inverse CDF so the
outgoing stream is memoryless, clamped to a maximum so a single packet
cannot be held indefinitely.
*/

use std::time::{Duration, SystemTime};

use thiserror::Error;

use mixnet_crypto::vrf::{self, Signature, SigningKey, VerifyingKey, VrfError, VrfOutput};
use mixnet_packet::onion::ReplayTag;

use crate::time::unix_time;

/// Default mean of the delay distribution.
pub const DEFAULT_MEAN_DELAY: Duration = Duration::from_millis(50);

/// Default hard cap on a single delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(1000);

/// How long a ticket stays auditable, seconds. Matches the replay
/// window: past it the tag may be forgotten and re-proved.
pub const TICKET_LIFETIME_SECS: u64 = 600;

/// Delay assigned to one packet together with the proof it was
/// computed honestly.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DelayTicket {
    /// How long the packet is held before forwarding.
    pub delay: Duration,
    /// VRF proof over the packet's replay tag.
    pub proof: Signature,
    /// Unix time in seconds the ticket stops being auditable at.
    pub expires_at: u64,
}

/// Error that can happen when auditing a `DelayTicket`.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum TicketError {
    /// The ticket is past its audit deadline.
    #[error("Ticket expired at {}", expires_at)]
    Expired {
        /// Deadline the ticket carried.
        expires_at: u64,
    },
    /// The VRF proof does not verify.
    #[error("Invalid VRF proof: {0}")]
    Vrf(#[from] VrfError),
    /// The proof is valid but the claimed delay does not match it.
    #[error("Claimed delay {:?} does not match the proof", claimed)]
    WrongDelay {
        /// Delay claimed by the ticket.
        claimed: Duration,
    },
}

/// Assigns verifiable delays for one relay identity.
pub struct DelayScheduler {
    signing_key: SigningKey,
    mean: Duration,
    max: Duration,
}

impl DelayScheduler {
    /// New `DelayScheduler` with the default distribution parameters.
    pub fn new(signing_key: SigningKey) -> DelayScheduler {
        DelayScheduler::with_params(signing_key, DEFAULT_MEAN_DELAY, DEFAULT_MAX_DELAY)
    }

    /// New `DelayScheduler` with explicit distribution parameters.
    pub fn with_params(signing_key: SigningKey, mean: Duration, max: Duration) -> DelayScheduler {
        DelayScheduler {
            signing_key,
            mean,
            max,
        }
    }

    /// Public key auditors verify tickets against.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Assign the delay for a packet. The delay and the proof are
    /// deterministic per tag.
    pub fn schedule(&self, tag: &ReplayTag) -> DelayTicket {
        let (output, proof) = vrf::prove(&self.signing_key, &tag.0);
        DelayTicket {
            delay: delay_from_output(&output, self.mean, self.max),
            proof,
            expires_at: unix_time(SystemTime::now()) + TICKET_LIFETIME_SECS,
        }
    }
}

/// Check that a ticket was honestly derived from the packet's tag and
/// is still within its audit window at `now` (unix seconds).
pub fn verify_ticket(
    pk: &VerifyingKey,
    tag: &ReplayTag,
    ticket: &DelayTicket,
    mean: Duration,
    max: Duration,
    now: u64,
) -> Result<(), TicketError> {
    if now >= ticket.expires_at {
        return Err(TicketError::Expired {
            expires_at: ticket.expires_at,
        });
    }
    let output = vrf::verify(pk, &tag.0, &ticket.proof)?;
    let expected = delay_from_output(&output, mean, max);
    if ticket.delay != expected {
        return Err(TicketError::WrongDelay {
            claimed: ticket.delay,
        });
    }
    Ok(())
}

/// Map a VRF output to an exponential delay by the inverse CDF.
fn delay_from_output(output: &VrfOutput, mean: Duration, max: Duration) -> Duration {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(&output[..8]);
    // uniform in [0, 1); 1 - u stays strictly positive
    let u = u64::from_le_bytes(bytes) as f64 / (u64::MAX as f64 + 1.0);
    let delay = mean.as_secs_f64() * -(1.0 - u).ln();
    Duration::from_secs_f64(delay).min(max)
}
