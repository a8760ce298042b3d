// Round participant strategies.
// The engine owns the protocol state; a strategy only decides what numbers a
// node puts on the wire, so honest and adversarial nodes share one engine.

use crate::secure_sum::{self, MaskRange, Masked, Modulus};
use rand::RngCore;

/// What a node contributes at each step of a round.
pub trait RoundParticipant: Send + Sync {
    /// Initiator: blind the local value before it leaves the node.
    fn commit(
        &self,
        value: u64,
        modulus: Modulus,
        range: MaskRange,
        rng: &mut dyn RngCore,
    ) -> Masked;

    /// Forwarder: fold the local value into the running sum.
    fn respond(&self, running_sum: u64, value: u64, modulus: Modulus) -> u64;

    /// Initiator, once the token is back: strip the mask.
    fn reveal(&self, running_sum: u64, mask: u64, modulus: Modulus) -> u64;
}

/// Follows the protocol.
#[derive(Clone, Copy, Debug, Default)]
pub struct HonestParticipant;

impl RoundParticipant for HonestParticipant {
    fn commit(
        &self,
        value: u64,
        modulus: Modulus,
        range: MaskRange,
        rng: &mut dyn RngCore,
    ) -> Masked {
        secure_sum::mask(value, modulus, range, rng)
    }

    fn respond(&self, running_sum: u64, value: u64, modulus: Modulus) -> u64 {
        secure_sum::accumulate(running_sum, value, modulus)
    }

    fn reveal(&self, running_sum: u64, mask: u64, modulus: Modulus) -> u64 {
        secure_sum::unmask(running_sum, mask, modulus)
    }
}
