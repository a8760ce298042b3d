// Ring secure-sum: each node adds its private value to a masked token that
// circulates once around a fixed ring; only the initiator can remove the mask.
//
// Not a secure MPC protocol: a node's two neighbours together learn its value,
// and a small modulus can be brute forced.

pub mod participant;
pub mod ring;
pub mod secure_sum;

pub use participant::{HonestParticipant, RoundParticipant};
pub use ring::config::RingConfig;
pub use ring::engine::RoundError;
pub use ring::node::{Node, NodeError, RoundTicket};
pub use secure_sum::{MaskRange, Masked, Modulus};
