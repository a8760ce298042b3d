//! Per-node round state machine.
//!
//! The engine runs on its own thread and is the only owner of the node's
//! [`RoundState`]. Handlers and the driver talk to it through [`Command`]s and
//! get answers on reply channels; the engine itself never touches a socket.
//!
//! ```text
//! Idle --initiate--> Initiating --own token back--> Draining --drain--> Idle
//! Idle --foreign token--> Forwarding --delivered--> Draining --drain--> Idle
//! Initiating/Forwarding --abandon/forward failure--> Idle
//! ```

use crate::participant::RoundParticipant;
use crate::ring::stats::NodeStats;
use crate::ring::transport::ForwardError;
use crate::ring::types::{
    MaskDisclosure, NodeId, NodeStatus, RoundId, RoundMessage, RoundPhase,
};
use crate::secure_sum::{MaskRange, Modulus};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Outcomes the driver sees.
#[derive(Debug, Error)]
pub enum RoundError {
    #[error("a round is already active on this node")]
    AlreadyActive,
    #[error("no result within {0:?}")]
    Timeout(Duration),
    #[error("first hop failed: {0}")]
    Forward(#[from] ForwardError),
    #[error("round was aborted before it completed")]
    Aborted,
    #[error("round engine is not running")]
    EngineStopped,
}

enum RoundState {
    Idle,
    Initiating {
        round: RoundId,
        mask: u64,
        notify: mpsc::SyncSender<u64>,
    },
    Forwarding {
        initiator: NodeId,
        round: RoundId,
    },
    Draining {
        initiator: NodeId,
        round: RoundId,
        until: Instant,
    },
}

impl RoundState {
    fn phase(&self) -> RoundPhase {
        match self {
            RoundState::Idle => RoundPhase::Idle,
            RoundState::Initiating { .. } => RoundPhase::Initiating,
            RoundState::Forwarding { .. } => RoundPhase::Forwarding,
            RoundState::Draining { .. } => RoundPhase::Draining,
        }
    }

    fn round(&self) -> Option<RoundId> {
        match self {
            RoundState::Idle => None,
            RoundState::Initiating { round, .. }
            | RoundState::Forwarding { round, .. }
            | RoundState::Draining { round, .. } => Some(*round),
        }
    }
}

/// Why an inbound message was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    /// Our own token for a round we are no longer running.
    Stale,
    /// A repeat of the round we just finished.
    Duplicate,
    /// Another round while ours is in flight.
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Forward(RoundMessage),
    Completed(u64),
    Discarded(Discard),
}

pub(crate) struct Initiated {
    pub message: RoundMessage,
    pub result: mpsc::Receiver<u64>,
}

pub(crate) enum Command {
    Initiate(mpsc::Sender<Result<Initiated, RoundError>>),
    Inbound(RoundMessage, mpsc::Sender<Disposition>),
    Delivered(RoundId),
    ForwardFailed(RoundId),
    /// Drop our own round if it is still in flight. The reply carries the
    /// total when the round had already completed.
    Abandon {
        round: RoundId,
        reply: Option<mpsc::Sender<Option<u64>>>,
    },
    SetValue(u64),
    Status(mpsc::Sender<NodeStatus>),
    Shutdown,
}

pub(crate) struct EngineParams {
    pub node_id: NodeId,
    pub value: u64,
    pub modulus: Modulus,
    pub mask_range: MaskRange,
    pub disclosure: MaskDisclosure,
    pub drain: Duration,
}

pub(crate) struct Engine {
    params: EngineParams,
    participant: Arc<dyn RoundParticipant>,
    stats: Arc<NodeStats>,
    rng: StdRng,
    state: RoundState,
    last_result: Option<u64>,
}

impl Engine {
    pub fn new(
        params: EngineParams,
        participant: Arc<dyn RoundParticipant>,
        stats: Arc<NodeStats>,
    ) -> Self {
        Self {
            params,
            participant,
            stats,
            rng: StdRng::from_entropy(),
            state: RoundState::Idle,
            last_result: None,
        }
    }

    pub fn spawn(self) -> std::io::Result<(EngineHandle, thread::JoinHandle<()>)> {
        let (tx, rx) = mpsc::channel();
        let name = format!("ring-engine-{}", self.params.node_id);
        let handle = thread::Builder::new().name(name).spawn(move || self.run(rx))?;
        Ok((EngineHandle { tx }, handle))
    }

    fn run(mut self, rx: mpsc::Receiver<Command>) {
        loop {
            let cmd = match self.drain_deadline() {
                Some(until) => {
                    let wait = until.saturating_duration_since(Instant::now());
                    match rx.recv_timeout(wait) {
                        Ok(cmd) => cmd,
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            self.expire(Instant::now());
                            continue;
                        }
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match rx.recv() {
                    Ok(cmd) => cmd,
                    Err(_) => break,
                },
            };
            if !self.handle(cmd, Instant::now()) {
                break;
            }
        }
        debug!(node = self.params.node_id, "engine stopped");
    }

    fn handle(&mut self, cmd: Command, now: Instant) -> bool {
        self.expire(now);
        match cmd {
            Command::Initiate(reply) => {
                let _ = reply.send(self.initiate(now));
            }
            Command::Inbound(msg, reply) => {
                let _ = reply.send(self.inbound(msg, now));
            }
            Command::Delivered(round) => self.delivered(round, now),
            Command::ForwardFailed(round) => self.forward_failed(round),
            Command::Abandon { round, reply } => {
                let completed = self.abandon(round);
                if let Some(reply) = reply {
                    let _ = reply.send(completed);
                }
            }
            Command::SetValue(value) => {
                self.params.value = value;
                info!(node = self.params.node_id, "private value updated");
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn initiate(&mut self, _now: Instant) -> Result<Initiated, RoundError> {
        if !matches!(self.state, RoundState::Idle) {
            return Err(RoundError::AlreadyActive);
        }
        let p = &self.params;
        let round: RoundId = self.rng.gen();
        let masked = self
            .participant
            .commit(p.value, p.modulus, p.mask_range, &mut self.rng);
        let sum = p.modulus.reduce(masked.value);
        let carried = match p.disclosure {
            MaskDisclosure::Local => None,
            MaskDisclosure::InMessage => Some(masked.mask),
        };
        let (notify, result) = mpsc::sync_channel(1);
        info!(node = p.node_id, round, sum, "starting round as initiator");
        self.state = RoundState::Initiating {
            round,
            mask: masked.mask,
            notify,
        };
        Ok(Initiated {
            message: RoundMessage {
                sum,
                initiator: self.params.node_id,
                round,
                mask: carried,
            },
            result,
        })
    }

    fn inbound(&mut self, msg: RoundMessage, now: Instant) -> Disposition {
        if msg.initiator == self.params.node_id {
            return self.complete(msg, now);
        }
        match self.state {
            RoundState::Draining {
                initiator, round, ..
            } if initiator == msg.initiator && round == msg.round => {
                self.discard(&msg, Discard::Duplicate)
            }
            RoundState::Idle | RoundState::Draining { .. } => {
                let p = &self.params;
                let sum = p
                    .modulus
                    .reduce(self.participant.respond(msg.sum, p.value, p.modulus));
                debug!(
                    node = p.node_id,
                    initiator = msg.initiator,
                    round = msg.round,
                    received = msg.sum,
                    sum,
                    "added local value"
                );
                self.state = RoundState::Forwarding {
                    initiator: msg.initiator,
                    round: msg.round,
                };
                Disposition::Forward(RoundMessage { sum, ..msg })
            }
            RoundState::Initiating { .. } | RoundState::Forwarding { .. } => {
                self.discard(&msg, Discard::Busy)
            }
        }
    }

    fn complete(&mut self, msg: RoundMessage, now: Instant) -> Disposition {
        let node_id = self.params.node_id;
        let mask = match self.state {
            RoundState::Initiating { round, mask, .. } if round == msg.round => mask,
            RoundState::Draining {
                initiator, round, ..
            } if initiator == node_id && round == msg.round => {
                return self.discard(&msg, Discard::Duplicate);
            }
            _ => return self.discard(&msg, Discard::Stale),
        };
        let p = &self.params;
        let total = p
            .modulus
            .reduce(self.participant.reveal(msg.sum, mask, p.modulus));
        let previous = std::mem::replace(
            &mut self.state,
            RoundState::Draining {
                initiator: node_id,
                round: msg.round,
                until: now + p.drain,
            },
        );
        if let RoundState::Initiating { notify, .. } = previous {
            let _ = notify.try_send(total);
        }
        self.last_result = Some(total);
        self.stats.round_completed();
        info!(node = node_id, round = msg.round, total, "round complete");
        Disposition::Completed(total)
    }

    fn delivered(&mut self, delivered: RoundId, now: Instant) {
        if let RoundState::Forwarding { initiator, round } = self.state {
            if round == delivered {
                self.stats.round_forwarded();
                self.state = RoundState::Draining {
                    initiator,
                    round,
                    until: now + self.params.drain,
                };
            }
        }
    }

    fn forward_failed(&mut self, failed: RoundId) {
        if let RoundState::Forwarding { initiator, round } = self.state {
            if round == failed {
                warn!(
                    node = self.params.node_id,
                    initiator, round, "round aborted locally; the rest of the ring is not told"
                );
                self.stats.round_aborted();
                self.state = RoundState::Idle;
            }
        }
    }

    fn abandon(&mut self, abandoned: RoundId) -> Option<u64> {
        let node_id = self.params.node_id;
        match self.state {
            RoundState::Initiating { round, .. } if round == abandoned => {
                warn!(node = node_id, round, "initiator abandoned round");
                self.stats.round_aborted();
                self.state = RoundState::Idle;
                None
            }
            RoundState::Draining {
                initiator, round, ..
            } if initiator == node_id && round == abandoned => self.last_result,
            _ => None,
        }
    }

    fn expire(&mut self, now: Instant) {
        if let RoundState::Draining { until, .. } = self.state {
            if now >= until {
                debug!(node = self.params.node_id, "ready for next round");
                self.state = RoundState::Idle;
            }
        }
    }

    fn drain_deadline(&self) -> Option<Instant> {
        match self.state {
            RoundState::Draining { until, .. } => Some(until),
            _ => None,
        }
    }

    fn discard(&self, msg: &RoundMessage, reason: Discard) -> Disposition {
        self.stats.message_discarded();
        warn!(
            node = self.params.node_id,
            initiator = msg.initiator,
            round = msg.round,
            ?reason,
            "discarding round message"
        );
        Disposition::Discarded(reason)
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            phase: self.state.phase(),
            round: self.state.round(),
            value: self.params.value,
            last_result: self.last_result,
        }
    }
}

/// Cloneable sender side of the engine's command channel.
#[derive(Clone)]
pub(crate) struct EngineHandle {
    tx: mpsc::Sender<Command>,
}

impl EngineHandle {
    fn request<T>(&self, make: impl FnOnce(mpsc::Sender<T>) -> Command) -> Result<T, RoundError> {
        let (reply, rx) = mpsc::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| RoundError::EngineStopped)?;
        rx.recv().map_err(|_| RoundError::EngineStopped)
    }

    pub fn initiate(&self) -> Result<Initiated, RoundError> {
        self.request(Command::Initiate)?
    }

    pub fn inbound(&self, msg: RoundMessage) -> Result<Disposition, RoundError> {
        self.request(|reply| Command::Inbound(msg, reply))
    }

    pub fn status(&self) -> Result<NodeStatus, RoundError> {
        self.request(Command::Status)
    }

    pub fn abandon(&self, round: RoundId) -> Result<Option<u64>, RoundError> {
        self.request(|reply| Command::Abandon {
            round,
            reply: Some(reply),
        })
    }

    pub fn notify(&self, cmd: Command) {
        let _ = self.tx.send(cmd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participant::HonestParticipant;
    use crate::secure_sum::{self, Masked};
    use rand::RngCore;

    struct FixedMask(u64);

    impl RoundParticipant for FixedMask {
        fn commit(&self, value: u64, m: Modulus, _: MaskRange, _: &mut dyn RngCore) -> Masked {
            Masked {
                value: secure_sum::mask_with(value, self.0, m),
                mask: self.0,
            }
        }

        fn respond(&self, running_sum: u64, value: u64, m: Modulus) -> u64 {
            HonestParticipant.respond(running_sum, value, m)
        }

        fn reveal(&self, running_sum: u64, mask: u64, m: Modulus) -> u64 {
            HonestParticipant.reveal(running_sum, mask, m)
        }
    }

    fn engine_with(node_id: NodeId, value: u64, participant: Arc<dyn RoundParticipant>) -> Engine {
        let modulus = Modulus::new(1500).unwrap();
        Engine::new(
            EngineParams {
                node_id,
                value,
                modulus,
                mask_range: MaskRange::full(modulus),
                disclosure: MaskDisclosure::Local,
                drain: Duration::from_millis(100),
            },
            participant,
            Arc::new(NodeStats::new()),
        )
    }

    fn engine(node_id: NodeId, value: u64) -> Engine {
        engine_with(node_id, value, Arc::new(HonestParticipant))
    }

    fn msg(sum: u64, initiator: NodeId, round: RoundId) -> RoundMessage {
        RoundMessage {
            sum,
            initiator,
            round,
            mask: None,
        }
    }

    #[test]
    fn second_initiate_is_rejected() {
        let now = Instant::now();
        let mut e = engine(1, 10);
        let first = e.initiate(now).expect("first initiate");
        assert_eq!(first.message.initiator, 1);
        assert!(first.message.sum < 1500);
        assert!(first.message.mask.is_none());
        assert!(matches!(e.initiate(now), Err(RoundError::AlreadyActive)));
        assert_eq!(e.status().phase, RoundPhase::Initiating);
    }

    #[test]
    fn initiator_unmasks_returning_token() {
        let now = Instant::now();
        let mut e = engine_with(1, 10, Arc::new(FixedMask(5)));
        let started = e.initiate(now).unwrap();
        assert_eq!(started.message.sum, 15);

        let back = msg(65, 1, started.message.round);
        assert_eq!(e.inbound(back, now), Disposition::Completed(60));
        assert_eq!(started.result.try_recv().unwrap(), 60);
        assert_eq!(e.status().phase, RoundPhase::Draining);
        assert_eq!(e.status().last_result, Some(60));

        // trailing copy of the same round
        assert_eq!(e.inbound(back, now), Disposition::Discarded(Discard::Duplicate));
        assert!(matches!(e.initiate(now), Err(RoundError::AlreadyActive)));

        e.expire(now + Duration::from_millis(150));
        assert_eq!(e.status().phase, RoundPhase::Idle);
        assert!(e.initiate(now).is_ok());
        assert_eq!(e.stats.snapshot().rounds_completed, 1);
    }

    #[test]
    fn forwarder_accumulates_then_drains() {
        let now = Instant::now();
        let mut e = engine(2, 20);
        assert_eq!(e.inbound(msg(15, 1, 7), now), Disposition::Forward(msg(35, 1, 7)));
        assert_eq!(e.status().phase, RoundPhase::Forwarding);

        assert_eq!(
            e.inbound(msg(99, 3, 8), now),
            Disposition::Discarded(Discard::Busy)
        );

        e.delivered(7, now);
        assert_eq!(e.status().phase, RoundPhase::Draining);
        assert_eq!(
            e.inbound(msg(15, 1, 7), now),
            Disposition::Discarded(Discard::Duplicate)
        );

        // a different round during the drain is a new round
        assert_eq!(e.inbound(msg(0, 3, 9), now), Disposition::Forward(msg(20, 3, 9)));
        e.delivered(9, now);
        e.expire(now + Duration::from_millis(150));
        assert_eq!(e.status().phase, RoundPhase::Idle);

        let stats = e.stats.snapshot();
        assert_eq!(stats.rounds_forwarded, 2);
        assert_eq!(stats.messages_discarded, 2);
    }

    #[test]
    fn running_sum_is_reduced_at_every_hop() {
        let now = Instant::now();
        let mut e = engine(2, 1400);
        assert_eq!(e.inbound(msg(1499, 1, 1), now), Disposition::Forward(msg(1399, 1, 1)));

        let mut e = engine(2, 0);
        assert_eq!(e.inbound(msg(4000, 1, 1), now), Disposition::Forward(msg(1000, 1, 1)));
    }

    #[test]
    fn own_token_without_matching_round_is_stale() {
        let now = Instant::now();
        let mut e = engine(1, 10);
        assert_eq!(e.inbound(msg(65, 1, 3), now), Disposition::Discarded(Discard::Stale));
        assert_eq!(e.status().phase, RoundPhase::Idle);

        let started = e.initiate(now).unwrap();
        let wrong = started.message.round.wrapping_add(1);
        assert_eq!(
            e.inbound(msg(65, 1, wrong), now),
            Disposition::Discarded(Discard::Stale)
        );
        assert_eq!(e.status().phase, RoundPhase::Initiating);
    }

    #[test]
    fn abandon_after_completion_returns_total() {
        let now = Instant::now();
        let mut e = engine_with(1, 10, Arc::new(FixedMask(5)));
        let started = e.initiate(now).unwrap();
        let round = started.message.round;
        assert_eq!(e.status().round, Some(round));

        e.inbound(msg(65, 1, round), now);
        assert_eq!(e.abandon(round), Some(60));
        assert_eq!(e.status().phase, RoundPhase::Draining);
        assert_eq!(e.abandon(round.wrapping_add(1)), None);
        assert_eq!(e.stats.snapshot().rounds_aborted, 0);
    }

    #[test]
    fn forward_failure_resets_to_idle() {
        let now = Instant::now();
        let mut e = engine(2, 20);
        e.inbound(msg(15, 1, 4), now);
        e.forward_failed(5);
        assert_eq!(e.status().phase, RoundPhase::Forwarding);
        e.forward_failed(4);
        assert_eq!(e.status().phase, RoundPhase::Idle);
        assert_eq!(e.stats.snapshot().rounds_aborted, 1);
    }

    #[test]
    fn abandon_resets_initiator_and_closes_waiter() {
        let now = Instant::now();
        let mut e = engine(1, 10);
        let started = e.initiate(now).unwrap();
        assert_eq!(e.abandon(started.message.round), None);
        assert_eq!(e.status().phase, RoundPhase::Idle);
        assert_eq!(e.status().round, None);
        assert!(matches!(
            started.result.try_recv(),
            Err(mpsc::TryRecvError::Disconnected)
        ));
        assert_eq!(
            e.inbound(msg(65, 1, started.message.round), now),
            Disposition::Discarded(Discard::Stale)
        );
    }

    #[test]
    fn in_message_disclosure_carries_mask_through_the_ring() {
        let now = Instant::now();
        let mut first = engine_with(1, 10, Arc::new(FixedMask(5)));
        first.params.disclosure = MaskDisclosure::InMessage;
        let started = first.initiate(now).unwrap();
        assert_eq!(started.message.mask, Some(5));

        let mut second = engine(2, 20);
        match second.inbound(started.message, now) {
            Disposition::Forward(next) => {
                assert_eq!(next.mask, Some(5));
                assert_eq!(next.sum, 35);
            }
            other => panic!("unexpected disposition {:?}", other),
        }
    }

    #[test]
    fn handle_updates_value_and_stops_on_shutdown() {
        let now = Instant::now();
        let mut e = engine(1, 10);
        assert!(e.handle(Command::SetValue(42), now));
        assert_eq!(e.status().value, 42);
        assert!(!e.handle(Command::Shutdown, now));
    }

    #[test]
    fn abandon_queued_behind_completion_reports_total() {
        let (handle, join) = engine_with(1, 10, Arc::new(FixedMask(5))).spawn().unwrap();
        let started = handle.initiate().unwrap();
        let round = started.message.round;
        // the returning token is handled before the driver gives up
        assert_eq!(
            handle.inbound(msg(65, 1, round)).unwrap(),
            Disposition::Completed(60)
        );
        assert_eq!(handle.abandon(round).unwrap(), Some(60));
        assert_eq!(started.result.try_recv().unwrap(), 60);
        assert_eq!(handle.status().unwrap().last_result, Some(60));
        handle.notify(Command::Shutdown);
        join.join().unwrap();
    }

    #[test]
    fn engine_thread_answers_requests() {
        let (handle, join) = engine(4, 7).spawn().unwrap();
        let started = handle.initiate().unwrap();
        assert!(matches!(handle.initiate(), Err(RoundError::AlreadyActive)));
        assert_eq!(handle.status().unwrap().phase, RoundPhase::Initiating);
        assert_eq!(handle.abandon(started.message.round).unwrap(), None);
        assert_eq!(handle.status().unwrap().phase, RoundPhase::Idle);
        handle.notify(Command::Shutdown);
        join.join().unwrap();
        assert!(matches!(handle.status(), Err(RoundError::EngineStopped)));
    }
}
