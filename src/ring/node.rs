//! A running ring member: listener, per-connection handlers, engine thread
//! and the driver-facing API.

use crate::participant::{HonestParticipant, RoundParticipant};
use crate::ring::codec;
use crate::ring::config::{ConfigError, RingConfig, TimingConfig};
use crate::ring::engine::{
    Command, Disposition, Engine, EngineHandle, EngineParams, Initiated, RoundError,
};
use crate::ring::stats::{NodeStats, StatsSnapshot};
use crate::ring::transport::{
    self, ClientTls, ForwardError, ServerTls, TlsContext, TransportError,
};
use crate::ring::types::{MaskDisclosure, NodeId, NodeStatus, RingMember, RoundId, RoundMessage};
use std::io::{ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// Start-up failures.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("failed to spawn {0} thread: {1}")]
    Spawn(&'static str, #[source] std::io::Error),
}

/// Outbound half: the one successor this node ever talks to.
struct Successor {
    client: ClientTls,
    member: RingMember,
    timing: TimingConfig,
}

impl Successor {
    fn send(&self, msg: &RoundMessage) -> Result<(), ForwardError> {
        transport::deliver(&self.client, &self.member.address(), msg, &self.timing)
    }
}

/// Everything a connection handler needs. Cloned per connection.
#[derive(Clone)]
struct Inbound {
    node_id: NodeId,
    server: ServerTls,
    io_timeout: Duration,
    engine: EngineHandle,
    successor: Arc<Successor>,
    stats: Arc<NodeStats>,
}

pub struct Node {
    id: NodeId,
    modulus: u64,
    local_addr: SocketAddr,
    result_timeout: Duration,
    engine: EngineHandle,
    successor: Arc<Successor>,
    stats: Arc<NodeStats>,
    shutdown: Arc<AtomicBool>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl Node {
    /// Starts an honest member `id` of the ring described by `config`,
    /// holding private `value`.
    pub fn start(config: &RingConfig, id: NodeId, value: u64) -> Result<Node, NodeError> {
        Self::start_with(config, id, value, Arc::new(HonestParticipant))
    }

    pub fn start_with(
        config: &RingConfig,
        id: NodeId,
        value: u64,
        participant: Arc<dyn RoundParticipant>,
    ) -> Result<Node, NodeError> {
        config.validate()?;
        config.check_value(value)?;
        let identity = config.identity(id)?;
        let tls = TlsContext::from_pki(&identity.pki, &config.pki.server_name)?;

        if config.mask_disclosure == MaskDisclosure::InMessage {
            warn!(
                node = id,
                "mask_disclosure = in_message: R travels with every hop and any member can recover the initiator's value"
            );
        }

        let addr = identity.member.address();
        let listener = TcpListener::bind(&addr).map_err(|source| NodeError::Bind {
            addr: addr.clone(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| NodeError::Bind {
            addr: addr.clone(),
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| NodeError::Bind { addr, source })?;

        let stats = Arc::new(NodeStats::new());
        let engine = Engine::new(
            EngineParams {
                node_id: id,
                value,
                modulus: config.modulus()?,
                mask_range: config.mask_range()?,
                disclosure: config.mask_disclosure,
                drain: config.timing.drain(),
            },
            participant,
            Arc::clone(&stats),
        );
        let (engine, engine_thread) = engine
            .spawn()
            .map_err(|e| NodeError::Spawn("engine", e))?;

        let successor = Arc::new(Successor {
            client: tls.client,
            member: identity.successor.clone(),
            timing: config.timing.clone(),
        });
        let inbound = Inbound {
            node_id: id,
            server: tls.server,
            io_timeout: config.timing.io_timeout(),
            engine: engine.clone(),
            successor: Arc::clone(&successor),
            stats: Arc::clone(&stats),
        };
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_in = Arc::clone(&shutdown);
        let accept_thread = thread::Builder::new()
            .name(format!("ring-accept-{}", id))
            .spawn(move || serve(listener, inbound, shutdown_in))
            .map_err(|e| {
                engine.notify(Command::Shutdown);
                NodeError::Spawn("accept", e)
            })?;

        info!(
            node = id,
            %local_addr,
            successor = identity.successor.id,
            successor_addr = %identity.successor.address(),
            "ring node listening"
        );

        Ok(Node {
            id,
            modulus: config.modulus,
            local_addr,
            result_timeout: config.timing.result_timeout(),
            engine,
            successor,
            stats,
            shutdown,
            threads: vec![accept_thread, engine_thread],
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Configured wait for [`RoundTicket::await_result`].
    pub fn result_timeout(&self) -> Duration {
        self.result_timeout
    }

    /// Starts a round with this node as initiator and sends the masked value
    /// to the successor. The send happens on the caller's thread.
    pub fn initiate(&self) -> Result<RoundTicket, RoundError> {
        let Initiated { message, result } = self.engine.initiate()?;
        if let Err(e) = self.successor.send(&message) {
            warn!(
                node = self.id,
                round = message.round,
                successor = self.successor.member.id,
                error = %e,
                "first hop failed; round abandoned"
            );
            self.engine.notify(Command::Abandon {
                round: message.round,
                reply: None,
            });
            return Err(RoundError::Forward(e));
        }
        info!(
            node = self.id,
            round = message.round,
            successor = self.successor.member.id,
            "round started"
        );
        Ok(RoundTicket {
            node: self.id,
            round: message.round,
            result,
            engine: self.engine.clone(),
            settled: false,
        })
    }

    pub fn status(&self) -> Result<NodeStatus, RoundError> {
        self.engine.status()
    }

    pub fn is_active(&self) -> bool {
        self.status().map(|s| s.is_active()).unwrap_or(false)
    }

    /// Replaces the private value used by later rounds.
    pub fn set_value(&self, value: u64) -> Result<(), ConfigError> {
        if value >= self.modulus {
            return Err(ConfigError::ValueOutOfRange {
                value,
                modulus: self.modulus,
            });
        }
        self.engine.notify(Command::SetValue(value));
        Ok(())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stops accepting connections and joins the node's threads. Handlers
    /// already running finish on their own.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.engine.notify(Command::Shutdown);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Handle on a round this node initiated. Dropping it without awaiting the
/// result abandons the round if it is still in flight.
pub struct RoundTicket {
    node: NodeId,
    round: RoundId,
    result: mpsc::Receiver<u64>,
    engine: EngineHandle,
    settled: bool,
}

impl RoundTicket {
    pub fn round(&self) -> RoundId {
        self.round
    }

    /// Blocks until the token comes back or `timeout` elapses. On timeout only
    /// this node's state is reset; the rest of the ring is not told.
    pub fn await_result(mut self, timeout: Duration) -> Result<u64, RoundError> {
        self.settled = true;
        match self.result.recv_timeout(timeout) {
            Ok(total) => Ok(total),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                // the engine may have completed the round after the timer fired
                if let Some(total) = self.engine.abandon(self.round)? {
                    return Ok(total);
                }
                if let Ok(total) = self.result.try_recv() {
                    return Ok(total);
                }
                warn!(node = self.node, round = self.round, ?timeout, "round timed out");
                Err(RoundError::Timeout(timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(RoundError::Aborted),
        }
    }
}

impl Drop for RoundTicket {
    fn drop(&mut self) {
        if !self.settled {
            debug!(node = self.node, round = self.round, "round ticket dropped");
            self.engine.notify(Command::Abandon {
                round: self.round,
                reply: None,
            });
        }
    }
}

fn serve(listener: TcpListener, inbound: Inbound, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match listener.accept() {
            Ok((tcp, peer)) => {
                inbound.stats.connection_accepted();
                let ctx = inbound.clone();
                let spawned = thread::Builder::new()
                    .name(format!("ring-conn-{}", inbound.node_id))
                    .spawn(move || handle_connection(tcp, peer, ctx));
                if let Err(e) = spawned {
                    error!(node = inbound.node_id, %peer, error = %e, "failed to spawn handler");
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                warn!(node = inbound.node_id, error = %err, "accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    debug!(node = inbound.node_id, "listener stopped");
}

/// handshake -> decode -> acknowledge -> engine -> forward
fn handle_connection(tcp: TcpStream, peer: SocketAddr, ctx: Inbound) {
    let node = ctx.node_id;
    let mut stream = match ctx.server.accept(tcp, ctx.io_timeout) {
        Ok(stream) => stream,
        Err(e) => {
            ctx.stats.handshake_rejected();
            warn!(node, %peer, error = %e, "inbound handshake rejected");
            return;
        }
    };
    if let Some(fingerprint) = transport::peer_fingerprint(&stream) {
        debug!(node, %peer, %fingerprint, "peer authenticated");
    }

    let msg = match codec::read_message(&mut stream) {
        Ok(msg) => msg,
        Err(e) => {
            ctx.stats.decode_failed();
            warn!(node, %peer, error = %e, "dropping undecodable payload");
            return;
        }
    };
    if let Err(e) = codec::write_ack(&mut stream) {
        warn!(node, %peer, error = %e, "could not acknowledge; message dropped");
        return;
    }
    stream.conn.send_close_notify();
    let _ = stream.flush();
    drop(stream);

    info!(
        node,
        %peer,
        initiator = msg.initiator,
        round = msg.round,
        sum = msg.sum,
        "received round message"
    );

    let disposition = match ctx.engine.inbound(msg) {
        Ok(d) => d,
        Err(e) => {
            warn!(node, error = %e, "engine unavailable; message dropped");
            return;
        }
    };
    match disposition {
        Disposition::Forward(next) => match ctx.successor.send(&next) {
            Ok(()) => {
                info!(
                    node,
                    round = next.round,
                    sum = next.sum,
                    successor = ctx.successor.member.id,
                    "forwarded"
                );
                ctx.engine.notify(Command::Delivered(next.round));
            }
            Err(e) => {
                warn!(
                    node,
                    round = next.round,
                    successor = ctx.successor.member.id,
                    error = %e,
                    "forward failed; aborting round locally"
                );
                ctx.engine.notify(Command::ForwardFailed(next.round));
            }
        },
        Disposition::Completed(_) | Disposition::Discarded(_) => {}
    }
}
