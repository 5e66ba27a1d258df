//! Accepting the worker and verifying its session token.
//!
//! Flow:
//! 1. Accept loop waits on the listener
//! 2. First connection claims the worker slot; any later one is closed
//! 3. Token read runs on its own task, exactly `len(token)` bytes
//! 4. Outcome goes to the waiting [`Connection`] and to the readiness gate
//!
//! Completions only record outcomes and signal; nothing here blocks a thread.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, OnceLock};

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::Instrument;

use super::{ChannelState, StateCell};
use crate::bridge::descriptor::SessionId;
use crate::error::ForkChannelError;

/// Result of verifying the worker's session token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authentication {
    /// The worker sent the expected token.
    Verified,
    /// The connection ended before the full token arrived.
    ClosedEarly,
    /// The worker sent a token of the right length but different content.
    Mismatch { expected: String, actual: String },
}

impl Authentication {
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified)
    }

    /// Turns a failed verification into an error.
    pub fn into_result(self) -> Result<(), ForkChannelError> {
        match self {
            Self::Verified => Ok(()),
            failed => Err(ForkChannelError::Authentication(failed)),
        }
    }
}

impl fmt::Display for Authentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Verified => f.write_str("worker verified"),
            Self::ClosedEarly => f.write_str("channel closed while verifying the client"),
            Self::Mismatch { expected, actual } => write!(
                f,
                "the actual sessionId '{}' does not match '{}'",
                actual, expected
            ),
        }
    }
}

/// How the accept step resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    Accepted { peer: SocketAddr },
    Failed { reason: String },
}

/// Single-assignment slot for the worker socket.
///
/// The first claim wins; the slot never changes afterwards.
#[derive(Debug, Default)]
pub(crate) struct WorkerSlot {
    socket: OnceLock<std::net::TcpStream>,
}

impl WorkerSlot {
    /// Hands the stream back when another connection already holds the slot.
    pub(crate) fn claim(&self, stream: std::net::TcpStream) -> Result<(), std::net::TcpStream> {
        self.socket.set(stream)
    }

    pub(crate) fn get(&self) -> Option<&std::net::TcpStream> {
        self.socket.get()
    }

    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.get().and_then(|s| s.peer_addr().ok())
    }

    /// Shuts the claimed socket down in both directions. No-op when unclaimed.
    pub(crate) fn shutdown(&self) -> io::Result<()> {
        match self.socket.get() {
            Some(socket) => match socket.shutdown(Shutdown::Both) {
                Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
                _ => Ok(()),
            },
            None => Ok(()),
        }
    }
}

/// Handle returned by [`ForkChannel::connect_to_client`](super::ForkChannel::connect_to_client).
///
/// Waiting is two-phase: [`accepted`](Self::accepted) resolves once a connection
/// was accepted (or accepting failed), [`complete`](Self::complete) additionally
/// waits for the token verification outcome. There is no internal deadline.
#[derive(Debug, Clone)]
pub struct Connection {
    accepted: watch::Receiver<Option<AcceptOutcome>>,
    authenticated: watch::Receiver<Option<Authentication>>,
}

impl Connection {
    /// Phase 1: waits until a worker connection was accepted.
    pub async fn accepted(&self) -> Result<SocketAddr, ForkChannelError> {
        let mut rx = self.accepted.clone();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| {
                ForkChannelError::Accept("channel closed before a worker connected".to_string())
            })?
            .clone();
        match outcome {
            Some(AcceptOutcome::Accepted { peer }) => Ok(peer),
            Some(AcceptOutcome::Failed { reason }) => Err(ForkChannelError::Accept(reason)),
            None => Err(ForkChannelError::Accept("no accept outcome".to_string())),
        }
    }

    /// Phases 1 and 2: waits for acceptance, then for the token verification.
    ///
    /// A wrong or missing token is not an error here; it is reported through
    /// the returned [`Authentication`].
    pub async fn complete(&self) -> Result<Authentication, ForkChannelError> {
        self.accepted().await?;

        let mut rx = self.authenticated.clone();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| {
                ForkChannelError::Accept(
                    "channel closed before the worker was verified".to_string(),
                )
            })?
            .clone();
        outcome.ok_or_else(|| ForkChannelError::Accept("no authentication outcome".to_string()))
    }

    /// [`complete`](Self::complete) for synchronous callers. Parks the calling
    /// thread; must not be called from a runtime worker thread.
    pub fn blocking_complete(&self) -> Result<Authentication, ForkChannelError> {
        futures::executor::block_on(self.complete())
    }

    /// Verification outcome if it has already been recorded.
    pub fn authentication(&self) -> Option<Authentication> {
        self.authenticated.borrow().clone()
    }
}

/// Source of inbound worker connections.
pub(crate) trait Acceptor: Send + 'static {
    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Acceptor for TcpListener {
    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

/// Everything the accept task owns or shares with the channel.
pub(crate) struct Handshake<L = TcpListener> {
    pub listener: L,
    pub session_id: SessionId,
    pub worker: Arc<WorkerSlot>,
    pub state: Arc<StateCell>,
}

impl<L: Acceptor> Handshake<L> {
    /// Starts accepting on the current runtime. `on_outcome` runs once with the
    /// verification outcome, whatever it is.
    pub(crate) fn start<F>(self, on_outcome: F) -> (Connection, tokio::task::JoinHandle<()>)
    where
        F: FnOnce(Authentication) + Send + 'static,
    {
        let (accepted_tx, accepted_rx) = watch::channel(None);
        let (auth_tx, auth_rx) = watch::channel(None);

        self.state.advance(ChannelState::Accepting);
        let task = tokio::spawn(
            self.accept_loop(accepted_tx, auth_tx, on_outcome)
                .in_current_span(),
        );

        (
            Connection {
                accepted: accepted_rx,
                authenticated: auth_rx,
            },
            task,
        )
    }

    async fn accept_loop<F>(
        mut self,
        accepted_tx: watch::Sender<Option<AcceptOutcome>>,
        auth_tx: watch::Sender<Option<Authentication>>,
        on_outcome: F,
    ) where
        F: FnOnce(Authentication) + Send + 'static,
    {
        let mut pending = Some((auth_tx, on_outcome));

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) if pending.is_some() => {
                    tracing::error!(error = %e, "Failed to accept worker connection");
                    self.state.advance(ChannelState::Failed);
                    accepted_tx.send_replace(Some(AcceptOutcome::Failed {
                        reason: e.to_string(),
                    }));
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed after worker connected, no longer listening");
                    return;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(%peer, error = %e, "TCP_NODELAY not supported");
            }
            let stream = match stream.into_std() {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(%peer, error = %e, "Failed to take ownership of accepted socket");
                    continue;
                }
            };

            if let Err(spare) = self.worker.claim(stream) {
                tracing::warn!(%peer, "Another TCP client attempts to connect");
                if let Err(e) = spare.shutdown(Shutdown::Both) {
                    tracing::debug!(%peer, error = %e, "Failed to shut down extra connection");
                }
                continue;
            }

            let (Some(claimed), Some((auth_tx, on_outcome))) = (self.worker.get(), pending.take())
            else {
                continue;
            };

            tracing::debug!(%peer, "Worker connected");
            self.state.advance(ChannelState::Accepted);
            accepted_tx.send_replace(Some(AcceptOutcome::Accepted { peer }));

            let reader = claimed.try_clone().and_then(TcpStream::from_std);
            let session_id = self.session_id.clone();
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                let outcome = match reader {
                    Ok(reader) => {
                        state.advance(ChannelState::Authenticating);
                        verify_session(reader, &session_id).await
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to open worker socket for verification");
                        Authentication::ClosedEarly
                    }
                };
                state.advance(if outcome.is_verified() {
                    ChannelState::Authenticated
                } else {
                    ChannelState::Failed
                });
                match &outcome {
                    Authentication::Verified => tracing::debug!("Worker verified"),
                    failed => tracing::warn!(%failed, "Worker verification failed"),
                }
                auth_tx.send_replace(Some(outcome.clone()));
                on_outcome(outcome);
            }
            .in_current_span());
        }
    }
}

/// Reads exactly `session_id.len()` bytes and compares them to the token.
async fn verify_session(mut reader: TcpStream, session_id: &SessionId) -> Authentication {
    let mut received = vec![0u8; session_id.len()];
    match reader.read_exact(&mut received).await {
        Ok(_) if received == session_id.as_bytes() => Authentication::Verified,
        Ok(_) => Authentication::Mismatch {
            expected: session_id.to_string(),
            actual: String::from_utf8_lossy(&received).into_owned(),
        },
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Authentication::ClosedEarly,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read session id from worker");
            Authentication::ClosedEarly
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::TcpListener as StdTcpListener;
    use std::sync::Barrier;

    fn loopback_pairs(n: usize) -> Vec<(std::net::TcpStream, std::net::TcpStream)> {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        (0..n)
            .map(|_| {
                let client = std::net::TcpStream::connect(addr).unwrap();
                let (server, _) = listener.accept().unwrap();
                (server, client)
            })
            .collect()
    }

    #[test]
    fn concurrent_claims_retain_exactly_one() {
        let slot = Arc::new(WorkerSlot::default());
        let pairs = loopback_pairs(4);
        let start = Arc::new(Barrier::new(pairs.len()));

        let mut clients = Vec::new();
        let threads: Vec<_> = pairs
            .into_iter()
            .map(|(server, client)| {
                clients.push(client);
                let slot = Arc::clone(&slot);
                let start = Arc::clone(&start);
                std::thread::spawn(move || {
                    let peer = server.peer_addr().unwrap();
                    start.wait();
                    slot.claim(server).is_ok().then_some(peer)
                })
            })
            .collect();

        let winners: Vec<SocketAddr> = threads
            .into_iter()
            .filter_map(|t| t.join().unwrap())
            .collect();

        assert_eq!(winners.len(), 1);
        assert_eq!(slot.peer_addr(), Some(winners[0]));
        let client_addrs: HashSet<_> = clients.iter().map(|c| c.local_addr().unwrap()).collect();
        assert!(client_addrs.contains(&winners[0]));
    }

    #[test]
    fn losing_claim_returns_stream_and_keeps_winner() {
        let slot = WorkerSlot::default();
        let mut pairs = loopback_pairs(2);
        let (second, _c2) = pairs.pop().unwrap();
        let (first, _c1) = pairs.pop().unwrap();
        let first_peer = first.peer_addr().unwrap();
        let second_peer = second.peer_addr().unwrap();

        assert!(slot.claim(first).is_ok());
        let returned = slot.claim(second).unwrap_err();

        assert_eq!(returned.peer_addr().unwrap(), second_peer);
        assert_eq!(slot.peer_addr(), Some(first_peer));
    }

    #[test]
    fn shutdown_unclaimed_slot_is_noop() {
        let slot = WorkerSlot::default();
        assert!(slot.shutdown().is_ok());
        assert!(slot.get().is_none());
    }

    #[test]
    fn shutdown_twice_is_ok() {
        let slot = WorkerSlot::default();
        let (server, _client) = loopback_pairs(1).pop().unwrap();
        slot.claim(server).unwrap();
        assert!(slot.shutdown().is_ok());
        assert!(slot.shutdown().is_ok());
    }

    struct RefusingAcceptor;

    impl Acceptor for RefusingAcceptor {
        fn accept(
            &mut self,
        ) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
            std::future::ready(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "listener torn down",
            )))
        }
    }

    #[tokio::test]
    async fn accept_failure_releases_both_waits() {
        let state = Arc::new(StateCell::new(ChannelState::Listening));
        let handshake = Handshake {
            listener: RefusingAcceptor,
            session_id: SessionId::parse("abc123").unwrap(),
            worker: Arc::new(WorkerSlot::default()),
            state: Arc::clone(&state),
        };
        let outcomes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = Arc::clone(&outcomes);

        let (connection, task) = handshake.start(move |_| {
            seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        let err = connection.accepted().await.unwrap_err();
        assert!(
            matches!(&err, ForkChannelError::Accept(reason) if reason.contains("listener torn down")),
            "unexpected error: {err}"
        );
        assert!(matches!(
            connection.complete().await,
            Err(ForkChannelError::Accept(_))
        ));
        assert!(connection.authentication().is_none());
        assert_eq!(state.get(), ChannelState::Failed);

        task.await.unwrap();
        assert_eq!(outcomes.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn mismatch_message_names_both_tokens() {
        let outcome = Authentication::Mismatch {
            expected: "abc123".to_string(),
            actual: "wrongX".to_string(),
        };
        insta::assert_snapshot!(outcome.to_string(), @"the actual sessionId 'wrongX' does not match 'abc123'");
        assert!(outcome.into_result().is_err());
        assert!(Authentication::Verified.into_result().is_ok());
    }
}
