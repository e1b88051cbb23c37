//! Offer/answer exchange coordination and connection promotion
//!
//! This module contains:
//! - [`RtcGateway`]: turns one accepted offer into one local answer without
//!   blocking on channel establishment
//! - [`PendingExchange`]: the half-open session between the HTTP exchange and
//!   its resolution
//! - The promotion race: a deadline and the engine's "data channel ready"
//!   signal compete on a single waiter task; exactly one outcome per
//!   exchange, and the application handler runs at most once
//!
//! The single-fire guarantee is structural: the ready signal is a
//! `tokio::sync::oneshot` resolved inside one `tokio::select!`, so there is
//! no shared outcome cell to guard.

use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::transport::{Transport, TransportSession};

/// How long an answered exchange may stay half-open before it is torn down.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Application callback receiving ownership of each promoted connection.
pub type ConnHandler<C> = Arc<dyn Fn(C) + Send + Sync>;

/// Why an exchange failed at accept time. All variants terminate the
/// exchange before any race is armed and leave no live session behind.
#[derive(Debug, Error)]
pub enum NegotiateError {
    #[error("no connection handler registered")]
    NoHandler,

    #[error("failed to create transport session: {0:#}")]
    SessionFailed(anyhow::Error),

    #[error("remote offer rejected: {0:#}")]
    RemoteRejected(anyhow::Error),

    #[error("answer generation failed: {0:#}")]
    AnswerFailed(anyhow::Error),

    #[error("committing local answer failed: {0:#}")]
    LocalCommitFailed(anyhow::Error),
}

/// The one terminal state of a pending exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionOutcome {
    /// The data channel opened in time; the connection now belongs to the
    /// application handler.
    Promoted,
    Aborted(AbortReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// No data channel within the deadline.
    Timeout,
    /// The engine dropped its notifier without ever firing it.
    SignalLost,
}

/// A half-open exchange: the answer has been emitted but the data channel
/// has not appeared yet. Owns its session exclusively, plus the handler that
/// will consume the connection, so a live session can never lack a consumer.
pub struct PendingExchange<S: TransportSession> {
    session: S,
    ready: oneshot::Receiver<S::Conn>,
    handler: ConnHandler<S::Conn>,
    answered_at: Instant,
}

impl<S: TransportSession> std::fmt::Debug for PendingExchange<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The session and handler are opaque; the timestamp is what matters
        // when one of these shows up in test output.
        f.debug_struct("PendingExchange")
            .field("answered_at", &self.answered_at)
            .finish_non_exhaustive()
    }
}

impl<S: TransportSession> PendingExchange<S> {
    /// Close the session without racing. Used when the answer could not be
    /// delivered at all.
    pub async fn discard(self) {
        if let Err(e) = self.session.close().await {
            log::warn!("failed to close discarded session: {e:#}");
        }
    }

    /// Resolve the exchange: whichever of {deadline, ready signal} comes
    /// first wins, and the loser is a no-op.
    async fn resolve(self, deadline: Duration) -> PromotionOutcome {
        let PendingExchange {
            session,
            ready,
            handler,
            answered_at,
        } = self;

        tokio::select! {
            established = ready => match established {
                Ok(conn) => {
                    log::info!(
                        "data channel established {:?} after answer",
                        answered_at.elapsed()
                    );
                    handler(conn);
                    PromotionOutcome::Promoted
                }
                Err(_) => {
                    log::warn!("transport session dropped its ready signal");
                    close_quietly(&session).await;
                    PromotionOutcome::Aborted(AbortReason::SignalLost)
                }
            },
            _ = tokio::time::sleep(deadline) => {
                log::warn!("no data channel within {deadline:?}, closing session");
                close_quietly(&session).await;
                PromotionOutcome::Aborted(AbortReason::Timeout)
            }
        }
    }
}

async fn close_quietly<S: TransportSession>(session: &S) {
    if let Err(e) = session.close().await {
        log::warn!("failed to close session: {e:#}");
    }
}

/// Signaling gateway: accepts offers, emits answers, and promotes or aborts
/// the resulting half-open sessions.
pub struct RtcGateway<T: Transport> {
    transport: T,
    handler: RwLock<Option<ConnHandler<T::Conn>>>,
    handshake_timeout: Duration,
}

impl<T: Transport> RtcGateway<T> {
    pub fn new(transport: T, handshake_timeout: Duration) -> Self {
        Self {
            transport,
            handler: RwLock::new(None),
            handshake_timeout,
        }
    }

    /// Register the application callback that receives each promoted
    /// connection. Must be called before any offer is accepted.
    pub fn register_connection_handler<F>(&self, handler: F)
    where
        F: Fn(T::Conn) + Send + Sync + 'static,
    {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(handler));
    }

    /// Accept one offer and produce the matching answer.
    ///
    /// Synchronous with respect to negotiation only: the returned exchange is
    /// still half-open and must be passed to [`RtcGateway::arm`] once the
    /// answer has been handed to the caller. Every error path closes the
    /// session before returning.
    pub async fn accept(
        &self,
        offer: RTCSessionDescription,
    ) -> Result<(PendingExchange<T::Session>, RTCSessionDescription), NegotiateError> {
        let handler = self
            .handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(NegotiateError::NoHandler)?;

        let session = self
            .transport
            .new_session()
            .await
            .map_err(NegotiateError::SessionFailed)?;

        if let Err(e) = session.set_remote_description(offer).await {
            close_quietly(&session).await;
            return Err(NegotiateError::RemoteRejected(e));
        }

        let answer = match session.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                close_quietly(&session).await;
                return Err(NegotiateError::AnswerFailed(e));
            }
        };

        if let Err(e) = session.set_local_description(answer.clone()).await {
            close_quietly(&session).await;
            return Err(NegotiateError::LocalCommitFailed(e));
        }

        let (notify, ready) = oneshot::channel();
        session.on_data_channel_ready(notify);

        let pending = PendingExchange {
            session,
            ready,
            handler,
            answered_at: Instant::now(),
        };
        Ok((pending, answer))
    }

    /// Arm the promotion race for an answered exchange. Spawns the one
    /// background waiter; the returned handle reports the outcome and may be
    /// dropped freely.
    pub fn arm(&self, pending: PendingExchange<T::Session>) -> JoinHandle<PromotionOutcome> {
        let deadline = self.handshake_timeout;
        tokio::spawn(pending.resolve(deadline))
    }
}
