//! Transport engine boundary for peer-to-peer data sessions
//!
//! This module contains:
//! - The capability traits the signaling core consumes ([`Transport`],
//!   [`TransportSession`])
//! - Their implementation on top of the `webrtc` crate, with detached data
//!   channels so an established connection reads and writes as a byte stream
//!
//! ICE, DTLS, SCTP and SDP handling all live inside the engine; nothing here
//! inspects a session description beyond passing it through.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data::data_channel::DataChannel;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Google STUN server for NAT traversal
const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

// ============================================================================
// Capability traits
// ============================================================================

/// Factory for transport sessions. One session is acquired per accepted
/// offer; sessions are never reused.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Session: TransportSession<Conn = Self::Conn>;
    type Conn: Send + 'static;

    async fn new_session(&self) -> Result<Self::Session>;
}

/// One live negotiation session inside the transport engine.
///
/// The engine starts establishing its low-level transport in the background
/// as soon as the session exists; none of these calls wait for that.
#[async_trait]
pub trait TransportSession: Send + Sync + 'static {
    type Conn: Send + 'static;

    /// Apply the peer's offer as the remote description.
    async fn set_remote_description(&self, offer: RTCSessionDescription) -> Result<()>;

    /// Synthesize a local answer bound to this session.
    async fn create_answer(&self) -> Result<RTCSessionDescription>;

    /// Commit the answer as the local description.
    async fn set_local_description(&self, answer: RTCSessionDescription) -> Result<()>;

    /// Register the one-shot notification fired when the peer's data channel
    /// is open. Implementations must fire `notify` at most once, no matter
    /// how many channel events the engine produces.
    fn on_data_channel_ready(&self, notify: oneshot::Sender<Self::Conn>);

    /// Tear the session down.
    async fn close(&self) -> Result<()>;
}

// ============================================================================
// WebRTC implementation
// ============================================================================

/// WebRTC transport engine: one API object shared by all sessions.
pub struct WebRtcTransport {
    api: API,
    config: RTCConfiguration,
}

impl WebRtcTransport {
    /// Build the engine with data-channel detach enabled.
    pub fn new(config: RTCConfiguration) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("Failed to register default codecs")?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .context("Failed to register interceptors")?;

        // Detached channels read/write as byte streams instead of callbacks
        let mut setting_engine = SettingEngine::default();
        setting_engine.detach_data_channels();

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        Ok(Self { api, config })
    }

    /// Default configuration: a public STUN server for NAT traversal.
    pub fn default_config() -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![STUN_SERVER.to_owned()],
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    type Session = WebRtcSession;
    type Conn = WebRtcConn;

    async fn new_session(&self) -> Result<WebRtcSession> {
        let peer = Arc::new(
            self.api
                .new_peer_connection(self.config.clone())
                .await
                .context("Failed to create peer connection")?,
        );

        peer.on_ice_connection_state_change(Box::new(move |state| {
            log::debug!("ICE connection state changed: {state}");
            Box::pin(async {})
        }));

        peer.on_peer_connection_state_change(Box::new(move |state| {
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Connected => {
                        log::info!("WebRTC connection established");
                    }
                    RTCPeerConnectionState::Failed => {
                        log::warn!("WebRTC connection failed");
                    }
                    RTCPeerConnectionState::Closed => {
                        log::debug!("WebRTC connection closed");
                    }
                    _ => {}
                }
            })
        }));

        Ok(WebRtcSession { peer })
    }
}

/// One peer connection, exclusively owned by a pending exchange.
pub struct WebRtcSession {
    peer: Arc<RTCPeerConnection>,
}

#[async_trait]
impl TransportSession for WebRtcSession {
    type Conn = WebRtcConn;

    async fn set_remote_description(&self, offer: RTCSessionDescription) -> Result<()> {
        self.peer
            .set_remote_description(offer)
            .await
            .context("Failed to set remote description")
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription> {
        self.peer
            .create_answer(None)
            .await
            .context("Failed to create answer")
    }

    async fn set_local_description(&self, answer: RTCSessionDescription) -> Result<()> {
        self.peer
            .set_local_description(answer)
            .await
            .context("Failed to set local description")
    }

    fn on_data_channel_ready(&self, notify: oneshot::Sender<WebRtcConn>) {
        // Take-once slot: the engine may announce several channels, the
        // one-shot must fire for the first open one only.
        let gate = Arc::new(Mutex::new(Some(notify)));
        let peer = Arc::clone(&self.peer);

        self.peer.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let gate = Arc::clone(&gate);
            let peer = Arc::clone(&peer);
            Box::pin(async move {
                let opened = Arc::clone(&channel);
                channel.on_open(Box::new(move || {
                    let conn = WebRtcConn {
                        peer: Arc::clone(&peer),
                        channel: Arc::clone(&opened),
                    };
                    let taken = gate.lock().unwrap_or_else(|e| e.into_inner()).take();
                    Box::pin(async move {
                        if let Some(notify) = taken {
                            if notify.send(conn).is_err() {
                                log::debug!("data channel opened after the exchange resolved");
                            }
                        }
                    })
                }));
            })
        }));
    }

    async fn close(&self) -> Result<()> {
        self.peer
            .close()
            .await
            .context("Failed to close peer connection")
    }
}

/// An established bidirectional data channel, handed to the application on
/// promotion. The signaling core holds no reference after that point.
pub struct WebRtcConn {
    peer: Arc<RTCPeerConnection>,
    channel: Arc<RTCDataChannel>,
}

impl WebRtcConn {
    /// Label the remote peer gave the channel.
    pub fn label(&self) -> &str {
        self.channel.label()
    }

    /// Detach the channel into a byte-stream handle. Requires the engine to
    /// have been built with detach enabled, which [`WebRtcTransport::new`]
    /// always does.
    pub async fn detach(&self) -> Result<Arc<DataChannel>> {
        self.channel
            .detach()
            .await
            .context("Failed to detach data channel")
    }

    /// Close the underlying peer connection.
    pub async fn close(&self) -> Result<()> {
        self.peer
            .close()
            .await
            .context("Failed to close peer connection")
    }
}
