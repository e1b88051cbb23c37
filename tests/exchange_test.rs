use axum::extract::{Form, State};
use axum::http::StatusCode;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use rendezvous_rs::rtc::{AbortReason, PromotionOutcome, RtcGateway};
use rendezvous_rs::serve::{post_offer, AppState, OfferForm};
use rendezvous_rs::signal;
use rendezvous_rs::transport::{WebRtcConn, WebRtcTransport};

// =============================================================================
// Helpers
// =============================================================================

/// Build a gateway whose handler echoes every message and reports each
/// promoted connection on the returned channel.
fn echo_gateway(timeout: Duration) -> (RtcGateway<WebRtcTransport>, mpsc::Receiver<String>) {
    // No ICE servers: host candidates are enough for an in-process loopback.
    let transport = WebRtcTransport::new(RTCConfiguration::default()).unwrap();
    let gateway = RtcGateway::new(transport, timeout);

    let (promoted_tx, promoted_rx) = mpsc::channel(1);
    gateway.register_connection_handler(move |conn: WebRtcConn| {
        let promoted_tx = promoted_tx.clone();
        tokio::spawn(async move {
            let _ = promoted_tx.send(conn.label().to_string()).await;
            let io = conn.detach().await.unwrap();
            let mut buf = vec![0u8; 16 * 1024];
            while let Ok(n) = io.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                if io.write(&Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
        });
    });

    (gateway, promoted_rx)
}

/// Offer-side peer: creates the data channel, produces a fully gathered
/// offer, and returns it alongside the connection and channel handles.
async fn prepare_offer_peer() -> (
    Arc<RTCPeerConnection>,
    Arc<webrtc::data_channel::RTCDataChannel>,
    RTCSessionDescription,
) {
    let api = APIBuilder::new().build();
    let peer = Arc::new(
        api.new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap(),
    );

    // The channel must exist before the offer so it is negotiated.
    let channel = peer.create_data_channel("echo-test", None).await.unwrap();

    let offer = peer.create_offer(None).await.unwrap();
    let mut gathered = peer.gathering_complete_promise().await;
    peer.set_local_description(offer).await.unwrap();
    let _ = gathered.recv().await;

    let offer = peer.local_description().await.unwrap();
    (peer, channel, offer)
}

async fn send_offer(state: &Arc<AppState>, encoded: String) -> axum::response::Response {
    post_offer(State(Arc::clone(state)), Form(OfferForm { offer: encoded })).await
}

async fn response_json(response: axum::response::Response) -> RTCSessionDescription {
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/json"
    );
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

// =============================================================================
// End-to-end exchanges
// =============================================================================

#[tokio::test]
async fn test_full_exchange_echoes_over_data_channel() {
    let (gateway, mut promoted_rx) = echo_gateway(Duration::from_secs(15));
    let state = Arc::new(AppState { gateway });

    let (peer, channel, offer) = prepare_offer_peer().await;

    let (open_tx, open_rx) = oneshot::channel();
    let open_tx = std::sync::Mutex::new(Some(open_tx));
    channel.on_open(Box::new(move || {
        if let Some(tx) = open_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        Box::pin(async {})
    }));

    let (msg_tx, mut msg_rx) = mpsc::channel(4);
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let msg_tx = msg_tx.clone();
        Box::pin(async move {
            let _ = msg_tx.send(msg.data.to_vec()).await;
        })
    }));

    // HTTP exchange: encoded offer in, native JSON answer out.
    let response = send_offer(&state, signal::encode(&offer).unwrap()).await;
    let answer = response_json(response).await;
    peer.set_remote_description(answer).await.unwrap();

    // The channel opens well before the 15s deadline; the handler sees the
    // connection exactly once.
    tokio::time::timeout(Duration::from_secs(10), open_rx)
        .await
        .expect("data channel never opened")
        .unwrap();
    let label = tokio::time::timeout(Duration::from_secs(10), promoted_rx.recv())
        .await
        .expect("handler never invoked")
        .unwrap();
    assert_eq!(label, "echo-test");

    channel.send(&Bytes::from_static(b"Ping")).await.unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(10), msg_rx.recv())
        .await
        .expect("no echo before timeout")
        .unwrap();
    assert_eq!(echoed, b"Ping");

    // Exactly-once: no second promotion for the same exchange.
    assert!(promoted_rx.try_recv().is_err());

    peer.close().await.unwrap();
}

#[tokio::test]
async fn test_unanswered_exchange_times_out() {
    let (gateway, mut promoted_rx) = echo_gateway(Duration::from_secs(1));

    // The offerer walks away: the answer is never applied remotely.
    let (peer, _channel, offer) = prepare_offer_peer().await;

    let (pending, _answer) = gateway.accept(offer).await.unwrap();
    let race = gateway.arm(pending);

    let outcome = tokio::time::timeout(Duration::from_secs(10), race)
        .await
        .expect("race never resolved")
        .unwrap();
    assert_eq!(outcome, PromotionOutcome::Aborted(AbortReason::Timeout));
    assert!(promoted_rx.try_recv().is_err());

    peer.close().await.unwrap();
}

// =============================================================================
// HTTP rejections
// =============================================================================

#[tokio::test]
async fn test_malformed_offer_text_is_rejected() {
    let (gateway, mut promoted_rx) = echo_gateway(Duration::from_secs(15));
    let state = Arc::new(AppState { gateway });

    let response = send_offer(&state, "%%% definitely not base64 %%%".to_string()).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(promoted_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_garbage_sdp_is_rejected() {
    let (gateway, _promoted_rx) = echo_gateway(Duration::from_secs(15));
    let state = Arc::new(AppState { gateway });

    // Decodes fine at the codec layer, rejected by the engine.
    let bogus: RTCSessionDescription = serde_json::from_value(serde_json::json!({
        "type": "offer",
        "sdp": "this is not an sdp",
    }))
    .unwrap();

    let response = send_offer(&state, signal::encode(&bogus).unwrap()).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_offer_without_handler_is_rejected() {
    let transport = WebRtcTransport::new(RTCConfiguration::default()).unwrap();
    let gateway = RtcGateway::new(transport, Duration::from_secs(15));
    let state = Arc::new(AppState { gateway });

    let (peer, _channel, offer) = prepare_offer_peer().await;
    let response = send_offer(&state, signal::encode(&offer).unwrap()).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    peer.close().await.unwrap();
}
