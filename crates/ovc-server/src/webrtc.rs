use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use ovc_protocol::types::ClientId;

use crate::config::Config;
use crate::registry::{AudioSink, SendResult};

/// The one DataChannel per client carrying voice frames.
pub const AUDIO_CHANNEL_LABEL: &str = "audio";

/// High-water mark on the channel's queued bytes. Above this, `send`
/// reports backpressure and the caller drops the frame.
pub const MAX_BUFFERED_AMOUNT: usize = 256 * 1024;

/// Events a peer transport reports to its owning signaling session. One
/// channel per session; the consumer pulls in its own task, so no transport
/// callback ever re-enters session state.
#[derive(Debug)]
pub enum PeerEvent {
    /// Locally gathered ICE candidate to trickle to the client.
    LocalCandidate {
        candidate: Option<String>,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
        complete: bool,
    },
    /// DTLS + SCTP are up and the `audio` channel opened.
    ChannelOpen,
    ChannelClosed,
    /// One raw inbound message from the `audio` channel.
    InboundFrame(Bytes),
    /// ICE/DTLS/SCTP went down; terminal for this peer.
    ConnectionFailed,
}

/// Builds peer connections according to the resolved configuration.
pub struct WebRtcEngine {
    api: API,
    rtc_config: RTCConfiguration,
}

impl WebRtcEngine {
    pub fn new(config: &Config) -> Result<Self> {
        let mut setting_engine = SettingEngine::default();

        if let (Some(min), Some(max)) = (config.ice_port_min, config.ice_port_max) {
            match EphemeralUDP::new(min, max) {
                Ok(udp) => {
                    setting_engine.set_udp_network(UDPNetwork::Ephemeral(udp));
                    info!(min, max, "ICE host candidates restricted to port range");
                }
                Err(e) => {
                    warn!(min, max, "unusable ICE port range, falling back to ephemeral: {e}");
                }
            }
        }

        let mut ice_servers = Vec::new();
        if !config.stun_urls.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: config.stun_urls.clone(),
                ..Default::default()
            });
        }
        if !config.turn_urls.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: config.turn_urls.clone(),
                username: config.turn_username.clone(),
                credential: config.turn_credential.clone(),
                ..Default::default()
            });
        }

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .build();

        Ok(Self {
            api,
            rtc_config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
        })
    }

    /// Create a peer connection for one client and wire its callbacks onto
    /// the session's event channel.
    pub async fn create_session(
        &self,
        client_id: ClientId,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<WebRtcSession>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_config.clone())
                .await
                .context("failed to create peer connection")?,
        );

        let session = Arc::new(WebRtcSession {
            client_id,
            pc: pc.clone(),
            channel: RwLock::new(None),
            open: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let event = match candidate {
                    Some(c) => match c.to_json() {
                        Ok(init) => PeerEvent::LocalCandidate {
                            candidate: Some(init.candidate),
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            complete: false,
                        },
                        Err(e) => {
                            warn!("failed to serialize ICE candidate: {e}");
                            return;
                        }
                    },
                    None => PeerEvent::LocalCandidate {
                        candidate: None,
                        sdp_mid: None,
                        sdp_mline_index: None,
                        complete: true,
                    },
                };
                let _ = tx.send(event).await;
            })
        }));

        let tx = events.clone();
        let state_session = session.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            let session = state_session.clone();
            Box::pin(async move {
                debug!(client = %session.client_id, ?state, "peer connection state");
                match state {
                    RTCPeerConnectionState::Connected => {
                        session.connected.store(true, Ordering::Relaxed);
                    }
                    RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Closed => {
                        session.open.store(false, Ordering::Relaxed);
                        let _ = tx.send(PeerEvent::ConnectionFailed).await;
                    }
                    _ => {}
                }
            })
        }));

        let tx = events;
        let dc_session = session.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            let session = dc_session.clone();
            Box::pin(async move {
                if dc.label() != AUDIO_CHANNEL_LABEL {
                    warn!(
                        client = %session.client_id,
                        label = dc.label(),
                        "ignoring unexpected data channel"
                    );
                    return;
                }

                let open_tx = tx.clone();
                let open_session = session.clone();
                dc.on_open(Box::new(move || {
                    Box::pin(async move {
                        open_session.open.store(true, Ordering::Relaxed);
                        let _ = open_tx.send(PeerEvent::ChannelOpen).await;
                    })
                }));

                let close_tx = tx.clone();
                let close_session = session.clone();
                dc.on_close(Box::new(move || {
                    let tx = close_tx.clone();
                    let session = close_session.clone();
                    Box::pin(async move {
                        session.open.store(false, Ordering::Relaxed);
                        let _ = tx.send(PeerEvent::ChannelClosed).await;
                    })
                }));

                let msg_tx = tx.clone();
                dc.on_message(Box::new(move |msg: DataChannelMessage| {
                    let msg_tx = msg_tx.clone();
                    Box::pin(async move {
                        let _ = msg_tx.send(PeerEvent::InboundFrame(msg.data)).await;
                    })
                }));

                *session.channel.write().await = Some(dc);
            })
        }));

        Ok(session)
    }
}

/// One client's peer transport: ICE agent, DTLS, SCTP and the `audio`
/// DataChannel, owned by the signaling session.
pub struct WebRtcSession {
    pub client_id: ClientId,
    pc: Arc<RTCPeerConnection>,
    channel: RwLock<Option<Arc<RTCDataChannel>>>,
    open: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl WebRtcSession {
    /// Apply the client's offer and produce the negotiated answer.
    pub async fn handle_offer(&self, sdp: String) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp).context("malformed SDP offer")?;
        self.pc
            .set_remote_description(offer)
            .await
            .context("failed to apply remote offer")?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .context("failed to create answer")?;
        self.pc
            .set_local_description(answer)
            .await
            .context("failed to apply local answer")?;

        let local = self
            .pc
            .local_description()
            .await
            .context("no local description after answer")?;
        Ok(local.sdp)
    }

    /// Apply one trickled remote candidate.
    pub async fn add_remote_candidate(
        &self,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate,
                sdp_mid,
                sdp_mline_index,
                username_fragment: None,
            })
            .await
            .context("failed to add remote ICE candidate")?;
        Ok(())
    }

    /// DTLS handshake completed and the transport reached `Connected`.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Tear down the peer. Idempotent; the peer-connection close releases
    /// SCTP, DTLS and ICE in reverse acquisition order.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::Relaxed);
        if let Some(dc) = self.channel.write().await.take() {
            let _ = dc.close().await;
        }
        if let Err(e) = self.pc.close().await {
            debug!(client = %self.client_id, "peer connection close: {e}");
        }
    }
}

#[async_trait]
impl AudioSink for WebRtcSession {
    async fn send(&self, packet: Bytes) -> SendResult {
        if !self.is_open() {
            return SendResult::Closed;
        }
        let channel = self.channel.read().await;
        let Some(dc) = channel.as_ref() else {
            return SendResult::Closed;
        };
        if dc.buffered_amount().await > MAX_BUFFERED_AMOUNT {
            return SendResult::Backpressure;
        }
        match dc.send(&packet).await {
            Ok(_) => SendResult::Ok,
            Err(e) => {
                debug!(client = %self.client_id, "data channel send failed: {e}");
                SendResult::Closed
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed) && !self.closed.load(Ordering::Relaxed)
    }
}
