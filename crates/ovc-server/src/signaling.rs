use std::net::{IpAddr, SocketAddr};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use ovc_protocol::packet::Packet;
use ovc_protocol::signal::{
    decode_client_msg, encode_server_msg, ClientMessage, ServerMessage, MAX_SIGNAL_MSG_SIZE,
};
use ovc_protocol::types::GroupSettings;

use crate::registry::ClientHandle;
use crate::server::ServerCtx;
use crate::webrtc::{PeerEvent, WebRtcSession};

/// Signaling WebSocket path.
pub const VOICE_PATH: &str = "/voice";

/// Server-initiated WebSocket pings.
const SERVER_PING_INTERVAL: Duration = Duration::from_secs(15);

/// Cadence of idle/deadline checks.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Exact-match Origin allow-list check; `"*"` accepts anything. A missing
/// Origin header only passes with the wildcard.
pub fn origin_allowed(allowed: &[String], origin: Option<&str>) -> bool {
    if allowed.iter().any(|a| a == "*") {
        return true;
    }
    match origin {
        Some(origin) => {
            let origin = origin.trim_end_matches('/');
            allowed
                .iter()
                .any(|a| a.trim_end_matches('/').eq_ignore_ascii_case(origin))
        }
        None => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Unauth,
    AuthOk,
    PeerNegotiating,
    PeerOpen,
    Closing,
}

/// Handle one signaling connection from accept to teardown.
pub async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, ctx: Arc<ServerCtx>) {
    let allowed = ctx.config.allowed_origins.clone();
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() != VOICE_PATH {
            return Err(error_response(StatusCode::NOT_FOUND));
        }
        let origin = req
            .headers()
            .get("Origin")
            .and_then(|v| v.to_str().ok());
        if !origin_allowed(&allowed, origin) {
            warn!(?origin, "rejected handshake from disallowed origin");
            return Err(error_response(StatusCode::FORBIDDEN));
        }
        Ok(resp)
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(peer = %peer_addr, "websocket handshake failed: {e}");
            return;
        }
    };
    info!(peer = %peer_addr, "signaling connection established");

    let (ws_sink, mut ws_stream) = ws.split();
    let (out_tx, out_rx) = mpsc::channel::<ServerMessage>(64);
    let writer = tokio::spawn(write_loop(ws_sink, out_rx));

    let (peer_tx, mut peer_rx) = mpsc::channel::<PeerEvent>(256);
    let close = Arc::new(Notify::new());
    let mut shutdown = ctx.shutdown_rx();
    let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
    maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut session = Session {
        ctx,
        peer_ip: peer_addr.ip(),
        out_tx,
        close: close.clone(),
        peer_tx,
        state: SessionState::Unauth,
        handle: None,
        webrtc: None,
        dtls_deadline: None,
        authenticated_at: None,
        game_bound: false,
        last_activity: Instant::now(),
        close_reason: None,
    };

    loop {
        tokio::select! {
            inbound = ws_stream.next() => {
                match inbound {
                    Some(Ok(msg)) => {
                        session.last_activity = Instant::now();
                        if session.on_ws_message(msg).await.is_break() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(peer = %peer_addr, "websocket read error: {e}");
                        break;
                    }
                    None => break,
                }
            }
            event = peer_rx.recv() => {
                if let Some(event) = event {
                    session.on_peer_event(event).await;
                }
            }
            _ = close.notified() => {
                session.close_reason = session
                    .handle
                    .as_ref()
                    .and_then(|h| h.take_close_reason());
                break;
            }
            _ = maintenance.tick() => {
                if session.on_tick().await.is_break() {
                    break;
                }
            }
            _ = shutdown.changed() => {
                session.close_reason = Some("server shutting down".into());
                break;
            }
        }
    }

    session.teardown().await;
    // Session is gone; once the last queued message is flushed the writer
    // sees a closed channel and sends the Close frame.
    let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
}

fn error_response(status: StatusCode) -> ErrorResponse {
    let mut resp = ErrorResponse::new(None);
    *resp.status_mut() = status;
    resp
}

/// Single writer per session: outbound JSON is delivered in enqueue order,
/// interleaved with protocol pings.
async fn write_loop(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::Receiver<ServerMessage>,
) {
    let mut ping = tokio::time::interval(SERVER_PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(msg) => match encode_server_msg(&msg) {
                        Ok(json) => {
                            if sink.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("failed to serialize outbound message: {e}"),
                    },
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

struct Session {
    ctx: Arc<ServerCtx>,
    peer_ip: IpAddr,
    out_tx: mpsc::Sender<ServerMessage>,
    close: Arc<Notify>,
    peer_tx: mpsc::Sender<PeerEvent>,
    state: SessionState,
    handle: Option<Arc<ClientHandle>>,
    webrtc: Option<Arc<WebRtcSession>>,
    dtls_deadline: Option<Instant>,
    authenticated_at: Option<Instant>,
    game_bound: bool,
    last_activity: Instant,
    close_reason: Option<String>,
}

impl Session {
    async fn send(&self, msg: ServerMessage) {
        let _ = self.out_tx.send(msg).await;
    }

    async fn send_error(&self, message: impl Into<String>) {
        self.send(ServerMessage::Error {
            message: message.into(),
        })
        .await;
    }

    async fn on_ws_message(&mut self, msg: Message) -> ControlFlow<()> {
        match msg {
            Message::Text(text) => {
                if text.len() > MAX_SIGNAL_MSG_SIZE {
                    self.send_error("message too large").await;
                    return ControlFlow::Continue(());
                }
                match decode_client_msg(&text) {
                    Ok(msg) => self.handle_client_message(msg).await,
                    Err(e) => {
                        debug!("undecodable signaling message: {e}");
                        if self.state == SessionState::Unauth {
                            self.close_reason = Some("malformed message".into());
                            return ControlFlow::Break(());
                        }
                        self.send_error("malformed message").await;
                        ControlFlow::Continue(())
                    }
                }
            }
            Message::Binary(_) => {
                self.send_error("binary frames are not accepted here").await;
                ControlFlow::Continue(())
            }
            Message::Close(_) => ControlFlow::Break(()),
            // Pings are answered by the protocol layer; both directions
            // count as activity, which select already recorded.
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => ControlFlow::Continue(()),
        }
    }

    async fn handle_client_message(&mut self, msg: ClientMessage) -> ControlFlow<()> {
        // Pings keep flowing in every state past the handshake.
        if let ClientMessage::Ping { timestamp } = msg {
            if self.state == SessionState::Unauth {
                self.close_reason = Some("not authenticated".into());
                return ControlFlow::Break(());
            }
            self.send(ServerMessage::Pong { timestamp }).await;
            return ControlFlow::Continue(());
        }

        match self.state {
            SessionState::Unauth => match msg {
                ClientMessage::Authenticate {
                    username,
                    auth_code,
                } => self.authenticate(username, auth_code).await,
                _ => {
                    self.send_error("not authenticated").await;
                    self.close_reason = Some("message before authentication".into());
                    ControlFlow::Break(())
                }
            },
            SessionState::AuthOk | SessionState::PeerOpen => {
                self.handle_control_message(msg).await
            }
            SessionState::PeerNegotiating => match msg {
                ClientMessage::WebrtcIceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                    complete,
                } => {
                    self.handle_remote_candidate(candidate, sdp_mid, sdp_mline_index, complete)
                        .await;
                    ControlFlow::Continue(())
                }
                ClientMessage::StartDataChannel {} => {
                    debug!("client reports ICE connected, awaiting data channel");
                    ControlFlow::Continue(())
                }
                ClientMessage::Disconnect {} => {
                    self.close_reason = Some("client disconnect".into());
                    ControlFlow::Break(())
                }
                _ => {
                    self.send_error("peer negotiation in progress").await;
                    ControlFlow::Continue(())
                }
            },
            SessionState::Closing => ControlFlow::Break(()),
        }
    }

    async fn handle_control_message(&mut self, msg: ClientMessage) -> ControlFlow<()> {
        match msg {
            ClientMessage::Authenticate { .. } => {
                self.send_error("already authenticated").await;
            }
            ClientMessage::CreateGroup {
                group_name,
                settings,
            } => {
                self.create_group(group_name, settings.unwrap_or_default())
                    .await;
            }
            ClientMessage::JoinGroup { group_id, password } => {
                self.join_group(group_id, password).await;
            }
            ClientMessage::LeaveGroup {} => self.leave_group().await,
            ClientMessage::ListGroups {} => {
                let groups = self.ctx.groups.list().await;
                self.send(ServerMessage::GroupList { groups }).await;
            }
            ClientMessage::ListPlayers {} => {
                let players = self.ctx.player_list().await;
                self.send(ServerMessage::PlayerList { players }).await;
            }
            ClientMessage::UserMute { is_muted } => {
                if let Some(handle) = &self.handle {
                    handle
                        .is_muted
                        .store(is_muted, std::sync::atomic::Ordering::Relaxed);
                    let msg = ServerMessage::UserMuted {
                        player_id: handle.player_id,
                        is_muted,
                    };
                    self.ctx.broadcast_presence(handle.player_id, msg).await;
                }
            }
            ClientMessage::UserDeafen { is_deafened } => {
                if let Some(handle) = &self.handle {
                    handle
                        .is_deafened
                        .store(is_deafened, std::sync::atomic::Ordering::Relaxed);
                    let msg = ServerMessage::UserDeafened {
                        player_id: handle.player_id,
                        is_deafened,
                    };
                    self.ctx.broadcast_presence(handle.player_id, msg).await;
                }
            }
            ClientMessage::UserSpeaking { is_speaking } => {
                if let Some(handle) = &self.handle {
                    handle
                        .is_speaking
                        .store(is_speaking, std::sync::atomic::Ordering::Relaxed);
                    let msg = ServerMessage::UserSpeaking {
                        player_id: handle.player_id,
                        is_speaking,
                    };
                    self.ctx.broadcast_presence(handle.player_id, msg).await;
                }
            }
            ClientMessage::WebrtcOffer { sdp } => self.negotiate(sdp).await,
            ClientMessage::WebrtcIceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
                complete,
            } => {
                self.handle_remote_candidate(candidate, sdp_mid, sdp_mline_index, complete)
                    .await;
            }
            ClientMessage::StartDataChannel {} => {
                debug!("start_data_channel outside negotiation, ignoring");
            }
            ClientMessage::Disconnect {} => {
                self.close_reason = Some("client disconnect".into());
                return ControlFlow::Break(());
            }
            ClientMessage::Ping { .. } => unreachable!("handled before state dispatch"),
        }
        ControlFlow::Continue(())
    }

    async fn authenticate(&mut self, username: String, auth_code: String) -> ControlFlow<()> {
        if self.ctx.auth_throttled(self.peer_ip) {
            self.send_error("too many failed attempts, try again later")
                .await;
            self.close_reason = Some("auth throttled".into());
            return ControlFlow::Break(());
        }

        let username = username.trim().to_string();
        let char_count = username.chars().count();
        if char_count == 0 || char_count > 32 || username.chars().any(|c| c.is_control()) {
            self.send_error("invalid username").await;
            self.close_reason = Some("invalid username".into());
            return ControlFlow::Break(());
        }

        if !self.ctx.auth.validate(&username, &auth_code) {
            self.ctx.record_auth_failure(self.peer_ip);
            self.send_error("invalid username or auth code").await;
            self.close_reason = Some("authentication failed".into());
            return ControlFlow::Break(());
        }
        let Some(player_id) = self.ctx.auth.lookup_player(&username) else {
            self.send_error("invalid username or auth code").await;
            self.close_reason = Some("authentication failed".into());
            return ControlFlow::Break(());
        };

        if self.ctx.sessions.by_player(&player_id).is_some() {
            self.send_error("player already connected").await;
            self.close_reason = Some("duplicate connection".into());
            return ControlFlow::Break(());
        }

        self.ctx.clear_auth_failures(self.peer_ip);

        let client_id = Uuid::new_v4();
        let handle = Arc::new(ClientHandle::new(
            client_id,
            player_id,
            username.clone(),
            self.out_tx.clone(),
            self.close.clone(),
        ));
        self.ctx.sessions.insert(handle.clone());
        self.handle = Some(handle.clone());
        self.state = SessionState::AuthOk;
        self.authenticated_at = Some(Instant::now());
        self.game_bound = self.ctx.ingame.contains_key(&player_id);

        info!(client = %client_id, player = %player_id, %username, "authenticated");

        self.send(ServerMessage::AuthSuccess {
            client_id,
            username,
        })
        .await;

        // Seed the new client with current presence, then announce it.
        let players = self.ctx.player_list().await;
        self.send(ServerMessage::PlayerList { players }).await;
        let groups = self.ctx.groups.list().await;
        self.send(ServerMessage::GroupList { groups }).await;

        let info = self.ctx.player_info(&handle).await;
        self.ctx
            .sessions
            .broadcast(&ServerMessage::PlayerJoined { player: info }, Some(client_id))
            .await;

        ControlFlow::Continue(())
    }

    async fn create_group(&mut self, name: String, settings: GroupSettings) {
        let Some(handle) = self.handle.clone() else {
            return;
        };
        let _gate = self.ctx.membership_gate.lock().await;
        match self
            .ctx
            .groups
            .create(handle.player_id, name.trim(), settings)
            .await
        {
            Ok((info, update, left)) => {
                if let Some(left) = left {
                    self.ctx.fanout_membership(&left).await;
                }
                self.send(ServerMessage::GroupCreated {
                    group_id: info.group_id,
                    group_name: info.name.clone(),
                })
                .await;
                self.ctx.fanout_membership(&update).await;
            }
            Err(e) => self.send_error(e.to_string()).await,
        }
    }

    async fn join_group(&mut self, group_id: Uuid, password: Option<String>) {
        let Some(handle) = self.handle.clone() else {
            return;
        };
        let _gate = self.ctx.membership_gate.lock().await;
        match self
            .ctx
            .groups
            .join(handle.player_id, group_id, password.as_deref())
            .await
        {
            Ok((update, left)) => {
                if let Some(left) = left {
                    self.ctx.fanout_membership(&left).await;
                }
                self.send(ServerMessage::GroupJoined { group_id }).await;
                self.ctx.fanout_membership(&update).await;
            }
            Err(e) => self.send_error(e.to_string()).await,
        }
    }

    async fn leave_group(&mut self) {
        let Some(handle) = self.handle.clone() else {
            return;
        };
        let _gate = self.ctx.membership_gate.lock().await;
        match self.ctx.groups.leave(handle.player_id).await {
            Ok(update) => {
                self.send(ServerMessage::GroupLeft {
                    group_id: update.group_id,
                    member_count: update.members.len() as u32,
                })
                .await;
                self.ctx.fanout_membership(&update).await;
            }
            Err(e) => self.send_error(e.to_string()).await,
        }
    }

    /// Apply an offer: tear down any previous peer, build a fresh one, and
    /// answer. Failure keeps the session in `AuthOk` so the client can retry.
    async fn negotiate(&mut self, sdp: String) {
        let Some(handle) = self.handle.clone() else {
            return;
        };

        if let Some(old) = self.webrtc.take() {
            handle.clear_audio_sink().await;
            old.close().await;
        }

        let peer = match self
            .ctx
            .webrtc
            .create_session(handle.client_id, self.peer_tx.clone())
            .await
        {
            Ok(peer) => peer,
            Err(e) => {
                warn!(client = %handle.client_id, "failed to create peer: {e:#}");
                self.send_error("failed to start peer negotiation").await;
                return;
            }
        };

        match peer.handle_offer(sdp).await {
            Ok(answer) => {
                self.webrtc = Some(peer);
                self.state = SessionState::PeerNegotiating;
                self.dtls_deadline = Some(
                    Instant::now()
                        + Duration::from_secs(self.ctx.config.dtls_handshake_timeout_secs),
                );
                self.send(ServerMessage::WebrtcAnswer { sdp: answer }).await;
            }
            Err(e) => {
                warn!(client = %handle.client_id, "offer negotiation failed: {e:#}");
                peer.close().await;
                self.state = SessionState::AuthOk;
                self.send_error("failed to negotiate peer connection").await;
            }
        }
    }

    async fn handle_remote_candidate(
        &mut self,
        candidate: Option<String>,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
        complete: bool,
    ) {
        let Some(peer) = self.webrtc.clone() else {
            self.send_error("no peer negotiation in progress").await;
            return;
        };
        let Some(candidate) = candidate.filter(|_| !complete) else {
            debug!("client finished trickling candidates");
            return;
        };
        if let Err(e) = peer
            .add_remote_candidate(candidate, sdp_mid, sdp_mline_index)
            .await
        {
            debug!("rejected remote ICE candidate: {e:#}");
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
                complete,
            } => {
                self.send(ServerMessage::WebrtcIceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                    complete,
                })
                .await;
            }
            PeerEvent::ChannelOpen => {
                if let (Some(handle), Some(peer)) = (&self.handle, &self.webrtc) {
                    handle.set_audio_sink(peer.clone()).await;
                    self.state = SessionState::PeerOpen;
                    self.dtls_deadline = None;
                    info!(client = %handle.client_id, "audio channel open");
                }
            }
            PeerEvent::ChannelClosed => {
                if self.state == SessionState::PeerOpen {
                    debug!("audio channel closed");
                    if let Some(handle) = &self.handle {
                        handle.clear_audio_sink().await;
                    }
                    self.state = SessionState::AuthOk;
                }
            }
            PeerEvent::InboundFrame(data) => self.on_frame(&data).await,
            PeerEvent::ConnectionFailed => {
                if matches!(
                    self.state,
                    SessionState::PeerNegotiating | SessionState::PeerOpen
                ) {
                    self.teardown_peer("peer transport failed").await;
                }
            }
        }
    }

    /// One inbound DataChannel message. Audio goes to the router; the
    /// channel-level auth handshake is acknowledged in place.
    async fn on_frame(&mut self, data: &[u8]) {
        let Some(handle) = self.handle.clone() else {
            return;
        };
        match Packet::decode(data) {
            Ok(Packet::Audio(frame)) => {
                if frame.sender != handle.client_id {
                    warn!(
                        client = %handle.client_id,
                        claimed = %frame.sender,
                        "dropping frame with spoofed sender id"
                    );
                    return;
                }
                self.ctx.router.route(handle.client_id, frame).await;
            }
            Ok(Packet::Auth { .. }) => {
                if let Some(peer) = &self.webrtc {
                    let ack = Packet::AuthAck {
                        client_id: handle.client_id,
                        accepted: true,
                        message: "voice connected".into(),
                    };
                    use crate::registry::AudioSink;
                    let _ = peer.send(ack.encode().into()).await;
                }
            }
            Ok(Packet::Disconnect { .. }) => {
                debug!(client = %handle.client_id, "peer sent disconnect packet");
            }
            Ok(Packet::AuthAck { .. }) => {}
            Err(e) => {
                debug!(client = %handle.client_id, "undecodable audio frame: {e}");
            }
        }
    }

    /// Transport died or timed out: drop the peer, fall back to `AuthOk`,
    /// keep the WebSocket alive so the client can renegotiate.
    async fn teardown_peer(&mut self, reason: &str) {
        if let Some(peer) = self.webrtc.take() {
            peer.close().await;
        }
        if let Some(handle) = &self.handle {
            handle.clear_audio_sink().await;
        }
        self.dtls_deadline = None;
        self.state = SessionState::AuthOk;
        self.send(ServerMessage::Disconnected {
            reason: reason.into(),
        })
        .await;
    }

    async fn on_tick(&mut self) -> ControlFlow<()> {
        let idle = Duration::from_secs(self.ctx.config.idle_timeout_secs);
        if self.last_activity.elapsed() > idle {
            self.close_reason = Some("idle timeout".into());
            return ControlFlow::Break(());
        }

        if let Some(deadline) = self.dtls_deadline {
            if let Some(peer) = &self.webrtc {
                if peer.is_connected() {
                    self.dtls_deadline = None;
                } else if Instant::now() >= deadline {
                    warn!("DTLS handshake timed out");
                    self.teardown_peer("DTLS handshake timeout").await;
                }
            }
        }

        if !self.game_bound {
            if let Some(handle) = &self.handle {
                if self.ctx.ingame.contains_key(&handle.player_id) {
                    self.game_bound = true;
                } else if self
                    .authenticated_at
                    .is_some_and(|at| {
                        at.elapsed()
                            > Duration::from_secs(self.ctx.config.pending_join_timeout_secs)
                    })
                {
                    self.close_reason = Some("no matching in-game session".into());
                    return ControlFlow::Break(());
                }
            }
        }

        ControlFlow::Continue(())
    }

    /// Release everything this connection owned and announce the departure.
    async fn teardown(mut self) {
        self.state = SessionState::Closing;
        let reason = self
            .close_reason
            .take()
            .unwrap_or_else(|| "connection closed".into());

        if let Some(peer) = self.webrtc.take() {
            peer.close().await;
        }

        if let Some(handle) = self.handle.take() {
            self.send(ServerMessage::Disconnected {
                reason: reason.clone(),
            })
            .await;

            self.ctx.sessions.remove(&handle.client_id);
            {
                let _gate = self.ctx.membership_gate.lock().await;
                if let Ok(update) = self.ctx.groups.leave(handle.player_id).await {
                    self.ctx.fanout_membership(&update).await;
                }
            }
            self.ctx
                .sessions
                .broadcast(
                    &ServerMessage::PlayerLeft {
                        player_id: handle.player_id,
                    },
                    None,
                )
                .await;
            info!(
                client = %handle.client_id,
                user = %handle.username,
                %reason,
                "session closed"
            );
        } else {
            debug!(%reason, "unauthenticated session closed");
        }
    }
}
