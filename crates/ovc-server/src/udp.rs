use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use ovc_protocol::packet::Packet;
use ovc_protocol::types::ClientId;

use crate::server::ServerCtx;

/// Generous receive buffer; audio packets stay under the 1000-byte MTU.
const MAX_UDP_PACKET_SIZE: usize = 1500;

/// Legacy UDP audio ingress. Packets use the same wire format as the
/// DataChannel; `Auth` binds a source address to a known client, after which
/// `Audio` packets are normalized into frames and enter the router.
pub async fn run_udp_loop(socket: Arc<UdpSocket>, ctx: Arc<ServerCtx>) {
    let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];
    // Only this task touches the bindings, so a plain map suffices.
    let mut bindings: HashMap<SocketAddr, ClientId> = HashMap::new();
    let mut shutdown = ctx.shutdown_rx();

    info!("legacy UDP ingress running");
    loop {
        let (len, src_addr) = tokio::select! {
            recv = socket.recv_from(&mut buf) => match recv {
                Ok(result) => result,
                Err(e) => {
                    error!("UDP recv error: {e}");
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };

        let data = &buf[..len];
        let packet = match Packet::decode(data) {
            Ok(p) => p,
            Err(e) => {
                warn!(src = %src_addr, "invalid UDP packet: {e}");
                continue;
            }
        };

        match packet {
            Packet::Auth { sender, username } => {
                let (accepted, message) = match ctx.sessions.get(&sender) {
                    Some(handle) if handle.username.eq_ignore_ascii_case(&username) => {
                        bindings.insert(src_addr, sender);
                        debug!(client = %sender, src = %src_addr, "bound UDP source");
                        (true, "udp bound".to_string())
                    }
                    Some(_) => (false, "username mismatch".to_string()),
                    None => (false, "unknown client".to_string()),
                };
                let ack = Packet::AuthAck {
                    client_id: sender,
                    accepted,
                    message,
                };
                if let Err(e) = socket.send_to(&ack.encode(), src_addr).await {
                    warn!(src = %src_addr, "auth ack send failed: {e}");
                }
            }
            Packet::Audio(frame) => {
                let Some(&client_id) = bindings.get(&src_addr) else {
                    warn!(src = %src_addr, "audio from unbound UDP source");
                    continue;
                };
                if frame.sender != client_id {
                    warn!(src = %src_addr, "dropping frame with mismatched sender id");
                    continue;
                }
                if ctx.sessions.get(&client_id).is_none() {
                    bindings.remove(&src_addr);
                    continue;
                }
                ctx.router.route(client_id, frame).await;
            }
            Packet::Disconnect { client_id } => {
                if bindings.get(&src_addr) == Some(&client_id) {
                    bindings.remove(&src_addr);
                    debug!(client = %client_id, src = %src_addr, "unbound UDP source");
                }
            }
            Packet::AuthAck { .. } => {}
        }
    }
    info!("legacy UDP ingress stopped");
}
