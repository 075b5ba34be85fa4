pub mod dispatcher;
pub mod message;

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use service::{
    channel::{ChannelSignal, Tx},
    ids, now_ms,
};

use crate::{App, SOFTWARE, api::events, hostname, peer::Peer, statistics::Stats, useragent};

/// `GET /ws` upgrade handler; one duplex message channel per peer.
pub async fn ws_handler(
    State(app): State<Arc<App>>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if app.dispatcher.peers.len() >= app.config.server.max_connections {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let user_agent = header_string(&headers, header::USER_AGENT);
    let host = header_string(&headers, header::HOST);

    ws.on_upgrade(move |socket| accept(app, socket, addr, user_agent, host))
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|it| it.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn accept(app: Arc<App>, mut socket: WebSocket, addr: SocketAddr, user_agent: String, host: String) {
    let id = ids::connection_id();
    let fingerprint = useragent::parse_user_agent(&user_agent);
    let subdomain_hint = hostname::subdomain_hint(&host, &app.config.domains.base_domains);

    let (sender, mut receiver) = Tx::channel();
    let dispatcher = &app.dispatcher;

    dispatcher.statistics.register(&id);
    dispatcher.peers.insert(Peer::new(
        id.clone(),
        sender.clone(),
        addr,
        fingerprint.clone(),
        subdomain_hint.clone(),
    ));

    log::info!("peer connected: id={id}, addr={addr}, platform={:?}", fingerprint.platform);

    events::publish("client_connected", || {
        json!({ "connectionId": id, "address": addr, "detected": fingerprint })
    });

    // The welcome asks the client to follow up with `client_info` so the
    // user agent guess can be refined.
    sender.send(
        json!({
            "type": "welcome",
            "connectionId": id,
            "server": SOFTWARE,
            "timestamp": now_ms(),
            "detected": fingerprint,
            "subdomain": subdomain_hint,
            "requestClientInfo": true,
        })
        .to_string(),
    );

    // One task pumps both directions: inbound frames are handled inline
    // (handlers are synchronous), outbound frames drain from the peer's
    // queue so a slow socket backpressures only this peer.
    loop {
        tokio::select! {
            signal = receiver.recv() => match signal {
                Some(ChannelSignal::Body(body)) => {
                    dispatcher.statistics.add(
                        &id,
                        &[Stats::SendBytes(body.len()), Stats::SendMsgs(1)],
                    );

                    if socket.send(Message::Text(body.into())).await.is_err() {
                        break;
                    }
                }
                Some(ChannelSignal::Close) => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                None => break,
            },
            frame = socket.recv() => match frame {
                Some(Ok(Message::Text(text))) => dispatcher.handle_text(&id, text.as_str()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }

    dispatcher.peer_closed(&id);
    log::info!("peer disconnected: id={id}");
}
