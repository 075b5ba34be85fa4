use std::{sync::Arc, time::Duration};

use serde_json::{Value, json};
use service::{
    ids, now_ms,
    session::{SessionError, SessionManager, SessionSettings},
};

use crate::{
    api::events,
    config::Config,
    identity::IdentityStore,
    observer::Observer,
    peer::{PeerTable, Role},
    signaling::message::ClientMessage,
    statistics::{Statistics, Stats},
};

/// Delay between delivering `kicked` to the target and closing its channel,
/// so the frame has a chance to flush.
const KICK_CLOSE_DELAY: Duration = Duration::from_millis(500);

/// Reconnect hint handed to clients when the host changes the session id.
const RECONNECT_DELAY_MS: u64 = 2000;

/// Interprets inbound frames: session lifecycle verbs mutate the registry,
/// opaque signaling payloads are forwarded to the named peer, everything
/// else is answered in place.
///
/// All handlers are synchronous; outbound delivery is a lock-free queue push
/// into each peer's writer, so fan-out can complete while the session entry
/// is still locked.
pub struct Dispatcher {
    pub config: Arc<Config>,
    pub peers: Arc<PeerTable>,
    pub sessions: Arc<SessionManager<Observer>>,
    pub statistics: Statistics,
    pub identities: Arc<IdentityStore>,
}

impl Dispatcher {
    /// entry point for one inbound text frame.
    pub fn handle_text(&self, peer_id: &str, text: &str) {
        self.statistics.add(
            peer_id,
            &[Stats::ReceivedBytes(text.len()), Stats::ReceivedMsgs(1)],
        );
        self.peers.with(peer_id, |it| it.last_seen = now_ms());

        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.dispatch(peer_id, message, text.len()),
            Err(error) => {
                self.statistics.add(peer_id, &[Stats::ErrorMsgs(1)]);
                self.send_error(peer_id, None, &format!("invalid message: {error}"), None);
            }
        }
    }

    fn dispatch(&self, peer_id: &str, message: ClientMessage, frame_len: usize) {
        let forward_type = message.forward_type();

        match message {
            ClientMessage::CreateSession {
                link_id,
                settings,
                password,
                request_id,
            } => self.create_session(peer_id, link_id, settings, password, request_id.as_deref()),
            ClientMessage::Join {
                link_id,
                password,
                is_host,
                request_id,
            } => self.join(peer_id, &link_id, password, is_host, request_id.as_deref()),
            ClientMessage::Host {
                link_id,
                password,
                request_id,
            } => self.join(peer_id, &link_id, password, true, request_id.as_deref()),
            ClientMessage::Leave { request_id } => {
                self.leave(peer_id, "left");
                self.send(peer_id, json!({ "type": "left" }), request_id.as_deref());
            }
            ClientMessage::ChangePassword {
                password,
                request_id,
            } => self.change_password(peer_id, password, request_id.as_deref()),
            ClientMessage::UpdateSettings {
                settings,
                request_id,
            } => self.update_settings(peer_id, settings, request_id.as_deref()),
            ClientMessage::KickClient {
                client_connection_id,
                reason,
                request_id,
            } => self.kick(peer_id, &client_connection_id, reason, request_id.as_deref()),
            ClientMessage::RegenerateLink { request_id } => {
                self.regenerate_link(peer_id, request_id.as_deref())
            }
            ClientMessage::ChangeSessionId {
                new_session_id,
                request_id,
            } => self.change_session_id(peer_id, &new_session_id, request_id.as_deref()),
            ClientMessage::Offer { target_id, rest }
            | ClientMessage::Answer { target_id, rest }
            | ClientMessage::IceCandidate { target_id, rest } => {
                self.forward(peer_id, &target_id, forward_type.unwrap(), rest, frame_len)
            }
            ClientMessage::Broadcast {
                payload,
                request_id,
            } => self.broadcast_payload(peer_id, payload, request_id.as_deref()),
            ClientMessage::Ping { request_id } => {
                self.peers.with(peer_id, |it| it.last_ping = now_ms());
                self.send(peer_id, json!({ "type": "pong" }), request_id.as_deref());
            }
            ClientMessage::ClientInfo {
                platform,
                os,
                arch,
                locale,
                app_version,
                wallet,
                machine_id,
            } => self.client_info(
                peer_id, platform, os, arch, locale, app_version, wallet, machine_id,
            ),
        }
    }

    fn create_session(
        &self,
        peer_id: &str,
        link_id: Option<String>,
        settings: Option<SessionSettings>,
        password: Option<String>,
        request_id: Option<&str>,
    ) {
        let Some(peer) = self.peers.get(peer_id) else {
            return;
        };

        if peer.session_id.is_some() {
            self.send_error(peer_id, Some("create_session"), "Already in a session", request_id);
            return;
        }

        // An explicit link id wins, then the subdomain hint from the Host
        // header, then a fresh sample.
        let id = match link_id {
            Some(id) => {
                let id = id.to_lowercase();
                if !ids::is_session_id(&id) {
                    self.send_error(peer_id, Some("create_session"), "Invalid session id", request_id);
                    return;
                }
                id
            }
            None => match peer.subdomain_hint.filter(|it| ids::is_link_id(it)) {
                Some(hint) => hint,
                None => self.fresh_link_id(),
            },
        };

        let mut settings = settings.unwrap_or_default();
        if password.is_some() {
            settings.password = password;
        }

        match self.sessions.create(&id, Some(peer_id.to_string()), settings) {
            Ok(session) => {
                self.peers.with(peer_id, |it| {
                    it.session_id = Some(session.id.clone());
                    it.role = Role::Host;
                });

                events::publish("session_created", || {
                    json!({ "sessionId": session.id, "hostConnectionId": peer_id })
                });

                log::info!("session created: id={}, host={peer_id}", session.id);

                self.send(
                    peer_id,
                    json!({
                        "type": "session_created",
                        "sessionId": session.id,
                        "linkId": session.id,
                        "settings": session.settings,
                    }),
                    request_id,
                );
            }
            Err(SessionError::Conflict) => {
                self.send_error(peer_id, Some("create_session"), "Session already exists", request_id)
            }
            Err(SessionError::NotFound) => unreachable!(),
        }
    }

    fn join(
        &self,
        peer_id: &str,
        link_id: &str,
        password: Option<String>,
        is_host: bool,
        request_id: Option<&str>,
    ) {
        let id = link_id.to_lowercase();

        // The host alias creates the session on the fly when the link does
        // not exist yet.
        if is_host && !self.sessions.contains(&id) {
            self.create_session(peer_id, Some(id), None, password, request_id);
            return;
        }

        enum Seat {
            Host,
            Client {
                host_id: String,
                client_count: usize,
                settings: SessionSettings,
            },
        }

        let outcome = self.sessions.with(&id, |session| {
            if is_host {
                if session.host.is_some() {
                    return Err("Session already has a host");
                }

                session.host = Some(peer_id.to_string());
                return Ok(Seat::Host);
            }

            let Some(host_id) = session.host.clone() else {
                return Err("no_host");
            };

            if let Some(required) = &session.settings.password {
                if password.as_deref() != Some(required.as_str()) {
                    return Err("Invalid password");
                }
            }

            if session.clients.len() >= session.settings.max_clients {
                return Err("Session is full");
            }

            if !session.clients.iter().any(|it| it == peer_id) {
                session.clients.push(peer_id.to_string());
                session.stats.total_joins += 1;
            }

            Ok(Seat::Client {
                host_id,
                client_count: session.clients.len(),
                settings: session.settings.clone(),
            })
        });

        match outcome {
            None => self.send_error(peer_id, Some("join"), "Session not found", request_id),
            Some(Err(reason)) => self.send_error(peer_id, Some("join"), reason, request_id),
            Some(Ok(Seat::Host)) => {
                self.peers.with(peer_id, |it| {
                    it.session_id = Some(id.clone());
                    it.role = Role::Host;
                });

                self.send(
                    peer_id,
                    json!({ "type": "session_created", "sessionId": id, "linkId": id }),
                    request_id,
                );
            }
            Some(Ok(Seat::Client {
                host_id,
                client_count,
                settings,
            })) => {
                self.peers.with(peer_id, |it| {
                    it.session_id = Some(id.clone());
                    it.role = Role::Client;
                });

                events::publish("client_joined", || {
                    json!({ "sessionId": id, "clientConnectionId": peer_id })
                });

                self.send(
                    peer_id,
                    json!({
                        "type": "joined",
                        "sessionId": id,
                        "hostConnectionId": host_id,
                        "clientCount": client_count,
                        "settings": settings,
                    }),
                    request_id,
                );

                self.notify_session(&id, peer_id, || {
                    json!({
                        "type": "client_joined",
                        "clientConnectionId": peer_id,
                        "clientCount": client_count,
                    })
                });
            }
        }
    }

    /// remove the peer from its session and tell the remainder.
    ///
    /// An emptied session is left for the reaper so a returning host can
    /// pick the link back up within the ttl.
    pub fn leave(&self, peer_id: &str, reason: &str) {
        let session_id = match self.peers.get(peer_id).and_then(|it| it.session_id) {
            Some(session_id) => session_id,
            None => return,
        };

        self.sessions.with(&session_id, |session| {
            if session.host.as_deref() == Some(peer_id) {
                session.host = None;
            } else {
                session.clients.retain(|it| it != peer_id);
            }

            for member in session.peers() {
                self.push(
                    member,
                    json!({
                        "type": "peer_left",
                        "peerId": peer_id,
                        "reason": reason,
                        "clientCount": session.clients.len(),
                    }),
                );
            }
        });

        self.peers.with(peer_id, |it| {
            it.session_id = None;
            it.role = Role::Unknown;
        });
    }

    fn change_password(
        &self,
        peer_id: &str,
        password: Option<String>,
        request_id: Option<&str>,
    ) {
        let Some(session_id) = self.host_session(peer_id, request_id) else {
            return;
        };

        self.sessions.with(&session_id, |session| {
            session.settings.password = password.clone();

            // Connected clients are not revalidated; the broadcast lets them
            // re-display the requirement for onward sharing.
            for member in session.clients.iter() {
                self.push(
                    member,
                    json!({
                        "type": "password_changed",
                        "passwordRequired": session.settings.password.is_some(),
                    }),
                );
            }
        });

        self.send(
            peer_id,
            json!({ "type": "password_changed", "passwordRequired": password.is_some() }),
            request_id,
        );
    }

    fn update_settings(
        &self,
        peer_id: &str,
        mut settings: SessionSettings,
        request_id: Option<&str>,
    ) {
        let Some(session_id) = self.host_session(peer_id, request_id) else {
            return;
        };

        self.sessions.with(&session_id, |session| {
            // The password travels through its own verb; an absent field
            // here keeps the current one.
            if settings.password.is_none() {
                settings.password = session.settings.password.clone();
            }
            session.settings = settings.clone();

            for member in session.clients.iter() {
                self.push(
                    member,
                    json!({ "type": "settings_updated", "settings": session.settings }),
                );
            }
        });

        self.send(peer_id, json!({ "type": "settings_updated" }), request_id);
    }

    fn kick(
        &self,
        peer_id: &str,
        client_id: &str,
        reason: Option<String>,
        request_id: Option<&str>,
    ) {
        let Some(session_id) = self.host_session(peer_id, request_id) else {
            return;
        };

        let reason = reason.unwrap_or_else(|| "kicked by host".to_string());

        let outcome = self.sessions.with(&session_id, |session| {
            let before = session.clients.len();
            session.clients.retain(|it| it != client_id);
            if session.clients.len() == before {
                return false;
            }

            // Target first, then the host's ack, then the remaining
            // clients, all before the session lock is released.
            self.push(
                client_id,
                json!({ "type": "kicked", "reason": reason }),
            );

            self.push(
                peer_id,
                json!({
                    "type": "client_kicked",
                    "clientConnectionId": client_id,
                    "clientCount": session.clients.len(),
                }),
            );

            for member in session.clients.iter() {
                self.push(
                    member,
                    json!({
                        "type": "peer_left",
                        "peerId": client_id,
                        "reason": "kicked",
                        "clientCount": session.clients.len(),
                    }),
                );
            }

            true
        });

        if outcome != Some(true) {
            self.send_error(peer_id, Some("kick"), "Client not found", request_id);
            return;
        }

        self.peers.with(client_id, |it| {
            it.session_id = None;
            it.role = Role::Unknown;
        });

        // Give the kicked frame a moment to flush before the socket goes.
        let peers = self.peers.clone();
        let client_id = client_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(KICK_CLOSE_DELAY).await;
            peers.close(&client_id);
        });
    }

    fn regenerate_link(&self, peer_id: &str, request_id: Option<&str>) {
        let Some(old) = self.host_session(peer_id, request_id) else {
            return;
        };

        let new = self.fresh_link_id();
        self.rekey(peer_id, &old, &new, "session_link_changed", request_id);
    }

    fn change_session_id(&self, peer_id: &str, new: &str, request_id: Option<&str>) {
        let Some(old) = self.host_session(peer_id, request_id) else {
            return;
        };

        let new = new.to_lowercase();
        if !ids::is_session_id(&new) {
            self.send_error(peer_id, Some("change_session_id"), "Invalid session id", request_id);
            return;
        }

        self.rekey(peer_id, &old, &new, "session_id_changed", request_id);
    }

    /// swap the registry key and repoint every member, then fan the change
    /// out.
    fn rekey(
        &self,
        peer_id: &str,
        old: &str,
        new: &str,
        changed_type: &str,
        request_id: Option<&str>,
    ) {
        let session = match self.sessions.rekey(old, new) {
            Ok(session) => session,
            Err(SessionError::Conflict) => {
                self.send_error(peer_id, Some(changed_type), "Session id already exists", request_id);
                return;
            }
            Err(SessionError::NotFound) => {
                self.send_error(peer_id, Some(changed_type), "Session not found", request_id);
                return;
            }
        };

        for member in session.peers() {
            self.peers
                .with(member, |it| it.session_id = Some(new.to_string()));
        }

        for member in session.peers() {
            if member != peer_id {
                self.push(
                    member,
                    json!({
                        "type": changed_type,
                        "oldSessionId": old,
                        "newSessionId": new,
                        "reconnectDelayMs": RECONNECT_DELAY_MS,
                    }),
                );
            }
        }

        log::info!("session rekeyed: old={old}, new={new}");

        self.send(
            peer_id,
            json!({
                "type": changed_type,
                "oldSessionId": old,
                "newSessionId": new,
            }),
            request_id,
        );
    }

    /// forward an opaque signaling frame to the named peer.
    ///
    /// Anything that does not line up, an unknown target or one outside the
    /// sender's session, is dropped silently.
    fn forward(
        &self,
        peer_id: &str,
        target_id: &str,
        frame_type: &str,
        rest: serde_json::Map<String, Value>,
        frame_len: usize,
    ) {
        let Some(session_id) = self.peers.get(peer_id).and_then(|it| it.session_id) else {
            return;
        };

        let target_session = self.peers.get(target_id).and_then(|it| it.session_id);
        if target_session.as_deref() != Some(session_id.as_str()) {
            return;
        }

        let mut frame = rest;
        frame.insert("type".to_string(), json!(frame_type));
        frame.insert("fromId".to_string(), json!(peer_id));

        self.push(target_id, Value::Object(frame));
        self.sessions.with(&session_id, |it| {
            it.stats.bytes_relayed += frame_len as u64;
        });
    }

    fn broadcast_payload(&self, peer_id: &str, payload: Value, request_id: Option<&str>) {
        let Some(session_id) = self.peers.get(peer_id).and_then(|it| it.session_id) else {
            self.send_error(peer_id, Some("broadcast"), "Not in a session", request_id);
            return;
        };

        self.notify_session(&session_id, peer_id, || {
            json!({ "type": "broadcast", "fromId": peer_id, "payload": payload })
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn client_info(
        &self,
        peer_id: &str,
        platform: Option<String>,
        os: Option<String>,
        arch: Option<String>,
        locale: Option<String>,
        app_version: Option<String>,
        wallet: Option<String>,
        machine_id: Option<String>,
    ) {
        self.peers.with(peer_id, |peer| {
            if platform.is_some() {
                peer.fingerprint.platform = platform.clone();
            }
            if os.is_some() {
                peer.fingerprint.os = os;
            }
            if arch.is_some() {
                peer.fingerprint.arch = arch;
            }
            if locale.is_some() {
                peer.locale = locale;
            }
            if app_version.is_some() {
                peer.app_version = app_version;
            }
            if wallet.is_some() {
                peer.wallet = wallet.clone();
            }
            if machine_id.is_some() {
                peer.machine_id = machine_id.clone();
            }
        });

        if let Some(machine_id) = &machine_id {
            self.identities
                .record(machine_id, wallet.as_deref(), platform.as_deref());
        }
    }

    /// socket closed or peer evicted: run leave handling for the remainder.
    pub fn peer_closed(&self, peer_id: &str) {
        self.leave(peer_id, "disconnected");
        self.peers.remove(peer_id);
        self.statistics.unregister(peer_id);

        events::publish("client_disconnected", || {
            json!({ "connectionId": peer_id })
        });
    }

    /// operator kick by session id, no peer authority involved.
    pub fn operator_kick(&self, session_id: &str, client_id: &str, reason: Option<String>) -> bool {
        let Some(host) = self.sessions.get(session_id).and_then(|it| it.host) else {
            return false;
        };

        let before = self
            .sessions
            .get(session_id)
            .map(|it| it.client_count())
            .unwrap_or(0);

        self.kick(&host, client_id, reason, None);

        self.sessions
            .get(session_id)
            .map(|it| it.client_count() < before)
            .unwrap_or(false)
    }

    /// operator link regeneration by session id.
    pub fn operator_regenerate(&self, session_id: &str) -> Option<(String, String)> {
        let session = self.sessions.get(session_id)?;
        let new = self.fresh_link_id();

        match &session.host {
            Some(host) => {
                let host = host.clone();
                self.rekey(&host, &session.id, &new, "session_link_changed", None);
            }
            None => {
                let moved = self.sessions.rekey(&session.id, &new).ok()?;
                for member in moved.peers() {
                    self.peers
                        .with(member, |it| it.session_id = Some(new.clone()));
                    self.push(
                        member,
                        json!({
                            "type": "session_link_changed",
                            "oldSessionId": session.id,
                            "newSessionId": new,
                        }),
                    );
                }
            }
        }

        Some((session.id, new))
    }

    /// operator password change by session id.
    pub fn operator_password(&self, session_id: &str, password: Option<String>) -> bool {
        self.sessions
            .with(session_id, |session| {
                session.settings.password = password;

                for member in session.peers() {
                    self.push(
                        member,
                        json!({
                            "type": "password_changed",
                            "passwordRequired": session.settings.password.is_some(),
                        }),
                    );
                }
            })
            .is_some()
    }

    /// out of band signaling forward for callers without a duplex channel.
    pub fn forward_out_of_band(
        &self,
        frame_type: &str,
        from_id: &str,
        target_id: &str,
        rest: serde_json::Map<String, Value>,
    ) -> bool {
        if !self.peers.contains(target_id) {
            return false;
        }

        let mut frame = rest;
        frame.insert("type".to_string(), json!(frame_type));
        frame.insert("fromId".to_string(), json!(from_id));

        self.push(target_id, Value::Object(frame))
    }

    fn fresh_link_id(&self) -> String {
        // A collision rejects the sample and tries again.
        loop {
            let id = ids::link_id();
            if !self.sessions.contains(&id) {
                return id;
            }
        }
    }

    /// session id the peer hosts, or an error frame and `None`.
    fn host_session(&self, peer_id: &str, request_id: Option<&str>) -> Option<String> {
        let session_id = self.peers.get(peer_id).and_then(|it| it.session_id);

        match session_id {
            Some(session_id)
                if self
                    .sessions
                    .get(&session_id)
                    .is_some_and(|it| it.host.as_deref() == Some(peer_id)) =>
            {
                Some(session_id)
            }
            _ => {
                self.send_error(peer_id, None, "Only the session host can do that", request_id);
                None
            }
        }
    }

    fn notify_session(&self, session_id: &str, from: &str, frame: impl Fn() -> Value) {
        if let Some(session) = self.sessions.get(session_id) {
            for member in session.peers() {
                if member != from {
                    self.push(member, frame());
                }
            }
        }
    }

    /// envelope and queue one frame; false when the peer is gone.
    fn send(&self, peer_id: &str, mut body: Value, request_id: Option<&str>) -> bool {
        if let Value::Object(map) = &mut body {
            map.insert("timestamp".to_string(), json!(now_ms()));
            if let Some(request_id) = request_id {
                map.insert("requestId".to_string(), json!(request_id));
            }
        }

        self.peers.send_to(peer_id, body.to_string())
    }

    fn push(&self, peer_id: &str, body: Value) -> bool {
        self.send(peer_id, body, None)
    }

    fn send_error(
        &self,
        peer_id: &str,
        verb: Option<&str>,
        reason: &str,
        request_id: Option<&str>,
    ) {
        let frame_type = match verb {
            Some(verb) => format!("{verb}_error"),
            None => "error".to_string(),
        };

        self.send(
            peer_id,
            json!({ "type": frame_type, "error": reason }),
            request_id,
        );
    }
}
