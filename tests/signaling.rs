use std::{sync::Arc, time::Duration};

use serde_json::{Value, json};
use tokio::sync::mpsc::unbounded_channel;

use openlink_server::{
    config::Config,
    identity::IdentityStore,
    observer::Observer,
    peer::{Peer, PeerTable, Role},
    signaling::dispatcher::Dispatcher,
    statistics::Statistics,
    useragent::Fingerprint,
};
use service::{
    channel::{ChannelSignal, Rx, Tx},
    ids,
    session::{SessionManager, SessionManagerOptions},
};

fn dispatcher() -> Arc<Dispatcher> {
    let peers = Arc::new(PeerTable::default());

    // The domain release queue has no broker behind it in these tests; keep
    // the receiver alive so sends keep succeeding.
    let (domain_gc, domain_rx) = unbounded_channel();
    std::mem::forget(domain_rx);

    let sessions = SessionManager::new(SessionManagerOptions {
        session_ttl: Duration::from_secs(3600),
        handler: Observer::new(peers.clone(), domain_gc),
    });

    Arc::new(Dispatcher {
        config: Arc::new(Config::default()),
        peers,
        sessions,
        statistics: Statistics::default(),
        identities: Arc::new(IdentityStore::in_memory()),
    })
}

/// register a peer the way the acceptor would.
fn connect(dispatcher: &Dispatcher) -> (String, Rx) {
    let id = ids::connection_id();
    let (sender, receiver) = Tx::channel();

    dispatcher.statistics.register(&id);
    dispatcher.peers.insert(Peer::new(
        id.clone(),
        sender,
        "127.0.0.1:50000".parse().unwrap(),
        Fingerprint::default(),
        None,
    ));

    (id, receiver)
}

fn recv(receiver: &mut Rx) -> Value {
    match receiver.try_recv().expect("expected a frame") {
        ChannelSignal::Body(body) => serde_json::from_str(&body).unwrap(),
        ChannelSignal::Close => panic!("unexpected close"),
    }
}

fn recv_type(receiver: &mut Rx, expected: &str) -> Value {
    let frame = recv(receiver);
    assert_eq!(frame["type"], expected, "frame: {frame}");
    frame
}

fn assert_silent(receiver: &mut Rx) {
    assert!(receiver.try_recv().is_err());
}

fn send(dispatcher: &Dispatcher, peer: &str, frame: Value) {
    dispatcher.handle_text(peer, &frame.to_string());
}

#[tokio::test]
async fn happy_join_and_leave() {
    let dispatcher = dispatcher();

    let (a, mut a_rx) = connect(&dispatcher);
    send(
        &dispatcher,
        &a,
        json!({ "type": "create_session", "linkId": "abcd1234" }),
    );

    let created = recv_type(&mut a_rx, "session_created");
    assert_eq!(created["sessionId"], "abcd1234");
    assert!(created["timestamp"].is_u64());

    let (b, mut b_rx) = connect(&dispatcher);
    send(&dispatcher, &b, json!({ "type": "join", "linkId": "abcd1234" }));

    let joined = recv_type(&mut b_rx, "joined");
    assert_eq!(joined["hostConnectionId"], a.as_str());
    assert_eq!(joined["clientCount"], 1);

    let notified = recv_type(&mut a_rx, "client_joined");
    assert_eq!(notified["clientConnectionId"], b.as_str());
    assert_eq!(notified["clientCount"], 1);

    assert_eq!(dispatcher.peers.get(&b).unwrap().role, Role::Client);

    // B drops its channel.
    dispatcher.peer_closed(&b);
    let left = recv_type(&mut a_rx, "peer_left");
    assert_eq!(left["peerId"], b.as_str());

    assert_eq!(
        dispatcher.sessions.get("abcd1234").unwrap().client_count(),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn kick_closes_the_target_after_the_grace() {
    let dispatcher = dispatcher();

    let (a, mut a_rx) = connect(&dispatcher);
    send(
        &dispatcher,
        &a,
        json!({ "type": "create_session", "linkId": "abcd1234" }),
    );
    recv_type(&mut a_rx, "session_created");

    let (b, mut b_rx) = connect(&dispatcher);
    send(&dispatcher, &b, json!({ "type": "join", "linkId": "abcd1234" }));
    recv_type(&mut b_rx, "joined");
    recv_type(&mut a_rx, "client_joined");

    send(
        &dispatcher,
        &a,
        json!({
            "type": "kick-client",
            "clientConnectionId": b,
            "reason": "test",
        }),
    );

    let kicked = recv_type(&mut b_rx, "kicked");
    assert_eq!(kicked["reason"], "test");

    let acked = recv_type(&mut a_rx, "client_kicked");
    assert_eq!(acked["clientCount"], 0);

    // The channel stays open until the grace elapses.
    assert_silent(&mut b_rx);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(b_rx.try_recv(), Ok(ChannelSignal::Close));

    assert_eq!(
        dispatcher.sessions.get("abcd1234").unwrap().client_count(),
        0
    );
}

#[tokio::test]
async fn password_rotation() {
    let dispatcher = dispatcher();

    let (a, mut a_rx) = connect(&dispatcher);
    send(
        &dispatcher,
        &a,
        json!({
            "type": "create_session",
            "linkId": "abcd1234",
            "password": "p1",
        }),
    );
    recv_type(&mut a_rx, "session_created");

    let (b, mut b_rx) = connect(&dispatcher);
    send(
        &dispatcher,
        &b,
        json!({ "type": "join", "linkId": "abcd1234", "password": "p1" }),
    );
    recv_type(&mut b_rx, "joined");
    recv_type(&mut a_rx, "client_joined");

    // Rotate mid-session; B stays connected and is told about the change.
    send(
        &dispatcher,
        &a,
        json!({ "type": "change-password", "password": "p2" }),
    );

    let changed = recv_type(&mut b_rx, "password_changed");
    assert_eq!(changed["passwordRequired"], true);
    recv_type(&mut a_rx, "password_changed");

    // A third peer still presenting the old password is refused.
    let (c, mut c_rx) = connect(&dispatcher);
    send(
        &dispatcher,
        &c,
        json!({ "type": "join", "linkId": "abcd1234", "password": "p1" }),
    );
    let refused = recv_type(&mut c_rx, "join_error");
    assert_eq!(refused["error"], "Invalid password");

    send(
        &dispatcher,
        &c,
        json!({ "type": "join", "linkId": "abcd1234", "password": "p2" }),
    );
    recv_type(&mut c_rx, "joined");
}

#[tokio::test]
async fn regenerate_link_moves_everyone() {
    let dispatcher = dispatcher();

    let (a, mut a_rx) = connect(&dispatcher);
    send(
        &dispatcher,
        &a,
        json!({ "type": "create_session", "linkId": "abcd1234" }),
    );
    recv_type(&mut a_rx, "session_created");

    let (b, mut b_rx) = connect(&dispatcher);
    send(&dispatcher, &b, json!({ "type": "join", "linkId": "abcd1234" }));
    recv_type(&mut b_rx, "joined");
    recv_type(&mut a_rx, "client_joined");

    send(
        &dispatcher,
        &a,
        json!({ "type": "regenerate-link", "requestId": "r1" }),
    );

    let response = recv_type(&mut a_rx, "session_link_changed");
    assert_eq!(response["oldSessionId"], "abcd1234");
    assert_eq!(response["requestId"], "r1");
    let new_id = response["newSessionId"].as_str().unwrap().to_string();
    assert!(ids::is_link_id(&new_id));

    let moved = recv_type(&mut b_rx, "session_link_changed");
    assert_eq!(moved["newSessionId"], new_id.as_str());

    // The old id is gone, the new one carries everyone.
    assert!(dispatcher.sessions.get("abcd1234").is_none());
    let session = dispatcher.sessions.get(&new_id).unwrap();
    assert_eq!(session.host.as_deref(), Some(a.as_str()));
    assert_eq!(session.client_count(), 1);

    assert_eq!(
        dispatcher.peers.get(&b).unwrap().session_id.as_deref(),
        Some(new_id.as_str())
    );
}

#[tokio::test]
async fn host_only_verbs_are_refused_for_clients() {
    let dispatcher = dispatcher();

    let (a, mut a_rx) = connect(&dispatcher);
    send(
        &dispatcher,
        &a,
        json!({ "type": "create_session", "linkId": "abcd1234" }),
    );
    recv_type(&mut a_rx, "session_created");

    let (b, mut b_rx) = connect(&dispatcher);
    send(&dispatcher, &b, json!({ "type": "join", "linkId": "abcd1234" }));
    recv_type(&mut b_rx, "joined");
    recv_type(&mut a_rx, "client_joined");

    send(
        &dispatcher,
        &b,
        json!({ "type": "kick_client", "clientConnectionId": a }),
    );
    recv_type(&mut b_rx, "error");

    send(&dispatcher, &b, json!({ "type": "regenerate_link" }));
    recv_type(&mut b_rx, "error");

    // Nothing moved.
    assert!(dispatcher.sessions.get("abcd1234").is_some());
    assert_silent(&mut a_rx);
}

#[tokio::test]
async fn joins_without_a_host_are_refused() {
    let dispatcher = dispatcher();

    // Placeholder session, e.g. reserved through the http surface.
    dispatcher
        .sessions
        .create("abcd1234", None, Default::default())
        .unwrap();

    let (b, mut b_rx) = connect(&dispatcher);
    send(&dispatcher, &b, json!({ "type": "join", "linkId": "abcd1234" }));

    let refused = recv_type(&mut b_rx, "join_error");
    assert_eq!(refused["error"], "no_host");
}

#[tokio::test]
async fn the_client_cap_is_enforced() {
    let dispatcher = dispatcher();

    let (a, mut a_rx) = connect(&dispatcher);
    send(
        &dispatcher,
        &a,
        json!({
            "type": "create_session",
            "linkId": "abcd1234",
            "settings": { "maxClients": 1 },
        }),
    );
    recv_type(&mut a_rx, "session_created");

    let (b, mut b_rx) = connect(&dispatcher);
    send(&dispatcher, &b, json!({ "type": "join", "linkId": "abcd1234" }));
    recv_type(&mut b_rx, "joined");

    let (c, mut c_rx) = connect(&dispatcher);
    send(&dispatcher, &c, json!({ "type": "join", "linkId": "abcd1234" }));
    let refused = recv_type(&mut c_rx, "join_error");
    assert_eq!(refused["error"], "Session is full");
}

#[tokio::test]
async fn signaling_frames_are_forwarded_with_the_sender_annotated() {
    let dispatcher = dispatcher();

    let (a, mut a_rx) = connect(&dispatcher);
    send(
        &dispatcher,
        &a,
        json!({ "type": "create_session", "linkId": "abcd1234" }),
    );
    recv_type(&mut a_rx, "session_created");

    let (b, mut b_rx) = connect(&dispatcher);
    send(&dispatcher, &b, json!({ "type": "join", "linkId": "abcd1234" }));
    recv_type(&mut b_rx, "joined");
    recv_type(&mut a_rx, "client_joined");

    send(
        &dispatcher,
        &b,
        json!({ "type": "offer", "targetId": a, "sdp": "v=0..." }),
    );

    let offer = recv_type(&mut a_rx, "offer");
    assert_eq!(offer["fromId"], b.as_str());
    assert_eq!(offer["sdp"], "v=0...");

    // The legacy ice spelling reaches the peer under the canonical tag.
    send(
        &dispatcher,
        &a,
        json!({ "type": "ice-candidate", "targetId": b, "candidate": { "foo": 1 } }),
    );
    let candidate = recv_type(&mut b_rx, "ice_candidate");
    assert_eq!(candidate["candidate"]["foo"], 1);

    // A target outside the session is dropped silently.
    let (stranger, mut stranger_rx) = connect(&dispatcher);
    send(
        &dispatcher,
        &b,
        json!({ "type": "offer", "targetId": stranger, "sdp": "v=0..." }),
    );
    assert_silent(&mut stranger_rx);

    let relayed = dispatcher
        .sessions
        .get("abcd1234")
        .unwrap()
        .stats
        .bytes_relayed;
    assert!(relayed > 0);
}

#[tokio::test]
async fn ping_pong_and_malformed_frames() {
    let dispatcher = dispatcher();
    let (a, mut a_rx) = connect(&dispatcher);

    send(&dispatcher, &a, json!({ "type": "ping", "requestId": "p1" }));
    let pong = recv_type(&mut a_rx, "pong");
    assert_eq!(pong["requestId"], "p1");

    dispatcher.handle_text(&a, "not json at all");
    recv_type(&mut a_rx, "error");

    let stats = dispatcher.statistics.get(&a).unwrap();
    assert_eq!(stats.error_msgs, 1);
    assert_eq!(stats.received_msgs, 2);
}

#[tokio::test]
async fn change_session_id_rejects_collisions() {
    let dispatcher = dispatcher();

    let (a, mut a_rx) = connect(&dispatcher);
    send(
        &dispatcher,
        &a,
        json!({ "type": "create_session", "linkId": "abcd1234" }),
    );
    recv_type(&mut a_rx, "session_created");

    let (b, mut b_rx) = connect(&dispatcher);
    send(
        &dispatcher,
        &b,
        json!({ "type": "create_session", "linkId": "wxyz9876" }),
    );
    recv_type(&mut b_rx, "session_created");

    send(
        &dispatcher,
        &a,
        json!({ "type": "change_session_id", "newSessionId": "wxyz9876" }),
    );
    recv_type(&mut a_rx, "session_id_changed_error");

    send(
        &dispatcher,
        &a,
        json!({ "type": "change_session_id", "newSessionId": "fresh123" }),
    );
    let changed = recv_type(&mut a_rx, "session_id_changed");
    assert_eq!(changed["newSessionId"], "fresh123");
    assert!(dispatcher.sessions.get("abcd1234").is_none());
}

#[tokio::test]
async fn operator_paths_mirror_the_host_verbs() {
    let dispatcher = dispatcher();

    let (a, mut a_rx) = connect(&dispatcher);
    send(
        &dispatcher,
        &a,
        json!({ "type": "create_session", "linkId": "abcd1234" }),
    );
    recv_type(&mut a_rx, "session_created");

    let (b, mut b_rx) = connect(&dispatcher);
    send(&dispatcher, &b, json!({ "type": "join", "linkId": "abcd1234" }));
    recv_type(&mut b_rx, "joined");
    recv_type(&mut a_rx, "client_joined");

    assert!(dispatcher.operator_password("abcd1234", Some("p9".to_string())));
    recv_type(&mut b_rx, "password_changed");

    let (old, new) = dispatcher.operator_regenerate("abcd1234").unwrap();
    assert_eq!(old, "abcd1234");
    assert!(dispatcher.sessions.get(&new).is_some());
}
