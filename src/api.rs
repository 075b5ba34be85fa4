use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::{Method, StatusCode, header},
    middleware::{self, Next},
    response::{
        IntoResponse, Response, Sse,
        sse::{Event, KeepAlive},
    },
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use service::{ids, session::SessionSettings};
use tokio_stream::{StreamExt, wrappers::BroadcastStream};

use broker::{
    domains::DomainRequest,
    permits::Permission,
};

use crate::{App, SOFTWARE, monitor::InstanceReport, signaling};

/// Live feed of peer and session activity behind `/clients/monitor`.
///
/// Publishing must never slow the signaling path down: with nobody watching
/// an event is not even built, and a watcher that falls a full window behind
/// loses the oldest entries instead of backpressuring the dispatcher.
pub mod events {
    use std::sync::LazyLock;

    use serde::Serialize;
    use serde_json::Value;
    use service::now_ms;
    use tokio::sync::broadcast;

    /// Sized for the burstiest producer, a whole session joining or
    /// draining at once.
    const FEED_WINDOW: usize = 256;

    /// One activity record: what happened, when, and the verb specific
    /// details.
    #[derive(Debug, Clone, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MonitorEvent {
        pub kind: String,
        pub at: u64,
        pub payload: Value,
    }

    static FEED: LazyLock<broadcast::Sender<MonitorEvent>> =
        LazyLock::new(|| broadcast::channel(FEED_WINDOW).0);

    pub fn subscribe() -> broadcast::Receiver<MonitorEvent> {
        FEED.subscribe()
    }

    /// publish one activity record; the payload closure only runs when
    /// someone is watching.
    pub fn publish<F>(kind: &str, payload: F)
    where
        F: FnOnce() -> Value,
    {
        if FEED.receiver_count() == 0 {
            return;
        }

        let _ = FEED.send(MonitorEvent {
            kind: kind.to_string(),
            at: now_ms(),
            payload: payload(),
        });
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody {
    #[serde(default, alias = "linkId")]
    session_id: Option<String>,
    #[serde(default)]
    settings: Option<SessionSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KickBody {
    client_connection_id: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PasswordBody {
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PermitBody {
    pattern: String,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    permissions: Option<Vec<Permission>>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    created_by: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TempUrlBody {
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    max_uses: Option<u32>,
    #[serde(default)]
    permissions: Option<Vec<Permission>>,
}

/// build the control surface; the duplex acceptor lives on the same router
/// under `/ws`.
///
/// Warn: the api carries no authentication of its own; do not expose it
/// directly to an unsafe environment.
pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/ws", get(signaling::ws_handler))
        .route(
            "/health",
            get(|State(app): State<Arc<App>>| async move {
                Json(json!({
                    "software": SOFTWARE,
                    "uptime": app.uptime.elapsed().as_secs(),
                    "peers": app.dispatcher.peers.len(),
                    "sessions": app.dispatcher.sessions.len(),
                }))
            }),
        )
        .route(
            "/api/validate/{link}",
            get(|Path(link): Path<String>, State(app): State<Arc<App>>| async move {
                let link = link.to_lowercase();
                Json(match app.dispatcher.sessions.get(&link) {
                    None => json!({ "linkId": link, "status": "inactive", "clientCount": 0 }),
                    Some(session) if session.host.is_none() => json!({
                        "linkId": link,
                        "status": "no_host",
                        "clientCount": session.client_count(),
                    }),
                    Some(session) => json!({
                        "linkId": link,
                        "status": "active",
                        "clientCount": session.client_count(),
                    }),
                })
            }),
        )
        .route(
            "/api/regenerate/{link}",
            post(|Path(link): Path<String>, State(app): State<Arc<App>>| async move {
                let link = link.to_lowercase();
                let sessions = &app.dispatcher.sessions;

                // An unknown link reserves an empty placeholder so a warming
                // client can claim it; the placeholder ages out on the
                // normal idle ttl.
                if sessions.get(&link).is_none() {
                    return match sessions.create(&link, None, SessionSettings::default()) {
                        Ok(_) => Json(json!({ "linkId": link, "created": true })).into_response(),
                        Err(_) => StatusCode::CONFLICT.into_response(),
                    };
                }

                sessions.with(&link, |it| it.regenerated = true);
                Json(json!({ "linkId": link, "regenerated": true })).into_response()
            }),
        )
        .route(
            "/api/session/{id}",
            get(|Path(id): Path<String>, State(app): State<Arc<App>>| async move {
                Json(match app.dispatcher.sessions.get(&id.to_lowercase()) {
                    None => json!({ "exists": false }),
                    Some(session) => json!({
                        "exists": true,
                        "sessionId": session.id,
                        "hasHost": session.host.is_some(),
                        "clientCount": session.client_count(),
                        "createdAt": session.created_at,
                        "lastActivity": session.last_activity,
                        "stats": session.stats,
                    }),
                })
            }),
        )
        .route(
            "/sessions",
            get(|State(app): State<Arc<App>>| async move {
                Json(
                    app.dispatcher
                        .sessions
                        .list()
                        .iter()
                        .map(|it| {
                            json!({
                                "sessionId": it.id,
                                "hasHost": it.host.is_some(),
                                "clientCount": it.client_count(),
                                "createdAt": it.created_at,
                                "expiresAt": it.expires_at,
                                "stats": it.stats,
                            })
                        })
                        .collect::<Vec<Value>>(),
                )
            }),
        )
        .route(
            "/sessions/create",
            post(
                |State(app): State<Arc<App>>, Json(body): Json<CreateSessionBody>| async move {
                    let sessions = &app.dispatcher.sessions;

                    let id = match body.session_id {
                        Some(id) => {
                            let id = id.to_lowercase();
                            if !ids::is_session_id(&id) {
                                return (StatusCode::BAD_REQUEST, "invalid session id")
                                    .into_response();
                            }
                            id
                        }
                        None => loop {
                            let id = ids::link_id();
                            if !sessions.contains(&id) {
                                break id;
                            }
                        },
                    };

                    match sessions.create(&id, None, body.settings.unwrap_or_default()) {
                        Ok(session) => Json(json!({
                            "sessionId": session.id,
                            "createdAt": session.created_at,
                            "expiresAt": session.expires_at,
                        }))
                        .into_response(),
                        Err(_) => StatusCode::CONFLICT.into_response(),
                    }
                },
            ),
        )
        .route(
            "/sessions/{id}",
            delete(|Path(id): Path<String>, State(app): State<Arc<App>>| async move {
                match app.dispatcher.sessions.destroy(&id.to_lowercase()) {
                    Some(_) => StatusCode::OK.into_response(),
                    None => StatusCode::NOT_FOUND.into_response(),
                }
            }),
        )
        .route(
            "/sessions/{id}/kick",
            post(
                |Path(id): Path<String>, State(app): State<Arc<App>>, Json(body): Json<KickBody>| async move {
                    if app.dispatcher.operator_kick(
                        &id.to_lowercase(),
                        &body.client_connection_id,
                        body.reason,
                    ) {
                        StatusCode::OK.into_response()
                    } else {
                        StatusCode::NOT_FOUND.into_response()
                    }
                },
            ),
        )
        .route(
            "/sessions/{id}/password",
            post(
                |Path(id): Path<String>, State(app): State<Arc<App>>, Json(body): Json<PasswordBody>| async move {
                    if app
                        .dispatcher
                        .operator_password(&id.to_lowercase(), body.password)
                    {
                        StatusCode::OK.into_response()
                    } else {
                        StatusCode::NOT_FOUND.into_response()
                    }
                },
            ),
        )
        .route(
            "/sessions/{id}/regenerate-link",
            post(|Path(id): Path<String>, State(app): State<Arc<App>>| async move {
                match app.dispatcher.operator_regenerate(&id.to_lowercase()) {
                    Some((old, new)) => Json(json!({
                        "oldSessionId": old,
                        "newSessionId": new,
                    }))
                    .into_response(),
                    None => StatusCode::NOT_FOUND.into_response(),
                }
            }),
        )
        .route(
            "/sessions/{id}/clients",
            get(|Path(id): Path<String>, State(app): State<Arc<App>>| async move {
                let Some(session) = app.dispatcher.sessions.get(&id.to_lowercase()) else {
                    return StatusCode::NOT_FOUND.into_response();
                };

                let clients: Vec<Value> = session
                    .clients
                    .iter()
                    .filter_map(|it| app.dispatcher.peers.get(it))
                    .map(|it| {
                        json!({
                            "connectionId": it.id,
                            "detected": it.fingerprint,
                            "address": it.remote_addr,
                            "connectedAt": it.connected_at,
                        })
                    })
                    .collect();

                Json(clients).into_response()
            }),
        )
        .route(
            "/clients",
            get(|State(app): State<Arc<App>>| async move {
                Json(
                    app.dispatcher
                        .peers
                        .list()
                        .iter()
                        .map(|it| {
                            json!({
                                "connectionId": it.id,
                                "sessionId": it.session_id,
                                "role": it.role,
                                "detected": it.fingerprint,
                                "address": it.remote_addr,
                                "wallet": it.wallet,
                                "machineId": it.machine_id,
                            })
                        })
                        .collect::<Vec<Value>>(),
                )
            }),
        )
        .route(
            "/connections",
            get(|State(app): State<Arc<App>>| async move {
                Json(
                    app.dispatcher
                        .peers
                        .list()
                        .iter()
                        .map(|it| {
                            let stats = app.dispatcher.statistics.get(&it.id);
                            json!({
                                "connectionId": it.id,
                                "status": it.status,
                                "sessionId": it.session_id,
                                "connectedAt": it.connected_at,
                                "lastSeen": it.last_seen,
                                "lastPing": it.last_ping,
                                "receivedMsgs": stats.as_ref().map(|s| s.received_msgs),
                                "sendMsgs": stats.as_ref().map(|s| s.send_msgs),
                                "receivedBytes": stats.as_ref().map(|s| s.received_bytes),
                                "sendBytes": stats.as_ref().map(|s| s.send_bytes),
                            })
                        })
                        .collect::<Vec<Value>>(),
                )
            }),
        )
        .route(
            "/clients/monitor",
            get(|| async move {
                let feed = BroadcastStream::new(events::subscribe()).map(|event| {
                    event.map(|it| {
                        let body = serde_json::to_string(&it).unwrap_or_default();
                        Event::default().event(&it.kind).data(body)
                    })
                });

                Sse::new(feed).keep_alive(KeepAlive::default())
            }),
        )
        .route(
            "/domains/request",
            post(
                |State(app): State<Arc<App>>, Json(request): Json<DomainRequest>| async move {
                    // The requesting peer must hold a live connection.
                    if !app.dispatcher.peers.contains(&request.peer_id) {
                        return (StatusCode::BAD_REQUEST, "unknown peer").into_response();
                    }

                    let peer_id = request.peer_id.clone();
                    match app.broker.request_domain(request).await {
                        Ok(record) => {
                            // The provisioned domain follows the hosting
                            // peer's session and is released with it.
                            if let Some(session_id) =
                                app.dispatcher.peers.get(&peer_id).and_then(|it| it.session_id)
                            {
                                app.dispatcher.sessions.with(&session_id, |it| {
                                    if !it.domains.contains(&record.id) {
                                        it.domains.push(record.id.clone());
                                    }
                                });
                            }

                            Json(record).into_response()
                        }
                        Err(error) => broker_error(error),
                    }
                },
            ),
        )
        .route(
            "/domains",
            get(|State(app): State<Arc<App>>| async move { Json(app.broker.list_domains()) }),
        )
        .route(
            "/domains/{id}",
            delete(|Path(id): Path<String>, State(app): State<Arc<App>>| async move {
                match app.broker.release_domain(&id).await {
                    Ok(record) => Json(record).into_response(),
                    Err(error) => broker_error(error),
                }
            }),
        )
        .route(
            "/domains/permits",
            post(
                |State(app): State<Arc<App>>, Json(body): Json<PermitBody>| async move {
                    let permit = app.broker.create_permit(
                        &body.pattern,
                        body.duration_ms.map(Duration::from_millis),
                        body.permissions
                            .unwrap_or_else(|| vec![Permission::Read, Permission::Connect]),
                        body.client_id,
                        body.created_by.as_deref().unwrap_or("api"),
                    );

                    Json(permit)
                },
            ),
        )
        .route(
            "/domains/{id}/temp-urls",
            post(
                |Path(id): Path<String>, State(app): State<Arc<App>>, Json(body): Json<TempUrlBody>| async move {
                    match app.broker.create_temp_url(
                        &id,
                        body.duration_ms.map(Duration::from_millis),
                        body.max_uses.unwrap_or(1),
                        body.permissions.unwrap_or_else(|| vec![Permission::Read]),
                    ) {
                        Ok(url) => Json(url).into_response(),
                        Err(error) => broker_error(error),
                    }
                },
            ),
        )
        .route(
            "/signaling/{verb}",
            post(
                |Path(verb): Path<String>, State(app): State<Arc<App>>, Json(body): Json<Value>| async move {
                    let frame_type = match verb.as_str() {
                        "offer" => "offer",
                        "answer" => "answer",
                        "ice-candidate" | "ice_candidate" => "ice_candidate",
                        _ => return StatusCode::NOT_FOUND.into_response(),
                    };

                    let Value::Object(mut rest) = body else {
                        return (StatusCode::BAD_REQUEST, "expected an object").into_response();
                    };

                    let Some(target_id) = rest
                        .remove("targetId")
                        .and_then(|it| it.as_str().map(str::to_string))
                    else {
                        return (StatusCode::BAD_REQUEST, "missing targetId").into_response();
                    };

                    let from_id = rest
                        .remove("fromId")
                        .and_then(|it| it.as_str().map(str::to_string))
                        .unwrap_or_else(|| "api".to_string());

                    let delivered = app
                        .dispatcher
                        .forward_out_of_band(frame_type, &from_id, &target_id, rest);

                    Json(json!({ "delivered": delivered })).into_response()
                },
            ),
        )
        .route(
            "/monitor/report",
            post(
                |State(app): State<Arc<App>>, Json(report): Json<InstanceReport>| async move {
                    app.monitor.report(report);
                    StatusCode::OK
                },
            ),
        )
        .route(
            "/monitor/instances",
            get(|State(app): State<Arc<App>>| async move {
                app.monitor.sweep();
                Json(app.monitor.instances())
            }),
        )
        .route(
            "/monitor/alerts",
            get(|State(app): State<Arc<App>>| async move { Json(app.monitor.alerts()) }),
        )
        .route(
            "/monitor/instances/{id}",
            delete(|Path(id): Path<String>, State(app): State<Arc<App>>| async move {
                if app.monitor.remove(&id) {
                    StatusCode::OK
                } else {
                    StatusCode::NOT_FOUND
                }
            }),
        )
        .layer(middleware::from_fn_with_state(app.clone(), cors))
        .with_state(app)
}

/// map a broker failure onto the http surface.
fn broker_error(error: broker::Error) -> Response {
    let status = match &error {
        broker::Error::MalformedRequest(_) | broker::Error::AccessDenied(_) => {
            StatusCode::BAD_REQUEST
        }
        broker::Error::NotFound => StatusCode::NOT_FOUND,
        broker::Error::Conflict(_) | broker::Error::ExternallyManaged(_) => StatusCode::CONFLICT,
        broker::Error::Transient(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (status, Json(json!({ "error": error.to_string() }))).into_response()
}

/// Allow the configured origins on the control surface; an empty allowlist
/// allows any origin. Preflights are answered in place.
async fn cors(State(app): State<Arc<App>>, request: Request, next: Next) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|it| it.to_str().ok())
        .map(str::to_string);

    let allow = match &origin {
        Some(origin) => {
            let allowlist = &app.config.server.cors_origins;
            if allowlist.is_empty() {
                Some("*".to_string())
            } else {
                allowlist.iter().find(|it| *it == origin).cloned()
            }
        }
        None => None,
    };

    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors(&mut response, allow);
        return response;
    }

    let mut response = next.run(request).await;
    apply_cors(&mut response, allow);
    response
}

fn apply_cors(response: &mut Response, allow: Option<String>) {
    let Some(allow) = allow.and_then(|it| it.parse().ok()) else {
        return;
    };

    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow);
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        "GET, POST, PUT, DELETE, OPTIONS".parse().unwrap(),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        "Authorization, Content-Type".parse().unwrap(),
    );
}
