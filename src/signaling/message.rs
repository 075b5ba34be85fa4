use serde::Deserialize;
use serde_json::{Map, Value};
use service::session::SessionSettings;

/// Every inbound duplex frame, discriminated on its `type` field.
///
/// The wire kept a few legacy spellings alive over the years; they are
/// accepted as aliases so older clients keep working: the dashed verb forms,
/// `ice-candidate` next to `ice_candidate`, and `host` as a join that takes
/// the host seat.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    #[serde(alias = "host_session")]
    CreateSession {
        #[serde(default)]
        link_id: Option<String>,
        #[serde(default)]
        settings: Option<SessionSettings>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        request_id: Option<String>,
    },
    Join {
        link_id: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        is_host: bool,
        #[serde(default)]
        request_id: Option<String>,
    },
    /// Legacy spelling of `join { is_host: true }`.
    Host {
        link_id: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        request_id: Option<String>,
    },
    Leave {
        #[serde(default)]
        request_id: Option<String>,
    },
    #[serde(alias = "change-password", alias = "update_password")]
    ChangePassword {
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        request_id: Option<String>,
    },
    UpdateSettings {
        settings: SessionSettings,
        #[serde(default)]
        request_id: Option<String>,
    },
    #[serde(alias = "kick-client", alias = "kick")]
    KickClient {
        client_connection_id: String,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        request_id: Option<String>,
    },
    #[serde(alias = "regenerate-link")]
    RegenerateLink {
        #[serde(default)]
        request_id: Option<String>,
    },
    #[serde(alias = "change-session-id")]
    ChangeSessionId {
        new_session_id: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    /// Opaque signaling payloads; everything beyond the target is forwarded
    /// untouched.
    Offer {
        target_id: String,
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    Answer {
        target_id: String,
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    #[serde(alias = "ice-candidate")]
    IceCandidate {
        target_id: String,
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    Broadcast {
        #[serde(default)]
        payload: Value,
        #[serde(default)]
        request_id: Option<String>,
    },
    Ping {
        #[serde(default)]
        request_id: Option<String>,
    },
    /// Fingerprint refinement requested by the welcome message.
    ClientInfo {
        #[serde(default)]
        platform: Option<String>,
        #[serde(default)]
        os: Option<String>,
        #[serde(default)]
        arch: Option<String>,
        #[serde(default)]
        locale: Option<String>,
        #[serde(default)]
        app_version: Option<String>,
        #[serde(default)]
        wallet: Option<String>,
        #[serde(default)]
        machine_id: Option<String>,
    },
}

impl ClientMessage {
    /// the wire tag of the forwarded signaling verbs.
    pub fn forward_type(&self) -> Option<&'static str> {
        match self {
            Self::Offer { .. } => Some("offer"),
            Self::Answer { .. } => Some("answer"),
            Self::IceCandidate { .. } => Some("ice_candidate"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_and_legacy_spellings_parse_to_the_same_verbs() {
        for body in [
            r#"{"type":"ice_candidate","targetId":"a","candidate":{}}"#,
            r#"{"type":"ice-candidate","targetId":"a","candidate":{}}"#,
        ] {
            assert!(matches!(
                serde_json::from_str::<ClientMessage>(body).unwrap(),
                ClientMessage::IceCandidate { .. }
            ));
        }

        for body in [
            r#"{"type":"kick_client","clientConnectionId":"a"}"#,
            r#"{"type":"kick-client","clientConnectionId":"a"}"#,
            r#"{"type":"kick","clientConnectionId":"a"}"#,
        ] {
            assert!(matches!(
                serde_json::from_str::<ClientMessage>(body).unwrap(),
                ClientMessage::KickClient { .. }
            ));
        }

        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"host_session"}"#).unwrap(),
            ClientMessage::CreateSession { .. }
        ));

        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"host","linkId":"abcd1234"}"#)
                .unwrap(),
            ClientMessage::Host { .. }
        ));
    }

    #[test]
    fn opaque_payload_fields_survive_into_rest() {
        let message: ClientMessage = serde_json::from_str(
            r#"{"type":"offer","targetId":"a","sdp":"v=0...","extra":1}"#,
        )
        .unwrap();

        match message {
            ClientMessage::Offer { target_id, rest } => {
                assert_eq!(target_id, "a");
                assert_eq!(rest.get("sdp").unwrap(), "v=0...");
                assert_eq!(rest.get("extra").unwrap(), 1);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"nope"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"no":"type"}"#).is_err());
    }
}
