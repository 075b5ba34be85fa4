use std::{
    sync::{Arc, Weak},
    thread,
    time::Duration,
};

use ahash::{HashMap, HashMapExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::now_ms;

/// Per session policy, owned by the host and broadcast to clients whenever it
/// changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    pub password: Option<String>,
    pub max_clients: usize,
    pub allow_input: bool,
    pub allow_audio: bool,
    pub allow_video: bool,
    pub allow_file_transfer: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            password: None,
            max_clients: 10,
            allow_input: true,
            allow_audio: true,
            allow_video: true,
            allow_file_transfer: true,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub total_joins: u64,
    /// Signaling bytes forwarded between the members, an estimate only.
    pub bytes_relayed: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub host: Option<String>,
    /// Client connection ids in join order.
    pub clients: Vec<String>,
    pub settings: SessionSettings,
    pub created_at: u64,
    pub expires_at: u64,
    pub last_activity: u64,
    pub stats: SessionStats,
    /// Domain ids provisioned for this session, released on destroy.
    pub domains: Vec<String>,
    /// Set by the regenerate endpoint when it touches an existing session.
    pub regenerated: bool,
}

impl Session {
    /// Every member connection id, host first.
    pub fn peers(&self) -> impl Iterator<Item = &String> {
        self.host.iter().chain(self.clients.iter())
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_member(&self, id: &str) -> bool {
        self.host.as_deref() == Some(id) || self.clients.iter().any(|it| it == id)
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_none() && self.clients.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    Conflict,
    NotFound,
}

impl std::error::Error for SessionError {}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conflict => write!(f, "session id already exists"),
            Self::NotFound => write!(f, "session not found"),
        }
    }
}

/// Receives registry side effects that need I/O the registry itself must not
/// perform: closing the evicted peers' channels and releasing any domains the
/// session still holds.
pub trait SessionHandler: Send + Sync + 'static {
    fn session_destroyed(&self, session: Session);
}

pub struct SessionManagerOptions<T> {
    /// How long an idle session survives, 1 hour by default.
    pub session_ttl: Duration,
    pub handler: T,
}

/// Authoritative session registry.
///
/// The map is the single source of truth for which peer is in which session;
/// the reverse pointer each peer carries is updated by the dispatcher under
/// this registry's write lock whenever membership changes.
pub struct SessionManager<T> {
    sessions: RwLock<HashMap<String, Session>>,
    ttl: Duration,
    handler: T,
}

impl<T> SessionManager<T>
where
    T: SessionHandler,
{
    pub fn new(options: SessionManagerOptions<T>) -> Arc<Self> {
        let this = Arc::new(Self {
            sessions: RwLock::new(HashMap::with_capacity(1024)),
            ttl: options.session_ttl,
            handler: options.handler,
        });

        // Background reaper. Sessions that sat idle past the ttl are
        // destroyed through the same cascade as an explicit destroy.
        let this_ = Arc::downgrade(&this);
        thread::spawn(move || reaper(this_));

        this
    }

    /// create a new session.
    ///
    /// The id is stored lowercased; a duplicate id is a conflict.
    pub fn create(
        &self,
        id: &str,
        host: Option<String>,
        settings: SessionSettings,
    ) -> Result<Session, SessionError> {
        let id = id.to_lowercase();
        let now = now_ms();

        let mut sessions = self.sessions.write();
        if sessions.contains_key(&id) {
            return Err(SessionError::Conflict);
        }

        let session = Session {
            id: id.clone(),
            host,
            clients: Vec::new(),
            settings,
            created_at: now,
            expires_at: now + self.ttl.as_millis() as u64,
            last_activity: now,
            stats: SessionStats::default(),
            domains: Vec::new(),
            regenerated: false,
        };

        sessions.insert(id, session.clone());
        Ok(session)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.read().contains_key(&id.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// snapshot of a single session.
    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().get(&id.to_lowercase()).cloned()
    }

    /// snapshot of every session, for the introspection surface.
    pub fn list(&self) -> Vec<Session> {
        self.sessions.read().values().cloned().collect()
    }

    /// mutate a session under the registry write lock.
    ///
    /// Stamps `last_activity` and pushes the idle expiry forward, so every
    /// mutation keeps the session alive. The closure's return value is handed
    /// back to the caller, `None` when the session does not exist.
    pub fn with<R>(&self, id: &str, handle: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(&id.to_lowercase())?;

        let now = now_ms();
        session.last_activity = now;
        session.expires_at = now + self.ttl.as_millis() as u64;

        Some(handle(session))
    }

    /// swap a session to a new registry key.
    ///
    /// Used by link regeneration and explicit session id changes. The removal
    /// and the re-insert happen under one write lock so no lookup can observe
    /// the session half-moved. The caller updates member peers' session
    /// pointers while still holding no other lock.
    pub fn rekey(&self, old: &str, new: &str) -> Result<Session, SessionError> {
        let old = old.to_lowercase();
        let new = new.to_lowercase();

        let mut sessions = self.sessions.write();
        if sessions.contains_key(&new) {
            return Err(SessionError::Conflict);
        }

        let mut session = sessions.remove(&old).ok_or(SessionError::NotFound)?;
        session.id = new.clone();
        session.last_activity = now_ms();

        sessions.insert(new, session.clone());
        Ok(session)
    }

    /// remove a session and run the destruction cascade.
    pub fn destroy(&self, id: &str) -> Option<Session> {
        let session = self.sessions.write().remove(&id.to_lowercase())?;

        log::info!("session destroyed: id={}", session.id);
        self.handler.session_destroyed(session.clone());
        Some(session)
    }
}

fn reaper<T: SessionHandler>(manager: Weak<SessionManager<T>>) {
    let mut expired = Vec::with_capacity(16);

    while let Some(this) = manager.upgrade() {
        let now = now_ms();

        {
            this.sessions
                .read()
                .values()
                .filter(|it| now >= it.expires_at)
                .for_each(|it| expired.push(it.id.clone()));
        }

        for id in expired.drain(..) {
            this.destroy(&id);
        }

        drop(this);
        thread::sleep(Duration::from_secs(60));
    }
}
