use std::{sync::Arc, time::Duration};

use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    Error, hex_token, now_ms,
    checker::ExistenceChecker,
    exec::ExecChannel,
    nginx::NginxWriter,
    permits::{AccessRecord, Permission, Permit, TempUrl},
    ports::{PortAllocator, PortRange},
};

/// Where the reverse proxy for a domain runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Local,
    Remote,
}

impl Location {
    /// `local` when the base is a loopback style suffix, `remote` for every
    /// public base.
    pub fn resolve(base_domain: &str) -> Self {
        if base_domain.ends_with(".local") || base_domain == "localhost" {
            Self::Local
        } else {
            Self::Remote
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainStatus {
    Creating,
    Active,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessControl {
    Public,
    PermitOnly,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainRecord {
    /// 16 hex.
    pub id: String,
    /// Connection id of the requesting peer.
    pub peer_id: String,
    pub subdomain: String,
    pub base_domain: String,
    pub full_name: String,
    pub target_host: String,
    pub target_port: u16,
    pub ssl: bool,
    /// Reverse proxy port taken from the allocator.
    pub proxy_port: u16,
    pub location: Location,
    pub status: DomainStatus,
    pub created_at: u64,
    pub expires_at: u64,
    pub access: AccessControl,
    /// Attached permit tokens.
    pub permits: Vec<String>,
    /// Attached temporary url ids.
    pub temp_urls: Vec<String>,
    pub requests: u64,
    pub access_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainRequest {
    pub subdomain: String,
    pub base_domain: String,
    /// Connection id of the requesting peer; the composition layer verifies
    /// it names a connected peer before the request reaches the broker.
    pub peer_id: String,
    pub target_host: String,
    pub target_port: u16,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub permit_token: Option<String>,
    #[serde(default)]
    pub temporary: bool,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub access: Option<AccessControl>,
}

pub struct BrokerOptions {
    /// Base domains the operator authorizes for on demand subdomains.
    pub base_domains: Vec<String>,
    pub port_range: PortRange,
    /// 24 hours by default; no domain outlives it.
    pub max_domain_life: Duration,
    /// 7 days by default.
    pub max_permit_duration: Duration,
    /// 15 minutes by default.
    pub temp_url_ttl: Duration,
    /// Reaper cadence, 15 minutes by default.
    pub cleanup_interval: Duration,
    pub local_conf: String,
    pub remote_conf: Option<String>,
    /// LAN address of this machine, the upstream remote blocks point back
    /// to.
    pub remote_upstream_host: String,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            base_domains: vec!["openlink.local".to_string()],
            port_range: PortRange::default(),
            max_domain_life: Duration::from_secs(24 * 3600),
            max_permit_duration: Duration::from_secs(7 * 24 * 3600),
            temp_url_ttl: Duration::from_secs(15 * 60),
            cleanup_interval: Duration::from_secs(15 * 60),
            local_conf: "/etc/nginx/conf.d/openlink-domains.conf".to_string(),
            remote_conf: None,
            remote_upstream_host: "127.0.0.1".to_string(),
        }
    }
}

struct PortTable {
    allocator: PortAllocator,
    /// port -> owning domain id, one to one over active domains.
    owners: HashMap<u16, String>,
}

/// Top level api for requesting and releasing subdomains.
///
/// Owns the active domain registry, the permit and temporary url registries
/// and the existence cache; orchestrates the allocator, the config writer
/// and the checker. No registry lock is ever held across an exec call.
pub struct DomainBroker<E> {
    options: BrokerOptions,
    exec: Arc<E>,
    nginx: NginxWriter<E>,
    checker: ExistenceChecker<E>,
    domains: Mutex<HashMap<String, DomainRecord>>,
    ports: Mutex<PortTable>,
    permits: Mutex<HashMap<String, Permit>>,
    temp_urls: Mutex<HashMap<String, TempUrl>>,
}

impl<E> DomainBroker<E>
where
    E: ExecChannel,
{
    pub fn new(options: BrokerOptions, exec: Arc<E>) -> Arc<Self> {
        let nginx = NginxWriter::new(
            exec.clone(),
            options.local_conf.clone(),
            options.remote_conf.clone(),
            options.remote_upstream_host.clone(),
        );

        let checker = ExistenceChecker::new(
            exec.clone(),
            options.local_conf.clone(),
            options.remote_conf.clone(),
        );

        Arc::new(Self {
            exec,
            nginx,
            checker,
            domains: Mutex::new(HashMap::with_capacity(64)),
            ports: Mutex::new(PortTable {
                allocator: PortAllocator::new(options.port_range),
                owners: HashMap::with_capacity(64),
            }),
            permits: Mutex::new(HashMap::with_capacity(64)),
            temp_urls: Mutex::new(HashMap::with_capacity(64)),
            options,
        })
    }

    pub fn checker(&self) -> &ExistenceChecker<E> {
        &self.checker
    }

    pub fn exec(&self) -> &Arc<E> {
        &self.exec
    }

    /// provision a subdomain and materialize its reverse proxy block.
    pub async fn request_domain(&self, request: DomainRequest) -> Result<DomainRecord, Error> {
        self.validate(&request)?;

        let full_name = format!("{}.{}", request.subdomain, request.base_domain);
        let location = Location::resolve(&request.base_domain);
        let now = now_ms();
        let expires_at = self.expiry(&request, now);

        // An internal hit is either the owner coming back (extend) or a
        // foreign peer that must present a matching permit.
        let existing = {
            self.domains
                .lock()
                .values()
                .find(|it| it.full_name == full_name)
                .cloned()
        };

        if let Some(existing) = existing {
            if existing.peer_id == request.peer_id {
                return self
                    .with_domain(&existing.id, |it| {
                        it.expires_at = expires_at;
                        it.requests += 1;
                        it.clone()
                    })
                    .ok_or(Error::NotFound);
            }

            let authorized = match &request.permit_token {
                Some(token) => self.validate_permit(token, Some(&full_name)),
                None => false,
            };

            if !authorized {
                return Err(Error::AccessDenied(format!(
                    "domain {full_name} is owned by another peer"
                )));
            }

            return self
                .with_domain(&existing.id, |it| {
                    it.requests += 1;
                    it.clone()
                })
                .ok_or(Error::NotFound);
        }

        // Not ours; a name that already resolves or already sits in a proxy
        // config is not manageable by the broker.
        let existence = self.checker.probe(&full_name).await?;
        if existence.exists {
            return Err(Error::ExternallyManaged(full_name));
        }

        let proxy_port = self
            .ports
            .lock()
            .allocator
            .alloc()
            .ok_or_else(|| Error::Conflict("port range exhausted".to_string()))?;

        let record = DomainRecord {
            id: hex_token(8),
            peer_id: request.peer_id.clone(),
            subdomain: request.subdomain.clone(),
            base_domain: request.base_domain.clone(),
            full_name: full_name.clone(),
            target_host: request.target_host.clone(),
            target_port: request.target_port,
            ssl: request.ssl,
            proxy_port,
            location,
            status: DomainStatus::Creating,
            created_at: now,
            expires_at,
            access: request.access.unwrap_or(AccessControl::Public),
            permits: Vec::new(),
            temp_urls: Vec::new(),
            requests: 1,
            access_url: None,
        };

        {
            let mut domains = self.domains.lock();
            if domains.values().any(|it| it.full_name == full_name) {
                let mut ports = self.ports.lock();
                ports.allocator.restore(proxy_port);
                return Err(Error::Conflict(format!("domain {full_name} already exists")));
            }

            self.ports.lock().owners.insert(proxy_port, record.id.clone());
            domains.insert(record.id.clone(), record.clone());
        }

        if let Err(error) = self.nginx.add(&record).await {
            let mut ports = self.ports.lock();
            ports.allocator.restore(proxy_port);
            ports.owners.remove(&proxy_port);
            self.domains.lock().remove(&record.id);
            return Err(error);
        }

        let scheme = if record.ssl { "https" } else { "http" };
        let access_url = format!("{scheme}://{full_name}");

        let permit = if record.access == AccessControl::PermitOnly {
            Some(self.create_permit(
                &full_name,
                Some(Duration::from_millis(expires_at.saturating_sub(now))),
                vec![Permission::Read, Permission::Connect],
                None,
                &request.peer_id,
            ))
        } else {
            None
        };

        log::info!(
            "domain active: name={full_name}, id={}, port={proxy_port}, location={}",
            record.id,
            location.as_str()
        );

        self.with_domain(&record.id, |it| {
            it.status = DomainStatus::Active;
            it.access_url = Some(access_url.clone());
            if let Some(permit) = &permit {
                it.permits.push(permit.token.clone());
            }
            it.clone()
        })
        .ok_or(Error::NotFound)
    }

    /// tear a domain down: proxy block out, port back, record gone.
    ///
    /// A second release of the same id is `not-found`.
    pub async fn release_domain(&self, id: &str) -> Result<DomainRecord, Error> {
        let record = self.domains.lock().remove(id).ok_or(Error::NotFound)?;

        if let Err(error) = self.nginx.remove(&record).await {
            // The aggregate was rolled back; keep the record so the registry
            // and the file stay consistent.
            self.domains.lock().insert(id.to_string(), record);
            return Err(error);
        }

        {
            let mut ports = self.ports.lock();
            ports.allocator.restore(record.proxy_port);
            ports.owners.remove(&record.proxy_port);
        }

        {
            let mut permits = self.permits.lock();
            for token in &record.permits {
                permits.remove(token);
            }
        }

        {
            let mut temp_urls = self.temp_urls.lock();
            for url_id in &record.temp_urls {
                temp_urls.remove(url_id);
            }
        }

        self.checker.forget(&record.full_name);

        log::info!("domain released: name={}, id={}", record.full_name, record.id);
        Ok(record)
    }

    pub fn get_domain(&self, id: &str) -> Option<DomainRecord> {
        self.domains.lock().get(id).cloned()
    }

    pub fn list_domains(&self) -> Vec<DomainRecord> {
        self.domains.lock().values().cloned().collect()
    }

    pub fn allocated_ports(&self) -> usize {
        self.ports.lock().allocator.len()
    }

    fn with_domain<R>(&self, id: &str, handle: impl FnOnce(&mut DomainRecord) -> R) -> Option<R> {
        self.domains.lock().get_mut(id).map(handle)
    }

    /// mint a permit; the duration is capped at the configured maximum.
    pub fn create_permit(
        &self,
        pattern: &str,
        duration: Option<Duration>,
        permissions: Vec<Permission>,
        client_id: Option<String>,
        created_by: &str,
    ) -> Permit {
        let now = now_ms();
        let duration = duration
            .unwrap_or(self.options.max_permit_duration)
            .min(self.options.max_permit_duration);

        let permit = Permit {
            token: hex_token(16),
            pattern: pattern.to_string(),
            client_id,
            permissions,
            created_by: created_by.to_string(),
            created_at: now,
            expires_at: now + duration.as_millis() as u64,
            usage_count: 0,
            last_used: None,
        };

        self.permits
            .lock()
            .insert(permit.token.clone(), permit.clone());
        permit
    }

    /// check a presented permit and record the use on a match.
    pub fn validate_permit(&self, token: &str, name: Option<&str>) -> bool {
        let now = now_ms();

        let mut permits = self.permits.lock();
        let Some(permit) = permits.get_mut(token) else {
            return false;
        };

        let matched = match name {
            Some(name) => permit.matches(name, now),
            None => now < permit.expires_at,
        };

        if matched {
            permit.usage_count += 1;
            permit.last_used = Some(now);
        }

        matched
    }

    pub fn get_permit(&self, token: &str) -> Option<Permit> {
        self.permits.lock().get(token).cloned()
    }

    /// mint a tokenized N-use url for an existing domain.
    pub fn create_temp_url(
        &self,
        domain_id: &str,
        duration: Option<Duration>,
        max_uses: u32,
        permissions: Vec<Permission>,
    ) -> Result<TempUrl, Error> {
        let access_url = self
            .get_domain(domain_id)
            .and_then(|it| it.access_url)
            .ok_or(Error::NotFound)?;

        let now = now_ms();
        let duration = duration.unwrap_or(self.options.temp_url_ttl);

        let url = TempUrl {
            id: hex_token(8),
            token: hex_token(16),
            domain_id: domain_id.to_string(),
            permissions,
            max_uses: max_uses.max(1),
            uses: 0,
            expires_at: now + duration.as_millis() as u64,
            access_url: String::new(),
            access_log: Vec::new(),
        };

        let url = TempUrl {
            access_url: format!("{access_url}/?olk_id={}&olk_token={}", url.id, url.token),
            ..url
        };

        self.with_domain(domain_id, |it| it.temp_urls.push(url.id.clone()));
        self.temp_urls.lock().insert(url.id.clone(), url.clone());
        Ok(url)
    }

    /// check a temporary url token; a success consumes one use and is
    /// appended to the access log.
    pub fn validate_temp_url(&self, id: &str, token: &str, client: Option<&str>) -> bool {
        let now = now_ms();

        let mut temp_urls = self.temp_urls.lock();
        let Some(url) = temp_urls.get_mut(id) else {
            return false;
        };

        if !url.validates(token, now) {
            return false;
        }

        url.uses += 1;
        url.access_log.push(AccessRecord {
            at: now,
            client: client.map(str::to_string),
        });

        true
    }

    /// one reaper sweep: expired domains released through the normal path,
    /// expired permits and urls deleted, stale cache entries dropped.
    pub async fn gc(&self) {
        let now = now_ms();

        let expired: Vec<String> = {
            let mut domains = self.domains.lock();
            domains
                .values_mut()
                .filter(|it| now >= it.expires_at)
                .map(|it| {
                    it.status = DomainStatus::Expired;
                    it.id.clone()
                })
                .collect()
        };

        for id in expired {
            if let Err(error) = self.release_domain(&id).await {
                log::warn!("expired domain release failed: id={id}, error={error}");
            }
        }

        self.permits.lock().retain(|_, it| now < it.expires_at);
        self.temp_urls.lock().retain(|_, it| now < it.expires_at);
        self.checker.prune();
    }

    /// background reaper task.
    pub fn spawn_gc(self: &Arc<Self>) {
        let this = Arc::downgrade(self);
        let cadence = self.options.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cadence);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match this.upgrade() {
                    Some(this) => this.gc().await,
                    None => break,
                }
            }
        });
    }

    fn validate(&self, request: &DomainRequest) -> Result<(), Error> {
        if !is_valid_label(&request.subdomain) {
            return Err(Error::MalformedRequest(format!(
                "invalid subdomain label: {:?}",
                request.subdomain
            )));
        }

        if !self
            .options
            .base_domains
            .iter()
            .any(|it| it == &request.base_domain)
        {
            return Err(Error::MalformedRequest(format!(
                "base domain not allowed: {}",
                request.base_domain
            )));
        }

        if request.peer_id.is_empty() {
            return Err(Error::MalformedRequest("missing peer id".to_string()));
        }

        if request.target_host.is_empty() {
            return Err(Error::MalformedRequest("missing target host".to_string()));
        }

        if request.target_port == 0 {
            return Err(Error::MalformedRequest("invalid target port".to_string()));
        }

        if request.temporary && request.duration_ms == Some(0) {
            return Err(Error::MalformedRequest("invalid duration".to_string()));
        }

        Ok(())
    }

    fn expiry(&self, request: &DomainRequest, now: u64) -> u64 {
        let max = now + self.options.max_domain_life.as_millis() as u64;

        match (request.temporary, request.duration_ms) {
            (true, Some(duration)) => max.min(now + duration),
            (true, None) => max.min(now + self.options.temp_url_ttl.as_millis() as u64),
            _ => max,
        }
    }
}

/// subdomain labels are `[a-z0-9-]+`, at most one dns label long.
///
/// # Unit Test
///
/// ```
/// use openlink_server_broker::domains::is_valid_label;
///
/// assert!(is_valid_label("foo"));
/// assert!(is_valid_label("foo-bar-01"));
/// assert!(!is_valid_label(""));
/// assert!(!is_valid_label("Foo"));
/// assert!(!is_valid_label("foo_bar"));
/// assert!(!is_valid_label(&"a".repeat(64)));
/// ```
pub fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && label
            .bytes()
            .all(|it| it.is_ascii_lowercase() || it.is_ascii_digit() || it == b'-')
}
