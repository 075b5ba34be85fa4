use std::sync::Arc;

use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;

use crate::{
    Error, now_ms,
    exec::{ExecChannel, ExecOutput},
};

/// A cache entry is served while fresh and hard-dropped once it passes the
/// maximum age.
pub const CACHE_FRESH_MS: u64 = 5 * 60 * 1000;
pub const CACHE_MAX_AGE_MS: u64 = 30 * 60 * 1000;

/// Where a positive existence answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Resolved in DNS, not something the broker materialized.
    Dns,
    /// Found as a `server_name` in an aggregate proxy config.
    ExternalNginx,
    None,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dns => "dns",
            Self::ExternalNginx => "external+nginx",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Existence {
    pub exists: bool,
    pub source: Source,
}

#[derive(Clone, Copy)]
struct CacheEntry {
    exists: bool,
    source: Source,
    fetched_at: u64,
}

/// Answers "does this fully qualified name already exist outside the
/// broker?".
///
/// The broker consults its own active-domain registry first; this component
/// only layers the cached external probes: DNS resolution and a
/// `server_name` grep over the aggregate proxy configs.
pub struct ExistenceChecker<E> {
    exec: Arc<E>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    local_conf: String,
    remote_conf: Option<String>,
}

impl<E> ExistenceChecker<E>
where
    E: ExecChannel,
{
    pub fn new(exec: Arc<E>, local_conf: String, remote_conf: Option<String>) -> Self {
        Self {
            exec,
            cache: Mutex::new(HashMap::with_capacity(256)),
            local_conf,
            remote_conf,
        }
    }

    /// probe whether the name exists externally, using the cache when fresh.
    ///
    /// The name must already be validated label-by-label; it is interpolated
    /// into the probe commands verbatim.
    pub async fn probe(&self, full_name: &str) -> Result<Existence, Error> {
        let now = now_ms();

        if let Some(entry) = self.cache.lock().get(full_name) {
            if now.saturating_sub(entry.fetched_at) < CACHE_FRESH_MS {
                return Ok(Existence {
                    exists: entry.exists,
                    source: entry.source,
                });
            }
        }

        let result = self.resolve(full_name).await?;
        self.seed(full_name, result.exists, result.source);
        Ok(result)
    }

    async fn resolve(&self, full_name: &str) -> Result<Existence, Error> {
        // DNS first. A resolved address is a positive external hit, NXDOMAIN
        // a definite negative.
        let lookup = self.run(&format!("nslookup {full_name}")).await?;
        if dns_resolved(&lookup) {
            return Ok(Existence {
                exists: true,
                source: Source::Dns,
            });
        }

        // Fall back to the aggregate configs of both locations.
        let grep = format!("grep -l 'server_name {full_name}' {} 2>/dev/null", self.local_conf);
        if self.exec.exec_local(&grep).await.map_err(transient)?.success() {
            return Ok(Existence {
                exists: true,
                source: Source::ExternalNginx,
            });
        }

        if let Some(remote_conf) = &self.remote_conf {
            let grep = format!("grep -l 'server_name {full_name}' {remote_conf} 2>/dev/null");
            if self.exec.exec_remote(&grep).await.map_err(transient)?.success() {
                return Ok(Existence {
                    exists: true,
                    source: Source::ExternalNginx,
                });
            }
        }

        Ok(Existence {
            exists: false,
            source: Source::None,
        })
    }

    async fn run(&self, command: &str) -> Result<ExecOutput, Error> {
        if self.remote_conf.is_some() {
            self.exec.exec_remote(command).await.map_err(transient)
        } else {
            self.exec.exec_local(command).await.map_err(transient)
        }
    }

    /// write an answer into the cache, also the test seam for pre-seeding.
    pub fn seed(&self, full_name: &str, exists: bool, source: Source) {
        self.cache.lock().insert(
            full_name.to_string(),
            CacheEntry {
                exists,
                source,
                fetched_at: now_ms(),
            },
        );
    }

    pub fn forget(&self, full_name: &str) {
        self.cache.lock().remove(full_name);
    }

    /// drop entries older than the hard ttl, called by the broker's reaper.
    pub fn prune(&self) {
        let now = now_ms();
        self.cache
            .lock()
            .retain(|_, entry| now.saturating_sub(entry.fetched_at) < CACHE_MAX_AGE_MS);
    }
}

fn transient(error: crate::exec::ExecError) -> Error {
    Error::Transient(error.to_string())
}

fn dns_resolved(output: &ExecOutput) -> bool {
    let text = format!("{}{}", output.stdout, output.stderr);
    if text.contains("NXDOMAIN") || text.contains("can't find") || text.contains("SERVFAIL") {
        return false;
    }

    // nslookup prints the resolver itself first; a second `Address` line is
    // the answer.
    output.success() && text.matches("Address").count() > 1
}
