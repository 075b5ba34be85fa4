use serde::{Deserialize, Serialize};

/// What a permit or temporary url allows against a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Connect,
    Write,
}

/// Capability token granting access to a domain pattern for a bounded
/// window.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Permit {
    /// 32 hex. The token doubles as the permit id.
    pub token: String,
    /// Exact full name, or a `*` wildcard pattern.
    pub pattern: String,
    /// When set, only this client id may present the permit.
    pub client_id: Option<String>,
    pub permissions: Vec<Permission>,
    pub created_by: String,
    pub created_at: u64,
    pub expires_at: u64,
    pub usage_count: u64,
    pub last_used: Option<u64>,
}

impl Permit {
    /// A permit matches while it is not expired and its pattern covers the
    /// name. Expiry is exclusive: a permit at exactly its expiry instant is
    /// rejected.
    pub fn matches(&self, name: &str, now: u64) -> bool {
        now < self.expires_at && pattern_matches(&self.pattern, name)
    }
}

/// exact or `*`-wildcard match against a full domain name.
///
/// # Unit Test
///
/// ```
/// use openlink_server_broker::permits::pattern_matches;
///
/// assert!(pattern_matches("foo.openlink.local", "foo.openlink.local"));
/// assert!(pattern_matches("*", "foo.openlink.local"));
/// assert!(pattern_matches("*.openlink.local", "foo.openlink.local"));
/// assert!(!pattern_matches("*.openlink.local", "foo.openlink.dev"));
/// assert!(!pattern_matches("bar.openlink.local", "foo.openlink.local"));
/// ```
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == name;
    }

    // Literal pieces between wildcards must appear in order; the first and
    // last pieces are anchored to the ends of the name.
    let segments: Vec<&str> = pattern.split('*').collect();

    let mut rest = match name.strip_prefix(segments[0]) {
        Some(rest) => rest,
        None => return false,
    };

    for segment in &segments[1..segments.len() - 1] {
        if segment.is_empty() {
            continue;
        }

        match rest.find(segment) {
            Some(at) => rest = &rest[at + segment.len()..],
            None => return false,
        }
    }

    rest.ends_with(segments[segments.len() - 1])
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRecord {
    pub at: u64,
    pub client: Option<String>,
}

/// Tokenized N-use access url to one domain.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TempUrl {
    /// 16 hex.
    pub id: String,
    /// 32 hex secret embedded in the url as a query parameter.
    pub token: String,
    pub domain_id: String,
    pub permissions: Vec<Permission>,
    pub max_uses: u32,
    pub uses: u32,
    pub expires_at: u64,
    pub access_url: String,
    pub access_log: Vec<AccessRecord>,
}

impl TempUrl {
    /// Valid while the token matches, the expiry is in the future and the
    /// usage cap has not been reached.
    pub fn validates(&self, token: &str, now: u64) -> bool {
        self.token == token && now < self.expires_at && self.uses < self.max_uses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn permit(expires_at: u64) -> Permit {
        Permit {
            token: "a".repeat(32),
            pattern: "foo.openlink.local".to_string(),
            client_id: None,
            permissions: vec![Permission::Read, Permission::Connect],
            created_by: "test".to_string(),
            created_at: 0,
            expires_at,
            usage_count: 0,
            last_used: None,
        }
    }

    #[test]
    fn permit_at_exactly_its_expiry_instant_is_rejected() {
        let permit = permit(1000);

        assert!(permit.matches("foo.openlink.local", 999));
        assert!(!permit.matches("foo.openlink.local", 1000));
        assert!(!permit.matches("foo.openlink.local", 1001));
    }

    #[test]
    fn permit_pattern_must_cover_the_name() {
        let permit = permit(1000);

        assert!(!permit.matches("bar.openlink.local", 0));
    }

    #[test]
    fn temp_url_at_the_usage_cap_is_rejected() {
        let mut url = TempUrl {
            id: "b".repeat(16),
            token: "c".repeat(32),
            domain_id: "d".repeat(16),
            permissions: vec![Permission::Read],
            max_uses: 2,
            uses: 0,
            expires_at: 1000,
            access_url: String::new(),
            access_log: Vec::new(),
        };

        assert!(url.validates(&"c".repeat(32), 0));
        url.uses = 1;
        assert!(url.validates(&"c".repeat(32), 0));
        url.uses = 2;
        assert!(!url.validates(&"c".repeat(32), 0));
    }

    #[test]
    fn temp_url_token_and_expiry_are_checked() {
        let url = TempUrl {
            id: "b".repeat(16),
            token: "c".repeat(32),
            domain_id: "d".repeat(16),
            permissions: vec![Permission::Read],
            max_uses: 1,
            uses: 0,
            expires_at: 1000,
            access_url: String::new(),
            access_log: Vec::new(),
        };

        assert!(!url.validates("wrong", 0));
        assert!(!url.validates(&"c".repeat(32), 1000));
    }

    #[test]
    fn wildcard_patterns() {
        assert!(pattern_matches("*", "anything.at.all"));
        assert!(pattern_matches("foo.*", "foo.openlink.local"));
        assert!(pattern_matches("*.local", "foo.openlink.local"));
        assert!(!pattern_matches("foo.*", "bar.openlink.local"));
        assert!(!pattern_matches("*.dev", "foo.openlink.local"));
    }
}
