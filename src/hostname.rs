/// Extract the subdomain session hint from an incoming `Host` header.
///
/// The port is stripped, then the remainder must end with `.` followed by an
/// allowlisted base domain and carry a non empty prefix. The prefix is the
/// hint; everything else yields `None`.
///
/// # Unit Test
///
/// ```
/// use openlink_server::hostname::subdomain_hint;
///
/// let bases = vec![
///     "openlink.raywonderis.me".to_string(),
///     "openlink.tappedin.fm".to_string(),
/// ];
///
/// assert_eq!(
///     subdomain_hint("abcd1234.openlink.raywonderis.me", &bases).as_deref(),
///     Some("abcd1234")
/// );
/// assert_eq!(
///     subdomain_hint("foo.openlink.tappedin.fm:8080", &bases).as_deref(),
///     Some("foo")
/// );
/// assert_eq!(subdomain_hint("openlink.raywonderis.me", &bases), None);
/// assert_eq!(subdomain_hint("example.com", &bases), None);
/// ```
pub fn subdomain_hint(host: &str, base_domains: &[String]) -> Option<String> {
    let host = strip_port(host).to_lowercase();

    for base in base_domains {
        if let Some(prefix) = host.strip_suffix(&format!(".{}", base.to_lowercase())) {
            if !prefix.is_empty() {
                return Some(prefix.to_string());
            }
        }
    }

    None
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|it| it.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bases() -> Vec<String> {
        vec!["openlink.local".to_string(), "openlink.raywonderis.me".to_string()]
    }

    #[test]
    fn prefix_before_an_allowlisted_base_is_the_hint() {
        assert_eq!(
            subdomain_hint("demo.openlink.local", &bases()).as_deref(),
            Some("demo")
        );
    }

    #[test]
    fn the_bare_base_has_no_hint() {
        assert_eq!(subdomain_hint("openlink.local", &bases()), None);
        assert_eq!(subdomain_hint(".openlink.local", &bases()), None);
    }

    #[test]
    fn ports_are_stripped_and_case_is_ignored() {
        assert_eq!(
            subdomain_hint("Demo.OpenLink.Local:3001", &bases()).as_deref(),
            Some("demo")
        );
    }

    #[test]
    fn unrelated_hosts_yield_nothing() {
        assert_eq!(subdomain_hint("example.com", &bases()), None);
        assert_eq!(subdomain_hint("openlink.local.evil.com", &bases()), None);
        assert_eq!(subdomain_hint("127.0.0.1:3001", &bases()), None);
    }
}
