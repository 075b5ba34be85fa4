use serde::Serialize;

/// Client fingerprint extracted from the upgrade request's user agent and
/// later refined by the `client_info` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub platform: Option<String>,
    pub os: Option<String>,
    pub arch: Option<String>,
}

// Windows NT versions as they appear in user agents, mapped to the release
// names users know.
const WINDOWS_RELEASES: &[(&str, &str)] = &[
    ("Windows NT 10.0", "Windows 10"),
    ("Windows NT 6.3", "Windows 8.1"),
    ("Windows NT 6.2", "Windows 8"),
    ("Windows NT 6.1", "Windows 7"),
    ("Windows NT 6.0", "Windows Vista"),
    ("Windows NT 5.1", "Windows XP"),
];

const LINUX_DISTROS: &[&str] = &["Ubuntu", "Fedora", "Debian", "Arch", "Mint", "SUSE"];

/// best effort scan of a user agent string.
///
/// Electron shells report their host OS as well, so the OS patterns run
/// first and the Electron marker only refines the platform.
pub fn parse_user_agent(user_agent: &str) -> Fingerprint {
    let mut fingerprint = Fingerprint {
        arch: parse_arch(user_agent),
        ..Default::default()
    };

    for (needle, release) in WINDOWS_RELEASES {
        if user_agent.contains(needle) {
            fingerprint.platform = Some("windows".to_string());
            fingerprint.os = Some(release.to_string());
            break;
        }
    }

    if fingerprint.platform.is_none() {
        if let Some(at) = user_agent.find("Mac OS X ") {
            fingerprint.platform = Some("macos".to_string());
            fingerprint.os = Some(parse_macos_release(&user_agent[at + "Mac OS X ".len()..]));
        }
    }

    if fingerprint.platform.is_none() && user_agent.contains("Linux") {
        fingerprint.platform = Some("linux".to_string());
        fingerprint.os = Some(
            LINUX_DISTROS
                .iter()
                .find(|it| user_agent.contains(**it))
                .map(|it| it.to_string())
                .unwrap_or_else(|| "Linux".to_string()),
        );
    }

    if user_agent.contains("Electron") && fingerprint.platform.is_none() {
        fingerprint.platform = Some("electron".to_string());
    }

    fingerprint
}

/// `Mac OS X 10_15_7` style release capture, major and minor only.
fn parse_macos_release(rest: &str) -> String {
    let version: String = rest
        .chars()
        .take_while(|it| it.is_ascii_digit() || *it == '_' || *it == '.')
        .collect();

    let mut parts = version.split(['_', '.']);
    match (parts.next(), parts.next()) {
        (Some(major), Some(minor)) if !major.is_empty() => format!("macOS {major}.{minor}"),
        (Some(major), None) if !major.is_empty() => format!("macOS {major}"),
        _ => "macOS".to_string(),
    }
}

fn parse_arch(user_agent: &str) -> Option<String> {
    if user_agent.contains("x86_64")
        || user_agent.contains("x64")
        || user_agent.contains("Win64")
        || user_agent.contains("WOW64")
    {
        Some("x86_64".to_string())
    } else if user_agent.contains("arm64") || user_agent.contains("aarch64") {
        Some("arm64".to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_releases_are_mapped_by_nt_version() {
        let fp = parse_user_agent(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/120.0",
        );
        assert_eq!(fp.platform.as_deref(), Some("windows"));
        assert_eq!(fp.os.as_deref(), Some("Windows 10"));
        assert_eq!(fp.arch.as_deref(), Some("x86_64"));

        let fp = parse_user_agent("Mozilla/5.0 (Windows NT 6.1; WOW64)");
        assert_eq!(fp.os.as_deref(), Some("Windows 7"));
    }

    #[test]
    fn macos_release_numbering_is_captured() {
        let fp = parse_user_agent(
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36",
        );
        assert_eq!(fp.platform.as_deref(), Some("macos"));
        assert_eq!(fp.os.as_deref(), Some("macOS 10.15"));
    }

    #[test]
    fn linux_distro_substrings_are_recognized() {
        let fp = parse_user_agent("Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:109.0)");
        assert_eq!(fp.platform.as_deref(), Some("linux"));
        assert_eq!(fp.os.as_deref(), Some("Ubuntu"));

        let fp = parse_user_agent("Mozilla/5.0 (X11; Linux aarch64)");
        assert_eq!(fp.os.as_deref(), Some("Linux"));
        assert_eq!(fp.arch.as_deref(), Some("arm64"));
    }

    #[test]
    fn electron_catch_all() {
        let fp = parse_user_agent("openlink-app/2.1 Electron/28.1.0");
        assert_eq!(fp.platform.as_deref(), Some("electron"));
        assert_eq!(fp.os, None);
    }

    #[test]
    fn unknown_agents_yield_an_empty_fingerprint() {
        assert_eq!(parse_user_agent("curl/8.4.0"), Fingerprint::default());
    }
}
