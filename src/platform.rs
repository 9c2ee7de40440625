//! Host platform description and declarative platform predicates.
//!
//! Platform-conditional behavior in formulas is expressed as `when` clauses
//! (data evaluated against a [`Platform`] value), never as branches inside the
//! executor.

use semver::Version;
use serde::Deserialize;

/// The platform a build runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    /// Operating system name ("linux", "macos", ...)
    pub os: String,
    /// Target architecture ("x86_64", "aarch64", ...)
    pub arch: String,
    /// OS release, when it could be determined
    pub os_version: Option<Version>,
}

impl Platform {
    /// Capture the host platform.
    pub fn host() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            os_version: host_os_version(),
        }
    }
}

/// Best-effort OS release lookup. `uname -r` style strings often carry
/// vendor suffixes, so only a leading `major.minor.patch` is accepted.
fn host_os_version() -> Option<Version> {
    let output = std::process::Command::new("uname").arg("-r").output().ok()?;
    let release = String::from_utf8_lossy(&output.stdout);
    let numeric: String = release
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    Version::parse(&numeric).ok()
}

/// A platform predicate attached to a step or environment overlay.
///
/// Every present field must match for the clause to apply; an empty clause
/// matches everything.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WhenClause {
    pub os: Option<String>,
    pub arch: Option<String>,
    pub min_os_version: Option<String>,
    pub max_os_version: Option<String>,
}

impl WhenClause {
    /// Evaluate this predicate against a platform.
    pub fn matches(&self, platform: &Platform) -> bool {
        if let Some(ref os) = self.os
            && os != &platform.os
        {
            return false;
        }
        if let Some(ref arch) = self.arch
            && arch != &platform.arch
        {
            return false;
        }
        if let Some(ref min) = self.min_os_version
            && !version_cmp(platform, min, |host, bound| host >= bound)
        {
            return false;
        }
        if let Some(ref max) = self.max_os_version
            && !version_cmp(platform, max, |host, bound| host <= bound)
        {
            return false;
        }
        true
    }

    /// Whether any field is set at all.
    pub fn is_empty(&self) -> bool {
        self.os.is_none()
            && self.arch.is_none()
            && self.min_os_version.is_none()
            && self.max_os_version.is_none()
    }
}

/// Compare the host OS version against a bound. An unknown host version or an
/// unparseable bound fails the predicate rather than silently passing.
fn version_cmp(platform: &Platform, bound: &str, cmp: fn(&Version, &Version) -> bool) -> bool {
    let Some(ref host) = platform.os_version else {
        return false;
    };
    match lenient_version(bound) {
        Some(bound) => cmp(host, &bound),
        None => false,
    }
}

/// Parse "12" or "12.3" as well as full semver.
pub(crate) fn lenient_version(s: &str) -> Option<Version> {
    if let Ok(v) = Version::parse(s) {
        return Some(v);
    }
    let parts: Vec<&str> = s.split('.').collect();
    let (major, minor, patch) = match parts.as_slice() {
        [a] => (a.parse().ok()?, 0, 0),
        [a, b] => (a.parse().ok()?, b.parse().ok()?, 0),
        [a, b, c] => (a.parse().ok()?, b.parse().ok()?, c.parse().ok()?),
        _ => return None,
    };
    Some(Version::new(major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linux_6_1() -> Platform {
        Platform {
            os: "linux".to_string(),
            arch: "x86_64".to_string(),
            os_version: Some(Version::new(6, 1, 0)),
        }
    }

    #[test]
    fn test_empty_clause_matches_everything() {
        let clause = WhenClause::default();
        assert!(clause.is_empty());
        assert!(clause.matches(&linux_6_1()));
    }

    #[test]
    fn test_os_mismatch() {
        let clause = WhenClause {
            os: Some("macos".to_string()),
            ..Default::default()
        };
        assert!(!clause.matches(&linux_6_1()));
    }

    #[test]
    fn test_min_version_bound() {
        let clause = WhenClause {
            os: Some("linux".to_string()),
            min_os_version: Some("5.10".to_string()),
            ..Default::default()
        };
        assert!(clause.matches(&linux_6_1()));

        let clause = WhenClause {
            min_os_version: Some("7".to_string()),
            ..Default::default()
        };
        assert!(!clause.matches(&linux_6_1()));
    }

    #[test]
    fn test_unknown_host_version_fails_version_predicates() {
        let platform = Platform {
            os: "linux".to_string(),
            arch: "x86_64".to_string(),
            os_version: None,
        };
        let clause = WhenClause {
            min_os_version: Some("1.0".to_string()),
            ..Default::default()
        };
        assert!(!clause.matches(&platform));
    }

    #[test]
    fn test_lenient_version_parse() {
        assert_eq!(lenient_version("12"), Some(Version::new(12, 0, 0)));
        assert_eq!(lenient_version("12.3"), Some(Version::new(12, 3, 0)));
        assert_eq!(lenient_version("12.3.1"), Some(Version::new(12, 3, 1)));
        assert_eq!(lenient_version("not-a-version"), None);
    }
}
