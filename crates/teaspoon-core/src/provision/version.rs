//! Release versions and conda-style package versions

use crate::error::ProvisionError;
use semver::Version;
use std::cmp::Ordering;
use std::fmt;

/// Parse a release version string, accepting a leading 'v'
pub fn parse_release_version(version_str: &str) -> Result<Version, ProvisionError> {
    let cleaned = version_str.trim();
    let cleaned = cleaned.strip_prefix('v').unwrap_or(cleaned);
    Version::parse(cleaned).map_err(|e| ProvisionError::InvalidVersion {
        version: version_str.to_string(),
        reason: e.to_string(),
    })
}

/// One dot-separated piece of a package version
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Number(u64),
    Text(String),
}

impl Segment {
    fn parse(raw: &str) -> Self {
        match raw.parse::<u64>() {
            Ok(n) => Segment::Number(n),
            Err(_) => Segment::Text(raw.to_ascii_lowercase()),
        }
    }
}

impl Ord for Segment {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Segment::Number(a), Segment::Number(b)) => a.cmp(b),
            // Pre-release tags sort before numbers: 1.0.rc1 < 1.0.0
            (Segment::Text(_), Segment::Number(_)) => Ordering::Less,
            (Segment::Number(_), Segment::Text(_)) => Ordering::Greater,
            (Segment::Text(a), Segment::Text(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Segment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A conda package version such as `3.8`, `2.3.1` or `1.81`
///
/// Missing trailing segments compare as zero, so `3.8 == 3.8.0`.
#[derive(Debug, Clone)]
pub struct PackageVersion {
    raw: String,
    segments: Vec<Segment>,
}

impl PackageVersion {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let allowed =
            |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+' | '!');
        if raw.is_empty() || !raw.chars().all(allowed) {
            return None;
        }
        let segments = raw
            .split(['.', '_', '-'])
            .filter(|s| !s.is_empty())
            .map(Segment::parse)
            .collect::<Vec<_>>();
        if segments.is_empty() {
            return None;
        }
        Some(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when `self` starts with every segment of `prefix` (`2.3.1` has prefix `2.3`)
    pub fn has_prefix(&self, prefix: &PackageVersion) -> bool {
        prefix.segments.len() <= self.segments.len()
            && prefix
                .segments
                .iter()
                .zip(&self.segments)
                .all(|(a, b)| a == b)
    }
}

impl PartialEq for PackageVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PackageVersion {}

impl Ord for PackageVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.segments.len().max(other.segments.len());
        let zero = Segment::Number(0);
        for i in 0..len {
            let a = self.segments.get(i).unwrap_or(&zero);
            let b = other.segments.get(i).unwrap_or(&zero);
            match a.cmp(b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for PackageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> PackageVersion {
        PackageVersion::parse(s).unwrap()
    }

    #[test]
    fn test_release_version_strips_v() {
        assert_eq!(parse_release_version("v0.3.0").unwrap(), Version::new(0, 3, 0));
        assert_eq!(parse_release_version("0.3.0").unwrap(), Version::new(0, 3, 0));
    }

    #[test]
    fn test_invalid_release_version() {
        let err = parse_release_version("latest").unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidVersion { .. }));
    }

    #[test]
    fn test_numeric_ordering() {
        assert!(v("3.10") > v("3.8"));
        assert!(v("2.3.1") > v("2.3"));
        assert!(v("0.10.0") > v("0.9.9"));
    }

    #[test]
    fn test_trailing_zero_equal() {
        assert_eq!(v("3.8"), v("3.8.0"));
    }

    #[test]
    fn test_prerelease_sorts_first() {
        assert!(v("1.0.rc1") < v("1.0.0"));
    }

    #[test]
    fn test_rejects_patterns() {
        assert!(PackageVersion::parse("^1.2$").is_none());
        assert!(PackageVersion::parse("1.*.3").is_none());
        assert!(PackageVersion::parse("1!2.0").is_some());
    }

    #[test]
    fn test_prefix() {
        assert!(v("2.3.1").has_prefix(&v("2.3")));
        assert!(!v("2.30").has_prefix(&v("2.3")));
        assert!(!v("2").has_prefix(&v("2.3")));
    }
}
