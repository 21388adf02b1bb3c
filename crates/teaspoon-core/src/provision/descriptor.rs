//! Environment descriptor types and parsing
//!
//! The descriptor is a conda `environment.yml` shipped inside the release:
//!
//! ```yaml
//! name: teaspoon
//! channels:
//!   - conda-forge
//!   - bioconda
//! dependencies:
//!   - python>=3.8
//!   - biopython
//!   - pip:
//!       - some-wheel==1.0
//! ```

use super::version::PackageVersion;
use crate::error::ProvisionError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// One entry of the `dependencies` list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dependency {
    Spec(String),
    Pip { pip: Vec<String> },
}

/// Parsed `environment.yml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentDescriptor {
    /// Environment name (informational, the prefix is chosen by the provisioner)
    #[serde(default)]
    pub name: Option<String>,

    /// Channels in priority order
    #[serde(default)]
    pub channels: Vec<String>,

    /// Package match specs and pip sub-lists
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

/// Descriptor together with where it came from and its digest
#[derive(Debug, Clone)]
pub struct LoadedDescriptor {
    pub path: PathBuf,
    pub descriptor: EnvironmentDescriptor,
    pub digest: String,
}

impl EnvironmentDescriptor {
    pub fn parse(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// Read and parse a descriptor file, recording its sha256
    pub fn load(path: &Path) -> Result<LoadedDescriptor, ProvisionError> {
        let bytes = std::fs::read(path).map_err(|e| ProvisionError::Descriptor {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let content = String::from_utf8_lossy(&bytes);
        let descriptor = Self::parse(&content).map_err(|e| ProvisionError::Descriptor {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(LoadedDescriptor {
            path: path.to_path_buf(),
            descriptor,
            digest: hex::encode(Sha256::digest(&bytes)),
        })
    }

    /// Conda package specs, parsed. Unparseable entries are reported as errors.
    pub fn package_specs(&self) -> Result<Vec<PackageSpec>, String> {
        self.dependencies
            .iter()
            .filter_map(|dep| match dep {
                Dependency::Spec(raw) => Some(PackageSpec::parse(raw)),
                Dependency::Pip { .. } => None,
            })
            .collect()
    }

    /// Reject specs whose combined constraints cannot be met by any version
    pub fn check_consistency(&self) -> Result<(), ProvisionError> {
        let specs = self.package_specs().map_err(ProvisionError::resolution)?;

        let mut by_name: BTreeMap<&str, Vec<&Constraint>> = BTreeMap::new();
        for spec in &specs {
            by_name
                .entry(spec.name.as_str())
                .or_default()
                .extend(spec.constraints.iter());
        }

        for (name, constraints) in by_name {
            check_intersection(&constraints)
                .map_err(|reason| ProvisionError::resolution(format!("{}: {}", name, reason)))?;
        }
        Ok(())
    }
}

/// A single version constraint from a match spec
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Exact(PackageVersion),
    Prefix(PackageVersion),
    NotEqual(PackageVersion),
    AtLeast(PackageVersion),
    Greater(PackageVersion),
    AtMost(PackageVersion),
    Less(PackageVersion),
    /// Expressions (such as `|` alternatives) left to the installer
    Unchecked(String),
}

impl Constraint {
    /// Parse one comma-separated constraint. `None` means the constraint allows
    /// every version (`*`); anything the checker cannot read stays `Unchecked`.
    fn parse(raw: &str, spaced: bool) -> Option<Self> {
        let raw = raw.trim();
        let (op, rest) = ["==", "!=", ">=", "<=", "~=", ">", "<", "="]
            .iter()
            .find_map(|op| raw.strip_prefix(*op).map(|rest| (*op, rest.trim())))
            .unwrap_or(("", raw));

        let (body, wildcard) = match rest.strip_suffix(".*").or_else(|| rest.strip_suffix('*')) {
            Some(body) => (body, true),
            None => (rest, false),
        };
        if wildcard && body.is_empty() && matches!(op, "" | "=" | "==") {
            return None;
        }
        let Some(version) = PackageVersion::parse(body) else {
            return Some(Constraint::Unchecked(raw.to_string()));
        };

        Some(match op {
            "==" if wildcard => Constraint::Prefix(version),
            "==" => Constraint::Exact(version),
            "=" => Constraint::Prefix(version),
            "!=" => Constraint::NotEqual(version),
            ">=" => Constraint::AtLeast(version),
            ">" => Constraint::Greater(version),
            "<=" => Constraint::AtMost(version),
            "<" => Constraint::Less(version),
            "~=" => Constraint::AtLeast(version),
            // `numpy 1.11` is fuzzy in conda, `numpy==1.11` is exact
            _ if wildcard || spaced => Constraint::Prefix(version),
            _ => Constraint::Exact(version),
        })
    }

    pub fn matches(&self, version: &PackageVersion) -> bool {
        match self {
            Constraint::Exact(v) => version == v,
            Constraint::Prefix(v) => version.has_prefix(v),
            Constraint::NotEqual(v) => version != v,
            Constraint::AtLeast(v) => version >= v,
            Constraint::Greater(v) => version > v,
            Constraint::AtMost(v) => version <= v,
            Constraint::Less(v) => version < v,
            Constraint::Unchecked(_) => true,
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Exact(v) => write!(f, "=={}", v),
            Constraint::Prefix(v) => write!(f, "={}", v),
            Constraint::NotEqual(v) => write!(f, "!={}", v),
            Constraint::AtLeast(v) => write!(f, ">={}", v),
            Constraint::Greater(v) => write!(f, ">{}", v),
            Constraint::AtMost(v) => write!(f, "<={}", v),
            Constraint::Less(v) => write!(f, "<{}", v),
            Constraint::Unchecked(raw) => write!(f, "{}", raw),
        }
    }
}

/// A package name with the conjunction of its version constraints
#[derive(Debug, Clone, PartialEq)]
pub struct PackageSpec {
    pub name: String,
    pub channel: Option<String>,
    pub constraints: Vec<Constraint>,
}

impl PackageSpec {
    /// Parse a conda match spec (`python>=3.8`, `bioconda::mash=2.3`, `python >=3.8,<3.12`)
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let (channel, rest) = match raw.split_once("::") {
            Some((channel, rest)) => (Some(channel.trim().to_string()), rest.trim()),
            None => (None, raw),
        };

        let split_at = rest
            .find(|c: char| matches!(c, '<' | '>' | '=' | '!' | '~' | ' '))
            .unwrap_or(rest.len());
        let name = rest[..split_at].trim().to_ascii_lowercase();
        if name.is_empty() {
            return Err(format!("missing package name in '{}'", raw));
        }

        let spaced = rest[split_at..].starts_with(' ');
        let version_part = normalize_version_part(&rest[split_at..]);
        // `name 1.2 build_0`: the build string is not a version constraint
        let version_part = version_part.split(' ').next().unwrap_or("");
        // `name=1.2=build_0`: same for the compact form
        let version_part = match version_part.strip_prefix('=') {
            Some(after) if !after.starts_with('=') => match after.split_once('=') {
                Some((ver, _build)) => format!("={}", ver),
                None => version_part.to_string(),
            },
            _ => version_part.to_string(),
        };

        let constraints = if version_part.contains('|') {
            vec![Constraint::Unchecked(version_part)]
        } else {
            version_part
                .split(',')
                .filter(|c| !c.trim().is_empty())
                .filter_map(|c| Constraint::parse(c, spaced))
                .collect()
        };

        Ok(Self {
            name,
            channel,
            constraints,
        })
    }

    pub fn matches(&self, version: &PackageVersion) -> bool {
        self.constraints.iter().all(|c| c.matches(version))
    }
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(channel) = &self.channel {
            write!(f, "{}::", channel)?;
        }
        write!(f, "{}", self.name)?;
        let constraints: Vec<String> = self.constraints.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", constraints.join(","))
    }
}

/// Drop whitespace after operators and around commas, so `>= 3.8, <3.12`
/// becomes `>=3.8,<3.12`. A single space is kept before a build string.
fn normalize_version_part(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;
    for c in raw.trim().chars() {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        let after_operator = out.ends_with(['<', '>', '=', '!', '~', ',', '|']);
        if pending_space && !after_operator && !matches!(c, ',' | '|') {
            out.push(' ');
        }
        pending_space = false;
        out.push(c);
    }
    out
}

/// Check whether any version can satisfy every constraint at once
fn check_intersection(constraints: &[&Constraint]) -> Result<(), String> {
    let describe = || {
        constraints
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };

    // An exact pin decides everything
    let exacts: Vec<&PackageVersion> = constraints
        .iter()
        .filter_map(|c| match c {
            Constraint::Exact(v) => Some(v),
            _ => None,
        })
        .collect();
    if let Some(pin) = exacts.first() {
        if constraints.iter().all(|c| c.matches(pin)) {
            return Ok(());
        }
        return Err(format!("no version satisfies {}", describe()));
    }

    let mut lower: Option<(&PackageVersion, bool)> = None;
    let mut upper: Option<(&PackageVersion, bool)> = None;
    let mut prefix: Option<&PackageVersion> = None;

    for constraint in constraints {
        match constraint {
            Constraint::AtLeast(v) | Constraint::Greater(v) => {
                let inclusive = matches!(constraint, Constraint::AtLeast(_));
                let tighter = match lower {
                    None => true,
                    Some((cur, cur_incl)) => v > cur || (v == cur && cur_incl && !inclusive),
                };
                if tighter {
                    lower = Some((v, inclusive));
                }
            }
            Constraint::AtMost(v) | Constraint::Less(v) => {
                let inclusive = matches!(constraint, Constraint::AtMost(_));
                let tighter = match upper {
                    None => true,
                    Some((cur, cur_incl)) => v < cur || (v == cur && cur_incl && !inclusive),
                };
                if tighter {
                    upper = Some((v, inclusive));
                }
            }
            Constraint::Prefix(v) => {
                prefix = match prefix {
                    None => Some(v),
                    Some(cur) if v.has_prefix(cur) => Some(v),
                    Some(cur) if cur.has_prefix(v) => Some(cur),
                    Some(_) => return Err(format!("conflicting pins {}", describe())),
                };
            }
            _ => {}
        }
    }

    if let (Some((lo, lo_incl)), Some((hi, hi_incl))) = (lower, upper) {
        if lo > hi || (lo == hi && !(lo_incl && hi_incl)) {
            return Err(format!("empty version range {}", describe()));
        }
        if lo == hi {
            let excluded = constraints
                .iter()
                .any(|c| matches!(c, Constraint::NotEqual(v) if v == lo));
            if excluded {
                return Err(format!("empty version range {}", describe()));
            }
        }
    }

    if let Some(p) = prefix {
        // The smallest version carrying the prefix is the prefix itself
        if let Some((hi, hi_incl)) = upper {
            if p > hi || (p == hi && !hi_incl) {
                return Err(format!("no version satisfies {}", describe()));
            }
        }
        if let Some((lo, _)) = lower {
            if lo > p && !lo.has_prefix(p) {
                return Err(format!("no version satisfies {}", describe()));
            }
        }
    }

    Ok(())
}
