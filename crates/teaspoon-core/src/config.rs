//! Environment-driven provisioning settings

use crate::product::ReleaseConfig;
use crate::provision::activate::DEFAULT_LOCALE;
use anyhow::Result;
use std::env;
use std::ffi::OsString;
use std::path::PathBuf;

pub const ENV_INSTALL_ROOT: &str = "TEASPOON_INSTALL_ROOT";
pub const ENV_DATA_DIR: &str = "TEASPOON_DATA_DIR";
pub const ENV_INSTALLER: &str = "TEASPOON_INSTALLER";
pub const ENV_CHANNELS: &str = "TEASPOON_CHANNELS";

pub const DEFAULT_INSTALL_ROOT: &str = "/opt/teaspoon";
const DEFAULT_DATA_DIR: &str = "/data";
const DEFAULT_INSTALLER: &str = "micromamba";

/// Values given on the command line; unset fields keep the lower layer
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub install_root: Option<PathBuf>,
    pub channels: Vec<String>,
    pub descriptor: Option<PathBuf>,
    pub release_url: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub installer: Option<PathBuf>,
    pub force: bool,
    pub skip_verify: bool,
}

/// Everything a provisioning run needs besides the release config
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionSettings {
    /// Release version to provision
    pub version: String,
    /// Channels given explicitly, highest priority first
    pub channels: Vec<String>,
    /// Descriptor to use instead of the one shipped in the release
    pub descriptor: Option<PathBuf>,
    /// Release URL template overriding the product default
    pub release_url: Option<String>,
    /// Directory holding the extracted release, the prefix and the record
    pub install_root: PathBuf,
    /// Working directory for runtime inputs and outputs
    pub data_dir: PathBuf,
    /// Installer binary (micromamba-compatible)
    pub installer: PathBuf,
    /// Locale fixed in the activated environment
    pub locale: String,
    /// Provision again even when a matching record exists
    pub force: bool,
    /// Skip running the help entry point after activation
    pub skip_verify: bool,
}

impl ProvisionSettings {
    /// Settings with built-in defaults only
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            channels: Vec::new(),
            descriptor: None,
            release_url: None,
            install_root: PathBuf::from(DEFAULT_INSTALL_ROOT),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            installer: PathBuf::from(DEFAULT_INSTALLER),
            locale: DEFAULT_LOCALE.to_string(),
            force: false,
            skip_verify: false,
        }
    }

    /// Build settings by reading the documented TEASPOON_* variables
    pub fn from_env(version: impl Into<String>) -> Result<Self> {
        Self::from_lookup(version, |key| env::var_os(key))
    }

    /// Build settings from `lookup`, which returns the value of a variable if set
    pub fn from_lookup<F>(version: impl Into<String>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let mut settings = Self::new(version);

        if let Some(root) = lookup(ENV_INSTALL_ROOT) {
            settings.install_root = PathBuf::from(root);
        }
        if let Some(data) = lookup(ENV_DATA_DIR) {
            settings.data_dir = PathBuf::from(data);
        }
        if let Some(installer) = lookup(ENV_INSTALLER) {
            settings.installer = PathBuf::from(installer);
        }
        if let Some(raw) = lookup(ENV_CHANNELS) {
            let raw = raw
                .into_string()
                .map_err(|_| anyhow::anyhow!("{} is not valid UTF-8", ENV_CHANNELS))?;
            settings.channels = parse_channels(&raw);
        }

        Ok(settings)
    }

    /// Apply command-line values on top of these settings
    pub fn with_overrides(mut self, overrides: SettingsOverrides) -> Self {
        if let Some(root) = overrides.install_root {
            self.install_root = root;
        }
        if !overrides.channels.is_empty() {
            self.channels = overrides.channels;
        }
        if let Some(data_dir) = overrides.data_dir {
            self.data_dir = data_dir;
        }
        if let Some(installer) = overrides.installer {
            self.installer = installer;
        }
        if overrides.descriptor.is_some() {
            self.descriptor = overrides.descriptor;
        }
        if overrides.release_url.is_some() {
            self.release_url = overrides.release_url;
        }
        self.force |= overrides.force;
        self.skip_verify |= overrides.skip_verify;
        self
    }

    /// Directory the release is extracted into
    pub fn tool_dir<C: ReleaseConfig>(&self, config: &C, version: &str) -> PathBuf {
        self.install_root.join(format!("{}-{}", config.name(), version))
    }

    /// Package environment prefix
    pub fn prefix(&self) -> PathBuf {
        self.install_root.join("env")
    }

    /// Channel order: explicit channels, then descriptor channels, then product defaults
    pub fn effective_channels<C: ReleaseConfig>(
        &self,
        config: &C,
        descriptor_channels: &[String],
    ) -> Vec<String> {
        let mut channels: Vec<String> = Vec::new();
        for channel in self.channels.iter().chain(descriptor_channels) {
            if !channels.contains(channel) {
                channels.push(channel.clone());
            }
        }
        if channels.is_empty() {
            channels = config
                .default_channels()
                .iter()
                .map(|c| c.to_string())
                .collect();
        }
        channels
    }
}

/// Split a comma-separated channel list, dropping blanks
pub fn parse_channels(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct TestRelease;

    impl ReleaseConfig for TestRelease {
        fn name(&self) -> &'static str {
            "teaspoon"
        }
        fn display_name(&self) -> &'static str {
            "teaspoon"
        }
        fn default_release_url(&self) -> Option<&'static str> {
            None
        }
        fn release_url_env(&self) -> &'static str {
            "TEASPOON_TEST_RELEASE_URL"
        }
        fn entry_points(&self) -> &'static [&'static str] {
            &["teaspoon.py"]
        }
        fn default_channels(&self) -> &'static [&'static str] {
            &["conda-forge", "bioconda"]
        }
    }

    #[test]
    fn test_parse_channels() {
        assert_eq!(
            parse_channels(" conda-forge, ,bioconda "),
            vec!["conda-forge", "bioconda"]
        );
    }

    #[test]
    fn test_channel_priority() {
        let mut settings = ProvisionSettings::new("0.3.0");
        settings.channels = vec!["bioconda".to_string()];
        let descriptor = vec!["conda-forge".to_string(), "bioconda".to_string()];
        assert_eq!(
            settings.effective_channels(&TestRelease, &descriptor),
            vec!["bioconda", "conda-forge"]
        );
    }

    #[test]
    fn test_default_channels_when_none_given() {
        let settings = ProvisionSettings::new("0.3.0");
        assert_eq!(
            settings.effective_channels(&TestRelease, &[]),
            vec!["conda-forge", "bioconda"]
        );
    }

    #[test]
    fn test_layout() {
        let mut settings = ProvisionSettings::new("0.3.0");
        settings.install_root = PathBuf::from("/opt/x");
        assert_eq!(
            settings.tool_dir(&TestRelease, "0.3.0"),
            PathBuf::from("/opt/x/teaspoon-0.3.0")
        );
        assert_eq!(settings.prefix(), PathBuf::from("/opt/x/env"));
    }

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<OsString> {
        let vars: Vec<(String, OsString)> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(*v)))
            .collect();
        move |key| vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    }

    #[test]
    fn test_defaults_without_variables() {
        let settings = ProvisionSettings::from_lookup("0.3.0", |_| None).unwrap();
        assert_eq!(settings, ProvisionSettings::new("0.3.0"));
        assert_eq!(settings.install_root, PathBuf::from("/opt/teaspoon"));
        assert_eq!(settings.data_dir, PathBuf::from("/data"));
        assert_eq!(settings.installer, PathBuf::from("micromamba"));
        assert!(settings.channels.is_empty());
    }

    #[test]
    fn test_variables_override_defaults() {
        let lookup = lookup_from(&[
            (ENV_INSTALL_ROOT, "/srv/teaspoon"),
            (ENV_DATA_DIR, "/scratch"),
            (ENV_INSTALLER, "/usr/local/bin/micromamba"),
            (ENV_CHANNELS, "bioconda, conda-forge"),
        ]);
        let settings = ProvisionSettings::from_lookup("0.3.0", lookup).unwrap();
        assert_eq!(settings.install_root, PathBuf::from("/srv/teaspoon"));
        assert_eq!(settings.data_dir, PathBuf::from("/scratch"));
        assert_eq!(settings.installer, PathBuf::from("/usr/local/bin/micromamba"));
        assert_eq!(settings.channels, vec!["bioconda", "conda-forge"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_channels_rejected() {
        use std::os::unix::ffi::OsStringExt;
        let lookup = |key: &str| {
            (key == ENV_CHANNELS).then(|| OsString::from_vec(vec![b'b', 0xff, b'c']))
        };
        let err = ProvisionSettings::from_lookup("0.3.0", lookup).unwrap_err();
        assert!(err.to_string().contains(ENV_CHANNELS));
    }

    #[test]
    fn test_flags_override_variables() {
        let lookup = lookup_from(&[
            (ENV_DATA_DIR, "/scratch"),
            (ENV_INSTALLER, "/usr/local/bin/micromamba"),
            (ENV_CHANNELS, "bioconda"),
        ]);
        let settings = ProvisionSettings::from_lookup("0.3.0", lookup)
            .unwrap()
            .with_overrides(SettingsOverrides {
                channels: vec!["conda-forge".to_string()],
                data_dir: Some(PathBuf::from("/work")),
                force: true,
                ..SettingsOverrides::default()
            });
        assert_eq!(settings.channels, vec!["conda-forge"]);
        assert_eq!(settings.data_dir, PathBuf::from("/work"));
        // Unset flags keep the variable layer
        assert_eq!(settings.installer, PathBuf::from("/usr/local/bin/micromamba"));
        assert_eq!(settings.install_root, PathBuf::from("/opt/teaspoon"));
        assert!(settings.force);
        assert!(!settings.skip_verify);
    }
}
