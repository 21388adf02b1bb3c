//! Release configuration trait for provisioned tools
//!
//! This trait defines what the provisioner needs to know about the tool
//! being installed: where its releases live, which descriptor ships inside
//! the archive, and which entry points it exposes.

/// Configuration trait for a provisionable tool release
///
/// Each binary implements this trait to define:
/// - Tool identity (name, display name)
/// - Release URL template
/// - Environment descriptor location and default channels
/// - Entry points exposed on the search path
pub trait ReleaseConfig: Clone + Send + Sync + 'static {
    /// Internal tool name (used for directory names, env vars)
    fn name(&self) -> &'static str;

    /// Human-readable display name
    fn display_name(&self) -> &'static str;

    /// Release archive URL template; `{version}` is substituted.
    /// `None` means the template must come from the override variable or CLI.
    fn default_release_url(&self) -> Option<&'static str>;

    /// Environment variable name for overriding the release URL template
    fn release_url_env(&self) -> &'static str;

    /// Path of the environment descriptor inside the extracted release
    fn descriptor_path(&self) -> &'static str {
        "environment.yml"
    }

    /// Scripts that must be reachable once the environment is activated
    fn entry_points(&self) -> &'static [&'static str];

    /// Entry point whose `--help` is used to verify an installation
    fn help_entry_point(&self) -> &'static str {
        self.entry_points().first().copied().unwrap_or_else(|| self.name())
    }

    /// Package channels in priority order, used when none are configured
    fn default_channels(&self) -> &'static [&'static str];

    /// User agent string for HTTP requests
    fn user_agent(&self) -> &'static str {
        self.name()
    }
}
