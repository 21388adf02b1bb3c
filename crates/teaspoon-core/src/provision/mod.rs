//! Release provisioning: fetch, extract, resolve & install, activate
//!
//! This module provides:
//! - Release fetching from remote URLs or local archives
//! - Archive extraction (tar.gz, zip)
//! - Environment descriptor parsing and constraint checks
//! - Installation through a conda-compatible installer
//! - The immutable activated environment record

pub mod activate;
pub mod archive;
pub mod descriptor;
pub mod fetcher;
pub mod installer;
pub mod version;

use crate::config::ProvisionSettings;
use crate::error::{ProvisionError, ProvisionStage};
use crate::product::ReleaseConfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, info_span, warn, Instrument};

pub use activate::{ActivatedEnvironment, Activation};
pub use descriptor::{EnvironmentDescriptor, PackageSpec};
pub use fetcher::{ReleaseFetcher, ReleaseSource};
pub use installer::{InstallRequest, InstalledPackage, Installer, MambaInstaller};

/// Time allowed for the help entry point to answer
const VERIFY_TIMEOUT: Duration = Duration::from_secs(60);

/// Progress callbacks for each provisioning stage
pub trait StageObserver {
    fn stage_started(&mut self, _stage: ProvisionStage) {}
    fn stage_finished(&mut self, _stage: ProvisionStage, _detail: &str) {}
    fn stage_failed(&mut self, _stage: ProvisionStage, _error: &ProvisionError) {}
}

/// Observer that ignores everything
impl StageObserver for () {}

/// How a provisioning run ended
#[derive(Debug, Clone)]
pub struct ProvisionOutcome {
    pub environment: ActivatedEnvironment,
    /// True when a matching record was found and nothing was redone
    pub reused: bool,
}

/// Runs the provisioning stages for one release
pub struct Provisioner<C: ReleaseConfig, I: Installer> {
    config: C,
    settings: ProvisionSettings,
    installer: I,
    fetcher: ReleaseFetcher,
}

impl<C: ReleaseConfig, I: Installer> Provisioner<C, I> {
    pub fn new(config: C, settings: ProvisionSettings, installer: I) -> Self {
        let fetcher = ReleaseFetcher::new(config.user_agent());
        Self {
            config,
            settings,
            installer,
            fetcher,
        }
    }

    fn release_source(&self, version: &str) -> Result<ReleaseSource, ProvisionError> {
        match &self.settings.release_url {
            Some(template) => ReleaseSource::from_template(template, version),
            None => ReleaseSource::from_config(&self.config, version),
        }
    }

    fn descriptor_path(&self, tool_dir: &std::path::Path) -> PathBuf {
        self.settings
            .descriptor
            .clone()
            .unwrap_or_else(|| tool_dir.join(self.config.descriptor_path()))
    }

    /// Return the stored record when it matches this version and descriptor
    fn reusable_record(&self, version: &str) -> Option<ActivatedEnvironment> {
        if self.settings.force {
            return None;
        }
        let record = ActivatedEnvironment::load(&self.settings.install_root)?;
        if record.version != version || !record.tool_dir.is_dir() || !record.prefix.is_dir() {
            return None;
        }
        let descriptor = EnvironmentDescriptor::load(&self.descriptor_path(&record.tool_dir)).ok()?;
        (descriptor.digest == record.descriptor_digest).then_some(record)
    }

    /// Run every stage in order, stopping at the first failure
    pub async fn provision(
        &self,
        observer: &mut dyn StageObserver,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        let version = version::parse_release_version(&self.settings.version)?.to_string();
        let span = info_span!("provision", tool = self.config.name(), version = %version);

        async {
            if let Some(environment) = self.reusable_record(&version) {
                info!("matching environment already provisioned");
                return Ok(ProvisionOutcome {
                    environment,
                    reused: true,
                });
            }

            let result = self.run_stages(&version, observer).await;
            // A failed fetch leaves the previous environment untouched
            if matches!(&result, Err(e) if e.stage() != ProvisionStage::Fetch) {
                if let Err(e) = ActivatedEnvironment::invalidate(&self.settings.install_root) {
                    warn!(error = %e, "failed to clear environment record");
                }
            }
            result.map(|environment| ProvisionOutcome {
                environment,
                reused: false,
            })
        }
        .instrument(span)
        .await
    }

    async fn run_stages(
        &self,
        version: &str,
        observer: &mut dyn StageObserver,
    ) -> Result<ActivatedEnvironment, ProvisionError> {
        let tool_dir = self.settings.tool_dir(&self.config, version);
        let prefix = self.settings.prefix();

        // Fetch
        observer.stage_started(ProvisionStage::Fetch);
        let fetched = match self.release_source(version) {
            Ok(source) => self.fetcher.fetch(&source, version).await,
            Err(e) => Err(e),
        };
        let fetched = report(observer, ProvisionStage::Fetch, fetched, |f| {
            format!("{} bytes", f.size)
        })?;

        // Whatever was activated before is no longer trustworthy
        ActivatedEnvironment::invalidate(&self.settings.install_root)
            .map_err(|e| ProvisionError::installation(ProvisionStage::Extract, e))?;

        // Extract; the temporary archive is removed when `fetched` drops
        observer.stage_started(ProvisionStage::Extract);
        let extracted = archive::extract_archive(&fetched, &tool_dir);
        drop(fetched);
        report(observer, ProvisionStage::Extract, extracted, |dir| {
            dir.display().to_string()
        })?;

        // Resolve & install
        observer.stage_started(ProvisionStage::Install);
        let installed = self.install(&tool_dir, &prefix).await;
        let (packages, digest) = report(observer, ProvisionStage::Install, installed, |(p, _)| {
            format!("{} packages", p.len())
        })?;

        // Activate
        observer.stage_started(ProvisionStage::Activate);
        let activated = self.activate(version, &tool_dir, &prefix, packages, &digest).await;
        report(observer, ProvisionStage::Activate, activated, |env| {
            format!("{} search path entries", env.search_path.len())
        })
    }

    async fn install(
        &self,
        tool_dir: &std::path::Path,
        prefix: &std::path::Path,
    ) -> Result<(Vec<InstalledPackage>, String), ProvisionError> {
        let loaded = EnvironmentDescriptor::load(&self.descriptor_path(tool_dir))?;
        loaded.descriptor.check_consistency()?;

        let channels = self
            .settings
            .effective_channels(&self.config, &loaded.descriptor.channels);
        info!(
            installer = self.installer.name(),
            channels = %channels.join(","),
            descriptor = %loaded.path.display(),
            "installing environment"
        );

        if let Some(parent) = prefix.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ProvisionError::installation(ProvisionStage::Install, e))?;
        }

        let request = InstallRequest {
            prefix,
            descriptor: &loaded.path,
            channels: &channels,
        };
        let packages = self.installer.install(&request).await?;
        Ok((packages, loaded.digest))
    }

    async fn activate(
        &self,
        version: &str,
        tool_dir: &std::path::Path,
        prefix: &std::path::Path,
        packages: Vec<InstalledPackage>,
        digest: &str,
    ) -> Result<ActivatedEnvironment, ProvisionError> {
        let environment = ActivatedEnvironment::activate(Activation {
            version,
            tool_dir,
            prefix,
            locale: &self.settings.locale,
            inherited_path: std::env::var_os("PATH"),
            entry_points: self.config.entry_points(),
            packages,
            descriptor_digest: digest,
        })?;

        std::fs::create_dir_all(&self.settings.data_dir).map_err(|e| {
            ProvisionError::installation(
                ProvisionStage::Activate,
                format!(
                    "failed to create data directory {}: {}",
                    self.settings.data_dir.display(),
                    e
                ),
            )
        })?;

        if !self.settings.skip_verify {
            verify_help(&environment, self.config.help_entry_point()).await?;
        }

        environment.persist(&self.settings.install_root)?;
        Ok(environment)
    }
}

fn report<T>(
    observer: &mut dyn StageObserver,
    stage: ProvisionStage,
    result: Result<T, ProvisionError>,
    detail: impl FnOnce(&T) -> String,
) -> Result<T, ProvisionError> {
    match &result {
        Ok(value) => {
            let detail = detail(value);
            info!(stage = %stage, %detail, "stage complete");
            observer.stage_finished(stage, &detail);
        }
        Err(e) => {
            warn!(stage = %stage, error = %e, "stage failed");
            observer.stage_failed(stage, e);
        }
    }
    result
}

/// Run `<entry point> --help` inside the environment; it must exit 0
pub async fn verify_help(
    environment: &ActivatedEnvironment,
    entry_point: &str,
) -> Result<(), ProvisionError> {
    let mut command = match environment.find_program(entry_point) {
        Some(program) => environment.command(&program.display().to_string())?,
        None => {
            // Not executable: hand the script to the environment's interpreter
            let script = environment.entry_points.get(entry_point).ok_or_else(|| {
                ProvisionError::installation(
                    ProvisionStage::Activate,
                    format!("entry point {} not found", entry_point),
                )
            })?;
            let mut command = environment.command("python3")?;
            command.arg(script);
            command
        }
    };
    command.arg("--help");

    let outcome = installer::run_streaming(command, entry_point, VERIFY_TIMEOUT)
        .await
        .map_err(|e| {
            ProvisionError::installation(
                ProvisionStage::Activate,
                format!("failed to run {} --help: {}", entry_point, e),
            )
        })?;

    if !outcome.status.success() {
        return Err(ProvisionError::installation(
            ProvisionStage::Activate,
            format!(
                "{} --help exited with code {}: {}",
                entry_point,
                outcome.status.code().unwrap_or(-1),
                outcome.stderr.trim()
            ),
        ));
    }
    info!(entry_point, "help entry point answered");
    Ok(())
}
