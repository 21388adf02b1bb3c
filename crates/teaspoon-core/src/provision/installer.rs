//! Package installation through an external conda-compatible installer
//!
//! Resolution and installation are delegated to micromamba (or any binary
//! with the same command line). The installer output is streamed to the
//! log and classified so solver failures surface as resolution errors.

use crate::error::{ProvisionError, ProvisionStage};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Default time allowed for a solve + install
pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Fragments of solver output that mean the constraints cannot be met
const RESOLUTION_MARKERS: &[&str] = &[
    "nothing provides",
    "could not solve",
    "unsatisfiable",
    "packagesnotfounderror",
    "no matching package",
    "encountered problems while solving",
    "cannot install",
    "conflicts with",
];

/// A package present in the provisioned environment
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub channel: String,
}

/// What to install and where
#[derive(Debug, Clone)]
pub struct InstallRequest<'a> {
    pub prefix: &'a Path,
    pub descriptor: &'a Path,
    pub channels: &'a [String],
}

/// Resolves a descriptor against ordered channels and installs the result
pub trait Installer: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Install into `request.prefix` and report the installed package set
    fn install(
        &self,
        request: &InstallRequest<'_>,
    ) -> impl Future<Output = Result<Vec<InstalledPackage>, ProvisionError>> + Send;
}

/// Captured result of a child process
#[derive(Debug)]
pub struct CommandOutcome {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Run a command, streaming its output to the log, with a timeout
pub async fn run_streaming(
    mut command: TokioCommand,
    label: &str,
    limit: Duration,
) -> std::io::Result<CommandOutcome> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = command.spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("failed to capture stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("failed to capture stderr"))?;

    let run = async {
        let (stdout, stderr) = tokio::join!(
            collect_lines(stdout, label, false),
            collect_lines(stderr, label, true)
        );
        let status = child.wait().await?;
        Ok::<_, std::io::Error>(CommandOutcome {
            status,
            stdout: stdout?,
            stderr: stderr?,
        })
    };

    match timeout(limit, run).await {
        Ok(outcome) => outcome,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("{} timed out after {} seconds", label, limit.as_secs()),
        )),
    }
}

async fn collect_lines<R: AsyncRead + Unpin>(
    reader: R,
    label: &str,
    is_stderr: bool,
) -> std::io::Result<String> {
    let mut lines = BufReader::new(reader).lines();
    let mut collected = String::new();
    while let Some(line) = lines.next_line().await? {
        if is_stderr {
            debug!(tool = label, stream = "stderr", "{}", line);
        } else {
            debug!(tool = label, stream = "stdout", "{}", line);
        }
        collected.push_str(&line);
        collected.push('\n');
    }
    Ok(collected)
}

/// True when installer output reports unsatisfiable constraints
pub fn is_resolution_failure(output: &str) -> bool {
    let lowered = output.to_ascii_lowercase();
    RESOLUTION_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// micromamba-compatible installer
#[derive(Debug, Clone)]
pub struct MambaInstaller {
    binary: PathBuf,
    timeout: Duration,
}

impl MambaInstaller {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: INSTALL_TIMEOUT,
        }
    }

    /// Arguments for the solve + install invocation
    pub fn install_args(request: &InstallRequest<'_>, update: bool) -> Vec<String> {
        let mut args = vec![
            if update { "install" } else { "create" }.to_string(),
            "--yes".to_string(),
            "--prefix".to_string(),
            request.prefix.display().to_string(),
            "--file".to_string(),
            request.descriptor.display().to_string(),
            "--channel-priority".to_string(),
            "strict".to_string(),
        ];
        if !request.channels.is_empty() {
            args.push("--override-channels".to_string());
            for channel in request.channels {
                args.push("-c".to_string());
                args.push(channel.clone());
            }
        }
        args
    }

    async fn list_packages(&self, prefix: &Path) -> Result<Vec<InstalledPackage>, ProvisionError> {
        let mut command = TokioCommand::new(&self.binary);
        command
            .arg("list")
            .arg("--prefix")
            .arg(prefix)
            .arg("--json");
        let outcome = run_streaming(command, "installer list", self.timeout)
            .await
            .map_err(|e| ProvisionError::installation(ProvisionStage::Install, e))?;
        if !outcome.status.success() {
            return Err(ProvisionError::installation(
                ProvisionStage::Install,
                format!(
                    "listing packages failed with exit code {}: {}",
                    outcome.status.code().unwrap_or(-1),
                    outcome.stderr.trim()
                ),
            ));
        }
        parse_package_list(&outcome.stdout)
    }
}

impl Installer for MambaInstaller {
    fn name(&self) -> &str {
        "micromamba"
    }

    async fn install(
        &self,
        request: &InstallRequest<'_>,
    ) -> Result<Vec<InstalledPackage>, ProvisionError> {
        let update = request.prefix.join("conda-meta").is_dir();
        let args = Self::install_args(request, update);
        info!(
            installer = %self.binary.display(),
            prefix = %request.prefix.display(),
            update,
            "resolving and installing environment"
        );

        let mut command = TokioCommand::new(&self.binary);
        command.args(&args);
        let outcome = match run_streaming(command, "installer", self.timeout).await {
            Ok(outcome) => outcome,
            Err(e) => {
                discard_prefix(request.prefix, update);
                return Err(ProvisionError::installation(
                    ProvisionStage::Install,
                    format!("failed to run {}: {}", self.binary.display(), e),
                ));
            }
        };

        if !outcome.status.success() {
            discard_prefix(request.prefix, update);
            let combined = format!("{}\n{}", outcome.stdout, outcome.stderr);
            let detail = last_lines(&combined, 12);
            return Err(if is_resolution_failure(&combined) {
                ProvisionError::resolution(detail)
            } else {
                ProvisionError::installation(
                    ProvisionStage::Install,
                    format!(
                        "installer exited with code {}: {}",
                        outcome.status.code().unwrap_or(-1),
                        detail
                    ),
                )
            });
        }

        match self.list_packages(request.prefix).await {
            Ok(packages) => Ok(packages),
            Err(e) => {
                discard_prefix(request.prefix, update);
                Err(e)
            }
        }
    }
}

/// Remove a prefix created by a failed run so nothing half-installed remains
fn discard_prefix(prefix: &Path, existed_before: bool) {
    if existed_before || !prefix.exists() {
        return;
    }
    if let Err(e) = std::fs::remove_dir_all(prefix) {
        warn!(prefix = %prefix.display(), error = %e, "failed to remove partial environment");
    }
}

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

/// Parse `micromamba list --json` output into a sorted package set
pub fn parse_package_list(json: &str) -> Result<Vec<InstalledPackage>, ProvisionError> {
    let mut packages: Vec<InstalledPackage> = serde_json::from_str(json).map_err(|e| {
        ProvisionError::installation(
            ProvisionStage::Install,
            format!("unreadable package list: {}", e),
        )
    })?;
    packages.sort();
    packages.dedup();
    Ok(packages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_args_create() {
        let channels = vec!["conda-forge".to_string(), "bioconda".to_string()];
        let request = InstallRequest {
            prefix: Path::new("/opt/teaspoon/env"),
            descriptor: Path::new("/opt/teaspoon/teaspoon-0.3.0/environment.yml"),
            channels: &channels,
        };
        let args = MambaInstaller::install_args(&request, false);
        assert_eq!(args[0], "create");
        assert!(args.contains(&"--override-channels".to_string()));
        let c_positions: Vec<&String> = args
            .iter()
            .enumerate()
            .filter(|(i, _)| *i > 0 && args[i - 1] == "-c")
            .map(|(_, a)| a)
            .collect();
        assert_eq!(c_positions, vec!["conda-forge", "bioconda"]);
    }

    #[test]
    fn test_install_args_update_without_channels() {
        let request = InstallRequest {
            prefix: Path::new("/env"),
            descriptor: Path::new("/environment.yml"),
            channels: &[],
        };
        let args = MambaInstaller::install_args(&request, true);
        assert_eq!(args[0], "install");
        assert!(!args.contains(&"--override-channels".to_string()));
    }

    #[test]
    fn test_resolution_failure_detection() {
        let stderr = "error    libmamba Could not solve for environment specs\n  \
                      - nothing provides python >=3.99";
        assert!(is_resolution_failure(stderr));
        assert!(!is_resolution_failure("No space left on device"));
    }

    #[test]
    fn test_parse_package_list() {
        let json = r#"[
            {"name": "python", "version": "3.11.6", "channel": "conda-forge", "build_string": "x"},
            {"name": "biopython", "version": "1.81", "channel": "conda-forge"}
        ]"#;
        let packages = parse_package_list(json).unwrap();
        assert_eq!(packages[0].name, "biopython");
        assert_eq!(packages[1].version, "3.11.6");
    }

    #[test]
    fn test_last_lines() {
        assert_eq!(last_lines("a\n\nb\nc\n", 2), "b\nc");
    }
}
