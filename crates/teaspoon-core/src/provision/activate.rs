//! The activated environment record
//!
//! Activation never touches the process environment. It produces an
//! immutable record of the search path and locale that downstream tool
//! invocations apply explicitly.

use super::installer::InstalledPackage;
use crate::error::{ProvisionError, ProvisionStage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command as TokioCommand;
use walkdir::WalkDir;

/// Locale fixed for deterministic text processing
pub const DEFAULT_LOCALE: &str = "C.UTF-8";

/// File name of the persisted record inside the install root
pub const RECORD_FILE: &str = "environment.json";

/// File name of the sourceable shell script inside the install root
pub const ACTIVATE_SCRIPT: &str = "activate.sh";

/// Result of a successful provisioning run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivatedEnvironment {
    /// Release version that was provisioned
    pub version: String,
    /// Extracted release directory
    pub tool_dir: PathBuf,
    /// Package environment prefix
    pub prefix: PathBuf,
    /// Executable search path, highest priority first
    pub search_path: Vec<PathBuf>,
    /// Value for LANG and LC_ALL
    pub locale: String,
    /// Installed package set, sorted
    pub packages: Vec<InstalledPackage>,
    /// Tool scripts found in the release, by file name
    pub entry_points: BTreeMap<String, PathBuf>,
    /// sha256 of the environment descriptor used
    pub descriptor_digest: String,
}

/// Inputs to activation
#[derive(Debug, Clone)]
pub struct Activation<'a> {
    pub version: &'a str,
    pub tool_dir: &'a Path,
    pub prefix: &'a Path,
    pub locale: &'a str,
    pub inherited_path: Option<OsString>,
    pub entry_points: &'a [&'a str],
    pub packages: Vec<InstalledPackage>,
    pub descriptor_digest: &'a str,
}

impl ActivatedEnvironment {
    /// Build the record: tool dir, then prefix/bin, then the inherited PATH entries
    ///
    /// The release and its packages come first so a tool of the same name
    /// elsewhere on the inherited PATH never shadows the pinned one.
    pub fn activate(activation: Activation<'_>) -> Result<Self, ProvisionError> {
        let bin_dir = activation.prefix.join("bin");
        let mut search_path = vec![activation.tool_dir.to_path_buf(), bin_dir];
        if let Some(inherited) = &activation.inherited_path {
            for entry in std::env::split_paths(inherited) {
                if !entry.as_os_str().is_empty() && !search_path.contains(&entry) {
                    search_path.push(entry);
                }
            }
        }

        let entry_points = find_entry_points(activation.tool_dir, activation.entry_points);
        let missing: Vec<&str> = activation
            .entry_points
            .iter()
            .filter(|name| !entry_points.contains_key(**name))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(ProvisionError::installation(
                ProvisionStage::Activate,
                format!(
                    "entry points not found in {}: {}",
                    activation.tool_dir.display(),
                    missing.join(", ")
                ),
            ));
        }

        Ok(Self {
            version: activation.version.to_string(),
            tool_dir: activation.tool_dir.to_path_buf(),
            prefix: activation.prefix.to_path_buf(),
            search_path,
            locale: activation.locale.to_string(),
            packages: activation.packages,
            entry_points,
            descriptor_digest: activation.descriptor_digest.to_string(),
        })
    }

    /// PATH value for child processes
    pub fn path_var(&self) -> Result<OsString, ProvisionError> {
        std::env::join_paths(&self.search_path).map_err(|e| {
            let message = format!("invalid PATH entry: {}", e);
            ProvisionError::installation(ProvisionStage::Activate, message)
        })
    }

    /// Environment variables a child process must see
    pub fn env_vars(&self) -> Result<Vec<(String, OsString)>, ProvisionError> {
        Ok(vec![
            ("PATH".to_string(), self.path_var()?),
            ("LANG".to_string(), OsString::from(&self.locale)),
            ("LC_ALL".to_string(), OsString::from(&self.locale)),
        ])
    }

    /// A command configured with this environment, resolving `program` on the search path
    pub fn command(&self, program: &str) -> Result<TokioCommand, ProvisionError> {
        let vars = self.env_vars()?;
        let resolved = self
            .find_program(program)
            .unwrap_or_else(|| PathBuf::from(program));
        let mut command = TokioCommand::new(resolved);
        command.envs(vars);
        Ok(command)
    }

    /// First executable named `program` on the search path
    pub fn find_program(&self, program: &str) -> Option<PathBuf> {
        if program.contains(std::path::MAIN_SEPARATOR) {
            return Some(PathBuf::from(program));
        }
        self.search_path
            .iter()
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
    }

    pub fn has_package(&self, name: &str) -> bool {
        self.packages.iter().any(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Shell script that reproduces this environment when sourced
    pub fn activate_script(&self) -> String {
        let path = self
            .search_path
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        let locale = shell_quote(&self.locale);
        format!(
            "# teaspoon {}\nexport PATH={}\nexport LANG={locale}\nexport LC_ALL={locale}\n",
            self.version,
            shell_quote(&path),
        )
    }

    /// Write `environment.json` and `activate.sh` into `root`
    pub fn persist(&self, root: &Path) -> Result<(), ProvisionError> {
        let fail = |e: String| ProvisionError::installation(ProvisionStage::Activate, e);
        let json = serde_json::to_string_pretty(self).map_err(|e| fail(e.to_string()))?;
        std::fs::write(root.join(RECORD_FILE), json).map_err(|e| fail(e.to_string()))?;
        std::fs::write(root.join(ACTIVATE_SCRIPT), self.activate_script())
            .map_err(|e| fail(e.to_string()))?;
        Ok(())
    }

    /// Load a previously persisted record, if any
    pub fn load(root: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(root.join(RECORD_FILE)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Remove a persisted record so a failed run leaves nothing activated
    pub fn invalidate(root: &Path) -> std::io::Result<()> {
        for name in [RECORD_FILE, ACTIVATE_SCRIPT] {
            match std::fs::remove_file(root.join(name)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Locate each named entry point under `tool_dir`, preferring the shallowest match
fn find_entry_points(tool_dir: &Path, names: &[&str]) -> BTreeMap<String, PathBuf> {
    let mut found = BTreeMap::new();
    for entry in WalkDir::new(tool_dir)
        .max_depth(3)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy();
        if names.contains(&&*file_name) {
            let current_depth = found
                .get(&*file_name)
                .and_then(|p: &PathBuf| p.strip_prefix(tool_dir).ok())
                .map(|p| p.components().count());
            if current_depth.map_or(true, |depth| entry.depth() < depth) {
                found.insert(file_name.to_string(), entry.path().to_path_buf());
            }
        }
    }
    found
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(dir: &Path) -> ActivatedEnvironment {
        let tool_dir = dir.join("teaspoon-0.3.0");
        std::fs::create_dir_all(tool_dir.join("scripts")).unwrap();
        std::fs::write(tool_dir.join("teaspoon.py"), "").unwrap();
        std::fs::write(tool_dir.join("scripts/tablespoon.py"), "").unwrap();

        ActivatedEnvironment::activate(Activation {
            version: "0.3.0",
            tool_dir: &tool_dir,
            prefix: &dir.join("env"),
            locale: DEFAULT_LOCALE,
            inherited_path: Some(OsString::from("/usr/local/bin:/usr/bin")),
            entry_points: &["teaspoon.py", "tablespoon.py"],
            packages: vec![InstalledPackage {
                name: "python".to_string(),
                version: "3.11.6".to_string(),
                channel: "conda-forge".to_string(),
            }],
            descriptor_digest: "abc",
        })
        .unwrap()
    }

    #[test]
    fn test_search_path_order() {
        let dir = tempfile::tempdir().unwrap();
        let env = sample(dir.path());
        assert_eq!(env.search_path[0], dir.path().join("teaspoon-0.3.0"));
        assert_eq!(env.search_path[1], dir.path().join("env/bin"));
        assert_eq!(env.search_path[2], PathBuf::from("/usr/local/bin"));
        assert_eq!(env.search_path.len(), 4);
    }

    #[test]
    fn test_entry_points_found() {
        let dir = tempfile::tempdir().unwrap();
        let env = sample(dir.path());
        assert_eq!(
            env.entry_points["tablespoon.py"],
            dir.path().join("teaspoon-0.3.0/scripts/tablespoon.py")
        );
        assert!(env.has_package("Python"));
    }

    #[test]
    fn test_missing_entry_point_fails_activation() {
        let dir = tempfile::tempdir().unwrap();
        let err = ActivatedEnvironment::activate(Activation {
            version: "0.3.0",
            tool_dir: dir.path(),
            prefix: &dir.path().join("env"),
            locale: DEFAULT_LOCALE,
            inherited_path: None,
            entry_points: &["teaspoon.py"],
            packages: Vec::new(),
            descriptor_digest: "abc",
        })
        .unwrap_err();
        assert_eq!(err.stage(), ProvisionStage::Activate);
    }

    #[test]
    fn test_env_vars_fix_locale() {
        let dir = tempfile::tempdir().unwrap();
        let env = sample(dir.path());
        let vars = env.env_vars().unwrap();
        assert!(vars.contains(&("LC_ALL".to_string(), OsString::from("C.UTF-8"))));
        assert!(vars.contains(&("LANG".to_string(), OsString::from("C.UTF-8"))));
    }

    #[test]
    fn test_persist_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let env = sample(dir.path());
        env.persist(dir.path()).unwrap();

        assert_eq!(ActivatedEnvironment::load(dir.path()), Some(env));
        let script = std::fs::read_to_string(dir.path().join(ACTIVATE_SCRIPT)).unwrap();
        assert!(script.contains("export LC_ALL='C.UTF-8'"));

        ActivatedEnvironment::invalidate(dir.path()).unwrap();
        assert!(ActivatedEnvironment::load(dir.path()).is_none());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("a'b"), "'a'\\''b'");
    }

    #[cfg(unix)]
    fn write_tool(dir: &Path, name: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn test_pinned_tool_shadows_inherited_one() {
        let dir = tempfile::tempdir().unwrap();
        let system_bin = dir.path().join("system/bin");
        let system_mash = write_tool(&system_bin, "mash");
        let rasusa = write_tool(&system_bin, "rasusa");
        let pinned_mash = write_tool(&dir.path().join("env/bin"), "mash");

        let tool_dir = dir.path().join("teaspoon-0.3.0");
        std::fs::create_dir_all(&tool_dir).unwrap();
        std::fs::write(tool_dir.join("teaspoon.py"), "").unwrap();
        let env = ActivatedEnvironment::activate(Activation {
            version: "0.3.0",
            tool_dir: &tool_dir,
            prefix: &dir.path().join("env"),
            locale: DEFAULT_LOCALE,
            inherited_path: Some(system_bin.clone().into_os_string()),
            entry_points: &["teaspoon.py"],
            packages: Vec::new(),
            descriptor_digest: "abc",
        })
        .unwrap();

        assert_eq!(env.find_program("mash"), Some(pinned_mash));
        assert_ne!(env.find_program("mash"), Some(system_mash));
        // Tools missing from the prefix still come from the inherited PATH
        assert_eq!(env.find_program("rasusa"), Some(rasusa));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_rejects_unjoinable_search_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = sample(dir.path());
        env.search_path.push(PathBuf::from("/opt/odd:dir"));

        let err = env.command("mash").unwrap_err();
        assert_eq!(err.stage(), ProvisionStage::Activate);
        assert!(err.to_string().contains("invalid PATH entry"));
    }
}
