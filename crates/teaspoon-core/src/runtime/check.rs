//! Detection of the external tools teaspoon drives: Python, mash and rasusa

use crate::provision::ActivatedEnvironment;
use anyhow::Result;
use std::fmt;
use std::process::Command;
use tracing::warn;

/// External tools required at run time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    Python,
    Mash,
    Rasusa,
}

impl Tool {
    pub const ALL: [Tool; 3] = [Tool::Python, Tool::Mash, Tool::Rasusa];

    pub fn display_name(&self) -> &'static str {
        match self {
            Tool::Python => "Python 3",
            Tool::Mash => "mash",
            Tool::Rasusa => "rasusa",
        }
    }

    /// Executable name looked up on the search path
    pub fn binary(&self) -> &'static str {
        match self {
            Tool::Python => "python3",
            Tool::Mash => "mash",
            Tool::Rasusa => "rasusa",
        }
    }

    fn install_hint(&self) -> &'static str {
        match self {
            Tool::Python => "Python 3 (conda-forge::python)",
            Tool::Mash => "mash (bioconda::mash)",
            Tool::Rasusa => "rasusa (bioconda::rasusa)",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Tool detection result
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub name: &'static str,
    pub version: Option<String>,
    pub available: bool,
}

/// Check one tool, using the activated environment's search path when given
pub fn check_tool(tool: Tool, environment: Option<&ActivatedEnvironment>) -> RuntimeInfo {
    let mut command = match environment {
        Some(env) => {
            let vars = match env.env_vars() {
                Ok(vars) => vars,
                Err(e) => {
                    warn!(tool = tool.binary(), error = %e, "cannot apply the environment");
                    return RuntimeInfo {
                        name: tool.display_name(),
                        version: None,
                        available: false,
                    };
                }
            };
            let program = env
                .find_program(tool.binary())
                .unwrap_or_else(|| tool.binary().into());
            let mut command = Command::new(program);
            command.envs(vars);
            command
        }
        None => Command::new(tool.binary()),
    };

    match command.arg("--version").output() {
        Ok(out) if out.status.success() => {
            // Some tools print their version on stderr
            let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
            let version = if stdout.is_empty() {
                String::from_utf8_lossy(&out.stderr).trim().to_string()
            } else {
                stdout
            };
            RuntimeInfo {
                name: tool.display_name(),
                version: Some(version),
                available: true,
            }
        }
        _ => RuntimeInfo {
            name: tool.display_name(),
            version: None,
            available: false,
        },
    }
}

/// Check every tool; fails listing all missing tools
pub fn check_tools(
    tools: &[Tool],
    environment: Option<&ActivatedEnvironment>,
) -> Result<Vec<RuntimeInfo>> {
    let mut results = Vec::new();
    let mut missing = Vec::new();

    for tool in tools {
        let info = check_tool(*tool, environment);
        if !info.available {
            missing.push(tool.install_hint());
        }
        results.push(info);
    }

    if !missing.is_empty() {
        anyhow::bail!(
            "Missing required tools:\n{}",
            missing
                .iter()
                .map(|m| format!("  - {}", m))
                .collect::<Vec<_>>()
                .join("\n")
        );
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names() {
        assert_eq!(Tool::Python.to_string(), "Python 3");
        assert_eq!(Tool::Rasusa.binary(), "rasusa");
    }

    #[cfg(unix)]
    #[test]
    fn test_check_tool_on_activated_path() {
        use crate::provision::{Activation, ActivatedEnvironment};
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let tool_dir = dir.path().join("tool");
        let bin = dir.path().join("env/bin");
        std::fs::create_dir_all(&tool_dir).unwrap();
        std::fs::create_dir_all(&bin).unwrap();
        let mash = bin.join("mash");
        std::fs::write(&mash, "#!/bin/sh\necho 2.3\n").unwrap();
        std::fs::set_permissions(&mash, std::fs::Permissions::from_mode(0o755)).unwrap();

        let env = ActivatedEnvironment::activate(Activation {
            version: "0.3.0",
            tool_dir: &tool_dir,
            prefix: &dir.path().join("env"),
            locale: "C.UTF-8",
            inherited_path: Some("/usr/bin:/bin".into()),
            entry_points: &[],
            packages: Vec::new(),
            descriptor_digest: "",
        })
        .unwrap();

        let info = check_tool(Tool::Mash, Some(&env));
        assert!(info.available);
        assert_eq!(info.version.as_deref(), Some("2.3"));
    }

    #[test]
    fn test_missing_tools_listed() {
        let dir = tempfile::tempdir().unwrap();
        let env = ActivatedEnvironment::activate(crate::provision::Activation {
            version: "0.3.0",
            tool_dir: dir.path(),
            prefix: &dir.path().join("env"),
            locale: "C.UTF-8",
            inherited_path: None,
            entry_points: &[],
            packages: Vec::new(),
            descriptor_digest: "",
        })
        .unwrap();

        // The search path holds only empty temp dirs
        let err = check_tools(&[Tool::Rasusa], Some(&env)).unwrap_err();
        assert!(err.to_string().contains("bioconda::rasusa"));
    }

    #[cfg(unix)]
    #[test]
    fn test_unjoinable_search_path_marks_tool_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = ActivatedEnvironment::activate(crate::provision::Activation {
            version: "0.3.0",
            tool_dir: dir.path(),
            prefix: &dir.path().join("env"),
            locale: "C.UTF-8",
            inherited_path: Some("/usr/bin:/bin".into()),
            entry_points: &[],
            packages: Vec::new(),
            descriptor_digest: "",
        })
        .unwrap();
        env.search_path.push("/opt/odd:dir".into());

        let info = check_tool(Tool::Python, Some(&env));
        assert!(!info.available);
        assert!(info.version.is_none());
    }
}
