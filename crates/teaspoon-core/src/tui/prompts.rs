//! Interactive provisioning flow

use crate::config::ProvisionSettings;
use crate::error::{ProvisionError, ProvisionStage};
use crate::product::ReleaseConfig;
use crate::provision::activate::ACTIVATE_SCRIPT;
use crate::provision::{ActivatedEnvironment, Installer, Provisioner, StageObserver};
use crate::runtime::check::{self, Tool};
use anyhow::Result;

/// Arguments for the provision command
#[derive(Debug, Clone)]
pub struct ProvisionArgs {
    pub settings: ProvisionSettings,

    /// Auto-confirm all prompts (non-interactive mode)
    pub yes: bool,
}

/// Spinner per stage, numbered in run order
struct SpinnerObserver {
    spinner: Option<cliclack::ProgressBar>,
}

impl SpinnerObserver {
    fn new() -> Self {
        Self { spinner: None }
    }

    fn position(stage: ProvisionStage) -> usize {
        ProvisionStage::ALL
            .iter()
            .position(|s| *s == stage)
            .map_or(0, |i| i + 1)
    }

    fn label(stage: ProvisionStage) -> String {
        format!(
            "[{}/{}] {}",
            Self::position(stage),
            ProvisionStage::ALL.len(),
            stage.display_name()
        )
    }
}

impl StageObserver for SpinnerObserver {
    fn stage_started(&mut self, stage: ProvisionStage) {
        let spinner = cliclack::spinner();
        spinner.start(format!("{}...", Self::label(stage)));
        self.spinner = Some(spinner);
    }

    fn stage_finished(&mut self, stage: ProvisionStage, detail: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.stop(format!("{}: {}", Self::label(stage), detail));
        }
    }

    fn stage_failed(&mut self, stage: ProvisionStage, _error: &ProvisionError) {
        if let Some(spinner) = self.spinner.take() {
            spinner.stop(format!("{} failed", Self::label(stage)));
        }
    }
}

/// Provision a release with progress output and prompts
pub async fn run_provision<C: ReleaseConfig, I: Installer>(
    config: &C,
    installer: I,
    args: ProvisionArgs,
) -> Result<ActivatedEnvironment> {
    cliclack::intro(format!("{} provision {}", config.display_name(), args.settings.version))?;

    confirm_replacement(&args)?;

    let install_root = args.settings.install_root.clone();
    let provisioner = Provisioner::new(config.clone(), args.settings, installer);
    let mut observer = SpinnerObserver::new();

    let outcome = match provisioner.provision(&mut observer).await {
        Ok(outcome) => outcome,
        Err(e) => {
            cliclack::log::error(format!("{}", e))?;
            cliclack::outro_cancel(format!("Provisioning stopped at {}", e.stage()))?;
            return Err(e.into());
        }
    };

    let environment = outcome.environment;
    if outcome.reused {
        cliclack::log::info(format!(
            "{} {} is already provisioned (use --force to redo)",
            config.display_name(),
            environment.version
        ))?;
    } else {
        cliclack::log::success(format!(
            "Installed {} packages into {}",
            environment.packages.len(),
            environment.prefix.display()
        ))?;
    }

    println!();
    println!("  Next steps");
    println!();
    let steps = [
        format!("source {}", install_root.join(ACTIVATE_SCRIPT).display()),
        format!("{} check", config.name()),
    ];
    for (i, step) in steps.iter().enumerate() {
        println!("  {}.  {}", i + 1, step);
    }

    cliclack::outro("Environment ready")?;
    Ok(environment)
}

/// Ask before replacing an environment provisioned for another version
fn confirm_replacement(args: &ProvisionArgs) -> Result<()> {
    let Some(existing) = ActivatedEnvironment::load(&args.settings.install_root) else {
        return Ok(());
    };
    let requested = args.settings.version.trim_start_matches('v');
    if existing.version == requested {
        return Ok(());
    }

    cliclack::log::warning(format!(
        "Version {} is currently provisioned in {}",
        existing.version,
        args.settings.install_root.display()
    ))?;

    let confirm = if args.yes {
        true
    } else {
        cliclack::confirm(format!("Replace it with {}?", requested))
            .initial_value(true)
            .interact()?
    };

    if !confirm {
        anyhow::bail!("Provisioning cancelled.");
    }
    Ok(())
}

/// Check the runtime tools, inside the stored environment when there is one
pub fn run_check(environment: Option<&ActivatedEnvironment>) -> Result<()> {
    let spinner = cliclack::spinner();
    spinner.start("Checking tools...");

    match check::check_tools(&Tool::ALL, environment) {
        Ok(tools) => {
            let info: Vec<String> = tools
                .iter()
                .map(|t| format!("{} ({})", t.name, t.version.as_deref().unwrap_or("unknown")))
                .collect();
            spinner.stop(format!("Detected tools: {}", info.join(", ")));
            Ok(())
        }
        Err(e) => {
            spinner.stop("Missing tools");
            cliclack::log::error(format!("{}", e))?;
            anyhow::bail!("Provision the environment or install the missing tools and try again.");
        }
    }
}
