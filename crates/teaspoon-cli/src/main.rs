//! teaspoon CLI - Provision teaspoon releases and downsample paired-end reads

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use teaspoon_core::config::{SettingsOverrides, DEFAULT_INSTALL_ROOT, ENV_INSTALL_ROOT};
use teaspoon_core::downsample::{
    self, BatchRequest, NameType, SubsampleOutcome, SubsampleRequest, Subsampler,
};
use teaspoon_core::tui::{self, ProvisionArgs};
use teaspoon_core::{ActivatedEnvironment, MambaInstaller, ProvisionSettings, ReleaseConfig};
use tracing_subscriber::EnvFilter;

/// teaspoon release configuration
#[derive(Clone)]
pub struct TeaspoonRelease;

impl ReleaseConfig for TeaspoonRelease {
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
        "TEASPOON_RELEASE_URL"
    }

    fn entry_points(&self) -> &'static [&'static str] {
        &["teaspoon.py", "tablespoon.py"]
    }

    fn default_channels(&self) -> &'static [&'static str] {
        &["conda-forge", "bioconda"]
    }

    fn user_agent(&self) -> &'static str {
        concat!("teaspoon-provision/", env!("CARGO_PKG_VERSION"))
    }
}

#[derive(Parser, Debug)]
#[command(name = "teaspoon")]
#[command(about = "Provision teaspoon releases and downsample paired-end reads")]
#[command(version)]
pub struct Args {
    /// Directory holding provisioned releases and the environment record
    #[arg(long, global = true, env = ENV_INSTALL_ROOT, default_value = DEFAULT_INSTALL_ROOT)]
    pub install_root: PathBuf,

    /// Increase log verbosity (-v info, -vv debug); RUST_LOG takes precedence
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch, extract, install and activate a release
    Provision(ProvisionCliArgs),
    /// Downsample one read pair to an approximate coverage
    Subsample(SubsampleCliArgs),
    /// Downsample every read pair in a directory
    Batch(BatchCliArgs),
    /// Check that Python, mash and rasusa are available
    Check,
    /// Print the provisioned environment
    Env(EnvCliArgs),
}

#[derive(ClapArgs, Debug)]
pub struct ProvisionCliArgs {
    /// Release version to provision (e.g. 0.3.0)
    pub version: String,

    /// Package channels, highest priority first (comma-separated)
    #[arg(short, long = "channel", value_delimiter = ',')]
    pub channels: Vec<String>,

    /// Environment descriptor to use instead of the one in the release
    #[arg(long)]
    pub descriptor: Option<PathBuf>,

    /// Release URL template; `{version}` is substituted
    #[arg(long = "release-url")]
    pub release_url: Option<String>,

    /// Working directory created for runtime data
    #[arg(long = "data-dir")]
    pub data_dir: Option<PathBuf>,

    /// micromamba-compatible installer binary
    #[arg(long)]
    pub installer: Option<PathBuf>,

    /// Provision again even if this version is already active
    #[arg(long)]
    pub force: bool,

    /// Skip the `--help` check after activation
    #[arg(long = "skip-verify")]
    pub skip_verify: bool,

    /// Auto-confirm all prompts (non-interactive mode)
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(ClapArgs, Debug)]
pub struct SubsampleCliArgs {
    /// Desired coverage for subsampling
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
    pub coverage: u32,

    /// Downsampled file name format: prepend, insert, extend
    #[arg(short, long = "name-type", alias = "name_type", default_value = "prepend")]
    pub name_type: NameType,

    /// Path to the first read file
    #[arg(short = '1', long, alias = "r1")]
    pub read1: PathBuf,

    /// Path to the second read file
    #[arg(short = '2', long, alias = "r2")]
    pub read2: PathBuf,

    /// Directory to save the downsampled files
    #[arg(short, long = "output-dir", alias = "output_dir", default_value = ".")]
    pub output_dir: PathBuf,
}

#[derive(ClapArgs, Debug)]
pub struct BatchCliArgs {
    /// Desired approximate coverage for subsampling
    #[arg(short, long, default_value_t = 100, value_parser = clap::value_parser!(u32).range(1..))]
    pub coverage: u32,

    /// Downsampled file name format: prepend, insert, extend
    #[arg(short, long = "name-type", alias = "name_type", default_value = "prepend")]
    pub name_type: NameType,

    /// Directory containing the input fastq files
    #[arg(short, long = "input-dir", alias = "input_dir")]
    pub input_dir: PathBuf,

    /// Exclude fastq files that start with this string
    #[arg(short, long)]
    pub exclude: Option<String>,

    /// Output path for downsampled fastq files
    #[arg(short, long = "output-dir", alias = "output_dir", default_value = ".")]
    pub output_dir: PathBuf,

    /// Number of read pairs downsampled at once
    #[arg(short, long, default_value_t = downsample::batch::DEFAULT_THREADS)]
    pub threads: usize,
}

#[derive(ClapArgs, Debug)]
pub struct EnvCliArgs {
    /// Print a shell script to `source` instead of a summary
    #[arg(long)]
    pub script: bool,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Ensure terminal cursor is restored on panic
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let _ = console::Term::stderr().show_cursor();
        default_panic(info);
    }));

    // Handle Ctrl+C gracefully
    ctrlc::set_handler(move || {
        let _ = console::Term::stderr().show_cursor();
        std::process::exit(130);
    })
    .ok();

    let args = Args::parse();
    init_logging(args.verbose);
    let config = TeaspoonRelease;

    let result = match args.command {
        Command::Provision(provision_args) => {
            provision(&config, &args.install_root, provision_args).await
        }
        Command::Subsample(subsample_args) => subsample(&args.install_root, subsample_args).await,
        Command::Batch(batch_args) => batch(&args.install_root, batch_args).await,
        Command::Check => {
            let environment = stored_environment(&args.install_root);
            tui::run_check(environment.as_ref())
        }
        Command::Env(env_args) => print_environment(&args.install_root, &env_args),
    };

    // Ensure cursor is visible on normal exit
    let _ = console::Term::stderr().show_cursor();

    result
}

async fn provision(
    config: &TeaspoonRelease,
    install_root: &Path,
    args: ProvisionCliArgs,
) -> Result<()> {
    // Flags override TEASPOON_* variables, which override defaults
    let settings = ProvisionSettings::from_env(args.version)?.with_overrides(SettingsOverrides {
        install_root: Some(install_root.to_path_buf()),
        channels: args.channels,
        descriptor: args.descriptor,
        release_url: args.release_url,
        data_dir: args.data_dir,
        installer: args.installer,
        force: args.force,
        skip_verify: args.skip_verify,
    });

    let installer = MambaInstaller::new(settings.installer.clone());
    tui::run_provision(
        config,
        installer,
        ProvisionArgs {
            settings,
            yes: args.yes,
        },
    )
    .await?;
    Ok(())
}

/// The stored record, if a release has been provisioned under `install_root`
fn stored_environment(install_root: &Path) -> Option<ActivatedEnvironment> {
    let environment = ActivatedEnvironment::load(install_root);
    if environment.is_none() {
        tracing::info!(
            install_root = %install_root.display(),
            "no provisioned environment, using the inherited PATH"
        );
    }
    environment
}

async fn subsample(install_root: &Path, args: SubsampleCliArgs) -> Result<()> {
    let subsampler = Subsampler::new(stored_environment(install_root));
    let request = SubsampleRequest {
        coverage: args.coverage,
        name_type: args.name_type,
        read1: args.read1,
        read2: args.read2,
        output_dir: args.output_dir,
    };

    let outcome = subsampler
        .subsample(&request)
        .await
        .with_context(|| format!("Failed to downsample {}", request.read1.display()))?;
    print_outcome(&outcome);
    Ok(())
}

async fn batch(install_root: &Path, args: BatchCliArgs) -> Result<()> {
    let subsampler = Subsampler::new(stored_environment(install_root));
    let request = BatchRequest {
        coverage: args.coverage,
        name_type: args.name_type,
        input_dir: args.input_dir,
        exclude: args.exclude,
        output_dir: args.output_dir,
        threads: args.threads,
    };

    let report = downsample::downsample_directory(&subsampler, &request).await?;
    for (_, outcome) in &report.succeeded {
        print_outcome(outcome);
    }
    for (pair, reason) in &report.failed {
        eprintln!(
            "{} {} and {}: {}",
            "failed".red().bold(),
            pair.read1.display(),
            pair.read2.display(),
            reason
        );
    }

    println!(
        "\n{} {} pairs, {} failed",
        "Downsampled".green().bold(),
        report.succeeded.len(),
        report.failed.len() + report.aborted
    );
    if !report.is_success() {
        anyhow::bail!(
            "{} of {} read pairs failed",
            report.failed.len() + report.aborted,
            report.succeeded.len() + report.failed.len() + report.aborted
        );
    }
    Ok(())
}

fn print_outcome(outcome: &SubsampleOutcome) {
    let (out1, out2) = outcome.outputs();
    match outcome {
        SubsampleOutcome::Copied { .. } => println!(
            "{} {} and {} (input too small to downsample)",
            "Copied".yellow().bold(),
            out1.display(),
            out2.display()
        ),
        SubsampleOutcome::Downsampled { estimate, .. } => println!(
            "{} {} and {} (genome size {}, estimated coverage {}x)",
            "Wrote".green().bold(),
            out1.display(),
            out2.display(),
            estimate.genome_size,
            estimate.coverage
        ),
    }
}

fn print_environment(install_root: &Path, args: &EnvCliArgs) -> Result<()> {
    let environment = ActivatedEnvironment::load(install_root).with_context(|| {
        format!(
            "No environment provisioned in {}. Run `teaspoon provision <version>` first.",
            install_root.display()
        )
    })?;

    if args.script {
        print!("{}", environment.activate_script());
        return Ok(());
    }

    println!("{} {}", "teaspoon".bold(), environment.version);
    println!("  {:<10} {}", "tool", environment.tool_dir.display());
    println!("  {:<10} {}", "prefix", environment.prefix.display());
    println!("  {:<10} {}", "locale", environment.locale);
    println!("  {:<10} {}", "PATH", environment.path_var()?.to_string_lossy());
    println!("  {:<10} {}", "packages", environment.packages.len());
    for package in &environment.packages {
        println!(
            "    {} {} {}",
            package.name,
            package.version.dimmed(),
            package.channel.dimmed()
        );
    }
    Ok(())
}
