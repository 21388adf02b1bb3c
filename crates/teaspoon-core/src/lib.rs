//! Teaspoon Core - provisioning and downsampling for the teaspoon read tools
//!
//! This library installs a released teaspoon version into a self-contained
//! environment and drives the downsampling pipeline inside it.
//!
//! # Architecture
//!
//! The library is organized into layers:
//!
//! - **Layer 1: Core Operations** - Release fetching, archive extraction, descriptor
//!   checks, installer delegation, tool detection and read downsampling
//! - **Layer 2: Workflow Orchestration** - `ReleaseConfig` trait and `Provisioner`
//!   running the fetch, extract, install and activate stages in order
//! - **Layer 3: CLI/TUI Interface** - Optional cliclack-based progress (feature-gated)
//!
//! Provisioning never mutates the process environment. Its result is an
//! [`ActivatedEnvironment`] record that child processes are configured from.
//!
//! # Feature Flags
//!
//! - `tui` (default): Enables the cliclack-based progress and prompts module
//!
//! # Example Usage (without TUI)
//!
//! ```ignore
//! use teaspoon_core::{MambaInstaller, ProvisionSettings, Provisioner};
//!
//! let settings = ProvisionSettings::from_env("0.3.0")?;
//! let installer = MambaInstaller::new(&settings.installer);
//! let provisioner = Provisioner::new(MyRelease, settings, installer);
//! let outcome = provisioner.provision(&mut ()).await?;
//! println!("PATH={}", outcome.environment.path_var()?.to_string_lossy());
//! ```

pub mod config;
pub mod downsample;
pub mod error;
pub mod product;
pub mod provision;
pub mod runtime;

#[cfg(feature = "tui")]
pub mod tui;

// Re-export main types for convenience
pub use config::ProvisionSettings;
pub use error::{DownsampleError, ProvisionError, ProvisionStage};
pub use product::ReleaseConfig;
pub use provision::{
    ActivatedEnvironment, InstalledPackage, Installer, MambaInstaller, ProvisionOutcome,
    Provisioner, StageObserver,
};
pub use runtime::{check_tools, RuntimeInfo, Tool};

#[cfg(feature = "tui")]
pub use tui::run_provision;
