//! Error taxonomy for provisioning and downsampling

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Provisioning stages, run strictly in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisionStage {
    Fetch,
    Extract,
    Install,
    Activate,
}

impl ProvisionStage {
    pub const ALL: [ProvisionStage; 4] = [
        ProvisionStage::Fetch,
        ProvisionStage::Extract,
        ProvisionStage::Install,
        ProvisionStage::Activate,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            ProvisionStage::Fetch => "fetch",
            ProvisionStage::Extract => "extract",
            ProvisionStage::Install => "resolve & install",
            ProvisionStage::Activate => "activate",
        }
    }
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Errors that abort provisioning. Every variant is terminal.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid release version '{version}': {reason}")]
    InvalidVersion { version: String, reason: String },

    #[error("release {version} could not be fetched from {location}: {reason}")]
    Fetch {
        version: String,
        location: String,
        reason: String,
    },

    #[error("failed to extract release archive: {reason}")]
    Extraction { reason: String },

    #[error("invalid environment descriptor {}: {reason}", path.display())]
    Descriptor { path: PathBuf, reason: String },

    #[error("unsatisfiable dependencies: {reason}")]
    DependencyResolution { reason: String },

    #[error("installation failed during {stage}: {reason}")]
    Installation {
        stage: ProvisionStage,
        reason: String,
    },
}

impl ProvisionError {
    /// The stage the error aborted, if it belongs to one
    pub fn stage(&self) -> ProvisionStage {
        match self {
            ProvisionError::InvalidVersion { .. } | ProvisionError::Fetch { .. } => {
                ProvisionStage::Fetch
            }
            ProvisionError::Extraction { .. } => ProvisionStage::Extract,
            ProvisionError::Descriptor { .. } | ProvisionError::DependencyResolution { .. } => {
                ProvisionStage::Install
            }
            ProvisionError::Installation { stage, .. } => *stage,
        }
    }

    pub(crate) fn extraction(reason: impl fmt::Display) -> Self {
        ProvisionError::Extraction {
            reason: reason.to_string(),
        }
    }

    pub(crate) fn installation(stage: ProvisionStage, reason: impl fmt::Display) -> Self {
        ProvisionError::Installation {
            stage,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn resolution(reason: impl fmt::Display) -> Self {
        ProvisionError::DependencyResolution {
            reason: reason.to_string(),
        }
    }
}

/// Errors raised while downsampling reads
#[derive(Debug, Error)]
pub enum DownsampleError {
    #[error("read file does not exist: {}", .0.display())]
    MissingRead(PathBuf),

    #[error("desired coverage must be a positive integer")]
    InvalidCoverage,

    #[error("number of threads must be a positive integer")]
    InvalidThreads,

    #[error("unknown name type '{0}' (choose: prepend, insert, extend)")]
    UnknownNameType(String),

    #[error("cannot apply insert naming to '{0}': file name has no '_'")]
    InsertWithoutUnderscore(String),

    #[error("cannot apply extend naming to '{0}': not a .fastq or .fastq.gz file")]
    NotFastq(String),

    #[error("{} is not a valid directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("no paired-end reads found in {}", .0.display())]
    NoPairs(PathBuf),

    #[error("could not parse genome size and coverage from mash output")]
    MashOutput,

    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with status {code}")]
    ToolFailed { tool: &'static str, code: i32 },

    #[error("provisioned environment is unusable: {0}")]
    Environment(#[from] ProvisionError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        assert_eq!(ProvisionStage::ALL[0], ProvisionStage::Fetch);
        assert_eq!(ProvisionStage::ALL[3], ProvisionStage::Activate);
    }

    #[test]
    fn test_error_stage_mapping() {
        let err = ProvisionError::resolution("python>=3.10 conflicts with python<3.9");
        assert_eq!(err.stage(), ProvisionStage::Install);
        assert!(err.to_string().contains("unsatisfiable"));

        let err = ProvisionError::extraction("corrupt gzip header");
        assert_eq!(err.stage(), ProvisionStage::Extract);

        let err = ProvisionError::installation(ProvisionStage::Activate, "help exited 1");
        assert_eq!(err.stage(), ProvisionStage::Activate);
    }
}
