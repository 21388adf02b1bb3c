//! Downsampling of one paired-end read set with mash and rasusa

use super::naming::{output_name, NameType};
use crate::error::DownsampleError;
use crate::provision::installer::run_streaming;
use crate::provision::ActivatedEnvironment;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as TokioCommand;
use tracing::{debug, info, warn};

/// Inputs at or below this size are copied instead of downsampled
pub const EMPTY_READ_THRESHOLD: u64 = 100;

/// Fixed rasusa seed so repeated runs pick the same reads
pub const RASUSA_SEED: &str = "11327544032246541232";

/// Upper bound on a single rasusa run
const RASUSA_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);

/// One read pair to downsample
#[derive(Debug, Clone, PartialEq)]
pub struct SubsampleRequest {
    pub coverage: u32,
    pub name_type: NameType,
    pub read1: PathBuf,
    pub read2: PathBuf,
    pub output_dir: PathBuf,
}

/// Genome size and coverage estimated by mash
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MashEstimate {
    pub genome_size: f64,
    pub coverage: u64,
}

/// What happened to a read pair
#[derive(Debug, Clone, PartialEq)]
pub enum SubsampleOutcome {
    /// Inputs were effectively empty and copied unchanged
    Copied { read1: PathBuf, read2: PathBuf },
    /// Reads were downsampled by rasusa
    Downsampled {
        read1: PathBuf,
        read2: PathBuf,
        estimate: MashEstimate,
    },
}

impl SubsampleOutcome {
    pub fn outputs(&self) -> (&Path, &Path) {
        match self {
            SubsampleOutcome::Copied { read1, read2 }
            | SubsampleOutcome::Downsampled { read1, read2, .. } => (read1, read2),
        }
    }
}

/// Parse `Estimated genome size:` and `Estimated coverage:` from mash stderr
pub fn parse_mash_estimates(stderr: &str) -> Option<MashEstimate> {
    let mut genome_size = None;
    let mut coverage = None;
    for line in stderr.lines() {
        if let Some(value) = line.strip_prefix("Estimated genome size:") {
            genome_size = value.trim().parse::<f64>().ok();
        } else if let Some(value) = line.strip_prefix("Estimated coverage:") {
            coverage = value
                .trim()
                .parse::<f64>()
                .ok()
                .map(|c| c.round().max(0.0) as u64);
        }
    }
    Some(MashEstimate {
        genome_size: genome_size?,
        coverage: coverage?,
    })
}

/// Runs mash and rasusa, optionally inside an activated environment
#[derive(Debug, Clone)]
pub struct Subsampler {
    environment: Option<Arc<ActivatedEnvironment>>,
    mash: String,
    rasusa: String,
}

impl Subsampler {
    pub fn new(environment: Option<ActivatedEnvironment>) -> Self {
        Self {
            environment: environment.map(Arc::new),
            mash: "mash".to_string(),
            rasusa: "rasusa".to_string(),
        }
    }

    /// Use different executables for mash and rasusa
    pub fn with_tools(mut self, mash: impl Into<String>, rasusa: impl Into<String>) -> Self {
        self.mash = mash.into();
        self.rasusa = rasusa.into();
        self
    }

    fn command(&self, program: &str) -> Result<TokioCommand, DownsampleError> {
        match &self.environment {
            Some(env) => Ok(env.command(program)?),
            None => Ok(TokioCommand::new(program)),
        }
    }

    /// Downsample one read pair to the requested coverage
    pub async fn subsample(
        &self,
        request: &SubsampleRequest,
    ) -> Result<SubsampleOutcome, DownsampleError> {
        if request.coverage == 0 {
            return Err(DownsampleError::InvalidCoverage);
        }
        let size1 = read_size(&request.read1).await?;
        let size2 = read_size(&request.read2).await?;

        tokio::fs::create_dir_all(&request.output_dir).await?;
        let out1 = request
            .output_dir
            .join(output_file_name(request.name_type, &request.read1, request.coverage)?);
        let out2 = request
            .output_dir
            .join(output_file_name(request.name_type, &request.read2, request.coverage)?);
        debug!(name_type = %request.name_type, "using naming scheme");
        info!(
            read1 = %request.read1.display(),
            read2 = %request.read2.display(),
            "processing read pair"
        );

        if size1 <= EMPTY_READ_THRESHOLD || size2 <= EMPTY_READ_THRESHOLD {
            warn!(
                read1 = %request.read1.display(),
                read2 = %request.read2.display(),
                "read pair is effectively empty, copying without downsampling"
            );
            tokio::fs::copy(&request.read1, &out1).await?;
            tokio::fs::copy(&request.read2, &out2).await?;
            return Ok(SubsampleOutcome::Copied {
                read1: out1,
                read2: out2,
            });
        }

        let estimate = self.estimate(&request.read1, &request.read2).await?;
        info!(
            genome_size = estimate.genome_size,
            estimated_coverage = estimate.coverage,
            target = request.coverage,
            "mash estimate"
        );

        self.run_rasusa(request, estimate, &out1, &out2).await?;
        Ok(SubsampleOutcome::Downsampled {
            read1: out1,
            read2: out2,
            estimate,
        })
    }

    /// Stream both read files through `mash sketch` and parse its estimates
    async fn estimate(&self, read1: &Path, read2: &Path) -> Result<MashEstimate, DownsampleError> {
        let mut command = self.command(&self.mash)?;
        command
            .args(["sketch", "-o", "/dev/null", "-k", "21", "-m", "10", "-r", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|source| DownsampleError::Spawn {
            tool: "mash",
            source,
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("failed to open mash stdin"))?;
        let inputs = [read1.to_path_buf(), read2.to_path_buf()];
        let writer = tokio::spawn(async move {
            for input in &inputs {
                let mut file = tokio::fs::File::open(input).await?;
                tokio::io::copy(&mut file, &mut stdin).await?;
            }
            stdin.shutdown().await
        });

        let output = child.wait_with_output().await?;
        match writer.await {
            Ok(Ok(())) => {}
            // mash may stop reading once it has enough k-mers
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(e) => return Err(std::io::Error::other(e).into()),
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        parse_mash_estimates(&stderr).ok_or(DownsampleError::MashOutput)
    }

    async fn run_rasusa(
        &self,
        request: &SubsampleRequest,
        estimate: MashEstimate,
        out1: &Path,
        out2: &Path,
    ) -> Result<(), DownsampleError> {
        let mut command = self.command(&self.rasusa)?;
        command
            .arg("reads")
            .arg("-s")
            .arg(RASUSA_SEED)
            .arg("-g")
            .arg(estimate.genome_size.to_string())
            .arg("-c")
            .arg(request.coverage.to_string())
            .arg("-o")
            .arg(out1)
            .arg("-o")
            .arg(out2)
            .arg(&request.read1)
            .arg(&request.read2);

        let outcome = run_streaming(command, "rasusa", RASUSA_TIMEOUT)
            .await
            .map_err(|source| DownsampleError::Spawn {
                tool: "rasusa",
                source,
            })?;
        if !outcome.status.success() {
            return Err(DownsampleError::ToolFailed {
                tool: "rasusa",
                code: outcome.status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }
}

async fn read_size(path: &Path) -> Result<u64, DownsampleError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(meta.len()),
        _ => Err(DownsampleError::MissingRead(path.to_path_buf())),
    }
}

fn output_file_name(
    name_type: NameType,
    read: &Path,
    coverage: u32,
) -> Result<String, DownsampleError> {
    let file_name = read
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| DownsampleError::MissingRead(read.to_path_buf()))?;
    output_name(name_type, &file_name, coverage)
}
