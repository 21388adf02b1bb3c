//! Directory-wide downsampling of paired-end reads

use super::naming::NameType;
use super::subsample::{SubsampleOutcome, SubsampleRequest, Subsampler};
use crate::error::DownsampleError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Default number of pairs processed at once
pub const DEFAULT_THREADS: usize = 8;

/// A read 1 file and its existing mate
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReadPair {
    pub read1: PathBuf,
    pub read2: PathBuf,
}

/// Options for one batch run
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub coverage: u32,
    pub name_type: NameType,
    pub input_dir: PathBuf,
    pub exclude: Option<String>,
    pub output_dir: PathBuf,
    pub threads: usize,
}

/// Per-pair results of a batch run
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<(ReadPair, SubsampleOutcome)>,
    pub failed: Vec<(ReadPair, String)>,
    /// Worker tasks that panicked or were cancelled
    pub aborted: usize,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.aborted == 0
    }
}

fn is_fastq(name: &str) -> bool {
    name.ends_with(".fastq") || name.ends_with(".fastq.gz")
}

fn mate_name(read1_name: &str) -> String {
    read1_name.replace("_1.", "_2.").replace("_R1_", "_R2_")
}

/// Find read 1 files in `dir` whose read 2 mate exists
pub fn find_read_pairs(
    dir: &Path,
    exclude: Option<&str>,
) -> Result<Vec<ReadPair>, DownsampleError> {
    if !dir.is_dir() {
        return Err(DownsampleError::NotADirectory(dir.to_path_buf()));
    }

    let mut pairs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_fastq(&name) {
            continue;
        }
        if exclude.is_some_and(|prefix| !prefix.is_empty() && name.starts_with(prefix)) {
            continue;
        }
        if !name.contains("_1.") && !name.contains("_R1_") {
            continue;
        }
        let read2 = dir.join(mate_name(&name));
        if read2.is_file() {
            pairs.push(ReadPair {
                read1: entry.path(),
                read2,
            });
        }
    }

    pairs.sort();
    Ok(pairs)
}

/// Downsample every pair in the input directory, `threads` at a time
pub async fn downsample_directory(
    subsampler: &Subsampler,
    request: &BatchRequest,
) -> Result<BatchReport, DownsampleError> {
    if request.coverage == 0 {
        return Err(DownsampleError::InvalidCoverage);
    }
    if request.threads == 0 {
        return Err(DownsampleError::InvalidThreads);
    }

    let pairs = find_read_pairs(&request.input_dir, request.exclude.as_deref())?;
    if pairs.is_empty() {
        return Err(DownsampleError::NoPairs(request.input_dir.clone()));
    }
    tokio::fs::create_dir_all(&request.output_dir).await?;
    info!(
        pairs = pairs.len(),
        threads = request.threads,
        input = %request.input_dir.display(),
        "downsampling directory"
    );

    let permits = Arc::new(Semaphore::new(request.threads));
    let mut tasks = JoinSet::new();
    for pair in pairs {
        let subsampler = subsampler.clone();
        let permits = permits.clone();
        let job = SubsampleRequest {
            coverage: request.coverage,
            name_type: request.name_type,
            read1: pair.read1.clone(),
            read2: pair.read2.clone(),
            output_dir: request.output_dir.clone(),
        };
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await;
            let result = subsampler.subsample(&job).await;
            (pair, result)
        });
    }

    let mut report = BatchReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((pair, Ok(outcome))) => report.succeeded.push((pair, outcome)),
            Ok((pair, Err(e))) => {
                error!(read1 = %pair.read1.display(), error = %e, "failed to downsample pair");
                report.failed.push((pair, e.to_string()));
            }
            Err(e) => {
                error!(error = %e, "downsampling task aborted");
                report.aborted += 1;
            }
        }
    }

    report.succeeded.sort_by(|a, b| a.0.cmp(&b.0));
    report.failed.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_mate_name() {
        assert_eq!(mate_name("S1_L001_R1_001.fastq.gz"), "S1_L001_R2_001.fastq.gz");
        assert_eq!(mate_name("SRR1_1.fastq"), "SRR1_2.fastq");
    }

    #[test]
    fn test_find_read_pairs() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "b_R1_001.fastq.gz",
            "b_R2_001.fastq.gz",
            "a_1.fastq",
            "a_2.fastq",
            "lonely_1.fastq",
            "notes_1.txt",
            "Undetermined_R1_001.fastq.gz",
            "Undetermined_R2_001.fastq.gz",
        ] {
            touch(dir.path(), name, "");
        }
        std::fs::create_dir(dir.path().join("dir_1.fastq")).unwrap();

        let pairs = find_read_pairs(dir.path(), Some("Undetermined")).unwrap();
        let names: Vec<_> = pairs
            .iter()
            .map(|p| p.read1.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a_1.fastq", "b_R1_001.fastq.gz"]);
        assert_eq!(pairs[1].read2, dir.path().join("b_R2_001.fastq.gz"));

        let all = find_read_pairs(dir.path(), None).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_find_read_pairs_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = find_read_pairs(&dir.path().join("absent"), None).unwrap_err();
        assert!(matches!(err, DownsampleError::NotADirectory(_)));
    }

    fn request(input_dir: &Path, output_dir: &Path, threads: usize) -> BatchRequest {
        BatchRequest {
            coverage: 30,
            name_type: NameType::Prepend,
            input_dir: input_dir.to_path_buf(),
            exclude: None,
            output_dir: output_dir.to_path_buf(),
            threads,
        }
    }

    #[tokio::test]
    async fn test_rejects_zero_threads_and_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let subsampler = Subsampler::new(None);

        let err = downsample_directory(&subsampler, &request(dir.path(), dir.path(), 0))
            .await
            .unwrap_err();
        assert!(matches!(err, DownsampleError::InvalidThreads));

        let err = downsample_directory(&subsampler, &request(dir.path(), dir.path(), 2))
            .await
            .unwrap_err();
        assert!(matches!(err, DownsampleError::NoPairs(_)));
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_other_pairs() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        // The tiny pair is copied; the large one needs a mash that does not exist
        touch(input.path(), "good_1.fastq", "@r\nA\n+\nI\n");
        touch(input.path(), "good_2.fastq", "@r\nA\n+\nI\n");
        touch(input.path(), "big_R1_001.fastq", &"A".repeat(500));
        touch(input.path(), "big_R2_001.fastq", &"A".repeat(500));

        let subsampler =
            Subsampler::new(None).with_tools("/nonexistent/mash", "/nonexistent/rasusa");
        let report = downsample_directory(&subsampler, &request(input.path(), output.path(), 1))
            .await
            .unwrap();

        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.succeeded[0].0.read1, input.path().join("good_1.fastq"));
        assert!(output.path().join("030xds-good_1.fastq").is_file());

        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].1.contains("mash"));
        assert!(!report.is_success());
    }
}
