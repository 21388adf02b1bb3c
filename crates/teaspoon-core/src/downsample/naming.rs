//! Output file naming for downsampled reads

use crate::error::DownsampleError;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// How the coverage tag is worked into the output file name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NameType {
    /// `030xds-sample_R1.fastq.gz`
    #[default]
    Prepend,
    /// `sample-030xds_R1.fastq.gz`
    Insert,
    /// `sample_R1.030xds.fastq.gz`
    Extend,
}

impl NameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NameType::Prepend => "prepend",
            NameType::Insert => "insert",
            NameType::Extend => "extend",
        }
    }
}

impl fmt::Display for NameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NameType {
    type Err = DownsampleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "prepend" => Ok(NameType::Prepend),
            "insert" => Ok(NameType::Insert),
            "extend" => Ok(NameType::Extend),
            other => Err(DownsampleError::UnknownNameType(other.to_string())),
        }
    }
}

fn fastq_suffix() -> &'static Regex {
    static SUFFIX: OnceLock<Regex> = OnceLock::new();
    SUFFIX.get_or_init(|| Regex::new(r"(\.fastq\.gz|\.fastq)").expect("static regex"))
}

/// Coverage tag, zero-padded to three digits: `30` -> `030xds`
pub fn coverage_tag(coverage: u32) -> String {
    format!("{:03}xds", coverage)
}

/// Output file name for one input read file
pub fn output_name(
    name_type: NameType,
    file_name: &str,
    coverage: u32,
) -> Result<String, DownsampleError> {
    let tag = coverage_tag(coverage);
    match name_type {
        NameType::Prepend => Ok(format!("{}-{}", tag, file_name)),
        NameType::Insert => {
            let (head, tail) = file_name
                .split_once('_')
                .ok_or_else(|| DownsampleError::InsertWithoutUnderscore(file_name.to_string()))?;
            Ok(format!("{}-{}_{}", head, tag, tail))
        }
        NameType::Extend => {
            let replaced = fastq_suffix().replace(file_name, format!(".{}$1", tag).as_str());
            if replaced == file_name {
                return Err(DownsampleError::NotFastq(file_name.to_string()));
            }
            Ok(replaced.into_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coverage_tag_padding() {
        assert_eq!(coverage_tag(5), "005xds");
        assert_eq!(coverage_tag(30), "030xds");
        assert_eq!(coverage_tag(1500), "1500xds");
    }

    #[test]
    fn test_prepend() {
        assert_eq!(
            output_name(NameType::Prepend, "S1_L001_R1_001.fastq.gz", 30).unwrap(),
            "030xds-S1_L001_R1_001.fastq.gz"
        );
    }

    #[test]
    fn test_insert() {
        assert_eq!(
            output_name(NameType::Insert, "S1_L001_R1_001.fastq.gz", 30).unwrap(),
            "S1-030xds_L001_R1_001.fastq.gz"
        );
    }

    #[test]
    fn test_insert_without_underscore() {
        let err = output_name(NameType::Insert, "reads.fastq", 30).unwrap_err();
        assert!(matches!(err, DownsampleError::InsertWithoutUnderscore(_)));
    }

    #[test]
    fn test_extend() {
        assert_eq!(
            output_name(NameType::Extend, "SRR123_1.fastq.gz", 100).unwrap(),
            "SRR123_1.100xds.fastq.gz"
        );
        assert_eq!(
            output_name(NameType::Extend, "SRR123_1.fastq", 40).unwrap(),
            "SRR123_1.040xds.fastq"
        );
    }

    #[test]
    fn test_extend_requires_fastq() {
        assert!(output_name(NameType::Extend, "reads.fa", 40).is_err());
    }

    #[test]
    fn test_parse_name_type() {
        assert_eq!("Insert".parse::<NameType>().unwrap(), NameType::Insert);
        assert!("append".parse::<NameType>().is_err());
        assert_eq!(NameType::default(), NameType::Prepend);
    }
}
