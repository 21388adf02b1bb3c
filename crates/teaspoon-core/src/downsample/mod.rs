//! Read downsampling
//!
//! - `naming`: coverage-tagged output file names
//! - `subsample`: one read pair through mash and rasusa
//! - `batch`: pair discovery and bounded concurrent runs over a directory

pub mod batch;
pub mod naming;
pub mod subsample;

pub use batch::{downsample_directory, find_read_pairs, BatchReport, BatchRequest, ReadPair};
pub use naming::{coverage_tag, output_name, NameType};
pub use subsample::{
    parse_mash_estimates, MashEstimate, SubsampleOutcome, SubsampleRequest, Subsampler,
};
