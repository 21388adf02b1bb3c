//! Detection of the external tools used by the downsampler

pub mod check;

pub use check::{check_tool, check_tools, RuntimeInfo, Tool};
