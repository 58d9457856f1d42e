#![forbid(unsafe_code)]

//! Library shared by the `bandfetch`, `launcher` and `release_manifest`
//! binaries.

pub mod config;
pub mod error;
pub mod extractor;
pub mod fetch;
pub mod model;
pub mod pipeline;
pub mod planner;
pub mod playlist;
pub mod postprocess;
pub mod preflight;
pub mod progress;
pub mod resolver;
pub mod scheduler;
pub mod transport;
pub mod update;

#[cfg(test)]
pub(crate) mod test_support;
