// Library interface for the binary and integration tests

pub mod backend;
pub mod capture;
pub mod config;
pub mod constants;
pub mod error;
pub mod http;
pub mod manifest;
pub mod memory;
pub mod model;
pub mod playback;
pub mod record;
pub mod resume;
pub mod serve;
pub mod sinks;
pub mod upload;

pub use error::{PipelineError, Result};
