//! Error taxonomy for the disk assembly engine.
//!
//! Every failure is classified by what the caller can do about it:
//! configuration and resource errors happen before any device mutation and
//! are fixable without cleanup; device-wait and tool failures are fatal for
//! the running build and trigger full teardown.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BuildError>;

#[derive(Error, Debug)]
pub enum BuildError {
    /// The partition layout (or build request) is unusable. Raised before any
    /// device is touched.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A host resource could not be obtained: no free loop device, target
    /// device too small, missing tools, insufficient privileges.
    #[error("{0}")]
    ResourceAcquisition(String),

    /// A partition or volume node did not appear within the wait timeout.
    #[error("timed out after {waited_secs}s waiting for {} to appear", path.display())]
    DeviceNotReady { path: PathBuf, waited_secs: u64 },

    /// An external command exited non-zero. The original command line and
    /// exit status are preserved for diagnostics.
    #[error("command failed: {command} (exit={code:?})")]
    ToolInvocation { command: String, code: Option<i32> },

    /// A tool ran successfully but its expected output artifact is missing.
    #[error("{tool} produced no output at {}", path.display())]
    MissingArtifact { tool: String, path: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BuildError {
    pub fn config(msg: impl Into<String>) -> Self {
        BuildError::Configuration(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        BuildError::ResourceAcquisition(msg.into())
    }
}
