use std::path::PathBuf;

/// Uniform error surface for every acquisition path.
///
/// Mirrors the error-kind table in the capture design: each variant maps to
/// exactly one of `Environment` / `Discovery` / `Import` / `GpuExecution` /
/// `HostIo`, which the orchestrator and the CLI use to decide whether to
/// fall through to the next strategy or give up.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("not running as root")]
    NotRoot,

    #[error("failed to open DRM device {path}: {source}")]
    DeviceOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("DRM capability {0} unavailable")]
    CapabilityUnavailable(&'static str),

    #[error("no active framebuffer found on any plane")]
    NoActiveFramebuffer,

    #[error("framebuffer {0} is legacy-only (FB1); FB2 metadata is required for capture")]
    LegacyFramebufferOnly(u32),

    #[error("framebuffer {0} not found")]
    FramebufferNotFound(u32),

    #[error("{what} failed with status {status}")]
    Import { what: &'static str, status: i32 },

    #[error("{what} failed with status {status}")]
    GpuExecution { what: &'static str, status: i32 },

    #[error("unrecognized pixel format code {0:#010x}")]
    UnrecognizedFormat(u32),

    #[error("failed to open output file {path}: {source}")]
    HostIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("exposure must be > 0, got {0}")]
    InvalidExposure(f32),

    #[error("tonemap mode must be in 0..=7, got {0}")]
    InvalidTonemapMode(u32),

    #[error("no acquisition strategy succeeded for framebuffer {0}")]
    AllStrategiesFailed(u32),
}

pub type Result<T> = std::result::Result<T, Error>;
