//! Driver shim (§4.H): the uniform error surface every acquisition path
//! maps its underlying status codes through, plus the tab-prefixed,
//! immediately-flushed diagnostic convention used for sub-path detail.
//!
//! `drm`, `libdrm_amdgpu_sys` and `ash` each report failure differently
//! (`io::Error`, a negative `i32` status, or a `vk::Result` enum); this
//! module is where that gets collapsed to one shape before it reaches
//! [`crate::error::Error`]. No buffering layer sits in front of
//! `tracing-subscriber`'s fmt layer, so a diagnostic logged here reaches
//! the terminal before the next ioctl or syscall even starts.

use tracing::{debug, error, warn};

use crate::error::{Error, Result};

/// Category an acquisition-path failure falls into, used to decide
/// whether the orchestrator treats it as fatal or tries the next
/// strategy (§7's propagation policy).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Environment,
    Discovery,
    Import,
    GpuExecution,
    HostIo,
}

impl ErrorKind {
    /// Whether a failure of this kind should make the orchestrator try
    /// the next strategy rather than give up immediately.
    pub fn is_recoverable(self) -> bool {
        matches!(self, ErrorKind::Import | ErrorKind::GpuExecution)
    }
}

/// Turn a raw negative-status accelerator/compute call into the matching
/// [`Error`] variant, logging the sub-path detail with the tab-prefix
/// convention first.
pub fn build_error(what: &'static str, status: i32, kind: ErrorKind) -> Error {
    let err = match kind {
        ErrorKind::Import => Error::Import { what, status },
        ErrorKind::GpuExecution => Error::GpuExecution { what, status },
        ErrorKind::Environment | ErrorKind::Discovery | ErrorKind::HostIo => {
            Error::GpuExecution { what, status }
        }
    };
    if kind.is_recoverable() {
        debug!("\t{what} failed with status {status}, trying next strategy");
    } else {
        error!("\t{what} failed with status {status}");
    }
    err
}

/// Map a raw negative-status accelerator/compute call into a
/// [`Result`], logging via [`build_error`] before the caller's `?`
/// propagates it.
pub fn from_status<T>(what: &'static str, status: i32, kind: ErrorKind) -> Result<T> {
    Err(build_error(what, status, kind))
}

/// Log a non-fatal sub-path detail (e.g. a best-effort capability
/// request that failed) at `warn` with the tab-prefix convention.
pub fn warn_detail(message: impl std::fmt::Display) {
    warn!("\t{message}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_and_gpu_execution_are_recoverable() {
        assert!(ErrorKind::Import.is_recoverable());
        assert!(ErrorKind::GpuExecution.is_recoverable());
    }

    #[test]
    fn environment_and_host_io_are_not_recoverable() {
        assert!(!ErrorKind::Environment.is_recoverable());
        assert!(!ErrorKind::HostIo.is_recoverable());
        assert!(!ErrorKind::Discovery.is_recoverable());
    }

    #[test]
    fn from_status_returns_the_requested_variant() {
        let err: Result<()> = from_status("amdgpu_bo_alloc", -12, ErrorKind::Import);
        assert!(matches!(err, Err(Error::Import { status: -12, .. })));
    }
}
