//! Single-frame KMS scanout capture with accelerator-native de-tiling and
//! HDR tone mapping.
//!
//! [`list`] enumerates planes for `--list`; [`capture`] runs the full
//! discovery -> orchestration -> format-conversion pipeline and returns a
//! packed RGB24 raster ready for [`image_writer::write_ppm`].

pub mod compute_import;
pub mod dma_copy;
pub mod error;
pub mod format;
pub mod image_writer;
pub mod kms;
pub mod orchestrator;
pub mod shim;
pub mod tonemap;

use std::path::Path;

pub use error::{Error, Result};
pub use format::PixelFormat;
pub use kms::{DrmKmsSource, FramebufferDescriptor, KmsSource, PlaneListing};
pub use tonemap::ToneMapParams;

/// List every plane on `device` and its bound framebuffer, tolerating
/// legacy-only (FB1) framebuffers.
pub fn list(device: &Path) -> Result<Vec<PlaneListing>> {
    let source = DrmKmsSource::open(device)?;
    kms::list_planes(&source)
}

/// Capture a single frame from `device`.
///
/// `fb_id` of `0` auto-selects the largest active framebuffer
/// ([`kms::discover_primary_framebuffer`]); otherwise the exact
/// framebuffer is captured if active.
///
/// Returns a packed RGB24 raster (`width * height * 3` bytes, no
/// padding) plus its dimensions.
pub fn capture(device: &Path, fb_id: u32, params: ToneMapParams) -> Result<(Vec<u8>, u32, u32)> {
    let source = DrmKmsSource::open(device)?;

    let fb = if fb_id == 0 {
        kms::discover_primary_framebuffer(&source)?
    } else {
        source.framebuffer_metadata(fb_id)?
    };

    let (raster, pitch, output_format) = orchestrator::capture(&source, &fb, params)?;

    let mut rgb = vec![0u8; fb.width as usize * fb.height as usize * 3];
    format::convert_to_rgb24(&raster, &mut rgb, fb.width, fb.height, output_format, pitch);

    Ok((rgb, fb.width, fb.height))
}
