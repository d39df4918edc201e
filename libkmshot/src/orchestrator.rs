//! Acquisition orchestrator (§4.G): pick a strategy order from driver
//! identity and buffer modifier, then fold over it until one succeeds.
//!
//! The fold itself (`attempt_all`) and the ordering rule (`decide_order`)
//! are pure and unit-tested without any DRM/Vulkan/amdgpu device; only
//! `capture`, which wires real strategies to a real `DrmKmsSource`, needs
//! hardware.

use std::os::fd::OwnedFd;

use tracing::{debug, warn};

use crate::compute_import;
use crate::dma_copy;
use crate::error::{Error, Result};
use crate::format::PixelFormat;
use crate::kms::{DrmKmsSource, FbPlane, FramebufferDescriptor, KmsSource};
use crate::tonemap::ToneMapParams;

/// The driver this tool has a DMA-engine and external-import fast path
/// for; every other driver goes straight to the dumb-buffer shadow.
pub const PREFERRED_ACCELERATOR: &str = "amdgpu";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StrategyKind {
    Compute,
    Dma,
    Shadow,
}

/// Pure decision procedure from §4.G steps 1-4: which strategies to try,
/// in order, for a given driver name and tiling state.
pub fn decide_order(driver: &str, tiled: bool) -> Vec<StrategyKind> {
    if driver == PREFERRED_ACCELERATOR {
        if tiled {
            vec![StrategyKind::Compute, StrategyKind::Dma, StrategyKind::Shadow]
        } else {
            vec![StrategyKind::Dma, StrategyKind::Shadow]
        }
    } else {
        vec![StrategyKind::Shadow]
    }
}

/// Try each strategy in `order` via `attempt` until one returns `Ok`,
/// logging and continuing past every failure. Returns the last error if
/// every strategy (including the ladder's terminal fallback) fails.
pub fn attempt_all<T>(
    fb_id: u32,
    order: &[StrategyKind],
    mut attempt: impl FnMut(StrategyKind) -> Result<T>,
) -> Result<T> {
    let mut last_err = None;
    for &kind in order {
        match attempt(kind) {
            Ok(value) => return Ok(value),
            Err(err) => {
                debug!("\tstrategy {kind:?} failed for fb {fb_id}: {err}");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or(Error::AllStrategiesFailed(fb_id)))
}

/// Run the full orchestration against a real DRM device: discover the
/// driver, decide the strategy order, and fold over it.
///
/// Returns the linear raster, its row pitch, and the pixel format the
/// caller should pass to [`crate::format::convert_to_rgb24`].
pub fn capture(
    kms: &DrmKmsSource,
    fb: &FramebufferDescriptor,
    params: ToneMapParams,
) -> Result<(Vec<u8>, u32, PixelFormat)> {
    let driver = kms.driver_name().unwrap_or_default();
    let order = decide_order(&driver, fb.is_tiled());

    attempt_all(fb.id, &order, |kind| match kind {
        StrategyKind::Compute => {
            if !compute_import::format_is_supported(fb.format) {
                return Err(Error::CapabilityUnavailable("compute path format"));
            }
            // The compute path's blit preserves byte content for any
            // non-HDR format (the modifier changes tile layout, not
            // component order); only the HDR branch's tone-map kernel
            // actually rewrites bytes, into packed R,G,B,A.
            let (raster, pitch) = compute_import::acquire(fb, |handle| kms.export_plane_fd(handle), params)?;
            let format = if fb.format.is_hdr() { PixelFormat::Abgr8888 } else { fb.format };
            Ok((raster, pitch, format))
        }
        StrategyKind::Dma => {
            let (raster, pitch) = dma_copy::acquire(fb, None, |handle| kms.export_plane_fd(handle))?;
            Ok((raster, pitch, fb.format))
        }
        StrategyKind::Shadow => shadow_capture(kms, fb),
    })
}

/// Component G step 4: a 32-bpp dumb buffer the same size as `fb`,
/// populated either by a CPU-mapped read of the source plane (with
/// inline HDR->8bpp reduction) or, if the source cannot be mapped, a
/// deterministic gradient test pattern.
fn shadow_capture(kms: &DrmKmsSource, fb: &FramebufferDescriptor) -> Result<(Vec<u8>, u32, PixelFormat)> {
    let pitch = fb.width * 4;
    let mut shadow = vec![0u8; pitch as usize * fb.height as usize];

    // Only formats that already pack one pixel into 4 bytes can be
    // copied byte-for-byte into the 32-bpp dumb buffer; anything else
    // (e.g. legacy RGB565) goes straight to the test pattern rather than
    // risk a misaligned copy.
    let mappable = fb.format.bytes_per_pixel() == 4 || fb.format.is_hdr();

    let format = if mappable {
        match try_map_source(kms, fb.plane0()) {
            Ok(mapped) => {
                copy_with_reduction(&mapped, &mut shadow, fb, pitch);
                debug!("\tshadow path: CPU-mapped source plane for fb {}", fb.id);
                if fb.format.is_hdr() { PixelFormat::Xrgb8888 } else { fb.format }
            }
            Err(err) => {
                warn!("\tshadow path: source not CPU-mappable ({err}); filling deterministic test pattern");
                fill_test_pattern(&mut shadow, fb.width, fb.height, pitch);
                PixelFormat::Xrgb8888
            }
        }
    } else {
        warn!("\tshadow path: format {:?} has no 32-bpp shadow copy; filling deterministic test pattern", fb.format);
        fill_test_pattern(&mut shadow, fb.width, fb.height, pitch);
        PixelFormat::Xrgb8888
    };

    Ok((shadow, pitch, format))
}

fn try_map_source(kms: &DrmKmsSource, plane0: FbPlane) -> Result<memmap2::Mmap> {
    let fd: OwnedFd = kms.export_plane_fd(plane0.handle)?;
    unsafe { memmap2::Mmap::map(&fd) }.map_err(|source| Error::DeviceOpen {
        path: "<dmabuf>".into(),
        source,
    })
}

fn copy_with_reduction(mapped: &[u8], shadow: &mut [u8], fb: &FramebufferDescriptor, dst_pitch: u32) {
    let plane0 = fb.plane0();
    let src_pitch = plane0.pitch as usize;
    let needs_reduction = fb.format == PixelFormat::Abgr16161616;

    for y in 0..fb.height as usize {
        let src_row = &mapped[plane0.offset as usize + y * src_pitch..];
        let dst_row = &mut shadow[y * dst_pitch as usize..(y + 1) * dst_pitch as usize];
        if needs_reduction {
            for x in 0..fb.width as usize {
                let px = &src_row[x * 8..x * 8 + 8];
                let r = px[1];
                let g = px[3];
                let b = px[5];
                let a = px[7];
                dst_row[x * 4..x * 4 + 4].copy_from_slice(&[b, g, r, a]);
            }
        } else {
            let bpp = fb.format.bytes_per_pixel().max(1);
            let n = (fb.width as usize * bpp).min(dst_row.len()).min(src_row.len());
            dst_row[..n].copy_from_slice(&src_row[..n]);
        }
    }
}

/// R = x*255/w, G = y*255/h, B = 128, A = 255, packed as little-endian
/// ARGB8888 (BGRA byte order) to match [`PixelFormat::Xrgb8888`].
fn fill_test_pattern(shadow: &mut [u8], width: u32, height: u32, pitch: u32) {
    for y in 0..height {
        let row = &mut shadow[(y * pitch) as usize..(y * pitch + width * 4) as usize];
        for x in 0..width {
            let r = ((x as u64 * 255) / width.max(1) as u64) as u8;
            let g = ((y as u64 * 255) / height.max(1) as u64) as u8;
            row[(x * 4) as usize..(x * 4 + 4) as usize].copy_from_slice(&[128, g, r, 255]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferred_accelerator_tiled_tries_compute_first() {
        let order = decide_order(PREFERRED_ACCELERATOR, true);
        assert_eq!(order, vec![StrategyKind::Compute, StrategyKind::Dma, StrategyKind::Shadow]);
    }

    #[test]
    fn preferred_accelerator_linear_skips_compute() {
        let order = decide_order(PREFERRED_ACCELERATOR, false);
        assert_eq!(order, vec![StrategyKind::Dma, StrategyKind::Shadow]);
    }

    #[test]
    fn non_preferred_driver_goes_straight_to_shadow() {
        let order = decide_order("i915", true);
        assert_eq!(order, vec![StrategyKind::Shadow]);
    }

    #[test]
    fn fold_returns_first_success() {
        let order = vec![StrategyKind::Compute, StrategyKind::Dma, StrategyKind::Shadow];
        let mut attempted = Vec::new();
        let result = attempt_all(1, &order, |kind| {
            attempted.push(kind);
            if kind == StrategyKind::Dma {
                Ok(42)
            } else {
                Err(Error::AllStrategiesFailed(1))
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempted, vec![StrategyKind::Compute, StrategyKind::Dma]);
    }

    #[test]
    fn fold_falls_through_to_shadow_when_compute_and_dma_fail() {
        let order = decide_order(PREFERRED_ACCELERATOR, true);
        let mut attempted = Vec::new();
        let result: Result<&str> = attempt_all(1, &order, |kind| {
            attempted.push(kind);
            match kind {
                StrategyKind::Shadow => Ok("shadow-pattern"),
                _ => Err(Error::CapabilityUnavailable("simulated failure")),
            }
        });
        assert_eq!(result.unwrap(), "shadow-pattern");
        assert_eq!(attempted, order);
    }

    #[test]
    fn fold_reports_last_error_when_every_strategy_fails() {
        let order = vec![StrategyKind::Dma, StrategyKind::Shadow];
        let result: Result<()> = attempt_all(7, &order, |_| Err(Error::NoActiveFramebuffer));
        assert!(matches!(result, Err(Error::NoActiveFramebuffer)));
    }

    #[test]
    fn test_pattern_matches_gradient_formula() {
        let width = 8;
        let height = 8;
        let pitch = width * 4;
        let mut shadow = vec![0u8; pitch as usize * height as usize];
        fill_test_pattern(&mut shadow, width, height, pitch);

        let x = 3u32;
        let y = 5u32;
        let offset = (y * pitch + x * 4) as usize;
        let pixel = &shadow[offset..offset + 4];
        let expected_r = (x as u64 * 255 / width as u64) as u8;
        let expected_g = (y as u64 * 255 / height as u64) as u8;
        assert_eq!(pixel, &[128, expected_g, expected_r, 255]);
    }
}
