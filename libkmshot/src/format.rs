//! Wire pixel-format registry and conversion to 24-bit RGB.
//!
//! `PixelFormat` is the wire format code a KMS framebuffer or an imported
//! image reports; [`convert_to_rgb24`] is the only place a tiled/linear
//! source buffer's bytes turn into the packed R,G,B raster the rest of the
//! crate works with.

use tracing::warn;

/// Recognized wire pixel formats, see the format table in the capture
/// design. Unknown fourccs are represented by [`PixelFormat::Unknown`]
/// rather than failing discovery outright — the orchestrator decides
/// whether an unrecognized format is fatal.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PixelFormat {
    Xrgb8888,
    Argb8888,
    Xbgr8888,
    Abgr8888,
    Rgb565,
    Abgr16161616,
    Unknown(u32),
}

impl PixelFormat {
    /// Bytes occupied by a single pixel in the source buffer.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Xrgb8888 | PixelFormat::Argb8888 => 4,
            PixelFormat::Xbgr8888 | PixelFormat::Abgr8888 => 4,
            PixelFormat::Rgb565 => 2,
            PixelFormat::Abgr16161616 => 8,
            PixelFormat::Unknown(_) => 0,
        }
    }

    pub fn is_hdr(self) -> bool {
        matches!(self, PixelFormat::Abgr16161616)
    }

    /// Map a little-endian DRM fourcc (as carried in a framebuffer
    /// descriptor) to the formats this crate understands.
    pub fn from_drm_fourcc(code: u32) -> PixelFormat {
        match drm_fourcc::DrmFourcc::try_from(code) {
            Ok(drm_fourcc::DrmFourcc::Xrgb8888) => PixelFormat::Xrgb8888,
            Ok(drm_fourcc::DrmFourcc::Argb8888) => PixelFormat::Argb8888,
            Ok(drm_fourcc::DrmFourcc::Xbgr8888) => PixelFormat::Xbgr8888,
            Ok(drm_fourcc::DrmFourcc::Abgr8888) => PixelFormat::Abgr8888,
            Ok(drm_fourcc::DrmFourcc::Rgb565) => PixelFormat::Rgb565,
            Ok(drm_fourcc::DrmFourcc::Abgr16161616) => PixelFormat::Abgr16161616,
            _ => PixelFormat::Unknown(code),
        }
    }
}

/// Convert a row-major source raster into a tightly packed `w*h*3` RGB24
/// raster.
///
/// `stride` is the number of bytes between the start of one source row and
/// the next; it may exceed `w * format.bytes_per_pixel()`, in which case the
/// trailing padding of each row is ignored. `dst` must be exactly
/// `w * h * 3` bytes.
///
/// Pure function: identical inputs produce identical output, and the
/// output never depends on the padding bytes past `w * bpp` in a row (both
/// load-bearing properties for the capture pipeline's fallback ladder,
/// where the same raster may be converted more than once).
pub fn convert_to_rgb24(src: &[u8], dst: &mut [u8], w: u32, h: u32, format: PixelFormat, stride: u32) {
    let (w, h, stride) = (w as usize, h as usize, stride as usize);
    debug_assert_eq!(dst.len(), w * h * 3);

    match format {
        PixelFormat::Xrgb8888 | PixelFormat::Argb8888 => {
            convert_rows(src, dst, w, h, stride, 4, |px| [px[2], px[1], px[0]])
        }
        PixelFormat::Xbgr8888 | PixelFormat::Abgr8888 => {
            convert_rows(src, dst, w, h, stride, 4, |px| [px[0], px[1], px[2]])
        }
        PixelFormat::Rgb565 => convert_rows(src, dst, w, h, stride, 2, |px| {
            let word = u16::from_le_bytes([px[0], px[1]]);
            let r5 = (word >> 11) & 0x1f;
            let g6 = (word >> 5) & 0x3f;
            let b5 = word & 0x1f;
            [
                ((r5 as u32 * 255 + 15) / 31) as u8,
                ((g6 as u32 * 255 + 31) / 63) as u8,
                ((b5 as u32 * 255 + 15) / 31) as u8,
            ]
        }),
        PixelFormat::Abgr16161616 => convert_rows(src, dst, w, h, stride, 8, |px| {
            [px[1], px[3], px[5]]
        }),
        PixelFormat::Unknown(code) => {
            warn!("\tunrecognized pixel format {code:#010x}; writing a zero-filled raster");
            dst.fill(0);
        }
    }
}

fn convert_rows<F>(src: &[u8], dst: &mut [u8], w: usize, h: usize, stride: usize, bpp: usize, pack: F)
where
    F: Fn(&[u8]) -> [u8; 3],
{
    for y in 0..h {
        let src_row_start = y * stride;
        let src_row = &src[src_row_start..src_row_start + w * bpp];
        let dst_row = &mut dst[y * w * 3..(y + 1) * w * 3];
        for x in 0..w {
            let px = &src_row[x * bpp..x * bpp + bpp];
            dst_row[x * 3..x * 3 + 3].copy_from_slice(&pack(px));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raster(w: u32, h: u32, stride: u32) -> usize {
        stride as usize * h as usize
    }

    #[test]
    fn argb8888_pixel_00rrggbb_roundtrips_to_rr_gg_bb() {
        let w = 1;
        let h = 1;
        let stride = 4;
        // Pack 0x00RRGGBB little-endian: bytes are B,G,R,X.
        let src = [0x33u8, 0x22, 0x11, 0x00];
        let mut dst = vec![0u8; w as usize * h as usize * 3];
        convert_to_rgb24(&src, &mut dst, w, h, PixelFormat::Argb8888, stride);
        assert_eq!(dst, [0x11, 0x22, 0x33]);
    }

    #[test]
    fn abgr8888_pixel_00rrggbb_roundtrips_to_bb_gg_rr() {
        let w = 1;
        let h = 1;
        let stride = 4;
        let src = [0x33u8, 0x22, 0x11, 0x00];
        let mut dst = vec![0u8; 3];
        convert_to_rgb24(&src, &mut dst, w, h, PixelFormat::Abgr8888, stride);
        assert_eq!(dst, [0x33, 0x22, 0x11]);
    }

    #[test]
    fn abgr16161616_takes_high_byte_of_each_channel() {
        let w = 1;
        let h = 1;
        let stride = 8;
        // R=0x1234, G=0x5678, B=0x9abc, A=0xffff, little-endian words.
        let src = [0x34u8, 0x12, 0x78, 0x56, 0xbc, 0x9a, 0xff, 0xff];
        let mut dst = vec![0u8; 3];
        convert_to_rgb24(&src, &mut dst, w, h, PixelFormat::Abgr16161616, stride);
        assert_eq!(dst, [0x12, 0x56, 0x9a]);
    }

    #[test]
    fn trailing_stride_padding_does_not_affect_output() {
        let w = 2;
        let h = 1;
        let stride = 16; // way more than w*bpp=8
        let mut src = vec![0u8; raster(w, h, stride)];
        src[0..4].copy_from_slice(&[1, 2, 3, 0]);
        src[4..8].copy_from_slice(&[4, 5, 6, 0]);
        // garbage past the live row
        for (i, b) in src[8..16].iter_mut().enumerate() {
            *b = 0xAA ^ i as u8;
        }
        let mut dst_a = vec![0u8; w as usize * h as usize * 3];
        convert_to_rgb24(&src, &mut dst_a, w, h, PixelFormat::Xrgb8888, stride);

        let mut src_b = src.clone();
        src_b[8..16].copy_from_slice(&[0u8; 8]);
        let mut dst_b = vec![0u8; w as usize * h as usize * 3];
        convert_to_rgb24(&src_b, &mut dst_b, w, h, PixelFormat::Xrgb8888, stride);

        assert_eq!(dst_a, dst_b);
    }

    #[test]
    fn conversion_is_pure() {
        let w = 4;
        let h = 4;
        let stride = 16;
        let src: Vec<u8> = (0..raster(w, h, stride)).map(|i| (i * 7) as u8).collect();
        let mut a = vec![0u8; w as usize * h as usize * 3];
        let mut b = vec![0u8; w as usize * h as usize * 3];
        convert_to_rgb24(&src, &mut a, w, h, PixelFormat::Xbgr8888, stride);
        convert_to_rgb24(&src, &mut b, w, h, PixelFormat::Xbgr8888, stride);
        assert_eq!(a, b);
    }

    #[test]
    fn unrecognized_format_is_zero_filled() {
        let mut dst = vec![0xFFu8; 12];
        convert_to_rgb24(&[0u8; 64], &mut dst, 2, 2, PixelFormat::Unknown(0xdead_beef), 8);
        assert_eq!(dst, [0u8; 12]);
    }
}
