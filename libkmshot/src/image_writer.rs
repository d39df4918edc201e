//! Portable bitmap ("P6") serialization.
//!
//! Deliberately hand-rolled rather than routed through a general image
//! crate: the output contract is a single fixed container (binary PPM),
//! so there is no format-negotiation surface worth a dependency for.

use std::io::{self, Write};
use std::path::Path;

use crate::error::{Error, Result};

/// Write a linear RGB raster (`w*h*3` bytes, row-major, 8-bit per channel)
/// as a binary PPM file.
///
/// The header is exactly `P6\n<w> <h>\n255\n` per the external interface
/// contract; no trailing newline or comment is inserted.
pub fn write_ppm(path: &Path, width: u32, height: u32, rgb: &[u8]) -> Result<()> {
    debug_assert_eq!(rgb.len(), width as usize * height as usize * 3);

    let file = std::fs::File::create(path).map_err(|source| Error::HostIo {
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = io::BufWriter::new(file);
    write_ppm_to(&mut writer, width, height, rgb).map_err(|source| Error::HostIo {
        path: path.to_path_buf(),
        source,
    })?;
    writer.flush().map_err(|source| Error::HostIo {
        path: path.to_path_buf(),
        source,
    })
}

fn write_ppm_to<W: Write>(writer: &mut W, width: u32, height: u32, rgb: &[u8]) -> io::Result<()> {
    write!(writer, "P6\n{width} {height}\n255\n")?;
    writer.write_all(rgb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_matches_the_required_three_lines() {
        let mut buf = Vec::new();
        write_ppm_to(&mut buf, 8, 8, &[0u8; 8 * 8 * 3]).unwrap();
        assert!(buf.starts_with(b"P6\n8 8\n255\n"));
        assert_eq!(buf.len(), b"P6\n8 8\n255\n".len() + 8 * 8 * 3);
    }
}
