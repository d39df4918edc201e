use std::path::PathBuf;

use clap::Parser;

/// Capture the currently-scanned-out display image from a KMS device.
#[derive(Parser, Debug)]
#[command(name = "kmshot", version, about)]
pub struct Cli {
    /// List planes and their bound framebuffers, then exit.
    #[arg(long)]
    pub list: bool,

    /// DRM character device.
    #[arg(long)]
    pub device: Option<PathBuf>,

    /// Output path.
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Numeric framebuffer id; 0 = auto-detect primary.
    #[arg(long)]
    pub fb: Option<u32>,

    /// HDR exposure multiplier; must be > 0.
    #[arg(long)]
    pub exposure: Option<f32>,

    /// Tone-map mode, 0..=7.
    #[arg(long)]
    pub tonemap: Option<u32>,

    /// Config file path; defaults to `~/.config/kmshot/config.toml`.
    #[arg(long)]
    pub config: Option<PathBuf>,
}
