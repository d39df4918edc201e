use std::io;
use std::path::PathBuf;

use clap::Parser;
use eyre::{eyre, Result};
use tracing::info;

mod cli;
mod config;

use cli::Cli;
use config::Config;

const DEFAULT_DEVICE: &str = "/dev/dri/card1";
const DEFAULT_OUTPUT: &str = "screenshot.ppm";
const DEFAULT_EXPOSURE: f32 = 1.0;
const DEFAULT_TONEMAP: u32 = 2;

/// Resolved device/output/exposure/tonemap/fb knobs, CLI flags winning
/// over whatever `~/.config/kmshot/config.toml` supplied.
struct CaptureConfig {
    device: PathBuf,
    output: PathBuf,
    fb: u32,
    exposure: f32,
    tonemap: u32,
    list: bool,
}

impl CaptureConfig {
    fn merge(cli: Cli, config: Config) -> CaptureConfig {
        CaptureConfig {
            device: cli.device.or_else(|| config.device_path()).unwrap_or_else(|| PathBuf::from(DEFAULT_DEVICE)),
            output: cli.output.or_else(|| config.output_path()).unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT)),
            fb: cli.fb.unwrap_or(0),
            exposure: cli.exposure.or(config.exposure).unwrap_or(DEFAULT_EXPOSURE),
            tonemap: cli.tonemap.or(config.tonemap).unwrap_or(DEFAULT_TONEMAP),
            list: cli.list,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_writer(io::stderr).init();

    // clap exits 2 on its own for bad args; this tool's exit codes are
    // 0 for --help/--version and 1 for every other failure, so parsing
    // is handled manually instead of via `Cli::parse()`.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if err.kind() == clap::error::ErrorKind::DisplayHelp || err.kind() == clap::error::ErrorKind::DisplayVersion => {
            print!("{err}");
            return Ok(());
        }
        Err(err) => {
            eprint!("{err}");
            std::process::exit(1);
        }
    };

    if !rustix::process::getuid().is_root() {
        return Err(eyre!("kmshot must run as root (uid 0) to access KMS/DRM devices"));
    }

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path);
    let capture_config = CaptureConfig::merge(cli, config);

    if capture_config.list {
        return run_list(&capture_config);
    }

    run_capture(&capture_config)
}

fn run_list(config: &CaptureConfig) -> Result<()> {
    let planes = libkmshot::list(&config.device)?;
    for plane in planes {
        if plane.fb_id == 0 {
            println!("plane {}: (unbound)", plane.plane_id);
            continue;
        }
        let legacy = if plane.legacy_only { " (legacy FB1)" } else { "" };
        println!(
            "plane {}: fb {} {}x{} {:?}{legacy}",
            plane.plane_id, plane.fb_id, plane.width, plane.height, plane.format
        );
    }
    Ok(())
}

fn run_capture(config: &CaptureConfig) -> Result<()> {
    let params = libkmshot::tonemap::validated_params(config.exposure, config.tonemap)?;

    let (rgb, width, height) = libkmshot::capture(&config.device, config.fb, params)?;
    libkmshot::image_writer::write_ppm(&config.output, width, height, &rgb)?;

    info!("wrote {width}x{height} to {}", config.output.display());
    Ok(())
}
