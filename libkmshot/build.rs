//! Compiles the HDR tone-mapping compute kernel from GLSL to SPIR-V.
//!
//! The checked-in `.comp` source is the input artifact, the baked byte
//! array consumed via `include_bytes!` is the output. Uses `shaderc`
//! (glslang's Rust binding) rather than shipping a pre-compiled `.spv`
//! so the shader source stays readable and diffable.

use std::env;
use std::path::PathBuf;

fn main() -> eyre::Result<()> {
    let shader_path = "shaders/tonemap.comp";
    println!("cargo:rerun-if-changed={shader_path}");

    let source = std::fs::read_to_string(shader_path)?;
    let compiler = shaderc::Compiler::new().ok_or_else(|| eyre::eyre!("shaderc compiler unavailable"))?;
    let mut options = shaderc::CompileOptions::new()
        .ok_or_else(|| eyre::eyre!("shaderc compile options unavailable"))?;
    options.set_optimization_level(shaderc::OptimizationLevel::Performance);

    let artifact = compiler.compile_into_spirv(
        &source,
        shaderc::ShaderKind::Compute,
        shader_path,
        "main",
        Some(&options),
    )?;

    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    std::fs::write(out_dir.join("tonemap.spv"), artifact.as_binary_u8())?;

    Ok(())
}
