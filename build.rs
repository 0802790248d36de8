// Build script to compile GLSL shaders to SPIR-V

use std::path::Path;
use std::process::Command;

const SHADERS: &[&str] = &["shaders/triangle.vert", "shaders/triangle.frag", "shaders/mesh.vert"];

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    // glslc ships with the Vulkan SDK
    for &input in SHADERS {
        compile_shader(input, &format!("{}.spv", input));
    }
}

fn compile_shader(input: &str, output: &str) {
    let input_path = Path::new(input);
    let output_path = Path::new(output);

    let result = Command::new("glslc")
        .arg(input_path)
        .arg("-o")
        .arg(output_path)
        .status();

    match result {
        Ok(status) if status.success() => {
            println!("cargo:rerun-if-changed={}", input);
        }
        Ok(status) => {
            panic!("Failed to compile {}: exit code {:?}", input, status.code());
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({}), {} was not compiled", e, input);
            println!("cargo:warning=compile manually: glslc {} -o {}", input, output);
        }
    }
}
