// Build script for rtview-renderer
// Compiles the HLSL ray tracing library to SPIR-V using dxc

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Shader libraries under shaders/, compiled as `lib_6_3`.
const LIBRARIES: [&str; 1] = ["raytracing.lib.hlsl"];

fn main() {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let shader_dir = manifest_dir.join("shaders");
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let spirv_dir = out_dir.join("spirv");

    println!("cargo:rerun-if-changed=shaders/");
    println!("cargo:rerun-if-env-changed=VULKAN_SDK");

    if !shader_dir.exists() {
        return;
    }

    fs::create_dir_all(&spirv_dir).unwrap();
    println!("cargo:rustc-env=RTVIEW_BUILT_SHADER_DIR={}", spirv_dir.display());

    let dxc = match find_dxc() {
        Some(path) => path,
        None => {
            println!("cargo:warning=dxc not found; set r_shaderdir to a directory holding raytracing.lib.spv");
            return;
        }
    };

    for filename in &LIBRARIES {
        let src_path = shader_dir.join(filename);
        let spv_path = spirv_dir.join(filename.replace(".hlsl", ".spv"));
        compile_library(&dxc, &src_path, &spv_path, filename);
        println!("cargo:rerun-if-changed=shaders/{filename}");
    }
}

/// Compile one shader library to SPIR-V. Failures are reported as warnings;
/// the viewer reports the missing library at startup.
fn compile_library(dxc: &Path, src_path: &Path, spv_path: &Path, filename: &str) -> bool {
    let output = Command::new(dxc)
        .args(["-T", "lib_6_3", "-spirv", "-fspv-target-env=vulkan1.2", "-fvk-use-scalar-layout", "-O3", "-Fo"])
        .arg(spv_path)
        .arg(src_path)
        .output();

    match output {
        Ok(result) if result.status.success() => true,
        Ok(result) => {
            let stderr = String::from_utf8_lossy(&result.stderr);
            println!("cargo:warning=dxc FAILED {filename}: {stderr}");
            false
        }
        Err(e) => {
            println!("cargo:warning=dxc: failed to run for {filename}: {e}");
            false
        }
    }
}

/// Find dxc: check PATH, then VULKAN_SDK/Bin/
fn find_dxc() -> Option<PathBuf> {
    if let Ok(output) = Command::new("dxc").arg("--version").output() {
        if output.status.success() {
            return Some(PathBuf::from("dxc"));
        }
    }

    if let Ok(sdk) = env::var("VULKAN_SDK") {
        for candidate in [["Bin", "dxc.exe"], ["bin", "dxc"]] {
            let path = PathBuf::from(&sdk).join(candidate[0]).join(candidate[1]);
            if path.exists() {
                return Some(path);
            }
        }
    }

    None
}
