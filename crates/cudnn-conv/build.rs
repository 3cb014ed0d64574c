//! Build script: library search paths for libcudart and libcudnn.
//!
//! Only does work with the `cuda` feature. Without it the crate builds on any
//! machine and `SimDevice` is the only device.
//!
//! # Environment Variables
//!
//! - `CUDA_PATH`: CUDA toolkit root (default `/usr/local/cuda`)
//! - `CUDNN_PATH`: cuDNN install root, when not inside the toolkit

use std::env;
use std::path::{Path, PathBuf};

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=CUDA_PATH");
    println!("cargo:rerun-if-env-changed=CUDNN_PATH");

    if env::var_os("CARGO_FEATURE_CUDA").is_none() {
        return;
    }

    let cuda_root = env::var("CUDA_PATH").unwrap_or_else(|_| "/usr/local/cuda".to_string());
    emit_search_paths(&PathBuf::from(cuda_root));

    if let Ok(cudnn_root) = env::var("CUDNN_PATH") {
        emit_search_paths(&PathBuf::from(cudnn_root));
    }
}

fn emit_search_paths(root: &Path) {
    for sub in ["lib64", "lib", "lib/x64"] {
        let dir = root.join(sub);
        if dir.is_dir() {
            println!("cargo:rustc-link-search=native={}", dir.display());
        }
    }
}
