//! Build script — emit native link flags for the `x11-grab` feature.
//!
//! The default build carries no native dependencies; the X11/GLX capture
//! backend is only linked when explicitly requested.

use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=X11_LIB_DIR");

    if env::var_os("CARGO_FEATURE_X11_GRAB").is_none() {
        return;
    }

    if let Some(dir) = env::var_os("X11_LIB_DIR") {
        let dir = PathBuf::from(dir);
        if !dir.exists() {
            panic!("X11_LIB_DIR set but not found at {}", dir.display());
        }
        println!("cargo:rustc-link-search=native={}", dir.display());
    }

    println!("cargo:rustc-link-lib=dylib=X11");
    println!("cargo:rustc-link-lib=dylib=Xcomposite");
    println!("cargo:rustc-link-lib=dylib=GL");
}
