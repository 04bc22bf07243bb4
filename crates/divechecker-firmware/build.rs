//! Bakes the ECDSA signing key into the image.
//!
//! `DIVECHECKER_PRIVATE_KEY` (64 hex digits) is taken from the environment or
//! a `.env` file next to the workspace. Without it the all-zero placeholder is
//! compiled in and the device refuses to sign.

use std::env;
use std::fs;
use std::path::PathBuf;

const KEY_VAR: &str = "DIVECHECKER_PRIVATE_KEY";

fn parse_key(hex: &str) -> Option<[u8; 32]> {
    let hex = hex.trim();
    if hex.len() != 64 {
        return None;
    }
    let mut key = [0u8; 32];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(hex.get(2 * i..2 * i + 2)?, 16).ok()?;
    }
    Some(key)
}

fn main() {
    println!("cargo:rerun-if-env-changed={KEY_VAR}");
    if let Ok(path) = dotenvy::dotenv() {
        println!("cargo:rerun-if-changed={}", path.display());
    }

    let key = match env::var(KEY_VAR) {
        Ok(hex) => parse_key(&hex).unwrap_or_else(|| {
            panic!("{KEY_VAR} must be exactly 64 hex digits");
        }),
        Err(_) => {
            println!("cargo:warning={KEY_VAR} not set; building with the placeholder key");
            [0u8; 32]
        }
    };

    let out = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    let body = format!("pub const DEVICE_PRIVATE_KEY: [u8; 32] = {key:?};\n");
    fs::write(out.join("device_key.rs"), body).expect("write device_key.rs");

    println!("cargo:rustc-link-arg=-Tlinkall.x");
}
