// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Build script for the EL3 monitor.

use std::env;

/// Platforms the monitor can be built for.
const PLATFORMS: [&str; 1] = ["qemu"];

/// Load address and maximum size of the monitor image on each platform.
fn image_region(platform: &str) -> (u64, u64) {
    match platform {
        "qemu" => (0x0e09_0000, 0x0007_0000),
        _ => unreachable!("Unknown platform {platform}"),
    }
}

fn setup_linker(platform: &str) {
    let (base, size) = image_region(platform);
    println!("cargo:rustc-link-arg=--defsym=MONITOR_BASE={base}");
    println!("cargo:rustc-link-arg=--defsym=MONITOR_SIZE={size}");

    println!("cargo:rustc-link-arg=-Tmonitor.ld");
    println!("cargo:rerun-if-changed=monitor.ld");
}

fn main() {
    println!(
        "cargo::rustc-check-cfg=cfg(platform, values(\"{}\"))",
        PLATFORMS.join("\", \""),
    );
    println!("cargo:rerun-if-env-changed=PLATFORM");
    println!("cargo:rerun-if-env-changed=LOG_LEVEL");

    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("none") {
        let platform = env::var("CARGO_CFG_PLATFORM")
            .or_else(|_| env::var("PLATFORM"))
            .unwrap_or_else(|_| PLATFORMS[0].to_owned());
        assert!(
            PLATFORMS.contains(&platform.as_str()),
            "Unknown platform {platform}"
        );
        if env::var("CARGO_CFG_PLATFORM").is_err() {
            println!("cargo::rustc-cfg=platform=\"{platform}\"");
        }

        setup_linker(&platform);
    }
}
