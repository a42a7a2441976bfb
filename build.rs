// Copyright 2026 strand developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

extern crate cc;

use std::env;
use std::path::PathBuf;

fn main() {
    let target: String = env::var("TARGET").unwrap();

    if target.contains("windows") {
        panic!("Unsupported platform: {}", target);
    }

    let (arch, abi) = match target.split('-').next().unwrap() {
        "x86_64" => ("x86_64", "sysv"),
        "arm64" | "aarch64" => ("arm64", "aapcs"),
        _ => {
            panic!("Unsupported architecture: {}", target);
        }
    };

    // The `.S` extension routes the files through the C preprocessor, which
    // takes care of the ELF vs Mach-O symbol decoration.
    let prefixes = ["jump", "make", "ontop"];
    let base_path: PathBuf = ["src", "asm"].iter().collect();
    let mut config = cc::Build::new();

    for prefix in prefixes.iter() {
        let file_name = [prefix, "_", arch, "_", abi, "_gas.S"].concat();

        let mut path = base_path.clone();
        path.push(file_name);
        config.file(path.to_str().unwrap());
    }

    config.compile("libstrand_fcontext.a");
}
