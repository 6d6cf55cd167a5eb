// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Log initialization.
//!
//! The library only emits records through the `log` facade. Embedders that have no logger of
//! their own call [`init`], which installs an `env_logger` writing to stderr and honoring
//! `RUST_LOG` (default level `info`).

use std::io::Write;
use std::sync::OnceLock;

static INIT: OnceLock<Result<(), String>> = OnceLock::new();

/// Installs the process logger. Calls after the first return the first call's result.
pub fn init() -> Result<(), String> {
    INIT.get_or_init(|| {
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.format(|buf, record| {
            write!(buf, "[{}", record.level())?;
            if let Some(path) = record.file() {
                write!(buf, " {}", path)?;
                if let Some(line) = record.line() {
                    write!(buf, ":{}", line)?;
                }
            }
            writeln!(buf, "] {}", record.args())
        });
        builder.try_init().map_err(|e| e.to_string())
    })
    .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice() {
        let first = init();
        assert_eq!(init(), first);
        log::info!("logger ready");
    }
}
