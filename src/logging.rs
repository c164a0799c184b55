//! Logging setup for the layout passes
//!
//! Everything in the crate logs through the `log` facade; these helpers
//! install an `env_logger` backend for binaries and tests that do not
//! bring their own.
//!
//! The passes use the levels as follows: `warn!` for suspicious profile
//! data or refused transformations, `info!` for per-pass summaries,
//! `debug!` for individual layout decisions (seed selection, rotations,
//! connections), and `trace!` for heap key churn and per-edge filtering.
//!
//! Verbosity is controlled through `RUST_LOG`, optionally per module:
//!
//! ```bash
//! RUST_LOG=bblayout=debug ...
//! RUST_LOG=bblayout::layout::trace=trace ...
//! ```

use log::LevelFilter;
use std::io::Write;

fn backend(level: Option<LevelFilter>) -> env_logger::Builder {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if let Some(level) = level {
        builder.filter_level(level);
    }
    builder.format(|out, record| {
        writeln!(
            out,
            "{:>5} [{}] {}",
            record.level(),
            record.target(),
            record.args()
        )
    });
    builder
}

/// Install the default backend: `RUST_LOG` decides verbosity, warnings
/// only when it is unset.
///
/// Safe to call more than once; an already-installed logger stays in
/// place.
pub fn init() {
    let _ = backend(None).try_init();
}

/// Install the backend at a fixed verbosity, ignoring `RUST_LOG`.
pub fn init_with_level(level: LevelFilter) {
    let _ = backend(Some(level)).try_init();
}

/// Backend for unit and integration tests: output is captured per test
/// and stays quiet unless `RUST_LOG` asks for more.
pub fn init_test() {
    let mut builder = backend(None);
    builder.is_test(true);
    let _ = builder.try_init();
}
