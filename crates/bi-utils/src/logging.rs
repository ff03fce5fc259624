//! Logging setup for the `biu` binary.
//!
//! The library only emits `tracing` events. [`init_logging`] installs a
//! stderr subscriber so that command output on stdout stays pipeable.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Database and AWS SDK targets that flood INFO.
const DRIVER_TARGETS: &[&str] = &["sqlx", "aws_config", "aws_smithy_runtime", "aws_sdk_s3"];

/// How much to log, from the `-q` and `-v` flags.
///
/// `-v` shows debug events of this crate and `-vv` trace events. Driver
/// targets stay at WARN until `-vvv`. `-q` wins over any `-v`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Verbosity {
    quiet: bool,
    verbose: u8,
}

impl Verbosity {
    /// `quiet` is the `-q` flag, `verbose` the number of `-v` flags.
    #[must_use]
    pub fn new(quiet: bool, verbose: u8) -> Self {
        Self { quiet, verbose }
    }

    /// Level of this crate's events.
    #[must_use]
    pub fn level(self) -> Level {
        match (self.quiet, self.verbose) {
            (true, _) => Level::ERROR,
            (false, 0) => Level::INFO,
            (false, 1) => Level::DEBUG,
            (false, _) => Level::TRACE,
        }
    }

    /// Level of the driver targets.
    #[must_use]
    pub fn driver_level(self) -> Level {
        match (self.quiet, self.verbose) {
            (true, _) => Level::ERROR,
            (false, 0..=2) => Level::WARN,
            (false, _) => Level::DEBUG,
        }
    }

    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    #[must_use]
    pub fn directives(self) -> String {
        let driver_level = self.driver_level();
        std::iter::once(format!("bi_utils={}", self.level()))
            .chain(DRIVER_TARGETS.iter().map(|target| format!("{target}={driver_level}")))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Install the global subscriber. `RUST_LOG` overrides `verbosity`.
///
/// ```no_run
/// use bi_utils::{init_logging, logging::Verbosity};
///
/// init_logging(Verbosity::new(false, 1));
/// ```
pub fn init_logging(verbosity: Verbosity) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.directives()));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true));

    // A host application may have installed one already
    let _ = subscriber.try_init();
}
