#![forbid(unsafe_code)]

mod error;

pub use error::*;

use std::time::Duration;

/// Timeout padrão de uma entrada quando nenhum é configurado.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Espera entre um pânico do scheduler e o reinício do loop.
pub const SCHEDULER_RESTART_BACKOFF: Duration = Duration::from_millis(50);

pub const DEFAULT_SOAK_THREADS: usize = 8;
pub const DEFAULT_SOAK_KEYS: u64 = 1_024;
pub const DEFAULT_SOAK_DURATION_MS: u64 = 2_000;
pub const DEFAULT_SOAK_TIMEOUT_MS: u64 = 50;
