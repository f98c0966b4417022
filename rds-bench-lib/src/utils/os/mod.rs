use crate::config::Config;

#[cfg(target_family = "unix")]
mod unix;

#[cfg(target_family = "unix")]
pub use self::unix::{raise_nofile, rlim_t};

/// Descriptors kept free for stdio, log files and the runtime itself.
const RESERVED_DESCRIPTORS: u64 = 64;

/// Number of open file descriptors a run needs when every pool is full.
pub fn required_nofile(config: &Config) -> u64 {
    let general = config.general();
    (general.clients as u64)
        .saturating_mul(general.poolsize as u64)
        .saturating_mul(config.endpoints().len().max(1) as u64)
        .saturating_add(RESERVED_DESCRIPTORS)
}
