#![cfg_attr(
    not(test),
    warn(clippy::print_stdout, clippy::dbg_macro),
    deny(clippy::unwrap_used, clippy::expect_used)
)]

pub mod codec;
pub mod config;
pub mod keyspace;
pub mod pool;
pub mod runner;
pub mod sampler;
pub mod stats;
pub mod utils;
pub mod worker;
pub mod workload;
