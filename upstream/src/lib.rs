//! Request orchestration for the upstream novel API: signed and throttled
//! HTTP access, device-pool rotation on risk control, the two-phase search
//! protocol, keyed chapter decryption, and bucketed chapter prefetching.

pub mod cache;
pub mod client;
pub mod config;
pub mod device;
pub mod errors;
pub mod keys;
pub mod metrics_defs;
pub mod prefetch;
pub mod rate_limit;
pub mod restart;
pub mod rotation;
pub mod search;
pub mod signing;
pub mod single_flight;
pub mod types;

#[cfg(test)]
mod testutils;
