//! Per-vCPU dirty page rate limiting.
//!
//! A vCPU that dirties memory faster than its quota is slowed down: every
//! time its dirty ring fills up, it sleeps for a throttle time that a
//! feedback loop adjusts once per period from the measured rate.

mod config;
mod controller;
mod limit;
mod rate;
mod state;

pub use self::{
    config::DirtyLimitConfig,
    controller::ThrottleController,
    limit::DirtyLimit,
    rate::{SampledVcpuRate, VcpuMemory, VcpuRateSource},
    state::{DirtyLimitInfo, VcpuDirtyLimitState},
};
