//! Guest dirty page rate estimation.
//!
//! The rate is estimated without dirty tracking: a random subset of guest
//! pages is hashed, hashed again after a time window, and the fraction of
//! changed hashes is scaled up to the size of guest memory.

mod config;
mod error;
mod round;
mod sampler;
mod stat;

pub use self::{
    config::SamplerConfig,
    error::SamplingError,
    round::{SampledPage, SamplingRound, page_hash},
    sampler::Sampler,
    stat::{CalcState, DirtyRateInfo, DirtyRateStat},
};
