#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Discovery servers that hand published snapshots to proxies.

pub mod ads;
mod encode;
pub mod gateway;
pub mod metrics;

pub use self::{ads::AdsServer, encode::encode, gateway::Gateway};
