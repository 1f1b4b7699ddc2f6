#![allow(clippy::result_large_err)]

pub mod adapter;
pub mod backpressure;
pub mod channel;
pub mod config;
pub mod connector;
pub mod error;
pub mod health;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod resource;
pub mod retry;
pub mod telemetry;
pub mod transform;
