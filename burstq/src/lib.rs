//! Burst-oriented DMA queue runtime.
//!
//! `burstq` drains or fills a fixed set of device DMA queues, one worker
//! thread per queue, through a zero-copy burst protocol:
//!
//! - [`device`]: collaborator traits for devices, control components and
//!   queue channels, plus an in-memory device ([`device::sim`]).
//! - [`queue`]: queue lifecycle and the burst acquire/release guards.
//! - [`ring`]: the batched SPSC slot ring backing the in-memory device.
//! - [`runtime`]: receive/transmit workers, backoff, CPU placement and the
//!   [`Coordinator`](runtime::Coordinator).
//! - [`config`]: run configuration with TOML loading.
//! - [`io`]: per-queue sinks and packet sources.

// Some bindings only feed log macros, which compile to nothing without the
// `tracing` feature.
#![cfg_attr(not(feature = "tracing"), allow(unused_variables))]

pub mod config;
pub mod device;
pub mod io;
pub mod queue;
pub mod ring;
pub mod runtime;
mod trace;

pub use trace::init_tracing;
