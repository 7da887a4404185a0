//! Cycle-level behavioral model of the trusted communication unit (TCU) of a
//! tiled manycore system.
//!
//! Each tile pairs a TCU with local memory; the TCU mediates all off-tile
//! traffic: credit-based inter-tile messaging through typed endpoints,
//! remote DMA through memory endpoints, and cache-to-memory forwarding. The
//! [`sim`] module provides the discrete-event harness the TCUs run in.

#[macro_use]
extern crate log;

pub mod config;
pub mod sim;
pub mod tcu;
