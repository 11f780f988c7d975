//! Irrigation controller core: plant/pack knowledge base with its transfer
//! and streaming protocols, plus the multi-resolution environmental history.
//!
//! The binary in `main.rs` wires these together; everything here is usable
//! on its own so the protocols can be driven directly from tests.

pub mod config;
pub mod controller;
pub mod endpoints;
pub mod error;
pub mod history;
pub mod pack;
#[cfg(feature = "sim")]
pub mod sim;
pub mod state;
pub mod transport;
pub mod web;
pub mod wire;
