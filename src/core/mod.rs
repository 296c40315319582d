//! Core runtime state: shadow memory, shared state and per-thread state.

pub(crate) mod global;
pub mod shadow;
pub(crate) mod tls;
