//! Allocation backends.
//!
//! The native heap interface, the default system heap, and the proxy that
//! decorates it with redzones and a quarantine.

pub(crate) mod block;
pub(crate) mod deferred;
pub(crate) mod heap;
pub(crate) mod native;
pub(crate) mod proxy;
pub(crate) mod quarantine;
