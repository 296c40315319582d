//! Small helpers shared by the allocator and shadow code.

pub(crate) mod layout;
pub(crate) mod size;
