//! A lock-free split-ordered hash list with hazard-pointer memory
//! reclamation.
//!
//! The crate has two layers. The reclamation layer ([`Domain`],
//! [`HazardContext`]) lets concurrent readers dereference pointers into
//! shared structures while other threads unlink and eventually free nodes,
//! without anyone observing freed memory. The container layer ([`SoList`],
//! [`SolAccessor`]) is a hash table realised as a single sorted linked list
//! over bit-reversed keys, so it grows by splitting buckets instead of
//! rehashing.

#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod accessor;
mod chunk;
mod context;
mod domain;
mod mark;
mod snapshot;
mod solist;
mod sync;

pub use accessor::SolAccessor;
pub use context::HazardContext;
pub use domain::Domain;
pub use solist::{Hash, SoList};
