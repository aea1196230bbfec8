//! Domain types and eligibility rules for escrow holds and disputes.
//!
//! Nothing in this crate performs I/O; the storage crate persists these
//! types and the app crate drives the batch engines over them.

pub mod policy;
pub mod types;

pub use policy::EscrowPolicy;
