//! Remote state identity
//!
//! Derives the canonical key of the persisted state object a module mutates.

pub mod identity;

pub use identity::RemoteStateIdentity;
