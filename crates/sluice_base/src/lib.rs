//! Foundation types for the sluice replication pipeline.
//!
//! This crate is kept small and dependency-light (like a utility layer
//! should be): hybrid logical clock timestamps, case-folded identifiers,
//! observable variables, and cooperative lifecycle scopes. The engine crate
//! builds the staging and sequencing machinery on top of these.

pub mod hlc;
pub mod ident;
pub mod notify;
pub mod stopper;
pub mod stopvar;
