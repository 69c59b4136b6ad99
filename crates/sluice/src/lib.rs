//! Change-data-capture staging and sequencing engine.
//!
//! Row mutations arrive from an upstream source keyed by hybrid logical
//! clock timestamps, are durably staged per target table, and are applied
//! to the target under a selectable ordering discipline. The interesting
//! pieces:
//!
//! - [`staging`]: the durable, idempotent mutation store and its
//!   per-target [`staging::Stager`] lifecycle
//! - [`sequencer`]: the pluggable family of apply disciplines, from
//!   pass-through to strictly serialized
//! - [`resolve`]: resolved-timestamp checkpoints that gate how far
//!   sequencers may drain
//! - [`script`]: user-supplied transformations that rewrite and route
//!   mutations before they land
//!
//! Target databases sit behind [`types::Applier`]; the staging database
//! sits behind [`staging::store::StagingStore`].

pub mod batches;
pub mod leases;
pub mod msort;
pub mod resolve;
pub mod retry;
pub mod script;
pub mod sequencer;
pub mod staging;
pub mod types;

pub use sluice_base::{hlc, ident, notify, stopper, stopvar};
