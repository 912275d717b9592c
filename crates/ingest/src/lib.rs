//! Object intake and the record store.
//!
//! Uploaded batch objects land in the object store and announce themselves on
//! the object-events queue. The ingest worker turns each object into records,
//! and every record insert appends an entry to the change stream the fanout
//! stage consumes.

pub mod deserializer;
pub mod intake;
pub mod memory;
pub mod object_store;
pub mod record_store;
pub mod service;
pub mod worker;
