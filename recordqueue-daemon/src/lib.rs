//! The record queue daemon.
//!
//! This builds on top of [`recordqueue_storage`] and runs the durable queues as a standalone
//! process. Upload batches are written into a spool directory, records can be fed through standard
//! input, and the `inspect` command reports what is stored on disk.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod cli;
pub mod config;
pub mod daemon;
pub mod inspect;
pub mod observability;
pub mod producer;
pub mod spool;
