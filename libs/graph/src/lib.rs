//! Digital-twin graph store over PostgreSQL and Apache AGE.
//!
//! The crate is organized around three seams:
//!
//! - [`store`] — the Postgres/AGE adapter, the model catalog, and the
//!   twin/relationship data plane, all reachable through trait interfaces so
//!   callers never depend on the concrete store;
//! - [`query`] — the TDQL-to-Cypher translator and the paginated query
//!   executor with opaque continuation tokens;
//! - [`jobs`] — durable import and bulk-delete jobs with a distributed lock,
//!   heartbeat, and resumable checkpoints.

pub mod cache;
pub mod jobs;
pub mod query;
pub mod store;
