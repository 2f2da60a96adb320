//! Shared domain types for the twin-graph service.
//!
//! This crate carries everything both the store layer and the job executors
//! need to agree on: DTMI identifiers, the parsed DTDL model surface, twin
//! and relationship documents, and the durable job records. It is free of
//! I/O so the translator and validators can be tested as pure functions.

pub mod dtmi;
pub mod job;
pub mod model;
pub mod relationship;
pub mod twin;

pub use self::{
    dtmi::{Dtmi, InvalidDtmi},
    model::{
        DtdlContent, DtdlInterface, DtdlParseError, DtdlSchema, FlattenedModel, ModelRecord,
        PrimitiveSchema, compute_bases, flatten_contents, flatten_raw_contents,
    },
    relationship::BasicRelationship,
    twin::{DigitalTwin, Etag},
};

/// Upper bound on the number of elements accepted by a single batch call.
pub const MAX_BATCH_SIZE: usize = 100;
