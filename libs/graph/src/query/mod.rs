//! Query translation and paged execution.

pub mod cursor;
mod read;
pub mod translator;

pub use self::{
    cursor::ContinuationToken,
    read::{DEFAULT_PAGE_SIZE, Page},
    translator::{TranslationError, has_variable_length_edges, translate},
};
