//! Opaque continuation tokens for paged queries.
//!
//! A token is the original query plus the cumulative offset, serialized and
//! base64-encoded. It is opaque but unsigned; binding it to a caller's
//! session is the hosting layer's concern.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use error_stack::{Report, ResultExt as _};
use serde::{Deserialize, Serialize};

use crate::store::error::ArgumentError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuationToken {
    /// The query the token continues, exactly as prepared for execution.
    pub query: String,
    /// Rows already returned to the caller.
    pub offset: u64,
}

impl ContinuationToken {
    #[must_use]
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(self).unwrap_or_default())
    }

    /// # Errors
    ///
    /// Returns [`ArgumentError`] when the token is not one of ours.
    pub fn decode(token: &str) -> Result<Self, Report<ArgumentError>> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .change_context(ArgumentError::new("malformed continuation token"))?;
        serde_json::from_slice(&bytes)
            .change_context(ArgumentError::new("malformed continuation token"))
    }
}
