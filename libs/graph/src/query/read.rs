//! Paged query execution over the graph backend.
//!
//! Pages are fetched with server-side `SKIP`/`LIMIT` plus a one-row
//! look-ahead that decides whether a continuation token is emitted. Queries
//! with variable-length edge patterns bypass the injection — the backend's
//! `SKIP` interacts badly with variable-length expansion — and are fetched
//! eagerly, then sliced client-side.

use std::sync::LazyLock;

use error_stack::{Report, ResultExt as _};
use futures::{Stream, TryStreamExt as _, stream};
use regex::Regex;
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::{
    query::{
        cursor::ContinuationToken,
        translator::{self, has_variable_length_edges},
    },
    store::{
        AsClient, PostgresStore,
        error::QueryError,
        postgres::age::{self, AgRow, find_keyword},
    },
};

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// One page of query results.
#[derive(Debug)]
pub struct Page {
    pub values: Vec<JsonValue>,
    pub continuation_token: Option<String>,
}

static TRAILING_LIMIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s+LIMIT\s+(\d+)\s*$").unwrap_or_else(|_| unreachable!())
});
static TRAILING_SKIP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s+SKIP\s+(\d+)\s*$").unwrap_or_else(|_| unreachable!())
});

/// A query split into its body and trailing `SKIP`/`LIMIT`.
#[derive(Debug, PartialEq, Eq)]
struct PagedQuery {
    body: String,
    skip: u64,
    limit: Option<u64>,
}

/// Peels trailing `SKIP s LIMIT l` off a Cypher query.
fn split_skip_limit(query: &str) -> PagedQuery {
    let mut body = query.trim().to_owned();
    let mut limit = None;
    if let Some(captures) = TRAILING_LIMIT.captures(&body) {
        limit = captures.get(1).and_then(|digits| digits.as_str().parse().ok());
        let start = captures.get(0).map_or(0, |whole| whole.start());
        body.truncate(start);
    }
    let mut skip = 0;
    if let Some(captures) = TRAILING_SKIP.captures(&body) {
        skip = captures
            .get(1)
            .and_then(|digits| digits.as_str().parse().ok())
            .unwrap_or(0);
        let start = captures.get(0).map_or(0, |whole| whole.start());
        body.truncate(start);
    }
    PagedQuery { body, skip, limit }
}

fn row_to_value(row: AgRow) -> JsonValue {
    JsonValue::Object(row)
}

impl<C: AsClient> PostgresStore<C> {
    /// Resolves the query dialect by its leading keyword: `SELECT` is TDQL
    /// and goes through the translator, anything else is passed to the
    /// backend as-is.
    fn prepare_query(&self, query: &str) -> Result<String, Report<QueryError>> {
        let trimmed = query.trim();
        if find_keyword(trimmed, "SELECT") == Some(0) {
            translator::translate(trimmed, self.graph())
                .change_context(QueryError)
        } else {
            Ok(trimmed.to_owned())
        }
    }

    /// Runs a query and streams its rows lazily.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] when translation or execution fails.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn query(
        &self,
        query: &str,
    ) -> Result<impl Stream<Item = Result<JsonValue, Report<QueryError>>> + '_, Report<QueryError>>
    {
        let prepared = self.prepare_query(query)?;
        let rows = age::execute_cypher_stream(
            self.raw_client(),
            self.graph(),
            &prepared,
            &JsonMap::new(),
        )
        .await?;
        Ok(rows.map_ok(row_to_value))
    }

    /// Runs a query as a stream of pages with continuation tokens.
    ///
    /// The page size is `page_size_hint` capped by a remaining caller
    /// `LIMIT`; a continuation token on the last page of the stream lets the
    /// caller resume later with a fresh call.
    ///
    /// # Errors
    ///
    /// Items yield [`QueryError`] when execution fails; a malformed
    /// continuation token fails the first item.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn query_pages<'s>(
        &'s self,
        query: &str,
        continuation_token: Option<&str>,
        page_size_hint: Option<usize>,
    ) -> impl Stream<Item = Result<Page, Report<QueryError>>> + 's {
        let page_size = page_size_hint.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
        let start: Result<(String, u64), Report<QueryError>> = match continuation_token {
            Some(token) => ContinuationToken::decode(token)
                .map(|token| (token.query, token.offset))
                .change_context(QueryError),
            None => self.prepare_query(query).map(|prepared| (prepared, 0)),
        };

        stream::try_unfold(
            (start, false),
            move |(start, done)| async move {
                if done {
                    return Ok(None);
                }
                let (prepared, offset) = start?;
                let paged = split_skip_limit(&prepared);

                let (values, has_more) = if has_variable_length_edges(&paged.body) {
                    self.fetch_page_eager(&paged, offset, page_size).await?
                } else {
                    self.fetch_page(&paged, offset, page_size).await?
                };

                let returned = offset + values.len() as u64;
                let continuation_token = has_more.then(|| {
                    ContinuationToken {
                        query: prepared.clone(),
                        offset: returned,
                    }
                    .encode()
                });
                let page = Page {
                    values,
                    continuation_token,
                };
                Ok(Some((page, (Ok((prepared, returned)), !has_more))))
            },
        )
    }

    /// Server-side pagination: `SKIP (s + offset) LIMIT (page + 1)`.
    async fn fetch_page(
        &self,
        paged: &PagedQuery,
        offset: u64,
        page_size: usize,
    ) -> Result<(Vec<JsonValue>, bool), Report<QueryError>> {
        let effective = effective_page_size(paged.limit, offset, page_size);
        if effective == 0 {
            return Ok((Vec::new(), false));
        }
        let query = format!(
            "{} SKIP {} LIMIT {}",
            paged.body,
            paged.skip + offset,
            effective + 1
        );
        let mut rows = age::execute_cypher(
            self.raw_client(),
            self.graph(),
            &query,
            &JsonMap::new(),
        )
        .await?;

        let has_more = rows.len() > effective
            && paged
                .limit
                .is_none_or(|limit| offset + (effective as u64) < limit);
        rows.truncate(effective);
        Ok((rows.into_iter().map(row_to_value).collect(), has_more))
    }

    /// Client-side pagination for variable-length-edge queries: fetch
    /// everything, slice the requested window.
    async fn fetch_page_eager(
        &self,
        paged: &PagedQuery,
        offset: u64,
        page_size: usize,
    ) -> Result<(Vec<JsonValue>, bool), Report<QueryError>> {
        let effective = effective_page_size(paged.limit, offset, page_size);
        if effective == 0 {
            return Ok((Vec::new(), false));
        }
        let rows = age::execute_cypher(
            self.raw_client(),
            self.graph(),
            &paged.body,
            &JsonMap::new(),
        )
        .await?;

        let mut window: Vec<JsonValue> = rows
            .into_iter()
            .skip(usize::try_from(paged.skip + offset).unwrap_or(usize::MAX))
            .take(effective + 1)
            .map(row_to_value)
            .collect();
        let has_more = window.len() > effective;
        window.truncate(effective);
        Ok((window, has_more))
    }
}

/// `min(hint, remaining LIMIT)`, zero once a caller `LIMIT` is exhausted.
fn effective_page_size(limit: Option<u64>, offset: u64, page_size: usize) -> usize {
    match limit {
        Some(limit) => {
            let remaining = limit.saturating_sub(offset);
            usize::try_from(remaining.min(page_size as u64)).unwrap_or(page_size)
        }
        None => page_size,
    }
}
