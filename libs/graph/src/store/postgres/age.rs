//! Low-level access to the Apache AGE property-graph extension.
//!
//! AGE's `cypher()` table function cannot take the graph name or the query
//! text as bind parameters, so the SQL is assembled textually with strict
//! quoting and the caller-supplied parameter map is inlined as an `agtype`
//! literal. Result columns are declared `agtype` and cast to `text`, then
//! decoded into JSON values.

use std::collections::BTreeMap;

use error_stack::{Report, ResultExt as _};
use futures::{Stream, TryStreamExt as _};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tokio_postgres::GenericClient;

use crate::store::error::{ArgumentError, QueryError};

/// A validated tenant graph name.
///
/// The name doubles as the Postgres schema holding the graph's label tables
/// and helper routines, so it is restricted to short lowercase identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphName(String);

impl GraphName {
    /// # Errors
    ///
    /// Returns [`ArgumentError`] when the name is not a lowercase identifier
    /// of at most 48 characters.
    pub fn new(name: impl Into<String>) -> Result<Self, Report<ArgumentError>> {
        let name = name.into();
        let mut chars = name.chars();
        let valid = match chars.next() {
            Some(first) if first.is_ascii_lowercase() || first == '_' => chars
                .all(|char| char.is_ascii_lowercase() || char.is_ascii_digit() || char == '_'),
            _ => false,
        };
        if !valid || name.len() > 48 {
            return Err(Report::new(ArgumentError::new(format!(
                "`{name}` is not a valid graph name; expected a lowercase identifier of at most \
                 48 characters"
            ))));
        }
        Ok(Self(name))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The schema holding job records, locks, and checkpoints.
    #[must_use]
    pub fn jobs_schema(&self) -> String {
        format!("{}_jobs", self.0)
    }
}

impl core::fmt::Display for GraphName {
    fn fmt(&self, fmt: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        fmt.write_str(&self.0)
    }
}

/// Quotes an SQL identifier.
#[must_use]
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quotes an SQL string literal. NUL bytes are stripped; they cannot occur
/// in Postgres text values.
#[must_use]
pub(crate) fn quote_literal(literal: &str) -> String {
    format!("'{}'", literal.replace('\0', "").replace('\'', "''"))
}

/// Picks a dollar-quote tag that does not collide with the query body.
fn dollar_tag(body: &str) -> String {
    let mut tag = "$q$".to_owned();
    let mut counter = 0_u32;
    while body.contains(&tag) {
        counter += 1;
        tag = format!("$q{counter}$");
    }
    tag
}

/// One decoded result row: projection name to JSON value.
pub type AgRow = JsonMap<String, JsonValue>;

/// Extracts the projection names of a Cypher query's `RETURN` clause.
///
/// `RETURN *` is resolved against the variables bound in `MATCH` patterns.
/// Names are display names; the generated SQL aliases columns positionally.
#[must_use]
pub(crate) fn return_columns(cypher: &str) -> Vec<String> {
    let Some(return_at) = find_keyword(cypher, "RETURN") else {
        return Vec::new();
    };
    let mut projection = &cypher[return_at + "RETURN".len()..];
    for terminator in ["ORDER BY", "SKIP", "LIMIT"] {
        if let Some(position) = find_keyword(projection, terminator) {
            projection = &projection[..position];
        }
    }
    let projection = projection.trim();

    if projection == "*" {
        return pattern_variables(&cypher[..return_at]);
    }

    split_top_level(projection, ',')
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let item = item.trim();
            if let Some(alias_at) = find_keyword(item, "AS") {
                return item[alias_at + 2..].trim().to_owned();
            }
            if item
                .chars()
                .all(|char| char.is_ascii_alphanumeric() || char == '_')
                && !item.is_empty()
            {
                return item.to_owned();
            }
            let cleaned: String = item
                .chars()
                .map(|char| match char {
                    '[' | ']' | '\'' | '"' | '(' | ')' | ' ' => '\0',
                    '.' => '.',
                    other => other,
                })
                .filter(|char| *char != '\0')
                .collect();
            if cleaned.is_empty() {
                format!("column{index}")
            } else {
                cleaned
            }
        })
        .collect()
}

/// Variables bound by node or edge patterns in `MATCH` clauses, in order of
/// appearance.
fn pattern_variables(clause: &str) -> Vec<String> {
    let mut variables = Vec::new();
    let mut remaining = clause;
    while let Some(match_at) = find_keyword(remaining, "MATCH") {
        let after = &remaining[match_at + "MATCH".len()..];
        let end = ["WHERE", "WITH", "MATCH", "RETURN"]
            .iter()
            .filter_map(|terminator| find_keyword(after, terminator))
            .min()
            .unwrap_or(after.len());
        collect_pattern_variables(&after[..end], &mut variables);
        remaining = &after[end..];
    }
    variables
}

fn collect_pattern_variables(pattern: &str, variables: &mut Vec<String>) {
    let mut in_string = false;
    for (index, char) in pattern.char_indices() {
        if char == '\'' {
            in_string = !in_string;
        } else if !in_string && (char == '(' || char == '[') {
            let name: String = pattern[index + 1..]
                .chars()
                .take_while(|char| char.is_ascii_alphanumeric() || *char == '_')
                .collect();
            if !name.is_empty() && !variables.contains(&name) {
                variables.push(name);
            }
        }
    }
}

/// Case-insensitive keyword search outside single-quoted strings.
pub(crate) fn find_keyword(haystack: &str, keyword: &str) -> Option<usize> {
    let upper = haystack.to_ascii_uppercase();
    let keyword = keyword.to_ascii_uppercase();
    let mut in_string = false;
    let mut search_from = 0;
    while let Some(relative) = upper[search_from..].find(&keyword) {
        let position = search_from + relative;
        for byte in haystack[search_from..position].bytes() {
            if byte == b'\'' {
                in_string = !in_string;
            }
        }
        if !in_string && is_word_boundary(haystack, position, keyword.len()) {
            return Some(position);
        }
        search_from = position + keyword.len();
    }
    None
}

fn is_word_boundary(haystack: &str, position: usize, length: usize) -> bool {
    let before_ok = position == 0
        || !haystack.as_bytes()[position - 1].is_ascii_alphanumeric()
            && haystack.as_bytes()[position - 1] != b'_';
    let after = position + length;
    let after_ok = after >= haystack.len()
        || !haystack.as_bytes()[after].is_ascii_alphanumeric()
            && haystack.as_bytes()[after] != b'_';
    before_ok && after_ok
}

/// Splits on `separator` at nesting depth zero, respecting strings, parens,
/// and brackets.
pub(crate) fn split_top_level(text: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0_i32;
    let mut in_string = false;
    let mut start = 0;
    for (index, char) in text.char_indices() {
        match char {
            '\'' => in_string = !in_string,
            '(' | '[' | '{' if !in_string => depth += 1,
            ')' | ']' | '}' if !in_string => depth -= 1,
            char if char == separator && !in_string && depth == 0 => {
                parts.push(&text[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

/// Builds the SQL wrapper for one Cypher query.
///
/// # Errors
///
/// Returns [`QueryError`] when the parameter map cannot be serialized.
pub(crate) fn build_cypher_sql(
    graph: &GraphName,
    cypher: &str,
    params: &JsonMap<String, JsonValue>,
) -> Result<(String, Vec<String>), Report<QueryError>> {
    let columns = return_columns(cypher);
    let tag = dollar_tag(cypher);

    let as_clause = if columns.is_empty() {
        "(result ag_catalog.agtype)".to_owned()
    } else {
        let declarations: Vec<_> = (0..columns.len())
            .map(|index| format!("c{index} ag_catalog.agtype"))
            .collect();
        format!("({})", declarations.join(", "))
    };
    let select_list = if columns.is_empty() {
        "result::text".to_owned()
    } else {
        (0..columns.len())
            .map(|index| format!("c{index}::text"))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let params_json = serde_json::to_string(&JsonValue::Object(params.clone()))
        .change_context(QueryError)
        .attach_printable("could not serialize cypher parameters")?;

    let sql = format!(
        "SELECT {select_list} FROM ag_catalog.cypher({graph_literal}, {tag}{cypher}{tag}, \
         {params_literal}::ag_catalog.agtype) AS {as_clause}",
        graph_literal = quote_literal(graph.as_str()),
        params_literal = quote_literal(&params_json),
    );
    Ok((sql, columns))
}

/// Decodes one agtype text value into JSON.
///
/// agtype output is JSON with trailing type annotations (`::vertex`,
/// `::edge`, `::path`, `::numeric`) that plain JSON parsers reject; the
/// annotations are stripped outside string literals first.
#[must_use]
pub(crate) fn parse_agtype(text: &str) -> JsonValue {
    let stripped = strip_annotations(text);
    serde_json::from_str(&stripped).unwrap_or(JsonValue::Null)
}

fn strip_annotations(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();
    let mut in_string = false;
    let mut escaped = false;
    while let Some((_, char)) = chars.next() {
        if in_string {
            output.push(char);
            if escaped {
                escaped = false;
            } else if char == '\\' {
                escaped = true;
            } else if char == '"' {
                in_string = false;
            }
            continue;
        }
        match char {
            '"' => {
                in_string = true;
                output.push(char);
            }
            ':' if chars.peek().is_some_and(|(_, next)| *next == ':') => {
                // consume `::annotation`
                chars.next();
                while chars
                    .peek()
                    .is_some_and(|(_, next)| next.is_ascii_alphabetic() || *next == '_')
                {
                    chars.next();
                }
            }
            other => output.push(other),
        }
    }
    output
}

/// Runs a Cypher query and collects every row.
#[tracing::instrument(level = "trace", skip(client, params))]
pub(crate) async fn execute_cypher<C: GenericClient>(
    client: &C,
    graph: &GraphName,
    cypher: &str,
    params: &JsonMap<String, JsonValue>,
) -> Result<Vec<AgRow>, Report<QueryError>> {
    let (sql, columns) = build_cypher_sql(graph, cypher, params)?;
    let rows = client
        .query(sql.as_str(), &[])
        .await
        .change_context(QueryError)
        .attach_printable_lazy(|| cypher.to_owned())?;

    Ok(rows.iter().map(|row| decode_row(row, &columns)).collect())
}

/// Runs a Cypher query and returns the first column of the first row.
pub(crate) async fn execute_cypher_scalar<C: GenericClient>(
    client: &C,
    graph: &GraphName,
    cypher: &str,
    params: &JsonMap<String, JsonValue>,
) -> Result<Option<JsonValue>, Report<QueryError>> {
    let rows = execute_cypher(client, graph, cypher, params).await?;
    Ok(rows
        .into_iter()
        .next()
        .and_then(|row| row.into_iter().next().map(|(_, value)| value)))
}

/// Runs a Cypher query as a lazily-driven row stream.
pub(crate) async fn execute_cypher_stream<C: GenericClient>(
    client: &C,
    graph: &GraphName,
    cypher: &str,
    params: &JsonMap<String, JsonValue>,
) -> Result<impl Stream<Item = Result<AgRow, Report<QueryError>>>, Report<QueryError>> {
    let (sql, columns) = build_cypher_sql(graph, cypher, params)?;
    let row_stream = client
        .query_raw(sql.as_str(), core::iter::empty::<&(dyn postgres_types::ToSql + Sync)>())
        .await
        .change_context(QueryError)
        .attach_printable_lazy(|| cypher.to_owned())?;

    Ok(row_stream
        .map_err(|error| Report::new(error).change_context(QueryError))
        .map_ok(move |row| decode_row(&row, &columns)))
}

fn decode_row(row: &tokio_postgres::Row, columns: &[String]) -> AgRow {
    let mut decoded = JsonMap::new();
    if columns.is_empty() {
        let text: Option<String> = row.get(0);
        decoded.insert(
            "result".to_owned(),
            text.as_deref().map(parse_agtype).unwrap_or(JsonValue::Null),
        );
        return decoded;
    }
    for (index, column) in columns.iter().enumerate() {
        let text: Option<String> = row.get(index);
        decoded.insert(
            column.clone(),
            text.as_deref().map(parse_agtype).unwrap_or(JsonValue::Null),
        );
    }
    decoded
}

/// Statements run once per graph at creation time, in order.
#[must_use]
pub(crate) fn create_graph_statements(graph: &GraphName) -> Vec<String> {
    let schema = quote_ident(graph.as_str());
    let jobs_schema = quote_ident(&graph.jobs_schema());
    let graph_literal = quote_literal(graph.as_str());
    let mut statements = vec![
        "CREATE EXTENSION IF NOT EXISTS age".to_owned(),
        format!("SELECT * FROM ag_catalog.create_graph({graph_literal})"),
        format!("SELECT ag_catalog.create_vlabel({graph_literal}, 'Twin')"),
        format!("SELECT ag_catalog.create_vlabel({graph_literal}, 'Model')"),
        format!("SELECT ag_catalog.create_elabel({graph_literal}, '_extends')"),
        format!("SELECT ag_catalog.create_elabel({graph_literal}, '_hasComponent')"),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS twin_dt_id_key ON {schema}.\"Twin\" \
             ((ag_catalog.agtype_access_operator(properties, '\"$dtId\"'::ag_catalog.agtype)))"
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS model_id_key ON {schema}.\"Model\" \
             ((ag_catalog.agtype_access_operator(properties, '\"id\"'::ag_catalog.agtype)))"
        ),
        is_of_model_function(graph, false),
        is_of_model_function(graph, true),
        format!("CREATE SCHEMA IF NOT EXISTS {jobs_schema}"),
        format!(
            "CREATE TABLE IF NOT EXISTS {jobs_schema}.jobs (\
                 id text PRIMARY KEY, \
                 job_type text NOT NULL, \
                 status text NOT NULL, \
                 created_at timestamptz NOT NULL DEFAULT now(), \
                 last_action_at timestamptz NOT NULL DEFAULT now(), \
                 finished_at timestamptz, \
                 purge_at timestamptz, \
                 models_created bigint NOT NULL DEFAULT 0, \
                 models_deleted bigint NOT NULL DEFAULT 0, \
                 twins_created bigint NOT NULL DEFAULT 0, \
                 twins_deleted bigint NOT NULL DEFAULT 0, \
                 relationships_created bigint NOT NULL DEFAULT 0, \
                 relationships_deleted bigint NOT NULL DEFAULT 0, \
                 error_count bigint NOT NULL DEFAULT 0, \
                 options jsonb NOT NULL DEFAULT '{{}}'::jsonb, \
                 failure_reason text)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {jobs_schema}.job_locks (\
                 job_id text PRIMARY KEY, \
                 owner_instance_id text NOT NULL, \
                 acquired_at timestamptz NOT NULL DEFAULT now(), \
                 heartbeat_at timestamptz NOT NULL DEFAULT now(), \
                 ttl_seconds bigint NOT NULL)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {jobs_schema}.checkpoints (\
                 job_id text PRIMARY KEY, \
                 checkpoint jsonb NOT NULL, \
                 updated_at timestamptz NOT NULL DEFAULT now())"
        ),
    ];
    statements.shrink_to_fit();
    statements
}

/// Statements run at graph teardown.
#[must_use]
pub(crate) fn drop_graph_statements(graph: &GraphName) -> Vec<String> {
    vec![
        format!(
            "SELECT * FROM ag_catalog.drop_graph({}, true)",
            quote_literal(graph.as_str())
        ),
        format!(
            "DROP SCHEMA IF EXISTS {} CASCADE",
            quote_ident(&graph.jobs_schema())
        ),
    ]
}

/// The subtype-test helper installed into the graph's schema.
///
/// The fast variant consults the persisted `bases` array on the twin's
/// model; the `_old` variant walks `_extends` recursively and is kept for
/// benchmarking the two against each other.
fn is_of_model_function(graph: &GraphName, old: bool) -> String {
    let schema = quote_ident(graph.as_str());
    let name = if old { "is_of_model_old" } else { "is_of_model" };
    let lookup = if old {
        format!(
            "WITH RECURSIVE ancestors AS ( \
                 SELECT m.id \
                   FROM {schema}.\"Model\" AS m \
                  WHERE (m.properties::text::jsonb) ->> 'id' = twin_model \
                 UNION \
                 SELECT e.end_id \
                   FROM {schema}.\"_extends\" AS e \
                   JOIN ancestors AS a ON e.start_id = a.id \
             ) \
             SELECT EXISTS ( \
                 SELECT 1 \
                   FROM ancestors AS a \
                   JOIN {schema}.\"Model\" AS m ON m.id = a.id \
                  WHERE (m.properties::text::jsonb) ->> 'id' = model \
             ) INTO matched;"
        )
    } else {
        format!(
            "SELECT (m.properties::text::jsonb) -> 'bases' ? model \
               INTO matched \
               FROM {schema}.\"Model\" AS m \
              WHERE (m.properties::text::jsonb) ->> 'id' = twin_model;"
        )
    };
    format!(
        "CREATE OR REPLACE FUNCTION {schema}.{name}(twin ag_catalog.agtype, model text, \
         exact boolean DEFAULT false) RETURNS boolean AS $fn$ \
         DECLARE \
             twin_model text; \
             matched boolean; \
         BEGIN \
             twin_model := trim(both '\"' from (ag_catalog.agtype_access_operator(twin, \
                 '\"$metadata\"'::ag_catalog.agtype, '\"$model\"'::ag_catalog.agtype))::text); \
             IF twin_model IS NULL OR twin_model = '' THEN \
                 RETURN false; \
             END IF; \
             IF twin_model = model THEN \
                 RETURN true; \
             END IF; \
             IF exact THEN \
                 RETURN false; \
             END IF; \
             {lookup} \
             RETURN COALESCE(matched, false); \
         END; \
         $fn$ LANGUAGE plpgsql STABLE"
    )
}

/// Per-connection session setup: AGE must be loaded and `ag_catalog` must be
/// on the search path for `cypher()` calls to resolve.
pub(crate) const SESSION_SETUP: [&str; 2] = [
    "LOAD 'age'",
    "SET search_path = ag_catalog, \"$user\", public",
];

/// Extracts the property map of a decoded vertex or edge.
#[must_use]
pub(crate) fn graph_element_properties(value: JsonValue) -> Option<JsonMap<String, JsonValue>> {
    match value {
        JsonValue::Object(mut element) => match element.remove("properties") {
            Some(JsonValue::Object(properties)) => Some(properties),
            _ => None,
        },
        _ => None,
    }
}

/// Maps string keys to JSON values for the cypher parameter map.
#[must_use]
pub(crate) fn params<const N: usize>(entries: [(&str, JsonValue); N]) -> JsonMap<String, JsonValue> {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value))
        .collect::<BTreeMap<_, _>>()
        .into_iter()
        .collect()
}
