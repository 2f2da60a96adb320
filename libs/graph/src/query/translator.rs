//! The TDQL-to-Cypher translator.
//!
//! A pure syntactic rewrite: no store access, no catalog access beyond the
//! graph name that qualifies the `is_of_model` helper. The surface language
//! is the SQL-flavored twin query dialect (`SELECT … FROM DIGITALTWINS …`);
//! the output is the Cypher dialect the AGE backend executes.
//!
//! Rewriting happens in fixed passes over quote-aware text: source/alias
//! parsing, `!=` normalization, property-path and alias binding, then
//! function expansion. String literals are never touched.

use error_stack::Report;

use crate::store::postgres::age::{find_keyword, split_top_level};
use crate::store::GraphName;

#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("could not translate the query: {message}")]
#[must_use]
pub struct TranslationError {
    pub message: String,
}

impl TranslationError {
    fn new(message: impl Into<String>) -> Report<Self> {
        Report::new(Self { message: message.into() })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Source {
    Twins,
    Relationships,
}

#[derive(Debug)]
struct Join {
    target: String,
    source_alias: String,
    relationship: String,
    edge_alias: Option<String>,
}

/// Translates one TDQL query into Cypher against `graph`.
///
/// # Errors
///
/// Returns [`TranslationError`] when the query does not parse as TDQL.
pub fn translate(tdql: &str, graph: &GraphName) -> Result<String, Report<TranslationError>> {
    let query = tdql.trim().trim_end_matches(';').trim();
    if find_keyword(query, "SELECT") != Some(0) {
        return Err(TranslationError::new("the query must start with SELECT"));
    }
    let from_at = find_keyword(query, "FROM")
        .ok_or_else(|| TranslationError::new("the query is missing a FROM clause"))?;

    let mut projection = query["SELECT".len()..from_at].trim().to_owned();
    let mut tail = query[from_at + "FROM".len()..].trim();

    // TOP(n) and COUNT() ride on the projection
    let mut limit = None;
    if let Some(top_at) = find_keyword(&projection, "TOP") {
        if top_at == 0 {
            let rest = projection["TOP".len()..].trim_start();
            let inner = rest
                .strip_prefix('(')
                .and_then(|rest| rest.split_once(')'))
                .ok_or_else(|| TranslationError::new("malformed TOP clause"))?;
            limit = Some(inner.0.trim().parse::<u64>().map_err(|_| {
                TranslationError::new(format!("`{}` is not a valid TOP count", inner.0.trim()))
            })?);
            projection = inner.1.trim().to_owned();
        }
    }
    let count = find_keyword(&projection, "COUNT") == Some(0)
        && projection["COUNT".len()..].trim().trim_start_matches('(').trim_start()
            .starts_with(')');

    // FROM source
    let source_word: String = tail
        .chars()
        .take_while(|char| char.is_ascii_alphanumeric() || *char == '_')
        .collect();
    let source = match source_word.to_ascii_uppercase().as_str() {
        "DIGITALTWINS" => Source::Twins,
        "RELATIONSHIPS" => Source::Relationships,
        other => {
            return Err(TranslationError::new(format!(
                "`{other}` is not a queryable collection"
            )));
        }
    };
    tail = tail[source_word.len()..].trim_start();

    // optional alias, custom MATCH, JOINs, WHERE
    let mut alias = None;
    let mut custom_match = None;
    let mut joins = Vec::new();
    let mut where_clause = None;

    if !tail.is_empty()
        && find_keyword(tail, "WHERE") != Some(0)
        && find_keyword(tail, "MATCH") != Some(0)
        && find_keyword(tail, "JOIN") != Some(0)
    {
        let word: String = tail
            .chars()
            .take_while(|char| char.is_ascii_alphanumeric() || *char == '_')
            .collect();
        if word.is_empty() {
            return Err(TranslationError::new(format!(
                "unexpected token after FROM: `{tail}`"
            )));
        }
        alias = Some(word.clone());
        tail = tail[word.len()..].trim_start();
    }

    while !tail.is_empty() {
        if find_keyword(tail, "WHERE") == Some(0) {
            where_clause = Some(tail["WHERE".len()..].trim().to_owned());
            break;
        } else if find_keyword(tail, "MATCH") == Some(0) {
            let rest = &tail["MATCH".len()..];
            let end = ["WHERE", "JOIN"]
                .iter()
                .filter_map(|keyword| find_keyword(rest, keyword))
                .min()
                .unwrap_or(rest.len());
            custom_match = Some(rest[..end].trim().to_owned());
            tail = rest[end..].trim_start();
        } else if find_keyword(tail, "JOIN") == Some(0) {
            let rest = &tail["JOIN".len()..];
            let end = ["WHERE", "JOIN"]
                .iter()
                .filter_map(|keyword| find_keyword(rest, keyword))
                .min()
                .unwrap_or(rest.len());
            joins.push(parse_join(rest[..end].trim())?);
            tail = rest[end..].trim_start();
        } else {
            return Err(TranslationError::new(format!(
                "unexpected token after FROM: `{tail}`"
            )));
        }
    }

    let root_alias = alias.unwrap_or_else(|| {
        match source {
            Source::Twins => "T",
            Source::Relationships => "R",
        }
        .to_owned()
    });

    // the MATCH clause and the predicates the pattern rewrite contributes
    let mut pattern_where = Vec::new();
    let pattern = match (&custom_match, source) {
        (Some(custom), _) => rewrite_pattern(custom, &mut pattern_where)?,
        (None, Source::Twins) if joins.is_empty() => format!("({root_alias}:Twin)"),
        (None, Source::Twins) => {
            let mut elements = Vec::new();
            for join in &joins {
                let edge = join.edge_alias.as_ref().map_or_else(
                    || format!(":{}", join.relationship),
                    |edge_alias| format!("{edge_alias}:{}", join.relationship),
                );
                elements.push(format!(
                    "({}:Twin)-[{edge}]->({}:Twin)",
                    join.source_alias, join.target
                ));
            }
            elements.join(", ")
        }
        (None, Source::Relationships) => {
            if root_alias == "_" {
                "(:Twin)-[_]->(:Twin)".to_owned()
            } else {
                format!("(:Twin)-[{root_alias}]->(:Twin)")
            }
        }
    };

    let mut known_aliases: Vec<String> = vec![root_alias.clone()];
    for join in &joins {
        known_aliases.push(join.target.clone());
        if let Some(edge_alias) = &join.edge_alias {
            known_aliases.push(edge_alias.clone());
        }
    }
    collect_identifiers(&pattern, &mut known_aliases);

    // WHERE rewriting
    let mut conditions = Vec::new();
    if let Some(where_clause) = where_clause {
        let rewritten = rewrite_not_equals(&where_clause);
        let rewritten = rewrite_property_paths(&rewritten, &known_aliases, &root_alias);
        let rewritten = rewrite_functions(&rewritten, graph, &root_alias)?;
        conditions.push(rewritten);
    }
    conditions.extend(pattern_where);
    let where_text = match conditions.len() {
        0 => String::new(),
        1 => conditions.remove(0),
        _ => conditions
            .iter()
            .map(|condition| format!("({condition})"))
            .collect::<Vec<_>>()
            .join(" AND "),
    };

    // projection
    let return_text = if count {
        "COUNT(*)".to_owned()
    } else if projection.trim() == "*" {
        "*".to_owned()
    } else {
        split_top_level(&projection, ',')
            .into_iter()
            .map(|item| {
                let item = item.trim();
                let (expression, item_alias) = match find_keyword(item, "AS") {
                    Some(as_at) => (
                        item[..as_at].trim(),
                        Some(item[as_at + "AS".len()..].trim()),
                    ),
                    None => (item, None),
                };
                let rewritten =
                    rewrite_property_paths(expression, &known_aliases, &root_alias);
                match item_alias {
                    Some(item_alias) => format!("{rewritten} AS {item_alias}"),
                    None => rewritten,
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut cypher = format!("MATCH {pattern}");
    if !where_text.is_empty() {
        cypher.push_str(" WHERE ");
        cypher.push_str(&where_text);
    }
    cypher.push_str(" RETURN ");
    cypher.push_str(&return_text);
    if let Some(limit) = limit {
        cypher.push_str(&format!(" LIMIT {limit}"));
    }
    Ok(cypher)
}

/// Whether a query contains a variable-length edge pattern (`[*]`,
/// `[*1..3]`, `[r*]`, `[r:KNOWS*2]`). The executor paginates those
/// client-side because `SKIP` misbehaves under variable-length expansion.
#[must_use]
pub fn has_variable_length_edges(query: &str) -> bool {
    let mut in_string = false;
    let mut in_bracket = false;
    for char in query.chars() {
        match char {
            '\'' => in_string = !in_string,
            '[' if !in_string => in_bracket = true,
            ']' if !in_string => in_bracket = false,
            '*' if in_bracket && !in_string => return true,
            _ => {}
        }
    }
    false
}

/// `JOIN <target> RELATED <source>.<relationship> [<edge alias>]`
fn parse_join(clause: &str) -> Result<Join, Report<TranslationError>> {
    let related_at = find_keyword(clause, "RELATED")
        .ok_or_else(|| TranslationError::new("JOIN must use the RELATED form"))?;
    let target = clause[..related_at].trim();
    if target.is_empty() {
        return Err(TranslationError::new("JOIN is missing a target alias"));
    }
    let rest = clause[related_at + "RELATED".len()..].trim();
    let mut words = rest.split_whitespace();
    let related = words
        .next()
        .ok_or_else(|| TranslationError::new("RELATED is missing a relationship reference"))?;
    let edge_alias = words.next().map(str::to_owned);
    let (source_alias, relationship) = related.split_once('.').ok_or_else(|| {
        TranslationError::new("RELATED must reference `<alias>.<relationship>`")
    })?;
    Ok(Join {
        target: target.to_owned(),
        source_alias: source_alias.to_owned(),
        relationship: relationship.to_owned(),
        edge_alias,
    })
}

/// Injects `:Twin` on unlabeled nodes and rewrites `[r:a|b]` label pipes
/// into `label()` predicates (the backend has no pipe support).
fn rewrite_pattern(
    pattern: &str,
    where_additions: &mut Vec<String>,
) -> Result<String, Report<TranslationError>> {
    let mut output = String::with_capacity(pattern.len());
    let mut in_string = false;
    let mut chars = pattern.char_indices();
    let mut generated_edges = 0_usize;

    while let Some((index, char)) = chars.next() {
        if char == '\'' {
            in_string = !in_string;
            output.push(char);
            continue;
        }
        if in_string {
            output.push(char);
            continue;
        }
        match char {
            '(' => {
                let close = matching_close(pattern, index, '(', ')')
                    .ok_or_else(|| TranslationError::new("unbalanced parenthesis in MATCH"))?;
                let inner = &pattern[index + 1..close];
                if inner.contains(':') {
                    output.push_str(&format!("({inner})"));
                } else {
                    output.push_str(&format!("({}:Twin)", inner.trim()));
                }
                advance_to(&mut chars, close);
            }
            '[' => {
                let close = matching_close(pattern, index, '[', ']')
                    .ok_or_else(|| TranslationError::new("unbalanced bracket in MATCH"))?;
                let inner = &pattern[index + 1..close];
                if inner.contains('|') && !inner.contains('*') {
                    let (edge_alias, labels) = match inner.split_once(':') {
                        Some((edge_alias, labels)) if !edge_alias.trim().is_empty() => {
                            (edge_alias.trim().to_owned(), labels)
                        }
                        Some((_, labels)) => {
                            generated_edges += 1;
                            (format!("r{generated_edges}"), labels)
                        }
                        None => {
                            return Err(TranslationError::new(
                                "a label pipe needs `[alias:label|label]`",
                            ));
                        }
                    };
                    let predicate = labels
                        .split('|')
                        .map(|label| format!("label({edge_alias}) = '{}'", label.trim()))
                        .collect::<Vec<_>>()
                        .join(" OR ");
                    where_additions.push(format!("({predicate})"));
                    output.push_str(&format!("[{edge_alias}]"));
                } else {
                    output.push_str(&format!("[{inner}]"));
                }
                advance_to(&mut chars, close);
            }
            other => output.push(other),
        }
    }
    Ok(output)
}

fn matching_close(text: &str, open_at: usize, open: char, close: char) -> Option<usize> {
    let mut depth = 0_i32;
    let mut in_string = false;
    for (index, char) in text.char_indices().skip_while(|(index, _)| *index < open_at) {
        match char {
            '\'' => in_string = !in_string,
            char if char == open && !in_string => depth += 1,
            char if char == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(index);
                }
            }
            _ => {}
        }
    }
    None
}

fn advance_to(chars: &mut core::str::CharIndices<'_>, position: usize) {
    while let Some((index, _)) = chars.next() {
        if index >= position {
            break;
        }
    }
}

/// `a != b` becomes `NOT (a = b)`.
fn rewrite_not_equals(clause: &str) -> String {
    let mut output = String::with_capacity(clause.len());
    let mut remaining = clause;
    loop {
        let Some(position) = find_outside_strings(remaining, "!=") else {
            output.push_str(remaining);
            return output;
        };
        let left_start = operand_start(&remaining[..position]);
        let left = remaining[left_start..position].trim();
        let after = &remaining[position + 2..];
        let right_end = operand_end(after);
        let right = after[..right_end].trim();

        output.push_str(&remaining[..left_start]);
        output.push_str(&format!("NOT ({left} = {right})"));
        remaining = &after[right_end..];
    }
}

fn find_outside_strings(haystack: &str, needle: &str) -> Option<usize> {
    let mut in_string = false;
    let bytes = haystack.as_bytes();
    for index in 0..bytes.len() {
        if bytes[index] == b'\'' {
            in_string = !in_string;
        } else if !in_string && haystack[index..].starts_with(needle) {
            return Some(index);
        }
    }
    None
}

fn operand_start(before: &str) -> usize {
    let trimmed_end = before.trim_end().len();
    let mut start = trimmed_end;
    let mut depth = 0_i32;
    for (index, char) in before[..trimmed_end].char_indices().rev() {
        match char {
            ')' | ']' => depth += 1,
            '(' | '[' if depth > 0 => depth -= 1,
            char if depth == 0
                && !(char.is_ascii_alphanumeric()
                    || matches!(char, '_' | '.' | '$' | '\'' | '"')) =>
            {
                return start;
            }
            _ => {}
        }
        start = index;
    }
    start
}

fn operand_end(after: &str) -> usize {
    let leading = after.len() - after.trim_start().len();
    let mut in_string = false;
    let mut depth = 0_i32;
    for (index, char) in after.char_indices().skip(leading) {
        match char {
            '\'' => in_string = !in_string,
            '(' | '[' if !in_string => depth += 1,
            ')' | ']' if !in_string && depth > 0 => depth -= 1,
            char if !in_string
                && depth == 0
                && !(char.is_ascii_alphanumeric()
                    || matches!(char, '_' | '.' | '$' | '"')) =>
            {
                return index;
            }
            _ => {}
        }
    }
    after.len()
}

const KEYWORDS: [&str; 13] = [
    "AND", "OR", "NOT", "TRUE", "FALSE", "NULL", "IS", "IN", "DEFINED", "OF", "LIKE", "EXACT",
    "CONTAINS",
];

/// Rewrites dotted property access into the backend's form and binds
/// unqualified references to the row alias.
///
/// Any path segment beginning with `$` switches to bracket form
/// (`T.$dtId` → `T['$dtId']`); a chain whose head is not a known alias is
/// prefixed with the root alias (`name` → `T.name`). The `_` alias passes
/// through unchanged.
fn rewrite_property_paths(text: &str, known_aliases: &[String], root_alias: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut rest = text;
    let mut in_string = false;

    'outer: while !rest.is_empty() {
        let mut chars = rest.char_indices();
        while let Some((index, char)) = chars.next() {
            if char == '\'' {
                in_string = !in_string;
                continue;
            }
            if in_string {
                continue;
            }
            let starts_chain = char.is_ascii_alphabetic() || char == '_' || char == '$';
            let after_identifier = index > 0
                && rest[..index]
                    .chars()
                    .next_back()
                    .is_some_and(|previous| {
                        previous.is_ascii_alphanumeric()
                            || matches!(previous, '_' | '$' | '.' | '\'')
                    });
            if starts_chain && !after_identifier {
                let chain_end = rest[index..]
                    .char_indices()
                    .find(|(_, char)| {
                        !(char.is_ascii_alphanumeric() || matches!(char, '_' | '$' | '.'))
                    })
                    .map_or(rest.len(), |(offset, _)| index + offset);
                let chain = &rest[index..chain_end];
                let is_call = rest[chain_end..].trim_start().starts_with('(');
                let is_keyword =
                    KEYWORDS.contains(&chain.to_ascii_uppercase().as_str());
                if is_call || is_keyword || chain == "_" {
                    output.push_str(&rest[..chain_end]);
                    rest = &rest[chain_end..];
                    continue 'outer;
                }

                output.push_str(&rest[..index]);
                output.push_str(&rewrite_chain(chain, known_aliases, root_alias));
                rest = &rest[chain_end..];
                continue 'outer;
            }
        }
        output.push_str(rest);
        break;
    }
    output
}

fn rewrite_chain(chain: &str, known_aliases: &[String], root_alias: &str) -> String {
    let segments: Vec<&str> = chain.split('.').collect();
    let head_is_alias = known_aliases.iter().any(|alias| alias == segments[0]);

    let (head, properties) = if head_is_alias {
        (segments[0].to_owned(), &segments[1..])
    } else {
        (root_alias.to_owned(), &segments[..])
    };

    let mut output = head;
    for segment in properties {
        if segment.starts_with('$') {
            output.push_str(&format!("['{segment}']"));
        } else {
            output.push('.');
            output.push_str(segment);
        }
    }
    output
}

/// Expands the TDQL function surface.
fn rewrite_functions(
    clause: &str,
    graph: &GraphName,
    root_alias: &str,
) -> Result<String, Report<TranslationError>> {
    let mut output = clause.to_owned();
    output = rewrite_function(&output, "IS_OF_MODEL", |arguments| {
        let mut alias = None;
        let mut model = None;
        let mut exact = false;
        for argument in &arguments {
            let argument = argument.trim();
            if argument.starts_with('\'') {
                model = Some(argument.to_owned());
            } else if argument.eq_ignore_ascii_case("exact") {
                exact = true;
            } else if !argument.is_empty() {
                alias = Some(argument.to_owned());
            }
        }
        let model = model.ok_or_else(|| {
            TranslationError::new("IS_OF_MODEL requires a model id argument")
        })?;
        let alias = alias.unwrap_or_else(|| root_alias.to_owned());
        Ok(if exact {
            format!("{graph}.is_of_model({alias},{model},true)")
        } else {
            format!("{graph}.is_of_model({alias},{model})")
        })
    })?;
    output = rewrite_function(&output, "IS_NUMBER", |arguments| {
        let argument = single_argument("IS_NUMBER", &arguments)?;
        Ok(format!(
            "((toFloat({argument}) IS NOT NULL OR toInteger({argument}) IS NOT NULL) AND NOT \
             (toString({argument}) = {argument}))"
        ))
    })?;
    output = rewrite_function(&output, "IS_STRING", |arguments| {
        let argument = single_argument("IS_STRING", &arguments)?;
        Ok(format!("(toString({argument}) = {argument})"))
    })?;
    output = rewrite_function(&output, "IS_BOOL", |arguments| {
        let argument = single_argument("IS_BOOL", &arguments)?;
        Ok(format!("({argument} = true OR {argument} = false)"))
    })?;
    output = rewrite_function(&output, "IS_DEFINED", |arguments| {
        let argument = single_argument("IS_DEFINED", &arguments)?;
        Ok(format!("{argument} IS NOT NULL"))
    })?;
    output = rewrite_function(&output, "IS_NULL", |arguments| {
        let argument = single_argument("IS_NULL", &arguments)?;
        Ok(format!("{argument} IS NULL"))
    })?;
    output = rewrite_function(&output, "CONTAINS", |arguments| {
        if arguments.len() != 2 {
            return Err(TranslationError::new("CONTAINS takes two arguments"));
        }
        Ok(format!(
            "{} CONTAINS {}",
            arguments[0].trim(),
            arguments[1].trim()
        ))
    })?;
    Ok(output)
}

fn single_argument(
    name: &str,
    arguments: &[String],
) -> Result<String, Report<TranslationError>> {
    if arguments.len() == 1 {
        Ok(arguments[0].trim().to_owned())
    } else {
        Err(TranslationError::new(format!("{name} takes one argument")))
    }
}

fn rewrite_function(
    clause: &str,
    name: &str,
    expand: impl Fn(Vec<String>) -> Result<String, Report<TranslationError>>,
) -> Result<String, Report<TranslationError>> {
    let mut output = String::with_capacity(clause.len());
    let mut rest = clause;
    while let Some(position) = find_keyword(rest, name) {
        let after_name = &rest[position + name.len()..];
        let open_offset = after_name.len() - after_name.trim_start().len();
        if !after_name[open_offset..].starts_with('(') {
            output.push_str(&rest[..position + name.len()]);
            rest = after_name;
            continue;
        }
        let open_at = position + name.len() + open_offset;
        let close_at = matching_close(rest, open_at, '(', ')')
            .ok_or_else(|| TranslationError::new(format!("unbalanced call to {name}")))?;
        let arguments = split_top_level(&rest[open_at + 1..close_at], ',')
            .into_iter()
            .map(|argument| argument.trim().to_owned())
            .filter(|argument| !argument.is_empty())
            .collect();
        output.push_str(&rest[..position]);
        output.push_str(&expand(arguments)?);
        rest = &rest[close_at + 1..];
    }
    output.push_str(rest);
    Ok(output)
}

fn collect_identifiers(pattern: &str, identifiers: &mut Vec<String>) {
    let mut in_string = false;
    for (index, char) in pattern.char_indices() {
        if char == '\'' {
            in_string = !in_string;
        } else if !in_string && (char == '(' || char == '[') {
            let name: String = pattern[index + 1..]
                .chars()
                .take_while(|char| char.is_ascii_alphanumeric() || *char == '_')
                .collect();
            if !name.is_empty() && !identifiers.contains(&name) {
                identifiers.push(name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{has_variable_length_edges, translate};
    use crate::store::GraphName;

    fn graph() -> GraphName {
        GraphName::new("g").expect("valid graph name")
    }

    #[track_caller]
    fn assert_translates(tdql: &str, expected: &str) {
        let cypher = translate(tdql, &graph()).expect("query translates");
        assert_eq!(cypher, expected, "input: {tdql}");
    }

    #[test]
    fn select_all_twins() {
        assert_translates("SELECT * FROM DIGITALTWINS", "MATCH (T:Twin) RETURN *");
    }

    #[test]
    fn select_with_declared_alias() {
        assert_translates("SELECT T FROM DIGITALTWINS T", "MATCH (T:Twin) RETURN T");
    }

    #[test]
    fn select_all_relationships() {
        assert_translates(
            "SELECT * FROM RELATIONSHIPS",
            "MATCH (:Twin)-[R]->(:Twin) RETURN *",
        );
    }

    #[test]
    fn count_twins() {
        assert_translates(
            "SELECT COUNT() FROM DIGITALTWINS",
            "MATCH (T:Twin) RETURN COUNT(*)",
        );
    }

    #[test]
    fn top_with_metadata_filter() {
        assert_translates(
            "SELECT TOP(1) T FROM DIGITALTWINS T WHERE T.$metadata.$model = 'dtmi:x;1'",
            "MATCH (T:Twin) WHERE T['$metadata']['$model'] = 'dtmi:x;1' RETURN T LIMIT 1",
        );
    }

    #[test]
    fn is_of_model_binds_the_implicit_alias() {
        assert_translates(
            "SELECT * FROM DIGITALTWINS WHERE IS_OF_MODEL('dtmi:x;1')",
            "MATCH (T:Twin) WHERE g.is_of_model(T,'dtmi:x;1') RETURN *",
        );
    }

    #[test]
    fn is_of_model_with_exact_and_alias() {
        assert_translates(
            "SELECT t FROM DIGITALTWINS t WHERE IS_OF_MODEL(t, 'dtmi:x;1', exact)",
            "MATCH (t:Twin) WHERE g.is_of_model(t,'dtmi:x;1',true) RETURN t",
        );
    }

    #[test]
    fn join_related_becomes_a_pattern_edge() {
        assert_translates(
            "SELECT B, R FROM DIGITALTWINS DT JOIN B RELATED DT.has R WHERE DT.$dtId = 'root'",
            "MATCH (DT:Twin)-[R:has]->(B:Twin) WHERE DT['$dtId'] = 'root' RETURN B, R",
        );
    }

    #[test]
    fn join_without_edge_alias() {
        assert_translates(
            "SELECT B FROM DIGITALTWINS DT JOIN B RELATED DT.has",
            "MATCH (DT:Twin)-[:has]->(B:Twin) RETURN B",
        );
    }

    #[test]
    fn not_equals_is_normalized() {
        assert_translates(
            "SELECT * FROM DIGITALTWINS WHERE T.name != 'x'",
            "MATCH (T:Twin) WHERE NOT (T.name = 'x') RETURN *",
        );
    }

    #[test]
    fn bare_selectors_bind_to_the_implicit_alias() {
        assert_translates(
            "SELECT $dtId, name FROM DIGITALTWINS",
            "MATCH (T:Twin) RETURN T['$dtId'], T.name",
        );
    }

    #[test]
    fn select_alias_projection() {
        assert_translates(
            "SELECT T.name AS twinName FROM DIGITALTWINS T",
            "MATCH (T:Twin) RETURN T.name AS twinName",
        );
    }

    #[test]
    fn keywords_are_case_insensitive() {
        assert_translates(
            "select * from digitaltwins where IS_OF_MODEL('dtmi:x;1')",
            "MATCH (T:Twin) WHERE g.is_of_model(T,'dtmi:x;1') RETURN *",
        );
    }

    #[test]
    fn custom_match_injects_twin_labels() {
        assert_translates(
            "SELECT a FROM DIGITALTWINS MATCH (a)-[r]->(b) WHERE a.$dtId = 'x'",
            "MATCH (a:Twin)-[r]->(b:Twin) WHERE a['$dtId'] = 'x' RETURN a",
        );
    }

    #[test]
    fn label_pipes_become_label_predicates() {
        assert_translates(
            "SELECT a FROM DIGITALTWINS MATCH (a)-[r:rel1|rel2]->(b) WHERE a.$dtId = 'x'",
            "MATCH (a:Twin)-[r]->(b:Twin) WHERE (a['$dtId'] = 'x') AND ((label(r) = 'rel1' OR \
             label(r) = 'rel2')) RETURN a",
        );
    }

    #[test]
    fn is_number_excludes_numeric_strings() {
        assert_translates(
            "SELECT * FROM DIGITALTWINS WHERE IS_NUMBER(T.value)",
            "MATCH (T:Twin) WHERE ((toFloat(T.value) IS NOT NULL OR toInteger(T.value) IS NOT \
             NULL) AND NOT (toString(T.value) = T.value)) RETURN *",
        );
    }

    #[test]
    fn contains_becomes_infix() {
        assert_translates(
            "SELECT * FROM DIGITALTWINS WHERE CONTAINS(T.name, 'abc')",
            "MATCH (T:Twin) WHERE T.name CONTAINS 'abc' RETURN *",
        );
    }

    #[test]
    fn starts_with_passes_through() {
        assert_translates(
            "SELECT * FROM DIGITALTWINS WHERE STARTS_WITH(T.name, 'ab')",
            "MATCH (T:Twin) WHERE STARTS_WITH(T.name, 'ab') RETURN *",
        );
    }

    #[test]
    fn is_defined_becomes_null_check() {
        assert_translates(
            "SELECT * FROM DIGITALTWINS WHERE IS_DEFINED(T.name)",
            "MATCH (T:Twin) WHERE T.name IS NOT NULL RETURN *",
        );
    }

    #[test]
    fn underscore_alias_passes_through() {
        assert_translates("SELECT _ FROM DIGITALTWINS _", "MATCH (_:Twin) RETURN _");
    }

    #[test]
    fn string_literals_are_never_rewritten() {
        assert_translates(
            "SELECT * FROM DIGITALTWINS WHERE T.note = 'a != b AND IS_NUMBER(x)'",
            "MATCH (T:Twin) WHERE T.note = 'a != b AND IS_NUMBER(x)' RETURN *",
        );
    }

    #[test]
    fn rejects_non_select_queries() {
        assert!(translate("MATCH (n) RETURN n", &graph()).is_err());
        assert!(translate("SELECT * FROM OTHER", &graph()).is_err());
    }

    #[test]
    fn variable_length_edges_are_detected() {
        assert!(has_variable_length_edges("MATCH (a)-[*]->(b) RETURN a"));
        assert!(has_variable_length_edges("MATCH (a)-[*1..3]->(b) RETURN a"));
        assert!(has_variable_length_edges("MATCH (a)-[r*]->(b) RETURN a"));
        assert!(has_variable_length_edges("MATCH (a)-[r:KNOWS*2]->(b) RETURN a"));
        assert!(!has_variable_length_edges("MATCH (a)-[r:KNOWS]->(b) RETURN a"));
        assert!(!has_variable_length_edges("MATCH (a) WHERE a.x = '[*]' RETURN a"));
    }
}
