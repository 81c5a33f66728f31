// Copyright 2021 Datafuse Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use url::form_urlencoded;

use super::{TaggedTerm, TermOp, expr::parse_series_by_tag, terms::parse_terms};
use crate::{
    clickhouse::{self, Options},
    error::AppError,
    sql::{Where, q},
};

/// Single-use lookup session: immutable query configuration plus the raw
/// response buffer, written once by `execute` and read by `list`/`series`.
/// Constructed fresh per request and discarded afterwards.
pub struct TaggedFinder {
    http: reqwest::Client,
    url: String,
    table: String,
    opts: Options,
    cardinality_limit: usize,
    body: Option<String>,
}

impl TaggedFinder {
    pub fn new(
        http: reqwest::Client,
        url: String,
        table: String,
        opts: Options,
        cardinality_limit: usize,
    ) -> Self {
        Self {
            http,
            url,
            table,
            opts,
            cardinality_limit,
            body: None,
        }
    }

    async fn make_where(&self, query: &str, from: i64, until: i64) -> Result<String, AppError> {
        let conditions = parse_series_by_tag(query)?;
        let mut terms = parse_terms(&conditions)?;

        // A single term has nothing to reorder against.
        if terms.len() > 1 {
            self.swap_rarest_term(&mut terms, from, until).await?;
        }

        let tagged_where = make_tagged_where(&terms);
        let date_where = make_date_where(from, until)?;

        Ok(format!("{date_where} AND {tagged_where}"))
    }

    /// Samples per-term match counts with one bounded query and moves the
    /// cheapest term into the primary slot. Reordering never changes the
    /// meaning of the final predicate, only its cost.
    async fn swap_rarest_term(
        &self,
        terms: &mut [TaggedTerm],
        from: i64,
        until: i64,
    ) -> Result<(), AppError> {
        let date_where = make_date_where(from, until)?;

        let sub_queries: Vec<String> = terms
            .iter()
            .enumerate()
            .map(|(index, term)| {
                format!(
                    "SELECT {index} AS Stmt FROM {table} WHERE ({date_where}) AND ({tag1_where}) LIMIT {limit}",
                    table = self.table,
                    tag1_where = term_where_primary(term),
                    limit = self.cardinality_limit,
                )
            })
            .collect();

        let sql = format!(
            "SELECT Stmt, count() FROM ({}) GROUP BY Stmt ORDER BY count() LIMIT 1",
            sub_queries.join(" UNION ALL ")
        );

        let body = clickhouse::query(&self.http, &self.url, &sql, &self.table, self.opts).await?;
        apply_sample(terms, &body, self.cardinality_limit)
    }

    /// Builds and runs the main lookup, buffering the raw response. Rows are
    /// deduplicated per path by their latest version and dropped when that
    /// version is flagged deleted.
    pub async fn execute(&mut self, query: &str, from: i64, until: i64) -> Result<(), AppError> {
        let where_clause = self.make_where(query, from, until).await?;
        let sql = format!(
            "SELECT Path FROM {} WHERE {} GROUP BY Path HAVING argMax(Deleted, Version)==0",
            self.table, where_clause
        );
        let body = clickhouse::query(&self.http, &self.url, &sql, &self.table, self.opts).await?;
        self.body = Some(body);
        Ok(())
    }

    /// Buffered paths with blank lines removed. Empty (not missing) before a
    /// successful `execute`.
    pub fn list(&self) -> Vec<&str> {
        match &self.body {
            None => Vec::new(),
            Some(body) => body.lines().filter(|row| !row.is_empty()).collect(),
        }
    }

    pub fn series(&self) -> Vec<&str> {
        self.list()
    }
}

/// Reconstructs the canonical tagged identifier from a path that may carry a
/// query-string suffix of tag pairs: pairs are rendered as `key=value`,
/// sorted, and joined onto the base path with `;`. Cosmetic normalization
/// only, so unrecognized input passes through unchanged.
pub fn abs(path: &str) -> String {
    let Some((base, query)) = path.split_once('?') else {
        return path.to_string();
    };

    let mut pairs: BTreeMap<String, String> = BTreeMap::new();
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        pairs
            .entry(key.into_owned())
            .or_insert_with(|| value.into_owned());
    }
    if pairs.is_empty() {
        return base.to_string();
    }

    let mut tags: Vec<String> = pairs
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    tags.sort();

    format!("{base};{}", tags.join(";"))
}

/// Predicate for the term occupying the primary slot. Positive operators are
/// checked against the indexed Tag1 column only; negative ones must consult
/// the full Tags collection, since the row may carry the same key under a
/// different value elsewhere in the set.
pub(crate) fn term_where_primary(term: &TaggedTerm) -> String {
    let literal = q(&format!("{}={}", term.key, term.value));
    match term.op {
        TermOp::Eq => format!("Tag1={literal}"),
        TermOp::Ne => format!("NOT arrayExists((x) -> x={literal}, Tags)"),
        TermOp::Match => {
            // The LIKE is an index-friendly pre-filter; it selects a superset
            // of the regex match that follows.
            let prefix = q(&format!("{}=%", term.key));
            format!("(Tag1 LIKE {prefix}) AND (match(Tag1, {literal}))")
        }
        TermOp::NotMatch => {
            let prefix = q(&format!("{}=%", term.key));
            format!("NOT arrayExists((x) -> (x LIKE {prefix}) AND (match(x, {literal})), Tags)")
        }
    }
}

/// Predicate for any later slot: an existential (or negated existential) test
/// over every element of the Tags collection.
pub(crate) fn term_where_secondary(term: &TaggedTerm) -> String {
    let literal = q(&format!("{}={}", term.key, term.value));
    match term.op {
        TermOp::Eq => format!("arrayExists((x) -> x={literal}, Tags)"),
        TermOp::Ne => format!("NOT arrayExists((x) -> x={literal}, Tags)"),
        TermOp::Match => {
            let prefix = q(&format!("{}=%", term.key));
            format!("arrayExists((x) -> (x LIKE {prefix}) AND (match(x, {literal})), Tags)")
        }
        TermOp::NotMatch => {
            let prefix = q(&format!("{}=%", term.key));
            format!("NOT arrayExists((x) -> (x LIKE {prefix}) AND (match(x, {literal})), Tags)")
        }
    }
}

pub fn make_tagged_where(terms: &[TaggedTerm]) -> String {
    let mut where_clause = Where::new();
    if let Some((primary, rest)) = terms.split_first() {
        where_clause.and(&term_where_primary(primary));
        for term in rest {
            where_clause.and(&term_where_secondary(term));
        }
    }
    where_clause.to_string()
}

fn make_date_where(from: i64, until: i64) -> Result<String, AppError> {
    let mut where_clause = Where::new();
    where_clause.and(&format!(
        "Date >='{}' AND Date <= '{}'",
        date_literal(from)?,
        date_literal(until)?
    ));
    Ok(where_clause.to_string())
}

fn date_literal(timestamp: i64) -> Result<String, AppError> {
    let date = Utc
        .timestamp_opt(timestamp, 0)
        .single()
        .ok_or_else(|| AppError::BadRequest("timestamp is out of range".into()))?;
    Ok(date.format("%Y-%m-%d").to_string())
}

/// Applies the sampling decision: the response carries the winning
/// `index\tcount` row. No row means no evidence, keep the default order. A
/// count equal to the cap is inconclusive (the true cardinality could be
/// anything at or above it), so the default order is kept there too.
fn apply_sample(terms: &mut [TaggedTerm], body: &str, limit: usize) -> Result<(), AppError> {
    let Some((index, count)) = rarest_candidate(body)? else {
        return Ok(());
    };
    if index >= terms.len() {
        return Err(AppError::Internal(format!(
            "cardinality sample referenced term {index} of {}",
            terms.len()
        )));
    }
    if index != 0 && count != limit as u64 {
        terms.swap(0, index);
    }
    Ok(())
}

fn rarest_candidate(body: &str) -> Result<Option<(usize, u64)>, AppError> {
    let Some(row) = body.lines().next() else {
        return Ok(None);
    };
    if row.is_empty() {
        return Ok(None);
    }
    let mut columns = row.split('\t');
    let index = columns
        .next()
        .and_then(|col| col.parse::<usize>().ok())
        .ok_or_else(|| bad_sample_row(row))?;
    let count = columns
        .next()
        .and_then(|col| col.parse::<u64>().ok())
        .ok_or_else(|| bad_sample_row(row))?;
    Ok(Some((index, count)))
}

fn bad_sample_row(row: &str) -> AppError {
    AppError::Internal(format!("unexpected cardinality response row: {row:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn term(key: &str, op: TermOp, value: &str) -> TaggedTerm {
        TaggedTerm {
            key: key.to_string(),
            op,
            value: value.to_string(),
        }
    }

    fn opts() -> Options {
        Options {
            timeout: Duration::from_secs(1),
        }
    }

    fn new_finder(url: &str, cardinality_limit: usize) -> TaggedFinder {
        TaggedFinder::new(
            reqwest::Client::new(),
            url.to_string(),
            "tbl".to_string(),
            opts(),
            cardinality_limit,
        )
    }

    async fn spawn_clickhouse_stub(body: &'static str) -> String {
        let app = axum::Router::new().fallback(move || async move { body });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn primary_predicates_per_operator() {
        assert_eq!(
            term_where_primary(&term("key", TermOp::Eq, "value")),
            "Tag1='key=value'"
        );
        assert_eq!(
            term_where_primary(&term("key", TermOp::Ne, "value")),
            "NOT arrayExists((x) -> x='key=value', Tags)"
        );
        assert_eq!(
            term_where_primary(&term("key", TermOp::Match, "value")),
            "(Tag1 LIKE 'key=%') AND (match(Tag1, 'key=value'))"
        );
        assert_eq!(
            term_where_primary(&term("key", TermOp::NotMatch, "value")),
            "NOT arrayExists((x) -> (x LIKE 'key=%') AND (match(x, 'key=value')), Tags)"
        );
    }

    #[test]
    fn secondary_predicates_per_operator() {
        assert_eq!(
            term_where_secondary(&term("key", TermOp::Eq, "value")),
            "arrayExists((x) -> x='key=value', Tags)"
        );
        assert_eq!(
            term_where_secondary(&term("key", TermOp::Ne, "value")),
            "NOT arrayExists((x) -> x='key=value', Tags)"
        );
        assert_eq!(
            term_where_secondary(&term("key", TermOp::Match, "value")),
            "arrayExists((x) -> (x LIKE 'key=%') AND (match(x, 'key=value')), Tags)"
        );
        assert_eq!(
            term_where_secondary(&term("key", TermOp::NotMatch, "value")),
            "NOT arrayExists((x) -> (x LIKE 'key=%') AND (match(x, 'key=value')), Tags)"
        );
    }

    #[test]
    fn quoting_flows_through_predicates() {
        assert_eq!(
            term_where_primary(&term("key", TermOp::Eq, "o'brien")),
            r"Tag1='key=o\'brien'"
        );
    }

    #[test]
    fn sample_swaps_rarest_term_into_primary_slot() {
        let mut terms = vec![
            term("a", TermOp::Eq, "1"),
            term("b", TermOp::Eq, "2"),
            term("c", TermOp::Eq, "3"),
        ];
        apply_sample(&mut terms, "1\t50\n", 1000).unwrap();
        assert_eq!(terms[0].key, "b");
        assert_eq!(terms[1].key, "a");
        assert_eq!(terms[2].key, "c");
    }

    #[test]
    fn sample_at_cap_is_inconclusive() {
        let mut terms = vec![term("a", TermOp::Eq, "1"), term("b", TermOp::Eq, "2")];
        apply_sample(&mut terms, "1\t1000\n", 1000).unwrap();
        assert_eq!(terms[0].key, "a");
    }

    #[test]
    fn sample_winning_primary_is_a_noop() {
        let mut terms = vec![term("a", TermOp::Eq, "1"), term("b", TermOp::Eq, "2")];
        apply_sample(&mut terms, "0\t50\n", 1000).unwrap();
        assert_eq!(terms[0].key, "a");
    }

    #[test]
    fn empty_sample_keeps_default_order() {
        let mut terms = vec![term("a", TermOp::Eq, "1"), term("b", TermOp::Eq, "2")];
        apply_sample(&mut terms, "", 1000).unwrap();
        assert_eq!(terms[0].key, "a");
    }

    #[test]
    fn malformed_sample_is_an_error() {
        let mut terms = vec![term("a", TermOp::Eq, "1"), term("b", TermOp::Eq, "2")];
        assert!(apply_sample(&mut terms, "nope\t5\n", 1000).is_err());
        assert!(apply_sample(&mut terms, "1\n", 1000).is_err());
        assert!(apply_sample(&mut terms, "7\t5\n", 1000).is_err());
    }

    #[test]
    fn list_is_empty_before_execute() {
        let finder = new_finder("http://127.0.0.1:9", 0);
        assert!(finder.list().is_empty());
        assert!(finder.series().is_empty());
    }

    #[test]
    fn list_drops_blank_lines() {
        let mut finder = new_finder("http://127.0.0.1:9", 0);
        finder.body = Some("a\n\nb\n".to_string());
        assert_eq!(finder.list(), vec!["a", "b"]);
    }

    #[test]
    fn abs_sorts_tag_pairs() {
        assert_eq!(abs("path?b=2&a=1"), "path;a=1;b=2");
    }

    #[test]
    fn abs_passes_bare_paths_through() {
        assert_eq!(abs("path"), "path");
        assert_eq!(abs("path?"), "path");
    }

    #[tokio::test]
    async fn make_where_builds_expected_predicates() {
        let cases = [
            (
                "seriesByTag('key=value')",
                "(Date >='1970-01-01' AND Date <= '1970-01-01') AND (Tag1='key=value')",
            ),
            (
                "seriesByTag('name=rps')",
                "(Date >='1970-01-01' AND Date <= '1970-01-01') AND (Tag1='__name__=rps')",
            ),
            (
                "seriesByTag('name=rps', 'key=~value')",
                "(Date >='1970-01-01' AND Date <= '1970-01-01') AND (Tag1='__name__=rps') AND (arrayExists((x) -> (x LIKE 'key=%') AND (match(x, 'key=value')), Tags))",
            ),
        ];

        // The stub answers the sampling query with an empty body, so the
        // default ordering stays in effect.
        let url = spawn_clickhouse_stub("").await;
        for (query, expected) in cases {
            let finder = new_finder(&url, 0);
            let where_clause = finder.make_where(query, 0, 0).await.unwrap();
            assert_eq!(where_clause, expected, "query: {query}");
        }
    }

    #[tokio::test]
    async fn make_where_applies_sampled_swap() {
        let url = spawn_clickhouse_stub("1\t1\n").await;
        let finder = new_finder(&url, 1000);
        let where_clause = finder
            .make_where("seriesByTag('name=rps', 'key=value')", 0, 0)
            .await
            .unwrap();
        assert_eq!(
            where_clause,
            "(Date >='1970-01-01' AND Date <= '1970-01-01') AND (Tag1='key=value') AND (arrayExists((x) -> x='__name__=rps', Tags))"
        );
    }

    #[tokio::test]
    async fn single_term_skips_sampling() {
        // Unroutable stub: any sampling attempt would fail the lookup.
        let finder = new_finder("http://127.0.0.1:9", 1000);
        let where_clause = finder
            .make_where("seriesByTag('key=value')", 0, 0)
            .await
            .unwrap();
        assert_eq!(
            where_clause,
            "(Date >='1970-01-01' AND Date <= '1970-01-01') AND (Tag1='key=value')"
        );
    }

    #[tokio::test]
    async fn execute_buffers_response_paths() {
        let url = spawn_clickhouse_stub("cpu.load?env=prod\n").await;
        let mut finder = new_finder(&url, 0);
        finder
            .execute("seriesByTag('key=value')", 0, 0)
            .await
            .unwrap();
        assert_eq!(finder.series(), vec!["cpu.load?env=prod"]);
        assert_eq!(abs(finder.series()[0]), "cpu.load;env=prod");
    }
}
