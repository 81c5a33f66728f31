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

use std::{collections::HashSet, time::Instant};

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::Request,
    middleware::{self, Next},
    response::Response,
    routing::get,
};
use chrono::Utc;
use serde::Deserialize;

use crate::{
    clickhouse,
    error::AppError,
    sql::{Where, q},
    tagged::{NAME_TAG, abs, make_tagged_where, parse_terms},
};

use super::state::AppState;

const DEFAULT_SERIES_LOOKBACK_SECS: i64 = 5 * 24 * 60 * 60;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/tags/autoComplete/tags", get(tag_names))
        .route("/tags/autoComplete/values", get(tag_values))
        .route("/tags/series", get(find_series))
        .with_state(state)
        .layer(middleware::from_fn(log_requests))
}

#[derive(Debug, Deserialize)]
struct SeriesParams {
    target: String,
    from: Option<i64>,
    until: Option<i64>,
}

/// Autocomplete parameters arrive as raw pairs because `expr` may repeat.
#[derive(Debug, Default)]
struct AutocompleteParams {
    exprs: Vec<String>,
    tag_prefix: String,
    tag: String,
    value_prefix: String,
    limit: Option<usize>,
}

async fn find_series(
    State(state): State<AppState>,
    Query(params): Query<SeriesParams>,
) -> Result<Json<Vec<String>>, AppError> {
    let until = params.until.unwrap_or_else(current_time_secs);
    let from = params
        .from
        .unwrap_or_else(|| until.saturating_sub(DEFAULT_SERIES_LOOKBACK_SECS));
    log::debug!(
        "series lookup: target=`{}` from={from} until={until}",
        params.target
    );
    let mut finder = state.finder();
    finder.execute(&params.target, from, until).await?;
    let series: Vec<String> = finder.series().iter().map(|path| abs(path)).collect();
    Ok(Json(series))
}

async fn tag_names(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<Vec<String>>, AppError> {
    let params = autocomplete_params(pairs)?;
    let limit = state.clamp_limit(params.limit);
    let (expr_clause, used) = expr_where(&params.exprs)?;

    let mut where_clause = Where::new();
    where_clause.and(&expr_clause);
    let value_sql = if used.is_empty() {
        if !params.tag_prefix.is_empty() {
            where_clause.and(&format!("Tag1 LIKE {}", q(&format!("{}%", params.tag_prefix))));
        }
        "splitByChar('=', Tag1)[1] AS value"
    } else {
        if !params.tag_prefix.is_empty() {
            where_clause.and(&format!(
                "arrayJoin(Tags) LIKE {}",
                q(&format!("{}%", params.tag_prefix))
            ));
        }
        "splitByChar('=', arrayJoin(Tags))[1] AS value"
    };
    append_freshness(&mut where_clause, state.autocomplete_days());

    // Used tags are filtered out after the query, so widen the limit to
    // compensate for rows they may occupy.
    let sql = format!(
        "SELECT {value_sql} FROM {} {} GROUP BY value ORDER BY value LIMIT {}",
        state.table(),
        where_clause.sql(),
        limit + used.len()
    );
    let body = clickhouse::query(state.http(), state.url(), &sql, state.table(), state.options())
        .await?;

    Ok(Json(collect_tag_names(
        &body,
        &used,
        &params.tag_prefix,
        limit,
    )))
}

async fn tag_values(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<Vec<String>>, AppError> {
    let params = autocomplete_params(pairs)?;
    if params.tag.is_empty() {
        return Err(AppError::BadRequest("tag parameter is required".into()));
    }
    let tag = if params.tag == "name" {
        NAME_TAG
    } else {
        params.tag.as_str()
    };
    let limit = state.clamp_limit(params.limit);
    let (expr_clause, used) = expr_where(&params.exprs)?;

    let mut where_clause = Where::new();
    where_clause.and(&expr_clause);
    let prefix = q(&format!("{tag}={}%", params.value_prefix));
    let value_sql = if used.is_empty() {
        where_clause.and(&format!("Tag1 LIKE {prefix}"));
        "splitByChar('=', Tag1)[2] AS value"
    } else {
        where_clause.and(&format!("arrayJoin(Tags) LIKE {prefix}"));
        "splitByChar('=', arrayJoin(Tags))[2] AS value"
    };
    append_freshness(&mut where_clause, state.autocomplete_days());

    let sql = format!(
        "SELECT {value_sql} FROM {} {} GROUP BY value ORDER BY value LIMIT {limit}",
        state.table(),
        where_clause.sql()
    );
    let body = clickhouse::query(state.http(), state.url(), &sql, state.table(), state.options())
        .await?;

    let values: Vec<String> = body.lines().map(str::to_string).collect();
    Ok(Json(values))
}

fn autocomplete_params(pairs: Vec<(String, String)>) -> Result<AutocompleteParams, AppError> {
    let mut params = AutocompleteParams::default();
    for (key, value) in pairs {
        match key.as_str() {
            "expr" => {
                if !value.is_empty() {
                    params.exprs.push(value);
                }
            }
            "tagPrefix" => params.tag_prefix = value,
            "tag" => params.tag = value,
            "valuePrefix" => params.value_prefix = value,
            "limit" => {
                let parsed = value
                    .parse()
                    .map_err(|err| AppError::BadRequest(format!("invalid limit {value:?}: {err}")))?;
                params.limit = Some(parsed);
            }
            _ => {}
        }
    }
    Ok(params)
}

/// Renders the already-selected tag filters into a predicate and collects the
/// keys they bind, so autocomplete can exclude them from its suggestions.
fn expr_where(exprs: &[String]) -> Result<(String, HashSet<String>), AppError> {
    let mut used = HashSet::new();
    if exprs.is_empty() {
        return Ok((String::new(), used));
    }
    let terms = parse_terms(exprs)?;
    for term in &terms {
        used.insert(term.key.clone());
        if term.key == NAME_TAG {
            used.insert("name".to_string());
        }
    }
    Ok((make_tagged_where(&terms), used))
}

fn append_freshness(where_clause: &mut Where, days: i64) {
    let from_date = Utc::now() - chrono::Duration::days(days);
    where_clause.and(&format!("Date >= '{}'", from_date.format("%Y-%m-%d")));
    where_clause.and("Deleted = 0");
}

fn collect_tag_names(
    body: &str,
    used: &HashSet<String>,
    tag_prefix: &str,
    limit: usize,
) -> Vec<String> {
    let mut tags = Vec::new();
    let mut has_name = false;
    for row in body.lines() {
        if row.is_empty() {
            continue;
        }
        let row = if row == NAME_TAG { "name" } else { row };
        if used.contains(row) {
            continue;
        }
        if row == "name" {
            has_name = true;
        }
        tags.push(row.to_string());
    }

    // The reserved name tag is always suggestible, even before any tagged
    // series mention it in the lookback window.
    if !has_name && !used.contains("name") && (tag_prefix.is_empty() || "name".starts_with(tag_prefix))
    {
        tags.push("name".to_string());
    }

    tags.sort();
    tags.truncate(limit);
    tags
}

fn current_time_secs() -> i64 {
    Utc::now().timestamp()
}

async fn log_requests(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let start = Instant::now();
    let response = next.run(req).await;
    log::info!(
        "{} {} -> {} ({:?})",
        method,
        uri,
        response.status(),
        start.elapsed()
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn collects_repeated_exprs_and_limit() {
        let params = autocomplete_params(pairs(&[
            ("expr", "a=b"),
            ("expr", ""),
            ("expr", "c!=d"),
            ("tagPrefix", "ho"),
            ("limit", "50"),
        ]))
        .unwrap();
        assert_eq!(params.exprs, vec!["a=b", "c!=d"]);
        assert_eq!(params.tag_prefix, "ho");
        assert_eq!(params.limit, Some(50));
    }

    #[test]
    fn rejects_non_numeric_limit() {
        let err = autocomplete_params(pairs(&[("limit", "lots")])).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn expr_where_tracks_used_tags() {
        let (clause, used) = expr_where(&["name=rps".to_string(), "env=prod".to_string()]).unwrap();
        assert_eq!(
            clause,
            "(Tag1='__name__=rps') AND (arrayExists((x) -> x='env=prod', Tags))"
        );
        assert!(used.contains(NAME_TAG));
        assert!(used.contains("name"));
        assert!(used.contains("env"));
    }

    #[test]
    fn expr_where_without_filters_is_empty() {
        let (clause, used) = expr_where(&[]).unwrap();
        assert!(clause.is_empty());
        assert!(used.is_empty());
    }

    #[test]
    fn tag_listing_renames_reserved_key_and_injects_name() {
        let tags = collect_tag_names("__name__\nhost\n", &HashSet::new(), "", 100);
        assert_eq!(tags, vec!["host", "name"]);

        let tags = collect_tag_names("host\nrole\n", &HashSet::new(), "", 100);
        assert_eq!(tags, vec!["host", "name", "role"]);
    }

    #[test]
    fn tag_listing_filters_used_and_prefix() {
        let used: HashSet<String> = ["host".to_string()].into_iter().collect();
        let tags = collect_tag_names("host\nrole\n", &used, "ro", 100);
        assert_eq!(tags, vec!["role"]);
    }

    #[test]
    fn tag_listing_honors_limit() {
        let tags = collect_tag_names("a\nb\nc\n", &HashSet::new(), "", 2);
        assert_eq!(tags, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn values_require_a_tag_parameter() {
        let app = Router::new().fallback(|| async { "" });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let state = AppState::bootstrap(crate::app::AppConfig {
            url: format!("http://{addr}"),
            table: "tbl".to_string(),
            query_timeout_secs: 1,
            connect_timeout_secs: 1,
            cardinality_limit: 0,
            autocomplete_days: 7,
        })
        .await
        .unwrap();

        let err = tag_values(State(state), Query(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
