//! # Query Shaping
//!
//! Translates the public REST query parameters into engine search requests
//! and shapes engine results into the documented response bodies. All filter
//! values pass through escaping so an embedded quote can never terminate the
//! filter string.

use std::collections::BTreeSet;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::engine::{SearchRequest, SearchResults};

/// Default and bounds for the /search `limit` parameter.
pub const SEARCH_LIMIT_DEFAULT: usize = 20;
pub const SEARCH_LIMIT_MAX: usize = 100;

/// Fixed limits for the shaped endpoints.
pub const TRACE_LIMIT: usize = 500;
pub const ERRORS_LIMIT: usize = 30;

/// Window applied to /errors when `since` is absent.
const ERRORS_DEFAULT_SINCE: &str = "1h";

/// Malformed query input. Always maps to a 400; never touches server state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("invalid since value: {0:?}")]
    InvalidSince(String),
    #[error("invalid filter value: {0:?}")]
    InvalidValue(String),
}

/// Query parameters for /search.
#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
    pub project: Option<String>,
    pub level: Option<String>,
    #[serde(rename = "traceId")]
    pub trace_id: Option<String>,
    pub environment: Option<String>,
    pub since: Option<String>,
    pub limit: Option<usize>,
}

/// Query parameters for /errors.
#[derive(Debug, Default, Deserialize)]
pub struct ErrorsParams {
    pub since: Option<String>,
    pub project: Option<String>,
    pub q: Option<String>,
}

/// Parse a duration specifier like `30s`, `5m`, `1h`, `2d` into milliseconds.
pub fn parse_since(s: &str) -> Result<i64, QueryError> {
    let invalid = || QueryError::InvalidSince(s.to_string());
    if s.len() < 2 || !s.is_ascii() {
        return Err(invalid());
    }
    let (digits, unit) = s.split_at(s.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let count: i64 = digits.parse().map_err(|_| invalid())?;
    let multiplier = match unit {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return Err(invalid()),
    };
    count.checked_mul(multiplier).ok_or_else(invalid)
}

/// Escape a value for inclusion in a quoted filter string. Control
/// characters are rejected outright.
fn escape_value(value: &str) -> Result<String, QueryError> {
    if value.chars().any(char::is_control) {
        return Err(QueryError::InvalidValue(value.to_string()));
    }
    Ok(value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn equality(attr: &str, value: &str) -> Result<String, QueryError> {
    Ok(format!("{attr} = \"{}\"", escape_value(value)?))
}

/// AND together the optional equality clauses and the time cutoff.
fn build_filter(
    project: Option<&str>,
    level: Option<&str>,
    trace_id: Option<&str>,
    environment: Option<&str>,
    cutoff_ms: Option<i64>,
) -> Result<Option<String>, QueryError> {
    let mut clauses: Vec<String> = Vec::new();
    if let Some(project) = project {
        clauses.push(equality("project", project)?);
    }
    if let Some(level) = level {
        clauses.push(equality("level", level)?);
    }
    if let Some(trace_id) = trace_id {
        clauses.push(equality("traceId", trace_id)?);
    }
    if let Some(environment) = environment {
        clauses.push(equality("environment", environment)?);
    }
    if let Some(cutoff) = cutoff_ms {
        clauses.push(format!("timestampMs > {cutoff}"));
    }
    if clauses.is_empty() {
        Ok(None)
    } else {
        Ok(Some(clauses.join(" AND ")))
    }
}

fn cutoff_from(since: Option<&str>) -> Result<Option<i64>, QueryError> {
    match since {
        Some(s) => Ok(Some(Utc::now().timestamp_millis() - parse_since(s)?)),
        None => Ok(None),
    }
}

/// Build the engine request for /search.
pub fn search_request(params: &SearchParams) -> Result<SearchRequest, QueryError> {
    let filter = build_filter(
        params.project.as_deref(),
        params.level.as_deref(),
        params.trace_id.as_deref(),
        params.environment.as_deref(),
        cutoff_from(params.since.as_deref())?,
    )?;
    Ok(SearchRequest {
        q: params.q.clone().unwrap_or_default(),
        filter,
        sort: vec!["timestamp:desc".to_string()],
        limit: params
            .limit
            .unwrap_or(SEARCH_LIMIT_DEFAULT)
            .clamp(1, SEARCH_LIMIT_MAX),
        facets: Some(vec!["project".to_string(), "level".to_string()]),
    })
}

pub fn shape_search(results: SearchResults) -> Value {
    json!({
        "totalHits": results.estimated_total_hits,
        "facets": {
            "project": facet(&results, "project"),
            "level": facet(&results, "level"),
        },
        "hits": results.hits,
    })
}

/// Build the engine request for /trace/{id}.
pub fn trace_request(trace_id: &str) -> Result<SearchRequest, QueryError> {
    Ok(SearchRequest {
        q: String::new(),
        filter: Some(equality("traceId", trace_id)?),
        sort: vec!["timestamp:asc".to_string()],
        limit: TRACE_LIMIT,
        facets: None,
    })
}

pub fn shape_trace(trace_id: &str, results: SearchResults) -> Value {
    let projects: BTreeSet<&str> = results
        .hits
        .iter()
        .filter_map(|hit| hit.get("project").and_then(Value::as_str))
        .collect();
    json!({
        "traceId": trace_id,
        "eventCount": results.hits.len(),
        "projects": projects,
        "timeline": results.hits,
    })
}

/// Build the engine request for /errors. The level disjunction is wrapped in
/// parens before AND-ing the remaining clauses.
pub fn errors_request(params: &ErrorsParams) -> Result<SearchRequest, QueryError> {
    let since = params.since.as_deref().unwrap_or(ERRORS_DEFAULT_SINCE);
    let mut clauses = vec!["(level = \"error\" OR level = \"fatal\")".to_string()];
    if let Some(project) = params.project.as_deref() {
        clauses.push(equality("project", project)?);
    }
    if let Some(cutoff) = cutoff_from(Some(since))? {
        clauses.push(format!("timestampMs > {cutoff}"));
    }
    Ok(SearchRequest {
        q: params.q.clone().unwrap_or_default(),
        filter: Some(clauses.join(" AND ")),
        sort: vec!["timestamp:desc".to_string()],
        limit: ERRORS_LIMIT,
        facets: Some(vec!["project".to_string()]),
    })
}

pub fn shape_errors(results: SearchResults) -> Value {
    json!({
        "totalErrors": results.estimated_total_hits,
        "byProject": facet(&results, "project"),
        "recentErrors": results.hits,
    })
}

/// Build the engine request for /projects: facets only, no hits.
pub fn projects_request() -> SearchRequest {
    SearchRequest {
        q: String::new(),
        filter: None,
        sort: Vec::new(),
        limit: 0,
        facets: Some(vec![
            "project".to_string(),
            "level".to_string(),
            "environment".to_string(),
        ]),
    }
}

pub fn shape_projects(results: SearchResults) -> Value {
    json!({
        "totalLogs": results.estimated_total_hits,
        "byProject": facet(&results, "project"),
        "byLevel": facet(&results, "level"),
        "byEnvironment": facet(&results, "environment"),
    })
}

fn facet(results: &SearchResults, name: &str) -> Value {
    results
        .facet_distribution
        .get(name)
        .map(|counts| json!(counts))
        .unwrap_or_else(|| json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_since_accepts_the_four_units() {
        assert_eq!(parse_since("30s").unwrap(), 30_000);
        assert_eq!(parse_since("5m").unwrap(), 300_000);
        assert_eq!(parse_since("1h").unwrap(), 3_600_000);
        assert_eq!(parse_since("2d").unwrap(), 172_800_000);
    }

    #[test]
    fn parse_since_rejects_malformed_input() {
        for bad in ["", "h", "1", "-5m", "5 m", "5x", "m5", "1.5h", "∞h"] {
            assert!(parse_since(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn quotes_cannot_escape_the_filter_string() {
        let filter = build_filter(Some("a\" OR level = \"debug"), None, None, None, None)
            .unwrap()
            .unwrap();
        assert_eq!(filter, "project = \"a\\\" OR level = \\\"debug\"");
    }

    #[test]
    fn control_characters_are_invalid_values() {
        assert!(matches!(
            build_filter(Some("a\nb"), None, None, None, None),
            Err(QueryError::InvalidValue(_))
        ));
    }

    #[test]
    fn filter_clauses_are_anded_in_order() {
        let filter = build_filter(Some("api"), Some("error"), Some("t-1"), Some("prod"), Some(42))
            .unwrap()
            .unwrap();
        assert_eq!(
            filter,
            "project = \"api\" AND level = \"error\" AND traceId = \"t-1\" \
             AND environment = \"prod\" AND timestampMs > 42"
        );
    }

    #[test]
    fn empty_filter_is_none() {
        assert_eq!(build_filter(None, None, None, None, None).unwrap(), None);
    }

    #[test]
    fn search_request_defaults_and_clamps() {
        let request = search_request(&SearchParams::default()).unwrap();
        assert_eq!(request.limit, SEARCH_LIMIT_DEFAULT);
        assert_eq!(request.filter, None);
        assert_eq!(request.sort, vec!["timestamp:desc"]);

        let request = search_request(&SearchParams {
            limit: Some(10_000),
            ..SearchParams::default()
        })
        .unwrap();
        assert_eq!(request.limit, SEARCH_LIMIT_MAX);

        let request = search_request(&SearchParams {
            limit: Some(0),
            ..SearchParams::default()
        })
        .unwrap();
        assert_eq!(request.limit, 1);
    }

    #[test]
    fn search_request_applies_since_cutoff() {
        let request = search_request(&SearchParams {
            since: Some("1h".to_string()),
            ..SearchParams::default()
        })
        .unwrap();
        let filter = request.filter.unwrap();
        assert!(filter.starts_with("timestampMs > "));
        let cutoff: i64 = filter["timestampMs > ".len()..].parse().unwrap();
        let expected = Utc::now().timestamp_millis() - 3_600_000;
        assert!((cutoff - expected).abs() < 5_000);
    }

    #[test]
    fn search_request_propagates_bad_since() {
        let err = search_request(&SearchParams {
            since: Some("soon".to_string()),
            ..SearchParams::default()
        })
        .unwrap_err();
        assert!(matches!(err, QueryError::InvalidSince(_)));
    }

    #[test]
    fn errors_request_wraps_level_disjunction() {
        let request = errors_request(&ErrorsParams {
            project: Some("api".to_string()),
            ..ErrorsParams::default()
        })
        .unwrap();
        let filter = request.filter.unwrap();
        assert!(filter.starts_with("(level = \"error\" OR level = \"fatal\") AND project = \"api\""));
        assert!(filter.contains("timestampMs > "));
        assert_eq!(request.limit, ERRORS_LIMIT);
    }

    #[test]
    fn trace_request_sorts_ascending() {
        let request = trace_request("t-1").unwrap();
        assert_eq!(request.filter.unwrap(), "traceId = \"t-1\"");
        assert_eq!(request.sort, vec!["timestamp:asc"]);
        assert_eq!(request.limit, TRACE_LIMIT);
    }

    #[test]
    fn shape_trace_collects_unique_projects() {
        let results = SearchResults {
            hits: vec![
                json!({"project": "svcA", "message": "a"}),
                json!({"project": "svcB", "message": "b"}),
                json!({"project": "svcA", "message": "c"}),
            ],
            ..SearchResults::default()
        };
        let shaped = shape_trace("t-1", results);
        assert_eq!(shaped["eventCount"], 3);
        assert_eq!(shaped["projects"], json!(["svcA", "svcB"]));
        assert_eq!(shaped["timeline"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn shape_search_always_exposes_both_facets() {
        let shaped = shape_search(SearchResults::default());
        assert_eq!(shaped["totalHits"], 0);
        assert_eq!(shaped["facets"]["project"], json!({}));
        assert_eq!(shaped["facets"]["level"], json!({}));
    }

    #[test]
    fn shape_projects_splits_facets() {
        let mut results = SearchResults::default();
        results.estimated_total_hits = 7;
        results
            .facet_distribution
            .insert("project".into(), [("api".to_string(), 4u64)].into());
        results
            .facet_distribution
            .insert("level".into(), [("info".to_string(), 7u64)].into());
        let shaped = shape_projects(results);
        assert_eq!(shaped["totalLogs"], 7);
        assert_eq!(shaped["byProject"]["api"], 4);
        assert_eq!(shaped["byLevel"]["info"], 7);
        assert_eq!(shaped["byEnvironment"], json!({}));
    }
}
