// 🔎 Query Engine - QuerySpec → parameterized SQL
//
// The SQL text only ever contains placeholders; identifiers, bounds, bucket
// widths and limits travel as bound parameters.
//
// Results are read page by page with keyset pagination over
// (ts, source id, row id), which is a total order for raw readings and for
// (source, bucket) aggregates alike.

use crate::error::{Error, Result};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ============================================================================
// AGGREGATION MODES
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMode {
    /// Raw readings, no bucketing
    #[default]
    None,
    Sum,
    Average,
    Median,
}

impl AggregationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationMode::None => "none",
            AggregationMode::Sum => "sum",
            AggregationMode::Average => "average",
            AggregationMode::Median => "median",
        }
    }

    pub fn is_aggregate(&self) -> bool {
        !matches!(self, AggregationMode::None)
    }
}

impl FromStr for AggregationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(AggregationMode::None),
            "sum" => Ok(AggregationMode::Sum),
            "average" | "avg" => Ok(AggregationMode::Average),
            "median" => Ok(AggregationMode::Median),
            other => Err(Error::UnsupportedAggregation(other.to_string())),
        }
    }
}

impl std::fmt::Display for AggregationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend lookup table: aggregation mode → SQL aggregate over `d.value`.
///
/// Supporting a new aggregation is one more entry here.
#[derive(Debug, Clone, Copy)]
pub struct AggregationTable {
    entries: &'static [(AggregationMode, &'static str)],
}

impl AggregationTable {
    pub const fn new(entries: &'static [(AggregationMode, &'static str)]) -> Self {
        AggregationTable { entries }
    }

    pub fn expression(&self, mode: AggregationMode) -> Option<&'static str> {
        self.entries
            .iter()
            .find(|(m, _)| *m == mode)
            .map(|(_, expr)| *expr)
    }

    pub fn supports(&self, mode: AggregationMode) -> bool {
        self.expression(mode).is_some()
    }
}

// ============================================================================
// QUERY SPEC
// ============================================================================

/// What a caller asks for.
///
/// `start`/`end` are inclusive UNIX timestamps; a negative bound means
/// "now plus this many seconds".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub sources: Vec<String>,
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
    /// 0 means unbounded
    #[serde(default)]
    pub limit: u64,
    /// Bucket width in seconds, 0 means no aggregation
    #[serde(default)]
    pub group_width: u64,
    #[serde(default)]
    pub mode: AggregationMode,
    #[serde(default)]
    pub descending: bool,
}

impl QuerySpec {
    pub fn new<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        QuerySpec {
            sources: sources.into_iter().map(Into::into).collect(),
            start: None,
            end: None,
            limit: 0,
            group_width: 0,
            mode: AggregationMode::None,
            descending: false,
        }
    }

    pub fn range(mut self, start: i64, end: i64) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    pub fn since(mut self, start: i64) -> Self {
        self.start = Some(start);
        self
    }

    pub fn until(mut self, end: i64) -> Self {
        self.end = Some(end);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn group_by(mut self, width_seconds: u64, mode: AggregationMode) -> Self {
        self.group_width = width_seconds;
        self.mode = mode;
        self
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    /// Checks that need no store access.
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(Error::InvalidQuery("at least one source is required".into()));
        }
        match (self.mode.is_aggregate(), self.group_width > 0) {
            (true, false) => {
                return Err(Error::InvalidQuery(format!(
                    "mode '{}' requires a bucket width",
                    self.mode
                )))
            }
            (false, true) => {
                return Err(Error::InvalidQuery(
                    "a bucket width requires an aggregation mode".into(),
                ))
            }
            _ => {}
        }
        if self.group_width > i64::MAX as u64 {
            return Err(Error::InvalidQuery("bucket width out of range".into()));
        }
        Ok(())
    }
}

/// Turn a possibly relative bound into an absolute timestamp
pub fn resolve_bound(bound: i64, now: i64) -> i64 {
    if bound < 0 {
        now.saturating_add(bound)
    } else {
        bound
    }
}

// ============================================================================
// QUERY PLAN
// ============================================================================

/// Position of the last row handed out, used to fetch the next page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorKey {
    pub timestamp: i64,
    pub source_id: i64,
    pub row: i64,
}

/// Parameterized SQL for one query, ready to be paged through.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    select: String,
    params: Vec<Value>,
    descending: bool,
    limit: Option<u64>,
}

impl QueryPlan {
    /// Build the plan for already-resolved source row ids.
    pub fn build(
        spec: &QuerySpec,
        source_ids: &[i64],
        now: i64,
        aggregations: &AggregationTable,
    ) -> Result<QueryPlan> {
        spec.validate()?;
        if source_ids.is_empty() {
            return Err(Error::InvalidQuery("no resolvable sources".into()));
        }

        let start = spec.start.map(|b| resolve_bound(b, now));
        let end = spec.end.map(|b| resolve_bound(b, now));
        if let (Some(start), Some(end)) = (start, end) {
            if end < start {
                return Err(Error::InvalidQuery(format!(
                    "range end {} is before start {}",
                    end, start
                )));
            }
        }

        let mut select = String::new();
        let mut params = Vec::new();
        let width = spec.group_width as i64;

        if spec.mode.is_aggregate() {
            let expr = aggregations
                .expression(spec.mode)
                .ok_or_else(|| Error::UnsupportedAggregation(spec.mode.to_string()))?;
            select.push_str("SELECT s.public_id AS source, (d.ts / ?) * ? AS ts, ");
            params.push(Value::Integer(width));
            params.push(Value::Integer(width));
            select.push_str(expr);
            select.push_str(" AS value, d.source_id AS sid, 0 AS rid");
        } else {
            select.push_str(
                "SELECT s.public_id AS source, d.ts AS ts, d.value AS value, \
                 d.source_id AS sid, d.rowid AS rid",
            );
        }

        select.push_str(" FROM data d JOIN sources s ON s.id = d.source_id WHERE d.source_id IN (");
        select.push_str(&vec!["?"; source_ids.len()].join(", "));
        select.push(')');
        params.extend(source_ids.iter().map(|id| Value::Integer(*id)));

        if let Some(start) = start {
            select.push_str(" AND d.ts >= ?");
            params.push(Value::Integer(start));
        }
        if let Some(end) = end {
            select.push_str(" AND d.ts <= ?");
            params.push(Value::Integer(end));
        }

        if spec.mode.is_aggregate() {
            select.push_str(" GROUP BY d.source_id, d.ts / ?");
            params.push(Value::Integer(width));
        }

        Ok(QueryPlan {
            select,
            params,
            descending: spec.descending,
            limit: (spec.limit > 0).then_some(spec.limit),
        })
    }

    /// Inner select, without ordering or paging
    pub fn sql(&self) -> &str {
        &self.select
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn is_descending(&self) -> bool {
        self.descending
    }

    /// SQL and parameters for the page following `after`.
    pub fn page(&self, after: Option<&CursorKey>, size: u64) -> (String, Vec<Value>) {
        let (cmp, dir) = if self.descending { ("<", "DESC") } else { (">", "ASC") };

        let mut sql = format!("SELECT source, ts, value, sid, rid FROM ({})", self.select);
        let mut params = self.params.clone();

        if let Some(key) = after {
            sql.push_str(&format!(" WHERE (ts, sid, rid) {} (?, ?, ?)", cmp));
            params.push(Value::Integer(key.timestamp));
            params.push(Value::Integer(key.source_id));
            params.push(Value::Integer(key.row));
        }

        sql.push_str(&format!(" ORDER BY ts {dir}, sid {dir}, rid {dir} LIMIT ?"));
        params.push(Value::Integer(size.min(i64::MAX as u64) as i64));

        (sql, params)
    }
}

// ============================================================================
// TESTS
// ============================================================================
