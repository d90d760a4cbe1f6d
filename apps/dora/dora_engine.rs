//! # DORA Engine - Delivery Performance Metrics
//!
//! Correlation and aggregation engine that turns three independently arriving
//! event streams (merged pull requests, deployments, monitoring alerts) into
//! the four DORA metrics: deployment frequency, lead time for changes, mean
//! time to recovery and change failure rate.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              DORA ENGINE                                     │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  WEBHOOKS → EVENT STORE → CORRELATORS → AGGREGATOR → REPORTS / FORECASTS    │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Idempotent ingestion**: every event kind is upserted by its natural key
//! - **Pure correlators**: lead time, MTTR and CFR are side-effect free joins
//! - **Calendar buckets**: daily, weekly (Sunday-based) and monthly means
//! - **Gap-free series**: daily series ready for forecasting
//! - **Graceful degradation**: naive forecasts for sparse data, structured
//!   error fields when a collaborator fails
//!
//! ## Author
//!
//! AIOps Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::time::timeout;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use parking_lot::RwLock;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------
use ahash::{AHashMap, AHashSet};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};

// ----------------------------------------------------------------------------
// Networking
// ----------------------------------------------------------------------------
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use reqwest::Client as HttpClient;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// Statistics & Math
// ----------------------------------------------------------------------------
use ordered_float::OrderedFloat;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry as PrometheusRegistry, TextEncoder,
};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "dora-engine";
pub const ENGINE_FULL_NAME: &str = "DORA Metrics Engine";

// ----------------------------------------------------------------------------
// Timestamp Layouts
// ----------------------------------------------------------------------------

/// Event timestamp layout with a trailing UTC designator
pub const ISO_LAYOUT_UTC: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Event timestamp layout without the UTC designator
pub const ISO_LAYOUT_NAIVE: &str = "%Y-%m-%dT%H:%M:%S";

/// Layout accepted by the query surface (interpreted as UTC)
pub const QUERY_LAYOUT: &str = "%Y-%m-%d %H:%M:%S";

/// Calendar date layout used for daily keys and series dates
pub const DATE_LAYOUT: &str = "%Y-%m-%d";

/// Alertmanager sends this for alerts that are still firing
pub const ALERTMANAGER_ZERO_TIME: &str = "0001-01-01T00:00:00Z";

// ----------------------------------------------------------------------------
// Collections (natural keys in parentheses)
// ----------------------------------------------------------------------------

/// Merged pull requests (pr_id)
pub const CHANGES_COLLECTION: &str = "github_events";

/// Build / deploy outcomes (build_id)
pub const DEPLOYMENTS_COLLECTION: &str = "jenkins_deployments";

/// Monitoring alerts (alert_id)
pub const INCIDENTS_COLLECTION: &str = "prometheus_alerts";

// ----------------------------------------------------------------------------
// Forecasting
// ----------------------------------------------------------------------------

/// Default forecast horizon (days)
pub const DEFAULT_FORECAST_DAYS: u32 = 30;

/// Smallest accepted forecast horizon (days)
pub const MIN_FORECAST_DAYS: u32 = 1;

/// Largest accepted forecast horizon (days)
pub const MAX_FORECAST_DAYS: u32 = 365;

/// Minimum points before outlier clamping is applied
pub const OUTLIER_CLAMP_MIN_POINTS: usize = 7;

/// IQR multiplier for the outlier fence
pub const IQR_FENCE_MULTIPLIER: f64 = 1.5;

/// Minimum points before the forecasting model is consulted
pub const MODEL_MIN_POINTS: usize = 3;

/// Data span (days) enabling daily seasonality
pub const DAILY_SEASONALITY_MIN_SPAN_DAYS: i64 = 3;

/// Data span (days) enabling weekly seasonality
pub const WEEKLY_SEASONALITY_MIN_SPAN_DAYS: i64 = 14;

/// Data span (days) enabling yearly seasonality
pub const YEARLY_SEASONALITY_MIN_SPAN_DAYS: i64 = 365;

/// Default uncertainty interval width for forecasts
pub const DEFAULT_INTERVAL_WIDTH: f64 = 0.95;

// ----------------------------------------------------------------------------
// Timeouts
// ----------------------------------------------------------------------------

/// Default timeout for event store reads (seconds)
pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 10;

/// Default timeout for the forecasting collaborator (seconds)
pub const DEFAULT_FORECAST_TIMEOUT_SECS: u64 = 30;

/// Default timeout for the insight collaborator (seconds)
pub const DEFAULT_INSIGHT_TIMEOUT_SECS: u64 = 20;

/// Default timeout for fetching a pull request's commits (seconds)
pub const DEFAULT_GITHUB_TIMEOUT_SECS: u64 = 10;

/// Requests slower than this are logged at warn level (milliseconds)
pub const SLOW_QUERY_THRESHOLD_MS: u64 = 2_000;

// ----------------------------------------------------------------------------
// Network
// ----------------------------------------------------------------------------

/// Default HTTP bind address
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";

// ============================================================================
// SECTION 3: TIME & PERIOD UTILITIES
// ============================================================================
// Every timestamp in the engine is a naive UTC wall-clock instant. Event
// timestamps arrive in one of two ISO-8601 layouts; anything else is treated
// as unparseable and the offending record is skipped by the correlators.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp Parsing
// ----------------------------------------------------------------------------

/// Parse an event timestamp.
///
/// Accepts exactly `YYYY-MM-DDTHH:MM:SSZ` and `YYYY-MM-DDTHH:MM:SS`.
/// Returns `None` for anything else, including fractional seconds and offsets.
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    if s.is_empty() {
        return None;
    }
    let layout = if s.ends_with('Z') { ISO_LAYOUT_UTC } else { ISO_LAYOUT_NAIVE };
    NaiveDateTime::parse_from_str(s, layout).ok()
}

/// Parse an optional event timestamp field.
#[inline]
pub fn parse_optional(s: Option<&str>) -> Option<NaiveDateTime> {
    s.and_then(parse_timestamp)
}

/// Parse a query-surface timestamp (`YYYY-MM-DD HH:MM:SS`, UTC).
pub fn parse_query_timestamp(field: &str, s: &str) -> Result<NaiveDateTime, ParseError> {
    NaiveDateTime::parse_from_str(s, QUERY_LAYOUT).map_err(|_| ParseError::InvalidTimestamp {
        field: field.to_string(),
        value: s.to_string(),
        expected: "YYYY-MM-DD HH:MM:SS",
    })
}

/// Format an instant as `YYYY-MM-DDTHH:MM:SSZ`.
#[inline]
pub fn to_iso_utc(t: NaiveDateTime) -> String {
    t.format(ISO_LAYOUT_UTC).to_string()
}

// ----------------------------------------------------------------------------
// 3.2 Period Granularity
// ----------------------------------------------------------------------------

/// Calendar bucket granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Daily,
    Weekly,
    Monthly,
}

impl Granularity {
    /// All granularities, in bucket output order
    pub const ALL: [Granularity; 3] = [Granularity::Daily, Granularity::Weekly, Granularity::Monthly];

    /// Derive the bucket key for an instant.
    ///
    /// Weekly keys use the Sunday-based week of the year (`%U`): days before
    /// the first Sunday of January fall in week `00`. This is not the ISO week
    /// and must stay that way for label compatibility.
    pub fn period_key(&self, t: NaiveDateTime) -> String {
        match self {
            Granularity::Daily => t.format(DATE_LAYOUT).to_string(),
            Granularity::Weekly => t.format("%Y-W%U").to_string(),
            Granularity::Monthly => t.format("%Y-%m").to_string(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Daily => "daily",
            Granularity::Weekly => "weekly",
            Granularity::Monthly => "monthly",
        }
    }
}

impl Display for Granularity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily" => Ok(Granularity::Daily),
            "weekly" => Ok(Granularity::Weekly),
            "monthly" => Ok(Granularity::Monthly),
            other => Err(ParseError::InvalidValue {
                field: "granularity".into(),
                value: other.to_string(),
            }),
        }
    }
}

/// Bucket key for an instant at the given granularity.
#[inline]
pub fn period_key(t: NaiveDateTime, granularity: Granularity) -> String {
    granularity.period_key(t)
}

// ----------------------------------------------------------------------------
// 3.3 Query Window
// ----------------------------------------------------------------------------

/// An inclusive `[start, end]` window of naive UTC instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl QueryWindow {
    /// Create a window, rejecting one whose end precedes its start.
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Result<Self, ParseError> {
        if end < start {
            return Err(ParseError::InvertedWindow {
                start: to_iso_utc(start),
                end: to_iso_utc(end),
            });
        }
        Ok(Self { start, end })
    }

    /// Build a window from query-surface strings (`YYYY-MM-DD HH:MM:SS`).
    pub fn from_query(start: &str, end: &str) -> Result<Self, ParseError> {
        let start = parse_query_timestamp("start_time", start)?;
        let end = parse_query_timestamp("end_time", end)?;
        Self::new(start, end)
    }

    /// Build a window from event-layout strings (`YYYY-MM-DDTHH:MM:SS[Z]`).
    pub fn from_iso(start: &str, end: &str) -> Result<Self, ParseError> {
        let parse = |field: &str, value: &str| {
            parse_timestamp(value).ok_or_else(|| ParseError::InvalidTimestamp {
                field: field.to_string(),
                value: value.to_string(),
                expected: "YYYY-MM-DDTHH:MM:SSZ",
            })
        };
        Self::new(parse("start", start)?, parse("end", end)?)
    }

    #[inline]
    pub fn contains(&self, t: NaiveDateTime) -> bool {
        t >= self.start && t <= self.end
    }

    /// Every calendar date touched by the window, in order.
    pub fn days(&self) -> Vec<NaiveDate> {
        let last = self.end.date();
        let mut dates = Vec::new();
        let mut day = self.start.date();
        while day <= last {
            dates.push(day);
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
        dates
    }

    /// Whole days between start and end.
    #[inline]
    pub fn period_days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn start_iso(&self) -> String {
        to_iso_utc(self.start)
    }

    pub fn end_iso(&self) -> String {
        to_iso_utc(self.end)
    }

    pub fn start_query(&self) -> String {
        self.start.format(QUERY_LAYOUT).to_string()
    }

    pub fn end_query(&self) -> String {
        self.end.format(QUERY_LAYOUT).to_string()
    }
}

impl Display for QueryWindow {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{} .. {}]", self.start_iso(), self.end_iso())
    }
}

// ----------------------------------------------------------------------------
// 3.4 Numeric Helpers
// ----------------------------------------------------------------------------

/// Round to two decimals, the precision of every published metric value.
#[inline]
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Arithmetic mean, `None` for an empty slice.
#[inline]
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// `100 * part / whole`, defined as `0.0` when `whole` is zero.
#[inline]
pub fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// One error type per concern, all convertible into `DoraError`. Record-level
// problems inside a correlation scan are not errors: they are counted as
// `SkipReason`s and the scan continues.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the DORA engine.
#[derive(Error, Debug)]
pub enum DoraError {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Unknown metric '{0}'. Use one of: deployment_frequency, lead_time, mttr, cfr")]
    UnknownMetric(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DoraError {
    /// Check if this error is recoverable by retrying the same request
    pub fn is_recoverable(&self) -> bool {
        match self {
            DoraError::Parse(_) => false,
            DoraError::Config(_) => false,
            DoraError::Store(e) => e.is_recoverable(),
            DoraError::Collaborator(e) => e.is_recoverable(),
            DoraError::Ingest(_) => false,
            DoraError::UnknownMetric(_) => false,
            DoraError::Io(_) => true,
            DoraError::Internal(_) => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            DoraError::Parse(_) => "parse",
            DoraError::Config(_) => "config",
            DoraError::Store(_) => "store",
            DoraError::Collaborator(_) => "collaborator",
            DoraError::Ingest(_) => "ingest",
            DoraError::UnknownMetric(_) => "unknown_metric",
            DoraError::Io(_) => "io",
            DoraError::Internal(_) => "internal",
        }
    }

    /// HTTP status for the query surface
    pub fn status_code(&self) -> StatusCode {
        match self {
            DoraError::Parse(_) | DoraError::UnknownMetric(_) | DoraError::Ingest(_) => {
                StatusCode::BAD_REQUEST
            }
            DoraError::Store(StoreError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Parse Errors
// ----------------------------------------------------------------------------

/// Malformed caller input: window bounds, metric names, horizons.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid datetime for '{field}': '{value}'. Use {expected}")]
    InvalidTimestamp {
        field: String,
        value: String,
        expected: &'static str,
    },

    #[error("Window end {end} precedes start {start}")]
    InvertedWindow { start: String, end: String },

    #[error("Forecast horizon {days} is outside {MIN_FORECAST_DAYS}..={MAX_FORECAST_DAYS} days")]
    HorizonOutOfRange { days: u32 },

    #[error("Invalid value for '{field}': '{value}'")]
    InvalidValue { field: String, value: String },
}

// ----------------------------------------------------------------------------
// 4.3 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Store Errors
// ----------------------------------------------------------------------------

/// Errors from the event store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store operation '{operation}' timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },

    #[error("Snapshot '{path}' could not be used: {message}")]
    Snapshot { path: PathBuf, message: String },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{collection} record has an empty natural key")]
    MissingKey { collection: &'static str },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StoreError::Timeout { .. } | StoreError::Io(_) | StoreError::Unavailable(_)
        )
    }
}

// ----------------------------------------------------------------------------
// 4.5 Collaborator Errors
// ----------------------------------------------------------------------------

/// Failures of the forecasting and text-insight collaborators
#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("{collaborator} timed out after {secs}s")]
    Timeout { collaborator: String, secs: u64 },

    #[error("{collaborator} request failed: {message}")]
    Http { collaborator: String, message: String },

    #[error("{collaborator} returned status {status}: {body}")]
    Status {
        collaborator: String,
        status: u16,
        body: String,
    },

    #[error("{collaborator} returned an unusable response: {message}")]
    InvalidResponse { collaborator: String, message: String },

    #[error("{collaborator} is disabled")]
    Disabled { collaborator: String },
}

impl CollaboratorError {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CollaboratorError::Timeout { .. } | CollaboratorError::Http { .. }
        )
    }

    pub fn http(collaborator: impl Into<String>, err: impl Display) -> Self {
        CollaboratorError::Http {
            collaborator: collaborator.into(),
            message: err.to_string(),
        }
    }

    pub fn invalid_response(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
        CollaboratorError::InvalidResponse {
            collaborator: collaborator.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.6 Ingest Errors
// ----------------------------------------------------------------------------

/// Errors while normalizing a webhook payload into an event record
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("{origin} payload is missing required field '{field}'")]
    MissingField { origin: &'static str, field: &'static str },

    #[error("{origin} payload is invalid: {message}")]
    InvalidPayload { origin: &'static str, message: String },
}

// ----------------------------------------------------------------------------
// 4.7 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for engine operations
pub type DoraResult<T> = Result<T, DoraError>;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for collaborator calls
pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

// ============================================================================
// SECTION 5: EVENT DATA MODEL
// ============================================================================
// The three persisted record kinds. Timestamps are kept as the text the
// source sent; typed accessors parse on demand and yield `None` when the
// text is not one of the two accepted layouts.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Code Change Events
// ----------------------------------------------------------------------------

/// A commit attached to a merged change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    pub sha: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl CommitRef {
    pub fn new(sha: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            sha: sha.into(),
            timestamp: Some(timestamp.into()),
        }
    }

    #[inline]
    pub fn committed_at(&self) -> Option<NaiveDateTime> {
        parse_optional(self.timestamp.as_deref())
    }
}

/// A merged pull request and its commits. Natural key: `pr_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeChangeEvent {
    pub pr_id: u64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub merged_at: Option<String>,
    #[serde(default)]
    pub commits: Vec<CommitRef>,
    #[serde(default)]
    pub target_branch: Option<String>,
}

impl CodeChangeEvent {
    /// A merged change with no metadata beyond its commits
    pub fn merged(pr_id: u64, merged_at: impl Into<String>, commits: Vec<CommitRef>) -> Self {
        Self {
            pr_id,
            title: None,
            author: None,
            created_at: None,
            merged_at: Some(merged_at.into()),
            commits,
            target_branch: None,
        }
    }

    #[inline]
    pub fn merged_at(&self) -> Option<NaiveDateTime> {
        parse_optional(self.merged_at.as_deref())
    }

    #[inline]
    pub fn natural_key(&self) -> String {
        self.pr_id.to_string()
    }
}

// ----------------------------------------------------------------------------
// 5.2 Deployment Events
// ----------------------------------------------------------------------------

/// Outcome of a build / deploy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeploymentStatus {
    Success,
    Failure,
    Other(String),
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            DeploymentStatus::Success => "SUCCESS",
            DeploymentStatus::Failure => "FAILURE",
            DeploymentStatus::Other(s) => s.as_str(),
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, DeploymentStatus::Success)
    }

    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self, DeploymentStatus::Failure)
    }
}

impl From<String> for DeploymentStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "SUCCESS" => DeploymentStatus::Success,
            "FAILURE" => DeploymentStatus::Failure,
            _ => DeploymentStatus::Other(s),
        }
    }
}

impl From<&str> for DeploymentStatus {
    fn from(s: &str) -> Self {
        DeploymentStatus::from(s.to_string())
    }
}

impl From<DeploymentStatus> for String {
    fn from(status: DeploymentStatus) -> Self {
        match status {
            DeploymentStatus::Other(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl Display for DeploymentStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A build / deploy outcome. Natural key: `build_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentEvent {
    pub build_id: String,
    #[serde(default)]
    pub job_name: Option<String>,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub commit_sha: Option<String>,
}

impl DeploymentEvent {
    pub fn new(
        build_id: impl Into<String>,
        status: impl Into<DeploymentStatus>,
        timestamp: impl Into<String>,
        commit_sha: Option<&str>,
    ) -> Self {
        Self {
            build_id: build_id.into(),
            job_name: None,
            status: status.into(),
            timestamp: Some(timestamp.into()),
            commit_sha: commit_sha.map(str::to_string),
        }
    }

    pub fn with_job(mut self, job: impl Into<String>) -> Self {
        self.job_name = Some(job.into());
        self
    }

    #[inline]
    pub fn deployed_at(&self) -> Option<NaiveDateTime> {
        parse_optional(self.timestamp.as_deref())
    }

    /// Commit sha, ignoring blank values
    #[inline]
    pub fn commit(&self) -> Option<&str> {
        self.commit_sha.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// Whether this deployment belongs to `job` (always true without a job filter)
    #[inline]
    pub fn is_job(&self, job: Option<&str>) -> bool {
        match job {
            Some(job) => self.job_name.as_deref() == Some(job),
            None => true,
        }
    }

    #[inline]
    pub fn natural_key(&self) -> String {
        self.build_id.clone()
    }
}

// ----------------------------------------------------------------------------
// 5.3 Incident Events
// ----------------------------------------------------------------------------

/// A monitoring alert. Natural key: `alert_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentEvent {
    pub alert_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default, rename = "startsAt")]
    pub starts_at: Option<String>,
    #[serde(default, rename = "endsAt")]
    pub ends_at: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl IncidentEvent {
    /// Alert id used when the source does not provide one:
    /// `<alertname or "alert">_<service>_<startsAt>`.
    pub fn derive_alert_id(name: Option<&str>, service: Option<&str>, starts_at: Option<&str>) -> String {
        format!(
            "{}_{}_{}",
            name.unwrap_or("alert"),
            service.unwrap_or(""),
            starts_at.unwrap_or("")
        )
    }

    pub fn new(
        name: impl Into<String>,
        severity: impl Into<String>,
        starts_at: impl Into<String>,
        ends_at: Option<&str>,
    ) -> Self {
        let name = name.into();
        let starts_at = starts_at.into();
        Self {
            alert_id: Self::derive_alert_id(Some(&name), None, Some(&starts_at)),
            name: Some(name),
            severity: Some(severity.into()),
            starts_at: Some(starts_at),
            ends_at: ends_at.map(str::to_string),
            description: String::new(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    #[inline]
    pub fn started_at(&self) -> Option<NaiveDateTime> {
        parse_optional(self.starts_at.as_deref())
    }

    /// Resolution time; `None` while the alert is open.
    #[inline]
    pub fn ended_at(&self) -> Option<NaiveDateTime> {
        parse_optional(self.ends_at.as_deref())
    }

    /// Severity of the record itself, lowercased
    pub fn severity_level(&self) -> Option<String> {
        self.severity.as_deref().map(str::to_ascii_lowercase)
    }

    /// Severity counts as critical on the record or on its `severity` label.
    pub fn is_critical(&self) -> bool {
        let on_record = self
            .severity
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("critical"));
        let on_label = self
            .labels
            .get("severity")
            .is_some_and(|s| s.eq_ignore_ascii_case("critical"));
        on_record || on_label
    }

    /// Commit named by the alert's `commit` label
    pub fn commit(&self) -> Option<&str> {
        self.labels.get("commit").map(String::as_str).filter(|s| !s.is_empty())
    }

    #[inline]
    pub fn natural_key(&self) -> String {
        self.alert_id.clone()
    }
}

// ----------------------------------------------------------------------------
// 5.4 Tagged Records
// ----------------------------------------------------------------------------

/// The three store collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionKind {
    Changes,
    Deployments,
    Incidents,
}

impl CollectionKind {
    pub const ALL: [CollectionKind; 3] = [
        CollectionKind::Changes,
        CollectionKind::Deployments,
        CollectionKind::Incidents,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CollectionKind::Changes => CHANGES_COLLECTION,
            CollectionKind::Deployments => DEPLOYMENTS_COLLECTION,
            CollectionKind::Incidents => INCIDENTS_COLLECTION,
        }
    }

    pub fn key_field(&self) -> &'static str {
        match self {
            CollectionKind::Changes => "pr_id",
            CollectionKind::Deployments => "build_id",
            CollectionKind::Incidents => "alert_id",
        }
    }
}

impl Display for CollectionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An event record of any kind, routed to its collection on upsert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventRecord {
    Change(CodeChangeEvent),
    Deployment(DeploymentEvent),
    Incident(IncidentEvent),
}

impl EventRecord {
    pub fn collection(&self) -> CollectionKind {
        match self {
            EventRecord::Change(_) => CollectionKind::Changes,
            EventRecord::Deployment(_) => CollectionKind::Deployments,
            EventRecord::Incident(_) => CollectionKind::Incidents,
        }
    }

    pub fn natural_key(&self) -> String {
        match self {
            EventRecord::Change(c) => c.natural_key(),
            EventRecord::Deployment(d) => d.natural_key(),
            EventRecord::Incident(i) => i.natural_key(),
        }
    }
}

impl From<CodeChangeEvent> for EventRecord {
    fn from(event: CodeChangeEvent) -> Self {
        EventRecord::Change(event)
    }
}

impl From<DeploymentEvent> for EventRecord {
    fn from(event: DeploymentEvent) -> Self {
        EventRecord::Deployment(event)
    }
}

impl From<IncidentEvent> for EventRecord {
    fn from(event: IncidentEvent) -> Self {
        EventRecord::Incident(event)
    }
}

/// Read-only copy of all three collections, shared by the correlators of
/// one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventSnapshot {
    #[serde(default, rename = "github_events")]
    pub changes: Vec<CodeChangeEvent>,
    #[serde(default, rename = "jenkins_deployments")]
    pub deployments: Vec<DeploymentEvent>,
    #[serde(default, rename = "prometheus_alerts")]
    pub incidents: Vec<IncidentEvent>,
}

impl EventSnapshot {
    pub fn len(&self) -> usize {
        self.changes.len() + self.deployments.len() + self.incidents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// SECTION 6: CONFIGURATION SYSTEM
// ============================================================================
// Layered configuration:
// - Built-in defaults
// - TOML file
// - DORA_ prefixed environment variables (`__` separates sections)
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the DORA engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DoraConfig {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Event store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Metric computation settings
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Forecasting collaborator
    #[serde(default)]
    pub forecast: ForecastConfig,

    /// Text-insight collaborator
    #[serde(default)]
    pub insights: InsightsConfig,

    /// Pull request commit lookups
    #[serde(default)]
    pub github: GithubConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl DoraConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        Self::extract(Self::figment().merge(Toml::file(path)))
    }

    /// Load from an optional file; defaults plus environment when absent.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Self::extract(Self::figment()),
        }
    }

    /// Load from string (for testing)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .merge(Env::prefixed("DORA_").split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server
            .bind_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::invalid_value("server.bind_addr", e.to_string()))?;

        let timeouts = [
            ("store.read_timeout_secs", self.store.read_timeout_secs),
            ("forecast.timeout_secs", self.forecast.timeout_secs),
            ("insights.timeout_secs", self.insights.timeout_secs),
            ("github.timeout_secs", self.github.timeout_secs),
        ];
        for (field, secs) in timeouts {
            if secs == 0 {
                return Err(ConfigError::invalid_value(field, "Timeout must be at least 1s"));
            }
        }

        if !(MIN_FORECAST_DAYS..=MAX_FORECAST_DAYS).contains(&self.metrics.default_forecast_days) {
            return Err(ConfigError::invalid_value(
                "metrics.default_forecast_days",
                format!(
                    "Forecast horizon must be within {}..={} days",
                    MIN_FORECAST_DAYS, MAX_FORECAST_DAYS
                ),
            ));
        }

        let width = self.forecast.interval_width;
        if !(width > 0.0 && width < 1.0) {
            return Err(ConfigError::invalid_value(
                "forecast.interval_width",
                "Interval width must be inside (0, 1)",
            ));
        }

        if !(0.0..=2.0).contains(&self.insights.temperature) {
            return Err(ConfigError::invalid_value(
                "insights.temperature",
                "Temperature must be within 0.0..=2.0",
            ));
        }

        if !matches!(self.logging.format.as_str(), "json" | "compact" | "pretty") {
            return Err(ConfigError::invalid_value(
                "logging.format",
                format!("Unknown format '{}' (json, compact, pretty)", self.logging.format),
            ));
        }

        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store.read_timeout_secs)
    }
}

// ----------------------------------------------------------------------------
// 6.2 Server Configuration
// ----------------------------------------------------------------------------

/// HTTP server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Allow any origin (the dashboard is served from elsewhere)
    #[serde(default = "default_true")]
    pub cors_permissive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            cors_permissive: true,
        }
    }
}

fn default_bind_addr() -> String {
    DEFAULT_BIND_ADDR.into()
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 6.3 Store Configuration
// ----------------------------------------------------------------------------

/// Event store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSON snapshot loaded at startup and rewritten after each webhook write
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,

    /// Upper bound on a single store read
    #[serde(default = "default_store_timeout")]
    pub read_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            read_timeout_secs: default_store_timeout(),
        }
    }
}

fn default_store_timeout() -> u64 {
    DEFAULT_STORE_TIMEOUT_SECS
}

// ----------------------------------------------------------------------------
// 6.4 Metrics Configuration
// ----------------------------------------------------------------------------

/// Metric computation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Restrict deployment-frequency and CFR series to this job (e.g. `prod-deploy`)
    #[serde(default)]
    pub production_job: Option<String>,

    /// Horizon used when a forecast request names none
    #[serde(default = "default_forecast_days")]
    pub default_forecast_days: u32,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            production_job: None,
            default_forecast_days: default_forecast_days(),
        }
    }
}

fn default_forecast_days() -> u32 {
    DEFAULT_FORECAST_DAYS
}

// ----------------------------------------------------------------------------
// 6.5 Forecast Configuration
// ----------------------------------------------------------------------------

/// Forecasting collaborator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastConfig {
    /// Remote model endpoint; the built-in Holt model is used when unset
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_forecast_timeout")]
    pub timeout_secs: u64,

    /// Uncertainty interval width
    #[serde(default = "default_interval_width")]
    pub interval_width: f64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_forecast_timeout(),
            interval_width: default_interval_width(),
        }
    }
}

fn default_forecast_timeout() -> u64 {
    DEFAULT_FORECAST_TIMEOUT_SECS
}

fn default_interval_width() -> f64 {
    DEFAULT_INTERVAL_WIDTH
}

// ----------------------------------------------------------------------------
// 6.6 Insights Configuration
// ----------------------------------------------------------------------------

/// Text-insight collaborator configuration
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// generateContent base URL; `{model}` is substituted
    #[serde(default = "default_insights_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_insights_model")]
    pub model: String,

    /// Usually supplied as DORA_INSIGHTS__API_KEY
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_insight_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

// Hand-written so the API key never reaches a log line.
impl Debug for InsightsConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("InsightsConfig")
            .field("enabled", &self.enabled)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .field("temperature", &self.temperature)
            .field("max_output_tokens", &self.max_output_tokens)
            .finish()
    }
}

impl Default for InsightsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_insights_endpoint(),
            model: default_insights_model(),
            api_key: None,
            timeout_secs: default_insight_timeout(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

impl InsightsConfig {
    /// Full request URL for the configured model
    pub fn request_url(&self) -> String {
        self.endpoint.replace("{model}", &self.model)
    }
}

fn default_insights_endpoint() -> String {
    "https://generativelanguage.googleapis.com/v1beta/models/{model}:generateContent".into()
}

fn default_insights_model() -> String {
    "gemini-1.5-flash".into()
}

fn default_insight_timeout() -> u64 {
    DEFAULT_INSIGHT_TIMEOUT_SECS
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_output_tokens() -> u32 {
    500
}

// ----------------------------------------------------------------------------
// 6.7 GitHub Configuration
// ----------------------------------------------------------------------------

/// Commit lookups for merged pull requests
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct GithubConfig {
    /// Fetch `pull_request.commits_url` on merge
    #[serde(default = "default_true")]
    pub fetch_commits: bool,

    /// Personal access token for private repositories (DORA_GITHUB__TOKEN)
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_github_timeout")]
    pub timeout_secs: u64,
}

impl Debug for GithubConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("GithubConfig")
            .field("fetch_commits", &self.fetch_commits)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            fetch_commits: true,
            token: None,
            timeout_secs: default_github_timeout(),
        }
    }
}

fn default_github_timeout() -> u64 {
    DEFAULT_GITHUB_TIMEOUT_SECS
}

// ----------------------------------------------------------------------------
// 6.8 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// SECTION 7: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging with three output formats. Every component logs under
// its own `dora::<component>` target so RUST_LOG can single one out.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Logger Initialization
// ----------------------------------------------------------------------------

fn level_filter(level: &str) -> tracing::level_filters::LevelFilter {
    use tracing::level_filters::LevelFilter;
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> DoraResult<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter(&config.level).into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match config.format.as_str() {
        "json" => tracing::subscriber::set_global_default(
            registry.with(
                tracing_fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            ),
        ),
        "compact" => tracing::subscriber::set_global_default(
            registry.with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            ),
        ),
        _ => tracing::subscriber::set_global_default(
            registry.with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            ),
        ),
    };
    installed.map_err(|e| DoraError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "dora::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ----------------------------------------------------------------------------
// 7.2 Performance Timer
// ----------------------------------------------------------------------------

/// Measures an operation and warns when it runs past a threshold
#[derive(Debug)]
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold_ms: Option<u64>,
}

impl PerfTimer {
    /// Start a new timer
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: None,
        }
    }

    /// Start a timer with a warning threshold
    pub fn with_threshold(name: &'static str, threshold_ms: u64) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: Some(threshold_ms),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop the timer, log if above threshold and return the elapsed time
    pub fn stop(self) -> Duration {
        let elapsed = self.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;

        match self.threshold_ms {
            Some(threshold) if elapsed_ms > threshold => warn!(
                target: "dora::perf",
                operation = self.name,
                elapsed_ms,
                threshold_ms = threshold,
                "Operation exceeded threshold"
            ),
            _ => trace!(
                target: "dora::perf",
                operation = self.name,
                elapsed_ms,
                "Operation completed"
            ),
        }

        elapsed
    }
}

// ============================================================================
// SECTION 8: CONFIG & TIME TESTS
// ============================================================================


// ============================================================================
// SECTION 9: EVENT STORE
// ============================================================================
// The engine reads and writes events only through the `EventStore` trait.
// Writes are upserts by natural key: re-delivering the same webhook replaces
// the stored document instead of adding a second one.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Query Filters
// ----------------------------------------------------------------------------

/// Deployment query. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeploymentFilter {
    pub status: Option<DeploymentStatus>,
    pub job_name: Option<String>,
    pub window: Option<QueryWindow>,
}

impl DeploymentFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn successful_in(window: QueryWindow) -> Self {
        Self {
            status: Some(DeploymentStatus::Success),
            job_name: None,
            window: Some(window),
        }
    }

    pub fn failed_in(window: QueryWindow) -> Self {
        Self {
            status: Some(DeploymentStatus::Failure),
            job_name: None,
            window: Some(window),
        }
    }

    pub fn in_window(window: QueryWindow) -> Self {
        Self {
            window: Some(window),
            ..Self::default()
        }
    }

    pub fn with_job(mut self, job: Option<&str>) -> Self {
        self.job_name = job.map(str::to_string);
        self
    }

    /// A windowed filter only matches deployments whose timestamp parses.
    pub fn matches(&self, deployment: &DeploymentEvent) -> bool {
        if let Some(status) = &self.status {
            if &deployment.status != status {
                return false;
            }
        }
        if !deployment.is_job(self.job_name.as_deref()) {
            return false;
        }
        match &self.window {
            Some(window) => deployment.deployed_at().is_some_and(|t| window.contains(t)),
            None => true,
        }
    }
}

/// Incident query. An empty severity list matches every severity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncidentFilter {
    /// Lowercase severities
    pub severities: Vec<String>,
    pub window: Option<QueryWindow>,
}

impl IncidentFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Incidents relevant to recovery: critical or high, starting in the window
    pub fn high_or_critical_in(window: QueryWindow) -> Self {
        Self {
            severities: vec!["critical".into(), "high".into()],
            window: Some(window),
        }
    }

    pub fn matches(&self, incident: &IncidentEvent) -> bool {
        if !self.severities.is_empty() {
            let level = incident.severity_level();
            if !level.is_some_and(|l| self.severities.iter().any(|s| *s == l)) {
                return false;
            }
        }
        match &self.window {
            Some(window) => incident.started_at().is_some_and(|t| window.contains(t)),
            None => true,
        }
    }
}

// ----------------------------------------------------------------------------
// 9.2 Store Trait
// ----------------------------------------------------------------------------

/// Whether an upsert created a document or replaced an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
}

/// Persistence contract for the three event collections
#[async_trait]
pub trait EventStore: Send + Sync + Debug {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Insert or replace one record by its natural key
    async fn upsert_one(&self, record: EventRecord) -> StoreResult<UpsertOutcome>;

    /// Upsert a batch, skipping records without a natural key.
    /// Returns the number of records written.
    async fn upsert_many(&self, records: Vec<EventRecord>) -> StoreResult<usize> {
        let mut written = 0;
        for record in records {
            match self.upsert_one(record).await {
                Ok(_) => written += 1,
                Err(StoreError::MissingKey { collection }) => {
                    warn!(target: "dora::store", collection, "Skipping record without natural key");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    /// All code-change events
    async fn find_changes(&self) -> StoreResult<Vec<CodeChangeEvent>>;

    async fn find_deployments(&self, filter: &DeploymentFilter) -> StoreResult<Vec<DeploymentEvent>>;

    async fn find_incidents(&self, filter: &IncidentFilter) -> StoreResult<Vec<IncidentEvent>>;

    /// Number of documents in a collection
    async fn count(&self, kind: CollectionKind) -> StoreResult<usize>;

    /// Persist buffered writes, if the backend buffers any
    async fn flush(&self) -> StoreResult<()> {
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 9.3 In-Memory Store
// ----------------------------------------------------------------------------

/// Insertion-ordered documents with a natural-key index
#[derive(Debug, Clone)]
struct KeyedCollection<T> {
    docs: Vec<T>,
    index: AHashMap<String, usize>,
}

impl<T> Default for KeyedCollection<T> {
    fn default() -> Self {
        Self {
            docs: Vec::new(),
            index: AHashMap::new(),
        }
    }
}

impl<T: Clone> KeyedCollection<T> {
    fn from_docs(docs: Vec<T>, key: impl Fn(&T) -> String) -> Self {
        let mut collection = Self {
            docs: Vec::with_capacity(docs.len()),
            index: AHashMap::with_capacity(docs.len()),
        };
        for doc in docs {
            let k = key(&doc);
            collection.upsert(k, doc);
        }
        collection
    }

    /// Replacement keeps the original position.
    fn upsert(&mut self, key: String, doc: T) -> UpsertOutcome {
        let existing = self.index.get(&key).copied();
        match existing {
            Some(pos) => {
                self.docs[pos] = doc;
                UpsertOutcome::Replaced
            }
            None => {
                self.index.insert(key, self.docs.len());
                self.docs.push(doc);
                UpsertOutcome::Inserted
            }
        }
    }

    fn filtered(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        self.docs.iter().filter(|d| pred(*d)).cloned().collect()
    }

    fn len(&self) -> usize {
        self.docs.len()
    }
}

/// Event store held in memory, optionally backed by a JSON snapshot file.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    changes: RwLock<KeyedCollection<CodeChangeEvent>>,
    deployments: RwLock<KeyedCollection<DeploymentEvent>>,
    incidents: RwLock<KeyedCollection<IncidentEvent>>,
    snapshot_path: Option<PathBuf>,
    /// Serializes snapshot writers so the newest state lands last.
    write_lock: tokio::sync::Mutex<()>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a snapshot; duplicate keys collapse, last wins.
    pub fn from_snapshot(snapshot: EventSnapshot) -> Self {
        Self {
            changes: RwLock::new(KeyedCollection::from_docs(snapshot.changes, CodeChangeEvent::natural_key)),
            deployments: RwLock::new(KeyedCollection::from_docs(
                snapshot.deployments,
                DeploymentEvent::natural_key,
            )),
            incidents: RwLock::new(KeyedCollection::from_docs(snapshot.incidents, IncidentEvent::natural_key)),
            snapshot_path: None,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open a snapshot-backed store. A missing file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let mut store = if path.exists() {
            Self::load_snapshot(&path)?
        } else {
            info!(target: "dora::store", path = %path.display(), "Snapshot not found, starting empty");
            Self::new()
        };
        store.snapshot_path = Some(path);
        Ok(store)
    }

    /// Read a snapshot file
    pub fn load_snapshot(path: &Path) -> StoreResult<Self> {
        let bytes = fs::read(path)?;
        let snapshot: EventSnapshot = serde_json::from_slice(&bytes).map_err(|e| StoreError::Snapshot {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        info!(
            target: "dora::store",
            path = %path.display(),
            changes = snapshot.changes.len(),
            deployments = snapshot.deployments.len(),
            incidents = snapshot.incidents.len(),
            "Snapshot loaded"
        );
        Ok(Self::from_snapshot(snapshot))
    }

    /// Write all collections to `path`, replacing the file atomically.
    ///
    /// Writers are serialized and each copies the collections only once it
    /// holds the lock, so the file always ends at the latest state.
    pub async fn save_snapshot(&self, path: &Path) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let body = serde_json::to_vec_pretty(&self.snapshot())?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(target: "dora::store", path = %path.display(), "Snapshot saved");
        Ok(())
    }

    /// Copy of every collection
    pub fn snapshot(&self) -> EventSnapshot {
        EventSnapshot {
            changes: self.changes.read().docs.clone(),
            deployments: self.deployments.read().docs.clone(),
            incidents: self.incidents.read().docs.clone(),
        }
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert_one(&self, record: EventRecord) -> StoreResult<UpsertOutcome> {
        let key = record.natural_key();
        if key.trim().is_empty() {
            return Err(StoreError::MissingKey {
                collection: record.collection().name(),
            });
        }
        let outcome = match record {
            EventRecord::Change(doc) => self.changes.write().upsert(key, doc),
            EventRecord::Deployment(doc) => self.deployments.write().upsert(key, doc),
            EventRecord::Incident(doc) => self.incidents.write().upsert(key, doc),
        };
        Ok(outcome)
    }

    async fn find_changes(&self) -> StoreResult<Vec<CodeChangeEvent>> {
        Ok(self.changes.read().docs.clone())
    }

    async fn find_deployments(&self, filter: &DeploymentFilter) -> StoreResult<Vec<DeploymentEvent>> {
        Ok(self.deployments.read().filtered(|d| filter.matches(d)))
    }

    async fn find_incidents(&self, filter: &IncidentFilter) -> StoreResult<Vec<IncidentEvent>> {
        Ok(self.incidents.read().filtered(|i| filter.matches(i)))
    }

    async fn count(&self, kind: CollectionKind) -> StoreResult<usize> {
        Ok(match kind {
            CollectionKind::Changes => self.changes.read().len(),
            CollectionKind::Deployments => self.deployments.read().len(),
            CollectionKind::Incidents => self.incidents.read().len(),
        })
    }

    async fn flush(&self) -> StoreResult<()> {
        match &self.snapshot_path {
            Some(path) => self.save_snapshot(path).await,
            None => Ok(()),
        }
    }
}

// ============================================================================
// SECTION 10: WEBHOOK NORMALIZATION
// ============================================================================
// Converts source-specific payloads into event records. Shapes vary by
// plugin and version, so every field is looked up leniently.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 JSON Helpers
// ----------------------------------------------------------------------------

/// Non-empty string at `key`
fn json_str<'a>(value: &'a JsonValue, key: &str) -> Option<&'a str> {
    value.get(key).and_then(JsonValue::as_str).filter(|s| !s.is_empty())
}

/// String or number at `key`, rendered as text
fn json_text(value: &JsonValue, key: &str) -> Option<String> {
    match value.get(key)? {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Follow a path of object keys
fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    path.iter().try_fold(value, |v, key| v.get(*key))
}

/// Epoch milliseconds as `YYYY-MM-DDTHH:MM:SSZ`
pub fn epoch_millis_to_iso(ms: i64) -> Option<String> {
    let nanos = (ms.rem_euclid(1_000) * 1_000_000) as u32;
    DateTime::from_timestamp(ms.div_euclid(1_000), nanos).map(|dt| to_iso_utc(dt.naive_utc()))
}

// ----------------------------------------------------------------------------
// 10.2 GitHub Pull Requests
// ----------------------------------------------------------------------------

/// Commit list in either the webhook shape `{sha, timestamp}` or the REST
/// shape `{sha, commit: {committer: {date}}}`. Non-arrays yield nothing.
pub fn parse_commit_list(items: &JsonValue) -> Vec<CommitRef> {
    let Some(items) = items.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|c| {
            let sha = json_str(c, "sha")?.to_string();
            let timestamp = json_str(c, "timestamp")
                .or_else(|| json_path(c, &["commit", "committer", "date"]).and_then(JsonValue::as_str))
                .map(str::to_string);
            Some(CommitRef { sha, timestamp })
        })
        .collect()
}

/// Normalize a `pull_request` webhook. Only merged-and-closed actions produce
/// a record; everything else is `Ok(None)`.
pub fn normalize_github(payload: &JsonValue) -> Result<Option<CodeChangeEvent>, IngestError> {
    let pr = payload.get("pull_request").unwrap_or(&JsonValue::Null);
    let merged = pr.get("merged").and_then(JsonValue::as_bool).unwrap_or(false);
    if json_str(payload, "action") != Some("closed") || !merged {
        return Ok(None);
    }

    let pr_id = pr.get("number").and_then(JsonValue::as_u64).ok_or(IngestError::MissingField {
        origin: "github",
        field: "pull_request.number",
    })?;

    Ok(Some(CodeChangeEvent {
        pr_id,
        title: json_str(pr, "title").map(str::to_string),
        author: json_path(pr, &["user", "login"]).and_then(JsonValue::as_str).map(str::to_string),
        created_at: json_str(pr, "created_at").map(str::to_string),
        merged_at: json_str(pr, "merged_at").map(str::to_string),
        commits: pr.get("commits").map(parse_commit_list).unwrap_or_default(),
        target_branch: json_path(pr, &["base", "ref"]).and_then(JsonValue::as_str).map(str::to_string),
    }))
}

/// `pull_request.commits_url`, present on real webhook payloads
pub fn github_commits_url(payload: &JsonValue) -> Option<&str> {
    json_path(payload, &["pull_request", "commits_url"]).and_then(JsonValue::as_str)
}

/// Looks up the commits of a merged pull request
#[async_trait]
pub trait CommitSource: Send + Sync + Debug {
    fn name(&self) -> &str;

    async fn fetch_commits(&self, commits_url: &str) -> CollaboratorResult<Vec<CommitRef>>;
}

/// GitHub REST client for `commits_url`
#[derive(Clone)]
pub struct GithubCommitSource {
    client: HttpClient,
    token: Option<String>,
    timeout: Duration,
}

impl Debug for GithubCommitSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("GithubCommitSource")
            .field("authenticated", &self.token.is_some())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl GithubCommitSource {
    pub fn from_config(config: &GithubConfig) -> CollaboratorResult<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = HttpClient::builder()
            .timeout(timeout)
            .user_agent(concat!("dora-engine/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CollaboratorError::http("github", e))?;
        Ok(Self {
            client,
            token: config.token.clone(),
            timeout,
        })
    }
}

#[async_trait]
impl CommitSource for GithubCommitSource {
    fn name(&self) -> &str {
        "github"
    }

    async fn fetch_commits(&self, commits_url: &str) -> CollaboratorResult<Vec<CommitRef>> {
        let mut request = self
            .client
            .get(commits_url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| CollaboratorError::http("github", e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| CollaboratorError::http("github", e))?;
        if !status.is_success() {
            return Err(CollaboratorError::Status {
                collaborator: "github".into(),
                status: status.as_u16(),
                body,
            });
        }

        let reply: JsonValue = serde_json::from_str(&body)
            .map_err(|e| CollaboratorError::invalid_response("github", e.to_string()))?;
        if !reply.is_array() {
            return Err(CollaboratorError::invalid_response("github", "expected a JSON array of commits"));
        }
        Ok(parse_commit_list(&reply))
    }
}

// ----------------------------------------------------------------------------
// 10.3 Jenkins Builds
// ----------------------------------------------------------------------------

/// Normalize a Jenkins notification. The build may be nested under `build`.
pub fn normalize_jenkins(payload: &JsonValue) -> Result<DeploymentEvent, IngestError> {
    let build = payload.get("build").filter(|b| b.is_object()).unwrap_or(payload);

    let build_id = json_text(build, "number")
        .or_else(|| json_text(build, "id"))
        .ok_or(IngestError::MissingField {
            origin: "jenkins",
            field: "number",
        })?;

    // In-progress builds carry no result yet; stored as an unclassified status.
    let status = json_str(build, "status").or_else(|| json_str(build, "result")).unwrap_or_default();

    let timestamp = match build.get("timestamp") {
        Some(JsonValue::Number(n)) => {
            let ms = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or_default();
            Some(epoch_millis_to_iso(ms).ok_or_else(|| IngestError::InvalidPayload {
                origin: "jenkins",
                message: format!("timestamp {} is out of range", n),
            })?)
        }
        _ => json_str(build, "timestamp").or_else(|| json_str(build, "date")).map(str::to_string),
    };

    let commit_sha = json_str(build, "commit")
        .or_else(|| json_path(build, &["scm", "commit"]).and_then(JsonValue::as_str))
        .or_else(|| json_path(build, &["actions", "lastBuiltRevision", "SHA1"]).and_then(JsonValue::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let job_name = json_str(build, "job_name")
        .or_else(|| json_str(payload, "job_name"))
        .map(str::to_string);

    Ok(DeploymentEvent {
        build_id,
        job_name,
        status: DeploymentStatus::from(status),
        timestamp,
        commit_sha,
    })
}

// ----------------------------------------------------------------------------
// 10.4 Alertmanager Notifications
// ----------------------------------------------------------------------------

/// Normalize an Alertmanager notification into one incident per alert.
pub fn normalize_alertmanager(payload: &JsonValue) -> Result<Vec<IncidentEvent>, IngestError> {
    let alerts = match payload.get("alerts") {
        None | Some(JsonValue::Null) => return Ok(Vec::new()),
        Some(JsonValue::Array(alerts)) => alerts,
        Some(_) => {
            return Err(IngestError::InvalidPayload {
                origin: "alertmanager",
                message: "'alerts' must be an array".into(),
            })
        }
    };

    let incidents = alerts
        .iter()
        .map(|alert| {
            let labels: BTreeMap<String, String> = alert
                .get("labels")
                .and_then(JsonValue::as_object)
                .map(|map| {
                    map.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default();

            let starts_at = json_str(alert, "startsAt").map(str::to_string);
            let ends_at = json_str(alert, "endsAt")
                .filter(|s| *s != ALERTMANAGER_ZERO_TIME)
                .map(str::to_string);
            let name = labels.get("alertname").cloned();

            IncidentEvent {
                alert_id: IncidentEvent::derive_alert_id(
                    name.as_deref(),
                    labels.get("service").map(String::as_str),
                    starts_at.as_deref(),
                ),
                name,
                severity: labels.get("severity").or_else(|| labels.get("level")).cloned(),
                starts_at,
                ends_at,
                description: json_path(alert, &["annotations", "description"])
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string(),
                labels,
            }
        })
        .collect();

    Ok(incidents)
}

#[cfg(test)]
mod store_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn window(start: &str, end: &str) -> QueryWindow {
        QueryWindow::from_iso(start, end).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_and_last_write_wins() {
        let store = InMemoryEventStore::new();
        let first = DeploymentEvent::new("b1", "FAILURE", "2024-03-01T10:00:00Z", Some("c1"));
        let second = DeploymentEvent::new("b1", "SUCCESS", "2024-03-01T11:00:00Z", Some("c1"));

        assert_eq!(store.upsert_one(first.clone().into()).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert_one(first.into()).await.unwrap(), UpsertOutcome::Replaced);
        assert_eq!(store.upsert_one(second.clone().into()).await.unwrap(), UpsertOutcome::Replaced);

        assert_eq!(store.count(CollectionKind::Deployments).await.unwrap(), 1);
        let stored = store.find_deployments(&DeploymentFilter::all()).await.unwrap();
        assert_eq!(stored, vec![second]);
    }

    #[tokio::test]
    async fn test_replacement_keeps_insertion_order() {
        let store = InMemoryEventStore::new();
        for pr in [3_u64, 1, 2] {
            let change = CodeChangeEvent::merged(pr, "2024-03-01T10:00:00Z", vec![]);
            store.upsert_one(change.into()).await.unwrap();
        }
        let mut updated = CodeChangeEvent::merged(1, "2024-03-02T10:00:00Z", vec![]);
        updated.title = Some("retitled".into());
        store.upsert_one(updated.into()).await.unwrap();

        let changes = store.find_changes().await.unwrap();
        let ids: Vec<u64> = changes.iter().map(|c| c.pr_id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert_eq!(changes[1].title.as_deref(), Some("retitled"));
    }

    #[tokio::test]
    async fn test_upsert_many_skips_missing_keys() {
        let store = InMemoryEventStore::new();
        let records: Vec<EventRecord> = vec![
            DeploymentEvent::new("b1", "SUCCESS", "2024-03-01T10:00:00Z", None).into(),
            DeploymentEvent::new("  ", "SUCCESS", "2024-03-01T10:00:00Z", None).into(),
            IncidentEvent::new("HighLatency", "critical", "2024-03-01T10:00:00Z", None).into(),
        ];
        assert_eq!(store.upsert_many(records).await.unwrap(), 2);
        assert_eq!(store.count(CollectionKind::Deployments).await.unwrap(), 1);
        assert_eq!(store.count(CollectionKind::Incidents).await.unwrap(), 1);
    }

    #[rstest]
    #[case(DeploymentFilter::successful_in(window("2024-03-01T00:00:00Z", "2024-03-01T23:59:59Z")), vec!["b1"])]
    #[case(DeploymentFilter::failed_in(window("2024-03-01T00:00:00Z", "2024-03-02T23:59:59Z")), vec!["b2"])]
    #[case(DeploymentFilter::in_window(window("2024-03-02T00:00:00Z", "2024-03-03T00:00:00Z")), vec!["b2", "b3"])]
    #[case(DeploymentFilter::all().with_job(Some("prod-deploy")), vec!["b1", "b3"])]
    #[tokio::test]
    async fn test_deployment_filters(#[case] filter: DeploymentFilter, #[case] expected: Vec<&str>) {
        let store = InMemoryEventStore::new();
        let docs = vec![
            DeploymentEvent::new("b1", "SUCCESS", "2024-03-01T10:00:00Z", None).with_job("prod-deploy"),
            DeploymentEvent::new("b2", "FAILURE", "2024-03-02T10:00:00Z", None).with_job("staging"),
            DeploymentEvent::new("b3", "SUCCESS", "2024-03-02T12:00:00Z", None).with_job("prod-deploy"),
            DeploymentEvent::new("b4", "SUCCESS", "garbage", None),
        ];
        store.upsert_many(docs.into_iter().map(Into::into).collect()).await.unwrap();

        let found = store.find_deployments(&filter).await.unwrap();
        let ids: Vec<&str> = found.iter().map(|d| d.build_id.as_str()).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_incident_filter_severity_is_case_insensitive() {
        let store = InMemoryEventStore::new();
        let docs = vec![
            IncidentEvent::new("A", "CRITICAL", "2024-03-01T10:00:00Z", None),
            IncidentEvent::new("B", "High", "2024-03-01T11:00:00Z", None),
            IncidentEvent::new("C", "warning", "2024-03-01T12:00:00Z", None),
            IncidentEvent::new("D", "critical", "2024-04-01T12:00:00Z", None),
        ];
        store.upsert_many(docs.into_iter().map(Into::into).collect()).await.unwrap();

        let filter = IncidentFilter::high_or_critical_in(window("2024-03-01T00:00:00Z", "2024-03-31T23:59:59Z"));
        let found = store.find_incidents(&filter).await.unwrap();
        let names: Vec<&str> = found.iter().filter_map(|i| i.name.as_deref()).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_snapshot_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");

        let store = InMemoryEventStore::open(&path).unwrap();
        store
            .upsert_one(CodeChangeEvent::merged(7, "2024-03-01T10:00:00Z", vec![CommitRef::new("c1", "2024-03-01T08:00:00Z")]).into())
            .await
            .unwrap();
        store
            .upsert_one(DeploymentEvent::new("b1", "SUCCESS", "2024-03-01T12:00:00Z", Some("c1")).into())
            .await
            .unwrap();
        store.flush().await.unwrap();

        let reopened = InMemoryEventStore::open(&path).unwrap();
        assert_eq!(reopened.snapshot(), store.snapshot());
        assert_eq!(reopened.count(CollectionKind::Changes).await.unwrap(), 1);

        let raw: JsonValue = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert!(raw.get("github_events").is_some());
        assert!(raw.get("jenkins_deployments").is_some());
        assert!(raw.get("prometheus_alerts").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_flushes_all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        let store = Arc::new(InMemoryEventStore::open(&path).unwrap());

        let tasks: Vec<_> = (0..64)
            .map(|n| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let ts = format!("2024-03-01T10:{:02}:00Z", n % 60);
                    store
                        .upsert_one(DeploymentEvent::new(format!("b{}", n), "SUCCESS", ts, None).into())
                        .await?;
                    store.flush().await
                })
            })
            .collect();

        let mut failures = Vec::new();
        for task in tasks {
            if let Err(e) = task.await.unwrap() {
                failures.push(e.to_string());
            }
        }
        assert_eq!(failures, Vec::<String>::new());

        let reopened = InMemoryEventStore::open(&path).unwrap();
        assert_eq!(reopened.count(CollectionKind::Deployments).await.unwrap(), 64);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupt_snapshot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(InMemoryEventStore::open(&path), Err(StoreError::Snapshot { .. })));
    }

    #[test]
    fn test_incident_serializes_camel_case_times() {
        let incident = IncidentEvent::new("A", "critical", "2024-03-01T10:00:00Z", Some("2024-03-01T11:00:00Z"));
        let value = serde_json::to_value(&incident).unwrap();
        assert_eq!(value["startsAt"], "2024-03-01T10:00:00Z");
        assert_eq!(value["endsAt"], "2024-03-01T11:00:00Z");
    }

    #[test]
    fn test_github_merged_pull_request() {
        let payload = json!({
            "action": "closed",
            "pull_request": {
                "number": 42,
                "title": "Add cache",
                "merged": true,
                "user": {"login": "octo"},
                "created_at": "2024-03-01T08:00:00Z",
                "merged_at": "2024-03-01T09:00:00Z",
                "base": {"ref": "main"},
                "commits": [
                    {"sha": "c1", "timestamp": "2024-03-01T07:00:00Z"},
                    {"sha": "c2", "commit": {"committer": {"date": "2024-03-01T07:30:00Z"}}}
                ]
            }
        });
        let change = normalize_github(&payload).unwrap().unwrap();
        assert_eq!(change.pr_id, 42);
        assert_eq!(change.author.as_deref(), Some("octo"));
        assert_eq!(change.target_branch.as_deref(), Some("main"));
        assert_eq!(
            change.commits,
            vec![
                CommitRef::new("c1", "2024-03-01T07:00:00Z"),
                CommitRef::new("c2", "2024-03-01T07:30:00Z"),
            ]
        );
    }

    #[rstest]
    #[case(json!({"action": "opened", "pull_request": {"number": 1, "merged": false}}))]
    #[case(json!({"action": "closed", "pull_request": {"number": 1, "merged": false}}))]
    #[case(json!({"zen": "Keep it logically awesome."}))]
    fn test_github_non_merge_actions_are_ignored(#[case] payload: JsonValue) {
        assert_eq!(normalize_github(&payload).unwrap(), None);
    }

    #[test]
    fn test_github_merge_without_number_is_rejected() {
        let payload = json!({"action": "closed", "pull_request": {"merged": true}});
        assert!(matches!(normalize_github(&payload), Err(IngestError::MissingField { .. })));
    }

    #[test]
    fn test_jenkins_nested_build_with_epoch_millis() {
        let payload = json!({
            "job_name": "prod-deploy",
            "build": {
                "number": 118,
                "result": "SUCCESS",
                "timestamp": 1709280000000_i64,
                "actions": {"lastBuiltRevision": {"SHA1": "abc123"}}
            }
        });
        let deployment = normalize_jenkins(&payload).unwrap();
        assert_eq!(deployment.build_id, "118");
        assert_eq!(deployment.status, DeploymentStatus::Success);
        assert_eq!(deployment.timestamp.as_deref(), Some("2024-03-01T08:00:00Z"));
        assert_eq!(deployment.commit_sha.as_deref(), Some("abc123"));
        assert_eq!(deployment.job_name.as_deref(), Some("prod-deploy"));
    }

    #[test]
    fn test_jenkins_flat_payload() {
        let payload = json!({
            "id": "deploy-9",
            "status": "ABORTED",
            "date": "2024-03-01T08:00:00Z",
            "scm": {"commit": "def456"}
        });
        let deployment = normalize_jenkins(&payload).unwrap();
        assert_eq!(deployment.build_id, "deploy-9");
        assert_eq!(deployment.status, DeploymentStatus::Other("ABORTED".into()));
        assert_eq!(deployment.timestamp.as_deref(), Some("2024-03-01T08:00:00Z"));
        assert_eq!(deployment.commit(), Some("def456"));
    }

    #[test]
    fn test_jenkins_build_without_result_is_unclassified() {
        let deployment = normalize_jenkins(&json!({"build": {"number": 12, "timestamp": "2024-03-01T08:00:00Z"}})).unwrap();
        assert_eq!(deployment.build_id, "12");
        assert_eq!(deployment.status, DeploymentStatus::Other(String::new()));
        assert!(!deployment.status.is_success());
        assert!(!deployment.status.is_failure());
    }

    #[test]
    fn test_jenkins_without_id_is_rejected() {
        let err = normalize_jenkins(&json!({"status": "SUCCESS"})).unwrap_err();
        assert_eq!(err, IngestError::MissingField { origin: "jenkins", field: "number" });
    }

    #[test]
    fn test_alertmanager_alerts() {
        let payload = json!({
            "status": "firing",
            "alerts": [
                {
                    "labels": {"alertname": "HighErrorRate", "service": "api", "severity": "critical", "commit": "c9"},
                    "annotations": {"description": "5xx above 5%"},
                    "startsAt": "2024-03-01T10:10:00Z",
                    "endsAt": "0001-01-01T00:00:00Z"
                },
                {
                    "labels": {"level": "high"},
                    "startsAt": "2024-03-01T11:00:00Z",
                    "endsAt": "2024-03-01T11:30:00Z"
                }
            ]
        });
        let incidents = normalize_alertmanager(&payload).unwrap();
        assert_eq!(incidents.len(), 2);

        let first = &incidents[0];
        assert_eq!(first.alert_id, "HighErrorRate_api_2024-03-01T10:10:00Z");
        assert_eq!(first.ends_at, None);
        assert!(first.is_critical());
        assert_eq!(first.commit(), Some("c9"));
        assert_eq!(first.description, "5xx above 5%");

        let second = &incidents[1];
        assert_eq!(second.alert_id, "alert__2024-03-01T11:00:00Z");
        assert_eq!(second.severity.as_deref(), Some("high"));
        assert_eq!(second.ended_at(), parse_timestamp("2024-03-01T11:30:00Z"));
    }

    #[test]
    fn test_alertmanager_rejects_non_array() {
        assert!(normalize_alertmanager(&json!({"alerts": "nope"})).is_err());
        assert_eq!(normalize_alertmanager(&json!({})).unwrap(), vec![]);
    }
}

// ============================================================================
// SECTION 11: CORRELATION ENGINE
// ============================================================================
// Pure joins over event slices. No I/O happens here: the engine fetches a
// snapshot from the store and hands borrowed slices to these functions.
// Every correlator re-applies its own window and status filters so it is
// correct for any superset of the records it needs.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Correlation Statistics
// ----------------------------------------------------------------------------

/// Why a record or pair did not produce a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A timestamp needed for the join did not parse
    UnparseableTimestamp,
    /// The commit time lies outside the query window
    OutsideWindow,
    /// Deployment precedes the commit, or recovery precedes the deployment
    Causality,
    /// Nothing on the other side of the join
    NoMatch,
    /// The matched incident has not ended
    OpenIncident,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::UnparseableTimestamp => "unparseable_timestamp",
            SkipReason::OutsideWindow => "outside_window",
            SkipReason::Causality => "causality",
            SkipReason::NoMatch => "no_match",
            SkipReason::OpenIncident => "open_incident",
        }
    }
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepted and skipped counts of one correlation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationStats {
    pub accepted: usize,
    pub skipped: BTreeMap<SkipReason, usize>,
}

impl CorrelationStats {
    #[inline]
    pub fn accept(&mut self) {
        self.accepted += 1;
    }

    #[inline]
    pub fn skip(&mut self, reason: SkipReason) {
        *self.skipped.entry(reason).or_insert(0) += 1;
    }

    pub fn skipped(&self, reason: SkipReason) -> usize {
        self.skipped.get(&reason).copied().unwrap_or(0)
    }

    pub fn total_skipped(&self) -> usize {
        self.skipped.values().sum()
    }
}

// ----------------------------------------------------------------------------
// 11.2 Period Aggregator
// ----------------------------------------------------------------------------

/// Mean value per calendar bucket, rounded to two decimals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeriodBuckets {
    pub daily: BTreeMap<String, f64>,
    pub weekly: BTreeMap<String, f64>,
    pub monthly: BTreeMap<String, f64>,
}

impl PeriodBuckets {
    pub fn get(&self, granularity: Granularity) -> &BTreeMap<String, f64> {
        match granularity {
            Granularity::Daily => &self.daily,
            Granularity::Weekly => &self.weekly,
            Granularity::Monthly => &self.monthly,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.daily.is_empty()
    }
}

/// Collects values under their daily, weekly and monthly keys
#[derive(Debug, Default)]
pub struct PeriodAccumulator {
    values: [BTreeMap<String, Vec<f64>>; 3],
}

impl PeriodAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value` in every bucket containing `at`.
    pub fn push(&mut self, at: NaiveDateTime, value: f64) {
        for (slot, granularity) in self.values.iter_mut().zip(Granularity::ALL) {
            slot.entry(granularity.period_key(at)).or_default().push(value);
        }
    }

    pub fn finish(self) -> PeriodBuckets {
        let [daily, weekly, monthly] = self.values.map(|slot| {
            slot.into_iter()
                .filter_map(|(key, values)| mean(&values).map(|m| (key, round2(m))))
                .collect::<BTreeMap<_, _>>()
        });
        PeriodBuckets { daily, weekly, monthly }
    }
}

// ----------------------------------------------------------------------------
// 11.3 Merged Commit Index
// ----------------------------------------------------------------------------

/// Commit sha → merge time of the change that carried it, over all merged
/// changes regardless of the query window.
#[derive(Debug, Default)]
pub struct MergedCommitIndex {
    merged: AHashMap<String, NaiveDateTime>,
}

impl MergedCommitIndex {
    /// A change counts as merged when its merge time parses.
    pub fn build(changes: &[CodeChangeEvent]) -> Self {
        let mut merged = AHashMap::new();
        for change in changes {
            let Some(merged_at) = change.merged_at() else {
                continue;
            };
            for commit in &change.commits {
                if !commit.sha.is_empty() {
                    merged.insert(commit.sha.clone(), merged_at);
                }
            }
        }
        Self { merged }
    }

    #[inline]
    pub fn contains(&self, sha: &str) -> bool {
        self.merged.contains_key(sha)
    }

    pub fn merged_at(&self, sha: &str) -> Option<NaiveDateTime> {
        self.merged.get(sha).copied()
    }

    pub fn len(&self) -> usize {
        self.merged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }
}

// ----------------------------------------------------------------------------
// 11.4 Lead Time Correlator
// ----------------------------------------------------------------------------

/// One commit reaching production
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadTimeSample {
    pub commit_sha: String,
    pub commit_time: NaiveDateTime,
    pub deploy_time: NaiveDateTime,
    pub hours: f64,
}

/// Lead time per period, plus the samples behind it
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LeadTimeReport {
    #[serde(flatten)]
    pub buckets: PeriodBuckets,
    #[serde(skip)]
    pub samples: Vec<LeadTimeSample>,
    #[serde(skip)]
    pub stats: CorrelationStats,
}

/// Join merged commits to their successful deployments.
///
/// Samples are bucketed by deployment time. A commit deployed several times
/// yields one sample per deployment; a change without commits yields none.
pub fn correlate_lead_time(
    window: &QueryWindow,
    changes: &[CodeChangeEvent],
    deployments: &[DeploymentEvent],
) -> LeadTimeReport {
    let merged = MergedCommitIndex::build(changes);
    let mut stats = CorrelationStats::default();

    let mut deployed: AHashMap<&str, Vec<NaiveDateTime>> = AHashMap::new();
    for deployment in deployments.iter().filter(|d| d.status.is_success()) {
        let Some(sha) = deployment.commit() else {
            continue;
        };
        match deployment.deployed_at() {
            Some(t) if window.contains(t) => deployed.entry(sha).or_default().push(t),
            Some(_) => {}
            None => stats.skip(SkipReason::UnparseableTimestamp),
        }
    }

    let mut accumulator = PeriodAccumulator::new();
    let mut samples = Vec::new();

    for commit in changes.iter().flat_map(|c| c.commits.iter()) {
        if commit.sha.is_empty() || !merged.contains(&commit.sha) {
            continue;
        }
        let Some(deploy_times) = deployed.get(commit.sha.as_str()) else {
            stats.skip(SkipReason::NoMatch);
            continue;
        };
        let Some(commit_time) = commit.committed_at() else {
            stats.skip(SkipReason::UnparseableTimestamp);
            continue;
        };
        if !window.contains(commit_time) {
            stats.skip(SkipReason::OutsideWindow);
            continue;
        }

        for &deploy_time in deploy_times {
            if deploy_time < commit_time {
                debug!(
                    target: "dora::lead_time",
                    sha = %commit.sha,
                    commit_time = %commit_time,
                    deploy_time = %deploy_time,
                    "Deployment precedes commit, pair dropped"
                );
                stats.skip(SkipReason::Causality);
                continue;
            }
            let hours = (deploy_time - commit_time).num_seconds() as f64 / 3_600.0;
            accumulator.push(deploy_time, hours);
            samples.push(LeadTimeSample {
                commit_sha: commit.sha.clone(),
                commit_time,
                deploy_time,
                hours,
            });
            stats.accept();
        }
    }

    debug!(
        target: "dora::lead_time",
        window = %window,
        accepted = stats.accepted,
        skipped = stats.total_skipped(),
        "Lead time correlated"
    );

    LeadTimeReport {
        buckets: accumulator.finish(),
        samples,
        stats,
    }
}

// ----------------------------------------------------------------------------
// 11.5 Recovery Correlator (MTTR)
// ----------------------------------------------------------------------------

/// One failed deployment and the incident resolution that followed it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySample {
    pub build_id: String,
    pub alert_id: String,
    pub deploy_time: NaiveDateTime,
    pub recovered_at: NaiveDateTime,
    pub minutes: f64,
}

/// Mean time to recovery per period, plus the samples behind it
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryReport {
    #[serde(flatten)]
    pub buckets: PeriodBuckets,
    #[serde(skip)]
    pub samples: Vec<RecoverySample>,
    #[serde(skip)]
    pub stats: CorrelationStats,
}

/// Join each failed deployment to the first high or critical incident that
/// starts at or after it.
///
/// The nearest subsequent incident is taken as the one the deployment
/// caused. Several deployments may resolve through the same incident.
pub fn correlate_recovery(
    window: &QueryWindow,
    deployments: &[DeploymentEvent],
    incidents: &[IncidentEvent],
) -> RecoveryReport {
    let mut stats = CorrelationStats::default();
    let relevant = IncidentFilter::high_or_critical_in(*window);

    let mut timeline: Vec<(NaiveDateTime, &IncidentEvent)> = incidents
        .iter()
        .filter(|i| relevant.matches(i))
        .filter_map(|i| i.started_at().map(|t| (t, i)))
        .collect();
    timeline.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.alert_id.cmp(&b.1.alert_id)));

    let mut accumulator = PeriodAccumulator::new();
    let mut samples = Vec::new();

    for deployment in deployments.iter().filter(|d| d.status.is_failure()) {
        let deploy_time = match deployment.deployed_at() {
            Some(t) if window.contains(t) => t,
            Some(_) => continue,
            None => {
                stats.skip(SkipReason::UnparseableTimestamp);
                continue;
            }
        };

        let first = timeline.partition_point(|(start, _)| *start < deploy_time);
        let Some(&(_, incident)) = timeline.get(first) else {
            stats.skip(SkipReason::NoMatch);
            continue;
        };
        let Some(recovered_at) = incident.ended_at() else {
            stats.skip(SkipReason::OpenIncident);
            continue;
        };
        if recovered_at < deploy_time {
            debug!(
                target: "dora::mttr",
                build_id = %deployment.build_id,
                alert_id = %incident.alert_id,
                "Incident ended before deployment, pair dropped"
            );
            stats.skip(SkipReason::Causality);
            continue;
        }

        let minutes = (recovered_at - deploy_time).num_seconds() as f64 / 60.0;
        accumulator.push(deploy_time, minutes);
        samples.push(RecoverySample {
            build_id: deployment.build_id.clone(),
            alert_id: incident.alert_id.clone(),
            deploy_time,
            recovered_at,
            minutes,
        });
        stats.accept();
    }

    debug!(
        target: "dora::mttr",
        window = %window,
        accepted = stats.accepted,
        skipped = stats.total_skipped(),
        "Recovery correlated"
    );

    RecoveryReport {
        buckets: accumulator.finish(),
        samples,
        stats,
    }
}

// ----------------------------------------------------------------------------
// 11.6 Change Failure Classifier (CFR)
// ----------------------------------------------------------------------------

/// Classification of one deployed commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeOutcome {
    pub commit_sha: String,
    pub deployed: bool,
    pub failed: bool,
}

/// Change failure rate over a window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CfrReport {
    #[serde(rename = "Start Time")]
    pub start_time: String,
    #[serde(rename = "End Time")]
    pub end_time: String,
    #[serde(rename = "Total Changes")]
    pub total_changes: usize,
    #[serde(rename = "Failed Changes")]
    pub failed_changes: usize,
    #[serde(rename = "Change Failure Rate (%)")]
    pub change_failure_rate: f64,
    /// One entry per deployed commit, ordered by sha
    #[serde(skip)]
    pub outcomes: Vec<ChangeOutcome>,
}

/// Classify deployed commits as failed or clean.
///
/// `start` and `end` use the event layout and are echoed unchanged. A commit
/// fails when any of its deployments in the window failed, or when a
/// critical incident starting in the window names it in its `commit` label.
pub fn classify_change_failures(
    start: &str,
    end: &str,
    changes: &[CodeChangeEvent],
    deployments: &[DeploymentEvent],
    incidents: &[IncidentEvent],
) -> Result<CfrReport, ParseError> {
    let window = QueryWindow::from_iso(start, end)?;
    let merged = MergedCommitIndex::build(changes);

    let flagged: AHashSet<&str> = incidents
        .iter()
        .filter(|i| i.is_critical())
        .filter(|i| i.started_at().is_some_and(|t| window.contains(t)))
        .filter_map(IncidentEvent::commit)
        .collect();

    // sha -> failed
    let mut deployed: BTreeMap<&str, bool> = BTreeMap::new();
    for deployment in deployments {
        let Some(sha) = deployment.commit() else {
            continue;
        };
        if !merged.contains(sha) || !deployment.deployed_at().is_some_and(|t| window.contains(t)) {
            continue;
        }
        let failed = deployment.status.is_failure() || flagged.contains(sha);
        *deployed.entry(sha).or_insert(false) |= failed;
    }

    let outcomes: Vec<ChangeOutcome> = deployed
        .into_iter()
        .map(|(sha, failed)| ChangeOutcome {
            commit_sha: sha.to_string(),
            deployed: true,
            failed,
        })
        .collect();

    let total_changes = outcomes.len();
    let failed_changes = outcomes.iter().filter(|o| o.failed).count();

    debug!(
        target: "dora::cfr",
        window = %window,
        total_changes,
        failed_changes,
        flagged_by_incident = flagged.len(),
        "Change failures classified"
    );

    Ok(CfrReport {
        start_time: start.to_string(),
        end_time: end.to_string(),
        total_changes,
        failed_changes,
        change_failure_rate: round2(percentage(failed_changes, total_changes)),
        outcomes,
    })
}

// ============================================================================
// SECTION 12: CORRELATION TESTS
// ============================================================================


// ============================================================================
// SECTION 13: STATISTICAL FUNCTIONS
// ============================================================================

/// Statistical helpers shared by preprocessing and the built-in model.
#[derive(Debug)]
pub struct StatisticalFunctions;

impl StatisticalFunctions {
    /// Population variance.
    pub fn variance(values: &[f64]) -> f64 {
        match mean(values) {
            Some(m) => values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64,
            None => 0.0,
        }
    }

    pub fn std_dev(values: &[f64]) -> f64 {
        Self::variance(values).sqrt()
    }

    /// Quantile with linear interpolation between closest ranks.
    pub fn quantile(values: &[f64], q: f64) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<OrderedFloat<f64>> = values.iter().copied().map(OrderedFloat).collect();
        sorted.sort_unstable();

        let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
        let lo = pos.floor() as usize;
        let hi = pos.ceil() as usize;
        let frac = pos - lo as f64;
        sorted[lo].0 + (sorted[hi].0 - sorted[lo].0) * frac
    }

    /// `[Q1 - k·IQR, Q3 + k·IQR]`
    pub fn iqr_fence(values: &[f64], multiplier: f64) -> (f64, f64) {
        let q1 = Self::quantile(values, 0.25);
        let q3 = Self::quantile(values, 0.75);
        let iqr = q3 - q1;
        (q1 - multiplier * iqr, q3 + multiplier * iqr)
    }

    /// Standard normal quantile for `p` in (0, 1), Abramowitz & Stegun 26.2.23.
    pub fn normal_quantile(p: f64) -> f64 {
        const C: [f64; 3] = [2.515517, 0.802853, 0.010328];
        const D: [f64; 3] = [1.432788, 0.189269, 0.001308];

        let p = p.clamp(1e-12, 1.0 - 1e-12);
        let upper = p >= 0.5;
        let tail = if upper { 1.0 - p } else { p };
        let t = (-2.0 * tail.ln()).sqrt();
        let z = t - (C[0] + C[1] * t + C[2] * t * t) / (1.0 + D[0] * t + D[1] * t * t + D[2] * t * t * t);
        if upper {
            z
        } else {
            -z
        }
    }
}

// ============================================================================
// SECTION 14: SERIES BUILDER
// ============================================================================
// Every metric becomes a daily, gap-free series over the window's calendar
// dates. How a missing day is filled depends on the metric: counts and
// rates are zero, means are carried forward and then backward.
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 Metric Identity
// ----------------------------------------------------------------------------

/// The four DORA metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoraMetric {
    DeploymentFrequency,
    LeadTime,
    Mttr,
    Cfr,
}

impl DoraMetric {
    pub const ALL: [DoraMetric; 4] = [
        DoraMetric::DeploymentFrequency,
        DoraMetric::LeadTime,
        DoraMetric::Mttr,
        DoraMetric::Cfr,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DoraMetric::DeploymentFrequency => "deployment_frequency",
            DoraMetric::LeadTime => "lead_time",
            DoraMetric::Mttr => "mttr",
            DoraMetric::Cfr => "cfr",
        }
    }
}

impl Display for DoraMetric {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DoraMetric {
    type Err = DoraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deployment_frequency" | "deployment-frequency" | "df" => Ok(DoraMetric::DeploymentFrequency),
            "lead_time" | "lead-time" | "lt" => Ok(DoraMetric::LeadTime),
            "mttr" => Ok(DoraMetric::Mttr),
            "cfr" => Ok(DoraMetric::Cfr),
            _ => Err(DoraError::UnknownMetric(s.to_string())),
        }
    }
}

// ----------------------------------------------------------------------------
// 14.2 Series Construction
// ----------------------------------------------------------------------------

/// One day of a metric series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub ds: NaiveDate,
    pub y: f64,
}

impl SeriesPoint {
    pub fn new(ds: NaiveDate, y: f64) -> Self {
        Self { ds, y }
    }
}

/// Successful deployments per day; days without any are explicit zeros.
pub fn deployment_frequency_series(
    window: &QueryWindow,
    deployments: &[DeploymentEvent],
    production_job: Option<&str>,
) -> Vec<SeriesPoint> {
    let filter = DeploymentFilter::successful_in(*window).with_job(production_job);
    let mut per_day: BTreeMap<NaiveDate, usize> = BTreeMap::new();
    for t in deployments.iter().filter(|d| filter.matches(d)).filter_map(DeploymentEvent::deployed_at) {
        *per_day.entry(t.date()).or_insert(0) += 1;
    }
    window
        .days()
        .into_iter()
        .map(|day| SeriesPoint::new(day, per_day.get(&day).copied().unwrap_or(0) as f64))
        .collect()
}

/// Daily `100 · failed / max(total, 1)` by deployment status.
pub fn cfr_series(
    window: &QueryWindow,
    deployments: &[DeploymentEvent],
    production_job: Option<&str>,
) -> Vec<SeriesPoint> {
    let filter = DeploymentFilter::in_window(*window).with_job(production_job);
    let mut per_day: BTreeMap<NaiveDate, (usize, usize)> = BTreeMap::new();
    for deployment in deployments.iter().filter(|d| filter.matches(d)) {
        let Some(t) = deployment.deployed_at() else {
            continue;
        };
        let (total, failed) = per_day.entry(t.date()).or_insert((0, 0));
        *total += 1;
        if deployment.status.is_failure() {
            *failed += 1;
        }
    }
    window
        .days()
        .into_iter()
        .map(|day| {
            let (total, failed) = per_day.get(&day).copied().unwrap_or((0, 0));
            SeriesPoint::new(day, failed as f64 / total.max(1) as f64 * 100.0)
        })
        .collect()
}

/// Daily bucket means spread over the window, forward-filled then
/// backward-filled. No buckets means no series.
pub fn filled_bucket_series(window: &QueryWindow, daily: &BTreeMap<String, f64>) -> Vec<SeriesPoint> {
    if daily.is_empty() {
        return Vec::new();
    }

    let days = window.days();
    let mut values: Vec<Option<f64>> = days
        .iter()
        .map(|day| daily.get(&day.format(DATE_LAYOUT).to_string()).copied())
        .collect();

    let mut carry = None;
    for v in values.iter_mut() {
        if v.is_some() {
            carry = *v;
        } else {
            *v = carry;
        }
    }
    let mut carry = None;
    for v in values.iter_mut().rev() {
        if v.is_some() {
            carry = *v;
        } else {
            *v = carry;
        }
    }

    // Buckets outside the window leave every day empty.
    days.into_iter()
        .zip(values)
        .filter_map(|(day, y)| y.map(|y| SeriesPoint::new(day, y)))
        .collect()
}

/// Build the daily series of `metric` from an event snapshot.
pub fn build_series(
    metric: DoraMetric,
    window: &QueryWindow,
    snapshot: &EventSnapshot,
    production_job: Option<&str>,
) -> Vec<SeriesPoint> {
    match metric {
        DoraMetric::DeploymentFrequency => {
            deployment_frequency_series(window, &snapshot.deployments, production_job)
        }
        DoraMetric::LeadTime => {
            let report = correlate_lead_time(window, &snapshot.changes, &snapshot.deployments);
            filled_bucket_series(window, &report.buckets.daily)
        }
        DoraMetric::Mttr => {
            let report = correlate_recovery(window, &snapshot.deployments, &snapshot.incidents);
            filled_bucket_series(window, &report.buckets.daily)
        }
        DoraMetric::Cfr => cfr_series(window, &snapshot.deployments, production_job),
    }
}

// ----------------------------------------------------------------------------
// 14.3 Preprocessing
// ----------------------------------------------------------------------------

/// Clamp outliers to the IQR fence (from 7 points up), then floor at zero.
pub fn preprocess_series(mut series: Vec<SeriesPoint>) -> Vec<SeriesPoint> {
    if series.len() >= OUTLIER_CLAMP_MIN_POINTS {
        let values: Vec<f64> = series.iter().map(|p| p.y).collect();
        let (lower, upper) = StatisticalFunctions::iqr_fence(&values, IQR_FENCE_MULTIPLIER);
        for point in series.iter_mut() {
            point.y = point.y.clamp(lower, upper);
        }
    }
    for point in series.iter_mut() {
        point.y = point.y.max(0.0);
    }
    series
}

// ============================================================================
// SECTION 15: FORECASTING
// ============================================================================
// The orchestrator picks a strategy from the series length:
//   0 points    -> INSUFFICIENT (nothing to say)
//   1-2 points  -> NAIVE (repeat the last value)
//   3+ points   -> MODEL (delegate to a ForecastModel)
// A model failure never fails the request; it is reported in `error`.
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 Forecast Types
// ----------------------------------------------------------------------------

/// Seasonal components worth fitting for a given data span
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seasonality {
    pub daily: bool,
    pub weekly: bool,
    pub yearly: bool,
}

impl Seasonality {
    pub fn from_span_days(span_days: i64) -> Self {
        Self {
            daily: span_days >= DAILY_SEASONALITY_MIN_SPAN_DAYS,
            weekly: span_days >= WEEKLY_SEASONALITY_MIN_SPAN_DAYS,
            yearly: span_days >= YEARLY_SEASONALITY_MIN_SPAN_DAYS,
        }
    }

    /// Span between the first and last point of a date-ordered series
    pub fn for_series(series: &[SeriesPoint]) -> Self {
        match (series.first(), series.last()) {
            (Some(first), Some(last)) => Self::from_span_days((last.ds - first.ds).num_days()),
            _ => Self::default(),
        }
    }
}

/// One predicted day
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub ds: NaiveDate,
    pub yhat: f64,
    pub yhat_lower: f64,
    pub yhat_upper: f64,
}

impl ForecastPoint {
    /// A point with no uncertainty band
    pub fn flat(ds: NaiveDate, value: f64) -> Self {
        Self {
            ds,
            yhat: value,
            yhat_lower: value,
            yhat_upper: value,
        }
    }

    fn clamped(self) -> Self {
        Self {
            ds: self.ds,
            yhat: self.yhat.max(0.0),
            yhat_lower: self.yhat_lower.max(0.0),
            yhat_upper: self.yhat_upper.max(0.0),
        }
    }
}

/// What a forecasting model is asked for
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastRequest {
    pub series: Vec<SeriesPoint>,
    pub horizon_days: u32,
    pub seasonality: Seasonality,
    pub interval_width: f64,
}

/// Strategy chosen for a series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForecastState {
    Insufficient,
    Naive,
    Model,
}

impl ForecastState {
    pub fn for_len(n: usize) -> Self {
        match n {
            0 => ForecastState::Insufficient,
            n if n < MODEL_MIN_POINTS => ForecastState::Naive,
            _ => ForecastState::Model,
        }
    }
}

/// History plus forecast for one metric
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastResult {
    pub state: ForecastState,
    pub history: Vec<SeriesPoint>,
    pub forecast: Vec<ForecastPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Repeat the last observed value (floored at zero) on each of the
/// `horizon_days` days after the last history date.
pub fn naive_forecast(series: &[SeriesPoint], horizon_days: u32) -> Vec<ForecastPoint> {
    let Some(last) = series.last() else {
        return Vec::new();
    };
    let value = last.y.max(0.0);
    last.ds
        .iter_days()
        .skip(1)
        .take(horizon_days as usize)
        .map(|ds| ForecastPoint::flat(ds, value))
        .collect()
}

// ----------------------------------------------------------------------------
// 15.2 Forecast Model Trait
// ----------------------------------------------------------------------------

/// A forecasting backend. Returns one point per history day followed by one
/// per horizon day.
#[async_trait]
pub trait ForecastModel: Send + Sync + Debug {
    fn name(&self) -> &str;

    async fn forecast(&self, request: &ForecastRequest) -> CollaboratorResult<Vec<ForecastPoint>>;
}

// ----------------------------------------------------------------------------
// 15.3 Built-in Holt Model
// ----------------------------------------------------------------------------

/// Holt's linear trend with an optional additive day-of-week index.
#[derive(Debug, Clone)]
pub struct HoltForecastModel {
    alpha: f64,
    beta: f64,
}

impl Default for HoltForecastModel {
    fn default() -> Self {
        Self { alpha: 0.5, beta: 0.3 }
    }
}

impl HoltForecastModel {
    pub fn new(alpha: f64, beta: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            beta: beta.clamp(0.0, 1.0),
        }
    }

    /// Mean deviation from the overall mean per weekday (Monday = 0).
    fn weekday_index(series: &[SeriesPoint]) -> [f64; 7] {
        let overall = series.iter().map(|p| p.y).sum::<f64>() / series.len() as f64;
        let mut sums = [0.0; 7];
        let mut counts = [0usize; 7];
        for p in series {
            let d = p.ds.weekday().num_days_from_monday() as usize;
            sums[d] += p.y;
            counts[d] += 1;
        }
        let mut index = [0.0; 7];
        for d in 0..7 {
            if counts[d] > 0 {
                index[d] = sums[d] / counts[d] as f64 - overall;
            }
        }
        index
    }

    /// Fit and project. Pure, so it is usable outside the async trait.
    pub fn project(&self, request: &ForecastRequest) -> Vec<ForecastPoint> {
        let series = &request.series;
        let Some(first) = series.first() else {
            return Vec::new();
        };

        let use_weekly = request.seasonality.weekly && series.len() >= 2 * 7;
        let index = if use_weekly { Self::weekday_index(series) } else { [0.0; 7] };
        let season = |ds: NaiveDate| index[ds.weekday().num_days_from_monday() as usize];

        let adjusted: Vec<f64> = series.iter().map(|p| p.y - season(p.ds)).collect();

        let mut level = adjusted[0];
        let mut trend = adjusted.get(1).map(|y| y - adjusted[0]).unwrap_or(0.0);
        let mut fitted = Vec::with_capacity(adjusted.len());
        fitted.push(first.y);

        for (point, y) in series.iter().zip(&adjusted).skip(1) {
            fitted.push(level + trend + season(point.ds));
            let new_level = self.alpha * y + (1.0 - self.alpha) * (level + trend);
            trend = self.beta * (new_level - level) + (1.0 - self.beta) * trend;
            level = new_level;
        }

        let residuals: Vec<f64> = series.iter().zip(&fitted).map(|(p, f)| p.y - f).collect();
        let sigma = StatisticalFunctions::std_dev(&residuals).max(0.0);
        let z = StatisticalFunctions::normal_quantile((1.0 + request.interval_width) / 2.0);

        let mut out: Vec<ForecastPoint> = series
            .iter()
            .zip(&fitted)
            .map(|(p, &yhat)| ForecastPoint {
                ds: p.ds,
                yhat,
                yhat_lower: yhat - z * sigma,
                yhat_upper: yhat + z * sigma,
            })
            .collect();

        let last_ds = series[series.len() - 1].ds;
        for (h, ds) in last_ds.iter_days().skip(1).take(request.horizon_days as usize).enumerate() {
            let steps = (h + 1) as f64;
            let yhat = level + trend * steps + season(ds);
            let band = z * sigma * steps.sqrt();
            out.push(ForecastPoint {
                ds,
                yhat,
                yhat_lower: yhat - band,
                yhat_upper: yhat + band,
            });
        }
        out
    }
}

#[async_trait]
impl ForecastModel for HoltForecastModel {
    fn name(&self) -> &str {
        "holt"
    }

    async fn forecast(&self, request: &ForecastRequest) -> CollaboratorResult<Vec<ForecastPoint>> {
        Ok(self.project(request))
    }
}

// ----------------------------------------------------------------------------
// 15.4 HTTP Forecast Model
// ----------------------------------------------------------------------------

/// Remote model: POSTs the request as JSON, expects `{"forecast": [...]}`.
#[derive(Debug, Clone)]
pub struct HttpForecastModel {
    client: HttpClient,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    forecast: Vec<ForecastPoint>,
}

impl HttpForecastModel {
    pub fn new(endpoint: impl Into<String>, timeout_secs: u64) -> CollaboratorResult<Self> {
        let client = HttpClient::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| CollaboratorError::http("forecast", e))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl ForecastModel for HttpForecastModel {
    fn name(&self) -> &str {
        "http"
    }

    async fn forecast(&self, request: &ForecastRequest) -> CollaboratorResult<Vec<ForecastPoint>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| CollaboratorError::http("forecast", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Status {
                collaborator: "forecast".into(),
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ForecastResponse = response
            .json()
            .await
            .map_err(|e| CollaboratorError::invalid_response("forecast", e.to_string()))?;
        Ok(parsed.forecast)
    }
}

// ----------------------------------------------------------------------------
// 15.5 Forecast Orchestrator
// ----------------------------------------------------------------------------

/// Preprocesses a series, picks a strategy and bounds the model call.
#[derive(Debug, Clone)]
pub struct ForecastOrchestrator {
    model: Arc<dyn ForecastModel>,
    timeout: Duration,
    interval_width: f64,
}

impl ForecastOrchestrator {
    pub fn new(model: Arc<dyn ForecastModel>, timeout: Duration, interval_width: f64) -> Self {
        Self {
            model,
            timeout,
            interval_width,
        }
    }

    /// Remote model when an endpoint is configured, built-in Holt otherwise.
    pub fn from_config(config: &ForecastConfig) -> CollaboratorResult<Self> {
        let model: Arc<dyn ForecastModel> = match &config.endpoint {
            Some(endpoint) => Arc::new(HttpForecastModel::new(endpoint.clone(), config.timeout_secs)?),
            None => Arc::new(HoltForecastModel::default()),
        };
        Ok(Self::new(model, Duration::from_secs(config.timeout_secs), config.interval_width))
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub async fn forecast(&self, series: Vec<SeriesPoint>, horizon_days: u32) -> ForecastResult {
        let history = preprocess_series(series);
        let state = ForecastState::for_len(history.len());

        match state {
            ForecastState::Insufficient => ForecastResult {
                state,
                history,
                forecast: Vec::new(),
                error: None,
            },
            ForecastState::Naive => {
                let forecast = naive_forecast(&history, horizon_days);
                ForecastResult {
                    state,
                    history,
                    forecast,
                    error: None,
                }
            }
            ForecastState::Model => {
                let request = ForecastRequest {
                    seasonality: Seasonality::for_series(&history),
                    series: history,
                    horizon_days,
                    interval_width: self.interval_width,
                };
                let outcome = match timeout(self.timeout, self.model.forecast(&request)).await {
                    Ok(result) => result,
                    Err(_) => Err(CollaboratorError::Timeout {
                        collaborator: format!("forecast model '{}'", self.model.name()),
                        secs: self.timeout.as_secs(),
                    }),
                };
                match outcome {
                    Ok(points) => ForecastResult {
                        state,
                        history: request.series,
                        forecast: points.into_iter().map(ForecastPoint::clamped).collect(),
                        error: None,
                    },
                    Err(e) => {
                        warn!(
                            target: "dora::forecast",
                            model = self.model.name(),
                            error = %e,
                            "Forecast model failed, returning history only"
                        );
                        ForecastResult {
                            state,
                            history: request.series,
                            forecast: Vec::new(),
                            error: Some(e.to_string()),
                        }
                    }
                }
            }
        }
    }
}

// ============================================================================
// SECTION 16: SERIES & FORECAST TESTS
// ============================================================================


// ============================================================================
// SECTION 17: TEXT INSIGHTS
// ============================================================================
// A report is condensed into a `MetricsSummary` and handed to a text
// generation collaborator. Failures degrade to an `error` field; they never
// fail the report they accompany.
// ============================================================================

// ----------------------------------------------------------------------------
// 17.1 Metrics Summary
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentFrequencySummary {
    pub total_deployments: usize,
    pub period_days: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeadTimeSummary {
    pub average_hours: f64,
    pub number_of_commits: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoverySummary {
    pub average_minutes: f64,
    pub failures_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CfrSummary {
    pub change_failure_rate: f64,
}

/// The compact view of a report sent to the insight collaborator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub deployment_frequency: DeploymentFrequencySummary,
    pub lead_time: LeadTimeSummary,
    pub mttr: RecoverySummary,
    pub cfr: CfrSummary,
}

impl MetricsSummary {
    /// Averages are taken over the daily bucket values, counts over samples.
    pub fn from_report(report: &DoraReport) -> Self {
        let daily_mean = |daily: &BTreeMap<String, f64>| {
            let values: Vec<f64> = daily.values().copied().collect();
            mean(&values).map(round2).unwrap_or(0.0)
        };

        Self {
            deployment_frequency: DeploymentFrequencySummary {
                total_deployments: report.deployment_frequency.count,
                period_days: report.window.period_days(),
            },
            lead_time: LeadTimeSummary {
                average_hours: daily_mean(&report.lead_time.buckets.daily),
                number_of_commits: report.lead_time.samples.len(),
            },
            mttr: RecoverySummary {
                average_minutes: daily_mean(&report.mttr.buckets.daily),
                failures_count: report.mttr.samples.len(),
            },
            cfr: CfrSummary {
                change_failure_rate: report.cfr.change_failure_rate,
            },
        }
    }

    /// Prompt asking for analysis, trend, outlook and suggestions.
    pub fn to_prompt(&self) -> String {
        let summary = serde_json::to_string_pretty(self).unwrap_or_default();
        format!(
            "You are a DevOps assistant. Analyze the following DORA metrics and answer in plain \
             text paragraphs without markdown headings or bullet symbols. Wrap key metrics, trends \
             and recommendations in **bold**.\n\n\
             Cover:\n\
             1. Analysis of the metrics\n\
             2. Trend detection (increasing/decreasing)\n\
             3. Prediction for the next period\n\
             4. Suggestions for improvement\n\n\
             Metrics Summary:\n{}\n",
            summary
        )
    }
}

// ----------------------------------------------------------------------------
// 17.2 Insight Providers
// ----------------------------------------------------------------------------

/// Text-generation collaborator
#[async_trait]
pub trait InsightProvider: Send + Sync + Debug {
    fn name(&self) -> &str;

    async fn generate(&self, summary: &MetricsSummary) -> CollaboratorResult<String>;
}

/// generateContent-style HTTP provider
#[derive(Clone)]
pub struct HttpInsightProvider {
    client: HttpClient,
    url: String,
    api_key: Option<String>,
    temperature: f64,
    max_output_tokens: u32,
}

impl Debug for HttpInsightProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpInsightProvider")
            .field("url", &self.url)
            .field("temperature", &self.temperature)
            .field("max_output_tokens", &self.max_output_tokens)
            .finish_non_exhaustive()
    }
}

impl HttpInsightProvider {
    pub fn from_config(config: &InsightsConfig) -> CollaboratorResult<Self> {
        let client = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CollaboratorError::http("insights", e))?;
        Ok(Self {
            client,
            url: config.request_url(),
            api_key: config.api_key.clone(),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
        })
    }

    fn request_body(&self, prompt: String) -> JsonValue {
        json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "temperature": self.temperature,
                "maxOutputTokens": self.max_output_tokens,
            }
        })
    }
}

/// Reply text at `candidates[0].content.parts[0].text`
fn generated_text(reply: &JsonValue) -> Option<&str> {
    reply.pointer("/candidates/0/content/parts/0/text").and_then(JsonValue::as_str)
}

#[async_trait]
impl InsightProvider for HttpInsightProvider {
    fn name(&self) -> &str {
        "generate-content"
    }

    async fn generate(&self, summary: &MetricsSummary) -> CollaboratorResult<String> {
        let mut request = self.client.post(&self.url).json(&self.request_body(summary.to_prompt()));
        if let Some(key) = &self.api_key {
            request = request.query(&[("key", key)]);
        }

        let response = request.send().await.map_err(|e| CollaboratorError::http("insights", e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| CollaboratorError::http("insights", e))?;
        if !status.is_success() {
            return Err(CollaboratorError::Status {
                collaborator: "insights".into(),
                status: status.as_u16(),
                body,
            });
        }

        let reply: JsonValue = serde_json::from_str(&body)
            .map_err(|e| CollaboratorError::invalid_response("insights", e.to_string()))?;
        Ok(generated_text(&reply).unwrap_or("No insight returned").to_string())
    }
}

/// Used when insights are switched off in configuration
#[derive(Debug, Clone, Default)]
pub struct DisabledInsightProvider;

#[async_trait]
impl InsightProvider for DisabledInsightProvider {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _summary: &MetricsSummary) -> CollaboratorResult<String> {
        Err(CollaboratorError::Disabled {
            collaborator: "insights".into(),
        })
    }
}

/// `{"ai_insights": ...}` or `{"error": ...}`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum InsightOutcome {
    Generated { ai_insights: String },
    Failed { error: String },
}

impl InsightOutcome {
    pub fn from_result(result: CollaboratorResult<String>) -> Self {
        match result {
            Ok(text) => InsightOutcome::Generated { ai_insights: text },
            Err(e) => InsightOutcome::Failed {
                error: format!("Failed to get AI insights: {}", e),
            },
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, InsightOutcome::Failed { .. })
    }
}

// ============================================================================
// SECTION 18: SELF-METRICS
// ============================================================================

/// Prometheus instruments for the engine itself, on a private registry.
pub struct EngineMetrics {
    registry: PrometheusRegistry,
    events_ingested: IntCounterVec,
    correlation_skipped: IntCounterVec,
    collaborator_failures: IntCounterVec,
    query_duration: HistogramVec,
}

impl Debug for EngineMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineMetrics").finish_non_exhaustive()
    }
}

impl EngineMetrics {
    pub fn new() -> DoraResult<Self> {
        let registry = PrometheusRegistry::new();

        let events_ingested = IntCounterVec::new(
            Opts::new("dora_events_ingested_total", "Event records written by webhooks"),
            &["collection"],
        )
        .map_err(Self::internal)?;
        let correlation_skipped = IntCounterVec::new(
            Opts::new("dora_correlation_skipped_total", "Records or pairs skipped by correlators"),
            &["correlator", "reason"],
        )
        .map_err(Self::internal)?;
        let collaborator_failures = IntCounterVec::new(
            Opts::new("dora_collaborator_failures_total", "Failed forecast, insight or commit lookup calls"),
            &["collaborator"],
        )
        .map_err(Self::internal)?;
        let query_duration = HistogramVec::new(
            HistogramOpts::new("dora_query_duration_seconds", "Query endpoint latency")
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["endpoint"],
        )
        .map_err(Self::internal)?;

        registry.register(Box::new(events_ingested.clone())).map_err(Self::internal)?;
        registry.register(Box::new(correlation_skipped.clone())).map_err(Self::internal)?;
        registry.register(Box::new(collaborator_failures.clone())).map_err(Self::internal)?;
        registry.register(Box::new(query_duration.clone())).map_err(Self::internal)?;

        Ok(Self {
            registry,
            events_ingested,
            correlation_skipped,
            collaborator_failures,
            query_duration,
        })
    }

    fn internal(e: prometheus::Error) -> DoraError {
        DoraError::Internal(format!("metrics registry: {}", e))
    }

    pub fn record_ingested(&self, collection: CollectionKind, count: usize) {
        self.events_ingested
            .with_label_values(&[collection.name()])
            .inc_by(count as u64);
    }

    pub fn record_skips(&self, correlator: &str, stats: &CorrelationStats) {
        for (reason, count) in &stats.skipped {
            self.correlation_skipped
                .with_label_values(&[correlator, reason.as_str()])
                .inc_by(*count as u64);
        }
    }

    pub fn record_collaborator_failure(&self, collaborator: &str) {
        self.collaborator_failures.with_label_values(&[collaborator]).inc();
    }

    pub fn observe_query(&self, endpoint: &str, elapsed: Duration) {
        self.query_duration
            .with_label_values(&[endpoint])
            .observe(elapsed.as_secs_f64());
    }

    /// Text exposition format
    pub fn render(&self) -> DoraResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(Self::internal)?;
        String::from_utf8(buffer).map_err(|e| DoraError::Internal(e.to_string()))
    }
}

// ============================================================================
// SECTION 19: DORA ENGINE
// ============================================================================
// Owns the injected store and collaborators. Each operation reads what it
// needs from the store (bounded by a timeout) and runs the pure correlators
// over it.
// ============================================================================

// ----------------------------------------------------------------------------
// 19.1 Report Types
// ----------------------------------------------------------------------------

/// A deployment as listed by the frequency endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentRef {
    pub build_id: String,
    pub timestamp: Option<String>,
}

/// Successful deployments in a window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentFrequency {
    pub count: usize,
    pub deployments: Vec<DeploymentRef>,
}

/// Deployment count with the window echoed in query layout
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentSummary {
    pub count: usize,
    pub start_date: String,
    pub end_date: String,
}

/// All four metrics over one window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DoraReport {
    #[serde(skip)]
    pub window: QueryWindow,
    pub deployment_frequency: DeploymentSummary,
    pub lead_time: LeadTimeReport,
    pub mttr: RecoveryReport,
    pub cfr: CfrReport,
}

impl DoraReport {
    /// Compute every metric from one snapshot, in parallel.
    pub fn compute(window: QueryWindow, snapshot: &EventSnapshot, production_job: Option<&str>) -> DoraResult<Self> {
        let ((count, lead_time), (mttr, cfr)) = rayon::join(
            || {
                rayon::join(
                    || {
                        let filter = DeploymentFilter::successful_in(window).with_job(production_job);
                        snapshot.deployments.iter().filter(|d| filter.matches(d)).count()
                    },
                    || correlate_lead_time(&window, &snapshot.changes, &snapshot.deployments),
                )
            },
            || {
                rayon::join(
                    || correlate_recovery(&window, &snapshot.deployments, &snapshot.incidents),
                    || {
                        classify_change_failures(
                            &window.start_iso(),
                            &window.end_iso(),
                            &snapshot.changes,
                            &snapshot.deployments,
                            &snapshot.incidents,
                        )
                    },
                )
            },
        );

        Ok(Self {
            window,
            deployment_frequency: DeploymentSummary {
                count,
                start_date: window.start_query(),
                end_date: window.end_query(),
            },
            lead_time,
            mttr,
            cfr: cfr?,
        })
    }
}

// ----------------------------------------------------------------------------
// 19.2 Engine
// ----------------------------------------------------------------------------

/// The DORA metrics engine
#[derive(Debug, Clone)]
pub struct DoraEngine {
    store: Arc<dyn EventStore>,
    forecaster: ForecastOrchestrator,
    insights: Arc<dyn InsightProvider>,
    commit_source: Option<Arc<dyn CommitSource>>,
    metrics: Arc<EngineMetrics>,
    store_timeout: Duration,
    insight_timeout: Duration,
    commit_timeout: Duration,
    production_job: Option<String>,
    default_forecast_days: u32,
}

impl DoraEngine {
    pub fn new(
        store: Arc<dyn EventStore>,
        forecaster: ForecastOrchestrator,
        insights: Arc<dyn InsightProvider>,
        config: &DoraConfig,
    ) -> DoraResult<Self> {
        Ok(Self {
            store,
            forecaster,
            insights,
            commit_source: None,
            metrics: Arc::new(EngineMetrics::new()?),
            store_timeout: config.store_timeout(),
            insight_timeout: Duration::from_secs(config.insights.timeout_secs),
            commit_timeout: Duration::from_secs(config.github.timeout_secs),
            production_job: config.metrics.production_job.clone(),
            default_forecast_days: config.metrics.default_forecast_days,
        })
    }

    /// Wire collaborators as configured around an existing store.
    pub fn from_config(config: &DoraConfig, store: Arc<dyn EventStore>) -> DoraResult<Self> {
        let forecaster = ForecastOrchestrator::from_config(&config.forecast)?;
        let insights: Arc<dyn InsightProvider> = if config.insights.enabled {
            Arc::new(HttpInsightProvider::from_config(&config.insights)?)
        } else {
            Arc::new(DisabledInsightProvider)
        };
        info!(
            target: "dora::engine",
            store = store.name(),
            forecast_model = forecaster.model_name(),
            insights = insights.name(),
            fetch_commits = config.github.fetch_commits,
            production_job = ?config.metrics.production_job,
            "Engine configured"
        );
        let engine = Self::new(store, forecaster, insights, config)?;
        if config.github.fetch_commits {
            let source = GithubCommitSource::from_config(&config.github)?;
            return Ok(engine.with_commit_source(Arc::new(source)));
        }
        Ok(engine)
    }

    /// Look up merged pull request commits through `source`
    pub fn with_commit_source(mut self, source: Arc<dyn CommitSource>) -> Self {
        self.commit_source = Some(source);
        self
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn default_forecast_days(&self) -> u32 {
        self.default_forecast_days
    }

    async fn bounded<T>(&self, operation: &'static str, fut: impl Future<Output = StoreResult<T>>) -> DoraResult<T> {
        match timeout(self.store_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(target: "dora::engine", operation, error = %e, "Store read failed");
                Err(e.into())
            }
            Err(_) => {
                warn!(target: "dora::engine", operation, "Store read timed out");
                Err(StoreError::Timeout {
                    operation,
                    secs: self.store_timeout.as_secs(),
                }
                .into())
            }
        }
    }

    /// All three collections
    pub async fn snapshot(&self) -> DoraResult<EventSnapshot> {
        let deployment_filter = DeploymentFilter::all();
        let incident_filter = IncidentFilter::all();
        let (changes, deployments, incidents) = futures::try_join!(
            self.bounded("find_changes", self.store.find_changes()),
            self.bounded("find_deployments", self.store.find_deployments(&deployment_filter)),
            self.bounded("find_incidents", self.store.find_incidents(&incident_filter)),
        )?;
        Ok(EventSnapshot {
            changes,
            deployments,
            incidents,
        })
    }

    // ------------------------------------------------------------------
    // Metric queries
    // ------------------------------------------------------------------

    pub async fn deployment_frequency(&self, window: &QueryWindow) -> DoraResult<DeploymentFrequency> {
        let filter = DeploymentFilter::successful_in(*window).with_job(self.production_job.as_deref());
        let deployments = self
            .bounded("find_deployments", self.store.find_deployments(&filter))
            .await?;
        Ok(DeploymentFrequency {
            count: deployments.len(),
            deployments: deployments
                .into_iter()
                .map(|d| DeploymentRef {
                    build_id: d.build_id,
                    timestamp: d.timestamp,
                })
                .collect(),
        })
    }

    pub async fn lead_time(&self, window: &QueryWindow) -> DoraResult<LeadTimeReport> {
        let filter = DeploymentFilter::successful_in(*window);
        let (changes, deployments) = futures::try_join!(
            self.bounded("find_changes", self.store.find_changes()),
            self.bounded("find_deployments", self.store.find_deployments(&filter)),
        )?;
        let report = correlate_lead_time(window, &changes, &deployments);
        self.metrics.record_skips("lead_time", &report.stats);
        Ok(report)
    }

    pub async fn mttr(&self, window: &QueryWindow) -> DoraResult<RecoveryReport> {
        let deployment_filter = DeploymentFilter::failed_in(*window);
        let incident_filter = IncidentFilter::high_or_critical_in(*window);
        let (deployments, incidents) = futures::try_join!(
            self.bounded("find_deployments", self.store.find_deployments(&deployment_filter)),
            self.bounded("find_incidents", self.store.find_incidents(&incident_filter)),
        )?;
        let report = correlate_recovery(window, &deployments, &incidents);
        self.metrics.record_skips("mttr", &report.stats);
        Ok(report)
    }

    pub async fn cfr(&self, window: &QueryWindow) -> DoraResult<CfrReport> {
        let snapshot = self.snapshot().await?;
        Ok(classify_change_failures(
            &window.start_iso(),
            &window.end_iso(),
            &snapshot.changes,
            &snapshot.deployments,
            &snapshot.incidents,
        )?)
    }

    /// All four metrics, computed off the async runtime.
    pub async fn report(&self, window: &QueryWindow) -> DoraResult<DoraReport> {
        let timer = PerfTimer::with_threshold("report", SLOW_QUERY_THRESHOLD_MS);
        let snapshot = self.snapshot().await?;
        let window = *window;
        let production_job = self.production_job.clone();

        let report = tokio::task::spawn_blocking(move || {
            DoraReport::compute(window, &snapshot, production_job.as_deref())
        })
        .await
        .map_err(|e| DoraError::Internal(format!("report task failed: {}", e)))??;

        self.metrics.record_skips("lead_time", &report.lead_time.stats);
        self.metrics.record_skips("mttr", &report.mttr.stats);
        debug!(
            target: "dora::engine",
            window = %window,
            elapsed_ms = timer.stop().as_millis() as u64,
            "Report computed"
        );
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Insights
    // ------------------------------------------------------------------

    pub async fn generate_insights(&self, summary: &MetricsSummary) -> InsightOutcome {
        let result = match timeout(self.insight_timeout, self.insights.generate(summary)).await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::Timeout {
                collaborator: format!("insight provider '{}'", self.insights.name()),
                secs: self.insight_timeout.as_secs(),
            }),
        };
        if let Err(e) = &result {
            if !matches!(e, CollaboratorError::Disabled { .. }) {
                warn!(target: "dora::insights", provider = self.insights.name(), error = %e, "Insight generation failed");
                self.metrics.record_collaborator_failure("insights");
            }
        }
        InsightOutcome::from_result(result)
    }

    /// Report, its summary and the generated insights
    pub async fn insights(&self, window: &QueryWindow) -> DoraResult<(DoraReport, MetricsSummary, InsightOutcome)> {
        let report = self.report(window).await?;
        let summary = MetricsSummary::from_report(&report);
        let outcome = self.generate_insights(&summary).await;
        Ok((report, summary, outcome))
    }

    // ------------------------------------------------------------------
    // Series & forecasts
    // ------------------------------------------------------------------

    pub async fn series(&self, metric: DoraMetric, window: &QueryWindow) -> DoraResult<Vec<SeriesPoint>> {
        let snapshot = self.snapshot().await?;
        Ok(build_series(metric, window, &snapshot, self.production_job.as_deref()))
    }

    pub async fn forecast(
        &self,
        metric: DoraMetric,
        window: &QueryWindow,
        horizon_days: Option<u32>,
    ) -> DoraResult<ForecastResult> {
        let days = horizon_days.unwrap_or(self.default_forecast_days);
        if !(MIN_FORECAST_DAYS..=MAX_FORECAST_DAYS).contains(&days) {
            return Err(ParseError::HorizonOutOfRange { days }.into());
        }

        let series = self.series(metric, window).await?;
        let result = self.forecaster.forecast(series, days).await;
        if result.error.is_some() {
            self.metrics.record_collaborator_failure("forecast");
        }
        info!(
            target: "dora::forecast",
            metric = %metric,
            state = ?result.state,
            history = result.history.len(),
            forecast = result.forecast.len(),
            "Forecast computed"
        );
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    /// Upsert normalized records and persist them. Returns records written.
    pub async fn ingest(&self, records: Vec<EventRecord>) -> DoraResult<usize> {
        let mut per_collection: BTreeMap<&'static str, (CollectionKind, usize)> = BTreeMap::new();
        let mut written = 0;
        for record in records {
            let kind = record.collection();
            match self.store.upsert_one(record).await {
                Ok(_) => {
                    written += 1;
                    per_collection.entry(kind.name()).or_insert((kind, 0)).1 += 1;
                }
                Err(StoreError::MissingKey { collection }) => {
                    warn!(target: "dora::ingest", collection, "Skipping record without natural key");
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.store.flush().await?;

        for (kind, count) in per_collection.values() {
            self.metrics.record_ingested(*kind, *count);
        }
        debug!(target: "dora::ingest", written, "Records ingested");
        Ok(written)
    }

    /// Commits from `commits_url`, or `None` to keep the payload's list
    async fn fetch_pr_commits(&self, payload: &JsonValue) -> Option<Vec<CommitRef>> {
        let source = self.commit_source.as_ref()?;
        let url = github_commits_url(payload)?;
        let result = match timeout(self.commit_timeout, source.fetch_commits(url)).await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::Timeout {
                collaborator: format!("commit source '{}'", source.name()),
                secs: self.commit_timeout.as_secs(),
            }),
        };
        match result {
            Ok(commits) => Some(commits),
            Err(e) => {
                warn!(target: "dora::ingest", source = source.name(), error = %e, "Commit lookup failed, using payload commits");
                self.metrics.record_collaborator_failure("github_commits");
                None
            }
        }
    }

    pub async fn ingest_github(&self, payload: &JsonValue) -> DoraResult<JsonValue> {
        match normalize_github(payload)? {
            Some(mut change) => {
                if let Some(commits) = self.fetch_pr_commits(payload).await {
                    change.commits = commits;
                }
                let pr_id = change.pr_id;
                self.ingest(vec![change.into()]).await?;
                Ok(json!({"status": "ok", "pr_id": pr_id}))
            }
            None => Ok(json!({"status": "ignored"})),
        }
    }

    pub async fn ingest_jenkins(&self, payload: &JsonValue) -> DoraResult<JsonValue> {
        let deployment = normalize_jenkins(payload)?;
        let build_id = deployment.build_id.clone();
        self.ingest(vec![deployment.into()]).await?;
        Ok(json!({"status": "ok", "build_id": build_id}))
    }

    pub async fn ingest_alertmanager(&self, payload: &JsonValue) -> DoraResult<JsonValue> {
        let incidents = normalize_alertmanager(payload)?;
        let processed: Vec<String> = incidents.iter().map(|i| i.alert_id.clone()).collect();
        self.ingest(incidents.into_iter().map(EventRecord::from).collect()).await?;
        Ok(json!({"status": "ok", "processed": processed}))
    }
}

// ============================================================================
// SECTION 20: ENGINE TESTS
// ============================================================================

#[cfg(test)]
mod engine_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug)]
    struct EchoInsights;

    #[async_trait]
    impl InsightProvider for EchoInsights {
        fn name(&self) -> &str {
            "echo"
        }

        async fn generate(&self, summary: &MetricsSummary) -> CollaboratorResult<String> {
            Ok(format!("{} deployments", summary.deployment_frequency.total_deployments))
        }
    }

    #[derive(Debug)]
    struct BrokenInsights;

    #[async_trait]
    impl InsightProvider for BrokenInsights {
        fn name(&self) -> &str {
            "broken"
        }

        async fn generate(&self, _summary: &MetricsSummary) -> CollaboratorResult<String> {
            Err(CollaboratorError::Status {
                collaborator: "insights".into(),
                status: 503,
                body: "overloaded".into(),
            })
        }
    }

    fn march() -> QueryWindow {
        QueryWindow::from_query("2024-03-01 00:00:00", "2024-03-03 23:59:59").unwrap()
    }

    async fn seeded_store() -> Arc<InMemoryEventStore> {
        let store = Arc::new(InMemoryEventStore::new());
        let records: Vec<EventRecord> = vec![
            CodeChangeEvent::merged(
                1,
                "2024-03-01T09:00:00Z",
                vec![
                    CommitRef::new("c1", "2024-03-01T08:00:00Z"),
                    CommitRef::new("c2", "2024-03-01T08:00:00Z"),
                    CommitRef::new("c3", "2024-03-01T08:00:00Z"),
                ],
            )
            .into(),
            DeploymentEvent::new("b1", "FAILURE", "2024-03-01T10:00:00Z", Some("c1")).into(),
            DeploymentEvent::new("b2", "SUCCESS", "2024-03-01T10:00:00Z", Some("c2")).into(),
            DeploymentEvent::new("b3", "SUCCESS", "2024-03-03T12:00:00Z", Some("c3")).into(),
            IncidentEvent::new("Crash", "critical", "2024-03-01T10:10:00Z", Some("2024-03-01T11:10:00Z"))
                .with_label("commit", "c2")
                .into(),
        ];
        store.upsert_many(records).await.unwrap();
        store
    }

    async fn engine_with(insights: Arc<dyn InsightProvider>) -> DoraEngine {
        let store: Arc<dyn EventStore> = seeded_store().await;
        let config = DoraConfig::default();
        let forecaster = ForecastOrchestrator::from_config(&config.forecast).unwrap();
        DoraEngine::new(store, forecaster, insights, &config).unwrap()
    }

    #[tokio::test]
    async fn test_report_combines_all_metrics() {
        let engine = engine_with(Arc::new(EchoInsights)).await;
        let report = engine.report(&march()).await.unwrap();

        assert_eq!(report.deployment_frequency.count, 2);
        assert_eq!(report.deployment_frequency.start_date, "2024-03-01 00:00:00");
        assert_eq!(report.lead_time.buckets.daily.get("2024-03-01"), Some(&2.0));
        assert_eq!(report.lead_time.buckets.daily.get("2024-03-03"), Some(&52.0));
        assert_eq!(report.mttr.buckets.daily.get("2024-03-01"), Some(&70.0));
        assert_eq!((report.cfr.total_changes, report.cfr.failed_changes), (3, 2));
        assert_eq!(report.cfr.change_failure_rate, 66.67);
        assert_eq!(report.cfr.start_time, "2024-03-01T00:00:00Z");
    }

    #[tokio::test]
    async fn test_individual_queries_agree_with_report() {
        let engine = engine_with(Arc::new(EchoInsights)).await;
        let window = march();
        let report = engine.report(&window).await.unwrap();

        assert_eq!(engine.lead_time(&window).await.unwrap().buckets, report.lead_time.buckets);
        assert_eq!(engine.mttr(&window).await.unwrap().buckets, report.mttr.buckets);
        assert_eq!(engine.cfr(&window).await.unwrap(), report.cfr);

        let frequency = engine.deployment_frequency(&window).await.unwrap();
        assert_eq!(frequency.count, report.deployment_frequency.count);
        assert_eq!(frequency.deployments[0].build_id, "b2");
    }

    #[tokio::test]
    async fn test_insights_summary_and_outcome() {
        let engine = engine_with(Arc::new(EchoInsights)).await;
        let (_, summary, outcome) = engine.insights(&march()).await.unwrap();

        assert_eq!(summary.deployment_frequency.total_deployments, 2);
        assert_eq!(summary.deployment_frequency.period_days, 2);
        assert_eq!(summary.lead_time.average_hours, 27.0);
        assert_eq!(summary.lead_time.number_of_commits, 2);
        assert_eq!(summary.mttr.average_minutes, 70.0);
        assert_eq!(summary.cfr.change_failure_rate, 66.67);
        assert_eq!(
            outcome,
            InsightOutcome::Generated {
                ai_insights: "2 deployments".into()
            }
        );
    }

    #[tokio::test]
    async fn test_insight_failure_degrades() {
        let engine = engine_with(Arc::new(BrokenInsights)).await;
        let (_, _, outcome) = engine.insights(&march()).await.unwrap();
        let value = serde_json::to_value(&outcome).unwrap();
        let error = value["error"].as_str().unwrap();
        assert!(error.starts_with("Failed to get AI insights: "));
        assert!(error.contains("503"));
        assert!(engine.metrics().render().unwrap().contains("dora_collaborator_failures_total"));
    }

    #[tokio::test]
    async fn test_forecast_rejects_horizon_out_of_range() {
        let engine = engine_with(Arc::new(DisabledInsightProvider)).await;
        for days in [0, 366] {
            let err = engine
                .forecast(DoraMetric::DeploymentFrequency, &march(), Some(days))
                .await
                .unwrap_err();
            assert!(matches!(err, DoraError::Parse(ParseError::HorizonOutOfRange { .. })));
        }
    }

    #[tokio::test]
    async fn test_forecast_deployment_frequency() {
        let engine = engine_with(Arc::new(DisabledInsightProvider)).await;
        let result = engine
            .forecast(DoraMetric::DeploymentFrequency, &march(), Some(4))
            .await
            .unwrap();
        assert_eq!(result.state, ForecastState::Model);
        assert_eq!(result.history.iter().map(|p| p.y).collect::<Vec<_>>(), vec![1.0, 0.0, 1.0]);
        assert_eq!(result.forecast.len(), 7);
        assert_eq!(result.error, None);
    }

    #[tokio::test]
    async fn test_ingest_webhooks_update_store_and_metrics() {
        let engine = engine_with(Arc::new(DisabledInsightProvider)).await;

        let ack = engine
            .ingest_jenkins(&json!({"number": 7, "status": "SUCCESS", "timestamp": "2024-03-02T10:00:00Z"}))
            .await
            .unwrap();
        assert_eq!(ack, json!({"status": "ok", "build_id": "7"}));

        let ack = engine
            .ingest_github(&json!({"action": "opened", "pull_request": {"number": 9}}))
            .await
            .unwrap();
        assert_eq!(ack, json!({"status": "ignored"}));

        let ack = engine
            .ingest_alertmanager(&json!({"alerts": [{"labels": {"alertname": "Down"}, "startsAt": "2024-03-02T10:00:00Z"}]}))
            .await
            .unwrap();
        assert_eq!(ack, json!({"status": "ok", "processed": ["Down__2024-03-02T10:00:00Z"]}));

        assert_eq!(engine.store().count(CollectionKind::Deployments).await.unwrap(), 4);
        let rendered = engine.metrics().render().unwrap();
        assert!(rendered.contains("dora_events_ingested_total{collection=\"jenkins_deployments\"} 1"));
    }

    #[derive(Debug)]
    struct FixedCommits(Vec<CommitRef>);

    #[async_trait]
    impl CommitSource for FixedCommits {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn fetch_commits(&self, commits_url: &str) -> CollaboratorResult<Vec<CommitRef>> {
            assert_eq!(commits_url, "https://api.github.com/repos/acme/shop/pulls/77/commits");
            Ok(self.0.clone())
        }
    }

    #[derive(Debug)]
    struct UnreachableCommits;

    #[async_trait]
    impl CommitSource for UnreachableCommits {
        fn name(&self) -> &str {
            "unreachable"
        }

        async fn fetch_commits(&self, _commits_url: &str) -> CollaboratorResult<Vec<CommitRef>> {
            Err(CollaboratorError::Status {
                collaborator: "github".into(),
                status: 404,
                body: "Not Found".into(),
            })
        }
    }

    /// Real webhooks carry a commit count, not a list
    fn merged_pr_webhook(commits: JsonValue) -> JsonValue {
        json!({
            "action": "closed",
            "pull_request": {
                "number": 77,
                "merged": true,
                "merged_at": "2024-03-02T12:00:00Z",
                "commits": commits,
                "commits_url": "https://api.github.com/repos/acme/shop/pulls/77/commits"
            }
        })
    }

    async fn stored_change(engine: &DoraEngine, pr_id: u64) -> CodeChangeEvent {
        let changes = engine.store().find_changes().await.unwrap();
        changes.into_iter().find(|c| c.pr_id == pr_id).unwrap()
    }

    #[tokio::test]
    async fn test_ingest_github_uses_fetched_commits() {
        let fetched = vec![
            CommitRef::new("f1", "2024-03-02T09:00:00Z"),
            CommitRef::new("f2", "2024-03-02T10:00:00Z"),
        ];
        let engine = engine_with(Arc::new(DisabledInsightProvider))
            .await
            .with_commit_source(Arc::new(FixedCommits(fetched.clone())));

        let ack = engine.ingest_github(&merged_pr_webhook(json!(2))).await.unwrap();
        assert_eq!(ack, json!({"status": "ok", "pr_id": 77}));
        assert_eq!(stored_change(&engine, 77).await.commits, fetched);
    }

    #[tokio::test]
    async fn test_ingest_github_falls_back_to_payload_commits() {
        let engine = engine_with(Arc::new(DisabledInsightProvider))
            .await
            .with_commit_source(Arc::new(UnreachableCommits));

        let payload = merged_pr_webhook(json!([{"sha": "p1", "timestamp": "2024-03-02T08:00:00Z"}]));
        engine.ingest_github(&payload).await.unwrap();

        assert_eq!(
            stored_change(&engine, 77).await.commits,
            vec![CommitRef::new("p1", "2024-03-02T08:00:00Z")]
        );
        let rendered = engine.metrics().render().unwrap();
        assert!(rendered.contains("dora_collaborator_failures_total{collaborator=\"github_commits\"} 1"));
    }

    #[tokio::test]
    async fn test_ingest_github_without_source_keeps_payload_commits() {
        let engine = engine_with(Arc::new(DisabledInsightProvider)).await;
        engine.ingest_github(&merged_pr_webhook(json!(3))).await.unwrap();
        assert!(stored_change(&engine, 77).await.commits.is_empty());
    }

    #[tokio::test]
    async fn test_ingest_counts_only_written_records() {
        let engine = engine_with(Arc::new(DisabledInsightProvider)).await;
        let records: Vec<EventRecord> = vec![
            DeploymentEvent::new("", "SUCCESS", "2024-03-02T10:00:00Z", None).into(),
            DeploymentEvent::new("b9", "SUCCESS", "2024-03-02T11:00:00Z", None).into(),
        ];

        assert_eq!(engine.ingest(records).await.unwrap(), 1);
        let rendered = engine.metrics().render().unwrap();
        assert!(rendered.contains("dora_events_ingested_total{collection=\"jenkins_deployments\"} 1"));
    }

    #[tokio::test]
    async fn test_ingest_rejects_malformed_payload() {
        let engine = engine_with(Arc::new(DisabledInsightProvider)).await;
        let err = engine.ingest_jenkins(&json!({"status": "SUCCESS"})).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.category(), "ingest");
    }

    #[derive(Debug)]
    struct StalledStore;

    #[async_trait]
    impl EventStore for StalledStore {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn upsert_one(&self, _record: EventRecord) -> StoreResult<UpsertOutcome> {
            Err(StoreError::Unavailable("read only".into()))
        }

        async fn find_changes(&self) -> StoreResult<Vec<CodeChangeEvent>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }

        async fn find_deployments(&self, _filter: &DeploymentFilter) -> StoreResult<Vec<DeploymentEvent>> {
            Ok(Vec::new())
        }

        async fn find_incidents(&self, _filter: &IncidentFilter) -> StoreResult<Vec<IncidentEvent>> {
            Ok(Vec::new())
        }

        async fn count(&self, _kind: CollectionKind) -> StoreResult<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_store_timeout_surfaces_as_error() {
        let config = DoraConfig::default();
        let mut engine = DoraEngine::new(
            Arc::new(StalledStore),
            ForecastOrchestrator::from_config(&config.forecast).unwrap(),
            Arc::new(DisabledInsightProvider),
            &config,
        )
        .unwrap();
        engine.store_timeout = Duration::from_millis(20);

        let err = engine.lead_time(&march()).await.unwrap_err();
        assert!(matches!(err, DoraError::Store(StoreError::Timeout { operation: "find_changes", .. })));
        assert!(err.is_recoverable());
    }
}

// ============================================================================
// SECTION 21: HTTP QUERY SURFACE
// ============================================================================
// Thin axum layer over `DoraEngine`. Query parameters are validated here so
// malformed input is rejected with `400 {"detail": ...}` before the engine
// is touched.
// ============================================================================

// ----------------------------------------------------------------------------
// 21.1 State & Errors
// ----------------------------------------------------------------------------

/// Shared handler state
#[derive(Debug, Clone)]
pub struct AppState {
    engine: Arc<DoraEngine>,
}

impl AppState {
    pub fn new(engine: DoraEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    pub fn engine(&self) -> &DoraEngine {
        &self.engine
    }
}

/// Handler error rendered as `{"detail": ...}`
#[derive(Debug)]
pub struct ApiError(DoraError);

impl<E: Into<DoraError>> From<E> for ApiError {
    fn from(err: E) -> Self {
        ApiError(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        if status.is_server_error() {
            error!(
                target: "dora::http",
                category = self.0.category(),
                recoverable = self.0.is_recoverable(),
                error = %self.0,
                "Request failed"
            );
        } else {
            debug!(target: "dora::http", error = %self.0, "Request rejected");
        }
        (status, Json(json!({ "detail": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ----------------------------------------------------------------------------
// 21.2 Query Parameters
// ----------------------------------------------------------------------------

/// `start_time` / `end_time` in `YYYY-MM-DD HH:MM:SS`
#[derive(Debug, Default, Deserialize)]
pub struct WindowParams {
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

impl WindowParams {
    fn window(&self) -> Result<QueryWindow, ParseError> {
        QueryWindow::from_query(
            required("start_time", &self.start_time)?,
            required("end_time", &self.end_time)?,
        )
    }
}

/// `start` / `end` of the CFR route
#[derive(Debug, Default, Deserialize)]
pub struct CfrParams {
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ForecastParams {
    pub metric: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub days: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ForecastPathParams {
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub periods: Option<String>,
}

fn required<'a>(field: &str, value: &'a Option<String>) -> Result<&'a str, ParseError> {
    value.as_deref().ok_or_else(|| ParseError::InvalidValue {
        field: field.to_string(),
        value: String::new(),
    })
}

/// Forecast horizon in days, `default` when absent.
fn parse_horizon(field: &str, raw: Option<&str>, default: u32) -> Result<u32, ParseError> {
    let days = match raw {
        None => default,
        Some(raw) => raw.trim().parse::<u32>().map_err(|_| ParseError::InvalidValue {
            field: field.to_string(),
            value: raw.to_string(),
        })?,
    };
    if !(MIN_FORECAST_DAYS..=MAX_FORECAST_DAYS).contains(&days) {
        return Err(ParseError::HorizonOutOfRange { days });
    }
    Ok(days)
}

fn parse_payload(origin: &'static str, body: &[u8]) -> Result<JsonValue, IngestError> {
    serde_json::from_slice(body).map_err(|e| IngestError::InvalidPayload {
        origin,
        message: e.to_string(),
    })
}

// ----------------------------------------------------------------------------
// 21.3 Router
// ----------------------------------------------------------------------------

/// Build the query and webhook router
pub fn build_router(state: AppState, cors_permissive: bool) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/deployment-frequency", get(deployment_frequency))
        .route("/lead-time", get(lead_time))
        .route("/mttr", get(mttr))
        .route("/api/cfr", get(change_failure_rate))
        .route("/dora-metrics", get(dora_metrics))
        .route("/ai-insights", get(ai_insights))
        .route("/forecast", get(forecast))
        .route("/forecast/:metric", get(forecast_metric))
        .route("/webhook/github", post(github_webhook))
        .route("/webhook/jenkins", post(jenkins_webhook))
        .route("/webhook/prometheus", post(prometheus_webhook))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if cors_permissive {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

fn observe(state: &AppState, endpoint: &'static str, timer: PerfTimer) {
    state.engine.metrics().observe_query(endpoint, timer.stop());
}

// ----------------------------------------------------------------------------
// 21.4 Handlers
// ----------------------------------------------------------------------------

async fn health() -> Json<JsonValue> {
    Json(json!({ "status": "ok" }))
}

async fn prometheus_metrics(State(state): State<AppState>) -> ApiResult<Response> {
    let body = state.engine.metrics().render()?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response())
}

async fn deployment_frequency(
    State(state): State<AppState>,
    Query(params): Query<WindowParams>,
) -> ApiResult<Json<DeploymentFrequency>> {
    let window = params.window()?;
    let timer = PerfTimer::with_threshold("deployment_frequency", SLOW_QUERY_THRESHOLD_MS);
    let result = state.engine.deployment_frequency(&window).await?;
    observe(&state, "deployment_frequency", timer);
    Ok(Json(result))
}

async fn lead_time(
    State(state): State<AppState>,
    Query(params): Query<WindowParams>,
) -> ApiResult<Json<LeadTimeReport>> {
    let window = params.window()?;
    let timer = PerfTimer::with_threshold("lead_time", SLOW_QUERY_THRESHOLD_MS);
    let report = state.engine.lead_time(&window).await?;
    observe(&state, "lead_time", timer);
    Ok(Json(report))
}

async fn mttr(
    State(state): State<AppState>,
    Query(params): Query<WindowParams>,
) -> ApiResult<Json<RecoveryReport>> {
    let window = params.window()?;
    let timer = PerfTimer::with_threshold("mttr", SLOW_QUERY_THRESHOLD_MS);
    let report = state.engine.mttr(&window).await?;
    observe(&state, "mttr", timer);
    Ok(Json(report))
}

async fn change_failure_rate(
    State(state): State<AppState>,
    Query(params): Query<CfrParams>,
) -> ApiResult<Json<CfrReport>> {
    let window = QueryWindow::from_query(required("start", &params.start)?, required("end", &params.end)?)?;
    let timer = PerfTimer::with_threshold("cfr", SLOW_QUERY_THRESHOLD_MS);
    let report = state.engine.cfr(&window).await?;
    observe(&state, "cfr", timer);
    Ok(Json(report))
}

async fn dora_metrics(
    State(state): State<AppState>,
    Query(params): Query<WindowParams>,
) -> ApiResult<Json<JsonValue>> {
    let window = params.window()?;
    let timer = PerfTimer::with_threshold("dora_metrics", SLOW_QUERY_THRESHOLD_MS);
    let (report, _, outcome) = state.engine.insights(&window).await?;
    observe(&state, "dora_metrics", timer);
    Ok(Json(json!({
        "dora_metrics": report,
        "ai_insights": outcome,
    })))
}

async fn ai_insights(
    State(state): State<AppState>,
    Query(params): Query<WindowParams>,
) -> ApiResult<Json<JsonValue>> {
    let window = params.window()?;
    let timer = PerfTimer::with_threshold("ai_insights", SLOW_QUERY_THRESHOLD_MS);
    let (_, summary, outcome) = state.engine.insights(&window).await?;
    observe(&state, "ai_insights", timer);
    Ok(Json(json!({
        "ai_insights": outcome,
        "metrics_summary": summary,
    })))
}

async fn forecast(
    State(state): State<AppState>,
    Query(params): Query<ForecastParams>,
) -> ApiResult<Json<JsonValue>> {
    let metric: DoraMetric = required("metric", &params.metric)?.parse()?;
    let window = QueryWindow::from_query(
        required("start_time", &params.start_time)?,
        required("end_time", &params.end_time)?,
    )?;
    let days = parse_horizon("days", params.days.as_deref(), state.engine.default_forecast_days())?;

    let timer = PerfTimer::with_threshold("forecast", SLOW_QUERY_THRESHOLD_MS);
    let result = state.engine.forecast(metric, &window, Some(days)).await?;
    observe(&state, "forecast", timer);
    Ok(Json(json!({
        "metric": metric,
        "days": days,
        "result": result,
    })))
}

async fn forecast_metric(
    State(state): State<AppState>,
    AxumPath(metric): AxumPath<String>,
    Query(params): Query<ForecastPathParams>,
) -> ApiResult<Json<JsonValue>> {
    let metric: DoraMetric = metric.parse()?;
    let window = QueryWindow::from_query(
        required("start_time", &params.start_time)?,
        required("end_time", &params.end_time)?,
    )?;
    let periods = parse_horizon("periods", params.periods.as_deref(), state.engine.default_forecast_days())?;

    let timer = PerfTimer::with_threshold("forecast", SLOW_QUERY_THRESHOLD_MS);
    let result = state.engine.forecast(metric, &window, Some(periods)).await?;
    observe(&state, "forecast", timer);
    Ok(Json(json!({
        "metric": metric,
        "periods": periods,
        "result": result,
    })))
}

async fn github_webhook(State(state): State<AppState>, body: axum::body::Bytes) -> ApiResult<Json<JsonValue>> {
    let payload = parse_payload("github", &body)?;
    Ok(Json(state.engine.ingest_github(&payload).await?))
}

async fn jenkins_webhook(State(state): State<AppState>, body: axum::body::Bytes) -> ApiResult<Json<JsonValue>> {
    let payload = parse_payload("jenkins", &body)?;
    Ok(Json(state.engine.ingest_jenkins(&payload).await?))
}

async fn prometheus_webhook(State(state): State<AppState>, body: axum::body::Bytes) -> ApiResult<Json<JsonValue>> {
    let payload = parse_payload("alertmanager", &body)?;
    Ok(Json(state.engine.ingest_alertmanager(&payload).await?))
}

// ----------------------------------------------------------------------------
// 21.5 Server
// ----------------------------------------------------------------------------

/// Open the configured store. A snapshot path makes it persistent.
pub fn open_store(config: &StoreConfig) -> StoreResult<Arc<InMemoryEventStore>> {
    let store = match &config.snapshot_path {
        Some(path) => InMemoryEventStore::open(path.clone())?,
        None => InMemoryEventStore::new(),
    };
    Ok(Arc::new(store))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(target: "dora::server", error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!(target: "dora::server", "Shutdown signal received");
}

/// Serve the router until ctrl-c, then flush the store.
pub async fn serve(config: DoraConfig) -> AnyhowResult<()> {
    let store = open_store(&config.store).context("Failed to open event store")?;
    let snapshot = store.snapshot();
    info!(
        target: "dora::server",
        path = ?store.snapshot_path(),
        changes = snapshot.changes.len(),
        deployments = snapshot.deployments.len(),
        incidents = snapshot.incidents.len(),
        "Event store ready"
    );

    let engine = DoraEngine::from_config(&config, store.clone())?;
    let app = build_router(AppState::new(engine), config.server.cors_permissive);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(target: "dora::server", addr = %config.server.bind_addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    store.flush().await.context("Failed to flush event store")?;
    info!(target: "dora::server", "Server stopped");
    Ok(())
}

// ============================================================================
// SECTION 22: HTTP TESTS
// ============================================================================

#[cfg(test)]
mod http_tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    const WINDOW: &str = "start_time=2024-03-01%2000:00:00&end_time=2024-03-03%2023:59:59";

    async fn app() -> Router {
        let store = Arc::new(InMemoryEventStore::new());
        let records: Vec<EventRecord> = vec![
            CodeChangeEvent::merged(
                1,
                "2024-03-01T09:00:00Z",
                vec![
                    CommitRef::new("c1", "2024-03-01T08:00:00Z"),
                    CommitRef::new("c2", "2024-03-01T08:00:00Z"),
                ],
            )
            .into(),
            DeploymentEvent::new("b1", "FAILURE", "2024-03-01T10:00:00Z", Some("c1")).into(),
            DeploymentEvent::new("b2", "SUCCESS", "2024-03-01T10:00:00Z", Some("c2")).into(),
            IncidentEvent::new("Crash", "critical", "2024-03-01T10:10:00Z", Some("2024-03-01T11:00:00Z"))
                .with_label("commit", "c2")
                .into(),
        ];
        store.upsert_many(records).await.unwrap();

        let mut config = DoraConfig::default();
        config.insights.enabled = false;
        let engine = DoraEngine::from_config(&config, store).unwrap();
        build_router(AppState::new(engine), true)
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, JsonValue) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(JsonValue::Null);
        (status, body)
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, JsonValue) {
        call(app, Request::get(uri).body(Body::empty()).unwrap()).await
    }

    async fn post_json(app: &Router, uri: &str, payload: JsonValue) -> (StatusCode, JsonValue) {
        let request = Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap();
        call(app, request).await
    }

    #[tokio::test]
    async fn test_health() {
        let app = app().await;
        assert_eq!(get_json(&app, "/health").await, (StatusCode::OK, json!({"status": "ok"})));
    }

    #[tokio::test]
    async fn test_metric_routes() {
        let app = app().await;

        let (status, body) = get_json(&app, &format!("/lead-time?{}", WINDOW)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["daily"], json!({"2024-03-01": 2.0}));
        assert_eq!(body["monthly"], json!({"2024-03": 2.0}));

        let (_, body) = get_json(&app, &format!("/mttr?{}", WINDOW)).await;
        assert_eq!(body["daily"], json!({"2024-03-01": 60.0}));

        let (_, body) = get_json(&app, &format!("/deployment-frequency?{}", WINDOW)).await;
        assert_eq!(
            body,
            json!({"count": 1, "deployments": [{"build_id": "b2", "timestamp": "2024-03-01T10:00:00Z"}]})
        );
    }

    #[tokio::test]
    async fn test_cfr_route_echoes_iso_window() {
        let app = app().await;
        let (status, body) = get_json(&app, "/api/cfr?start=2024-03-01%2000:00:00&end=2024-03-03%2023:59:59").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["Start Time"], "2024-03-01T00:00:00Z");
        assert_eq!(body["End Time"], "2024-03-03T23:59:59Z");
        assert_eq!(body["Total Changes"], 2);
        assert_eq!(body["Failed Changes"], 2);
        assert_eq!(body["Change Failure Rate (%)"], 100.0);
    }

    #[tokio::test]
    async fn test_malformed_window_is_bad_request() {
        let app = app().await;
        let (status, body) = get_json(&app, "/lead-time?start_time=2024-03-01T00:00:00Z&end_time=2024-03-02%2000:00:00").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap().contains("YYYY-MM-DD HH:MM:SS"));

        let (status, _) = get_json(&app, "/mttr?start_time=2024-03-01%2000:00:00").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get_json(&app, "/api/cfr?start=2024-03-02%2000:00:00&end=2024-03-01%2000:00:00").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_dora_metrics_with_insights_disabled() {
        let app = app().await;
        let (status, body) = get_json(&app, &format!("/dora-metrics?{}", WINDOW)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["dora_metrics"]["deployment_frequency"],
            json!({"count": 1, "start_date": "2024-03-01 00:00:00", "end_date": "2024-03-03 23:59:59"})
        );
        assert_eq!(body["dora_metrics"]["cfr"]["Total Changes"], 2);
        assert!(body["ai_insights"]["error"]
            .as_str()
            .unwrap()
            .starts_with("Failed to get AI insights: "));

        let (_, body) = get_json(&app, &format!("/ai-insights?{}", WINDOW)).await;
        assert_eq!(body["metrics_summary"]["mttr"], json!({"average_minutes": 60.0, "failures_count": 1}));
        assert_eq!(body["metrics_summary"]["deployment_frequency"]["period_days"], 2);
    }

    #[tokio::test]
    async fn test_forecast_routes() {
        let app = app().await;

        let (status, body) = get_json(&app, &format!("/forecast?metric=df&days=5&{}", WINDOW)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["metric"], "deployment_frequency");
        assert_eq!(body["days"], 5);
        assert_eq!(body["result"]["state"], "MODEL");
        assert_eq!(body["result"]["history"].as_array().unwrap().len(), 3);

        let (status, body) = get_json(&app, &format!("/forecast/lead-time?periods=2&{}", WINDOW)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["metric"], "lead_time");
        assert_eq!(body["periods"], 2);
    }

    #[tokio::test]
    async fn test_forecast_rejections() {
        let app = app().await;
        for uri in [
            format!("/forecast?metric=df&days=0&{}", WINDOW),
            format!("/forecast?metric=df&days=366&{}", WINDOW),
            format!("/forecast?metric=df&days=soon&{}", WINDOW),
            format!("/forecast?metric=velocity&{}", WINDOW),
            format!("/forecast/velocity?{}", WINDOW),
        ] {
            let (status, body) = get_json(&app, &uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
            assert!(body["detail"].is_string());
        }
    }

    #[tokio::test]
    async fn test_webhooks_feed_queries() {
        let app = app().await;

        let (status, body) = post_json(
            &app,
            "/webhook/jenkins",
            json!({"build": {"number": 3, "status": "SUCCESS", "timestamp": "2024-03-02T12:00:00Z"}}),
        )
        .await;
        assert_eq!((status, body), (StatusCode::OK, json!({"status": "ok", "build_id": "3"})));

        let (_, body) = post_json(&app, "/webhook/github", json!({"action": "closed", "pull_request": {"number": 5, "merged": false}})).await;
        assert_eq!(body, json!({"status": "ignored"}));

        let (_, body) = get_json(&app, &format!("/deployment-frequency?{}", WINDOW)).await;
        assert_eq!(body["count"], 2);

        let (status, body) = post_json(&app, "/webhook/jenkins", json!({"status": "SUCCESS"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap().contains("number"));

        let request = Request::post("/webhook/prometheus").body(Body::from("not json")).unwrap();
        let (status, _) = call(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_exposes_query_latency() {
        let app = app().await;
        get_json(&app, &format!("/lead-time?{}", WINDOW)).await;

        let response = app
            .clone()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("dora_query_duration_seconds_count{endpoint=\"lead_time\"} 1"));
    }

    #[test]
    fn test_parse_horizon() {
        assert_eq!(parse_horizon("days", None, 30), Ok(30));
        assert_eq!(parse_horizon("days", Some(" 7 "), 30), Ok(7));
        assert_eq!(parse_horizon("days", Some("0"), 30), Err(ParseError::HorizonOutOfRange { days: 0 }));
        assert!(matches!(parse_horizon("days", Some("-1"), 30), Err(ParseError::InvalidValue { .. })));
    }
}

// ============================================================================
// SECTION 23: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 23.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// DORA Engine CLI
#[derive(Parser, Debug)]
#[command(
    name = "dora",
    author = "AIOps Team",
    version,
    about = "DORA delivery metrics engine",
    long_about = "Correlates pull request merges, deployments and monitoring alerts into \
                  deployment frequency, lead time, MTTR and change failure rate, and \
                  forecasts their daily series."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "DORA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level override
    #[arg(short, long, env = "DORA_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "DORA_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP server (default)
    Serve,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show engine version and build info
    Version,

    /// Print the DORA report for a window as JSON
    Report {
        /// Window start, YYYY-MM-DD HH:MM:SS
        #[arg(long)]
        start: String,

        /// Window end, YYYY-MM-DD HH:MM:SS
        #[arg(long)]
        end: String,
    },

    /// Forecast one metric's daily series
    Forecast {
        /// deployment_frequency, lead_time, mttr or cfr
        #[arg(short, long)]
        metric: String,

        #[arg(long)]
        start: String,

        #[arg(long)]
        end: String,

        /// Days to forecast
        #[arg(long)]
        days: Option<u32>,
    },
}

// ----------------------------------------------------------------------------
// 23.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
fn handle_validate(config_path: Option<&Path>, verbose: bool) -> DoraResult<()> {
    match config_path {
        Some(path) => println!("Validating configuration file: {}", path.display()),
        None => println!("Validating default configuration with environment overrides"),
    }

    match DoraConfig::load_or_default(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Bind address: {}", config.server.bind_addr);
            match &config.store.snapshot_path {
                Some(path) => println!("  • Snapshot: {}", path.display()),
                None => println!("  • Snapshot: none (in-memory only)"),
            }
            println!(
                "  • Production job: {}",
                config.metrics.production_job.as_deref().unwrap_or("any")
            );
            println!(
                "  • Forecast model: {}",
                config.forecast.endpoint.as_deref().unwrap_or("built-in")
            );
            println!(
                "  • Insights: {}",
                if config.insights.enabled { config.insights.model.as_str() } else { "disabled" }
            );

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(DoraError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> DoraResult<()> {
    let config_str = DoraConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("📈 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Metrics:");
    println!("  • Deployment frequency");
    println!("  • Lead time for changes");
    println!("  • Mean time to recovery");
    println!("  • Change failure rate");
}

/// Handle the report subcommand
async fn handle_report(config: &DoraConfig, start: &str, end: &str) -> AnyhowResult<()> {
    let window = QueryWindow::from_query(start, end)?;
    let store = open_store(&config.store)?;
    let engine = DoraEngine::from_config(config, store)?;
    let report = engine.report(&window).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Handle the forecast subcommand
async fn handle_forecast(
    config: &DoraConfig,
    metric: &str,
    start: &str,
    end: &str,
    days: Option<u32>,
) -> AnyhowResult<()> {
    let metric: DoraMetric = metric.parse()?;
    let window = QueryWindow::from_query(start, end)?;
    let store = open_store(&config.store)?;
    let engine = DoraEngine::from_config(config, store)?;
    let result = engine.forecast(metric, &window, days).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "metric": metric, "result": result }))?
    );
    Ok(())
}

// ============================================================================
// SECTION 24: MAIN ENTRY POINT
// ============================================================================

/// Main entry point for the DORA engine
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need logging or a store
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(cli.config.as_deref(), *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config = DoraConfig::load_or_default(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("Failed to load config from {}", path.display()),
        None => "Failed to load default config".to_string(),
    })?;

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    match cli.command {
        Some(Commands::Report { start, end }) => handle_report(&config, &start, &end).await?,
        Some(Commands::Forecast {
            metric,
            start,
            end,
            days,
        }) => handle_forecast(&config, &metric, &start, &end, days).await?,
        Some(Commands::Serve) | None => {
            info!("📈 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
            serve(config).await?;
        }
        Some(Commands::Version) | Some(Commands::GenerateConfig { .. }) | Some(Commands::Validate { .. }) => {}
    }

    Ok(())
}
