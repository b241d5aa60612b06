//! # Host Metrics Engine - CPU Metric Accumulation & Snapshot Emission
//!
//! Collects scalar measurements taken during a periodic scrape cycle, groups
//! them into strongly typed named metrics and hands them back as immutable,
//! resource-scoped snapshots ready for a transport layer.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                           HOST METRICS ENGINE                               │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  CPU SOURCE → SCRAPER → METRICS BUILDER → ACCUMULATORS → RESOURCE SNAPSHOTS │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Cycle
//!
//! - `record_*` calls append data points to the per-metric accumulators
//! - `emit_for_resource` moves every non-empty accumulator into a new
//!   resource snapshot (once per resource when a scrape spans several)
//! - `emit` closes the cycle and hands the whole batch to the caller
//!
//! The builder is single threaded. One builder belongs to one scraper.

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
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::signal;
use tokio::time::{interval, MissedTickBehavior};

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Hashing & Lazy Tables
// ----------------------------------------------------------------------------
use ahash::AHashMap;
use once_cell::sync::Lazy;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "hostmetrics";
pub const ENGINE_FULL_NAME: &str = "Host Metrics Engine";

/// Instrumentation scope stamped on every emitted resource snapshot
pub const SCOPE_NAME: &str = "otelcol/hostmetricsreceiver/cpu";

/// Semantic conventions schema the emitted metric names follow
pub const SCHEMA_URL: &str = "https://opentelemetry.io/schemas/1.9.0";

/// Resource attribute carrying the monitored host name
pub const HOST_NAME_KEY: &str = "host.name";

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Default scrape interval
pub const DEFAULT_COLLECTION_INTERVAL: Duration = Duration::from_secs(10);

/// Minimum allowed scrape interval
pub const MIN_COLLECTION_INTERVAL: Duration = Duration::from_secs(1);

/// Kernel clock ticks per second (USER_HZ) used by /proc/stat
pub const CLOCK_TICKS_PER_SECOND: f64 = 100.0;

/// Default location of the kernel CPU statistics
pub const DEFAULT_PROC_STAT_PATH: &str = "/proc/stat";

// ----------------------------------------------------------------------------
// Attributes
// ----------------------------------------------------------------------------

/// Most data points carry two dimensions (cpu, state)
pub const INLINE_ATTRIBUTES: usize = 4;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The data model handed to downstream collaborators:
// - Timestamp: nanoseconds since Unix epoch
// - NumberDataPoint: one observation with its dimensions
// - Metric: a named, typed sequence of data points
// - ResourceMetrics: all metrics of one resource under one scope
// - Metrics: the batch returned by one emission cycle
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp Types - Nanosecond Precision Time Handling
// ----------------------------------------------------------------------------

/// High-precision timestamp in nanoseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Saturates at the bounds of the nanosecond range
    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(1_000_000_000))
    }

    /// `None` when `secs` does not fit the nanosecond range
    #[inline]
    pub const fn checked_from_secs(secs: i64) -> Option<Self> {
        match secs.checked_mul(1_000_000_000) {
            Some(nanos) => Some(Self(nanos)),
            None => None,
        }
    }

    /// Get the current wall-clock timestamp
    #[inline]
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1_000_000_000
    }

    /// Convert to chrono DateTime<Utc>
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.9f UTC"))
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        let duration = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_nanos_opt().unwrap_or(0))
    }
}

// ----------------------------------------------------------------------------
// 3.2 Attributes - Key-Value Dimensional Data
// ----------------------------------------------------------------------------

/// A single attribute (key-value pair) on a data point or resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attribute {
    pub key: CompactString,
    pub value: CompactString,
}

impl Attribute {
    #[inline]
    pub fn new<K, V>(key: K, value: V) -> Self
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Display for Attribute {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

impl<K, V> From<(K, V)> for Attribute
where
    K: Into<CompactString>,
    V: Into<CompactString>,
{
    fn from((key, value): (K, V)) -> Self {
        Self::new(key, value)
    }
}

/// Insertion-ordered attributes with unique keys, stack allocated when small.
pub type Attributes = SmallVec<[Attribute; INLINE_ATTRIBUTES]>;

/// Extension trait for Attributes
pub trait AttributesExt {
    /// Get an attribute value by key
    fn get(&self, key: &str) -> Option<&str>;

    fn contains_key(&self, key: &str) -> bool;

    /// Insert a string attribute, overwriting the value of an existing key
    fn put_str<K, V>(&mut self, key: K, value: V)
    where
        K: Into<CompactString>,
        V: Into<CompactString>;
}

impl AttributesExt for Attributes {
    fn get(&self, key: &str) -> Option<&str> {
        self.iter()
            .find(|a| a.key.as_str() == key)
            .map(|a| a.value.as_str())
    }

    fn contains_key(&self, key: &str) -> bool {
        self.iter().any(|a| a.key.as_str() == key)
    }

    fn put_str<K, V>(&mut self, key: K, value: V)
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        let key = key.into();
        let value = value.into();

        if let Some(attr) = self.iter_mut().find(|a| a.key == key) {
            attr.value = value;
        } else {
            self.push(Attribute { key, value });
        }
    }
}

/// Create an Attributes collection from key-value pairs
#[macro_export]
macro_rules! attributes {
    () => {
        smallvec::smallvec![]
    };
    ($($key:expr => $value:expr),+ $(,)?) => {
        smallvec::smallvec![
            $($crate::Attribute::new($key, $value)),+
        ]
    };
}

// ----------------------------------------------------------------------------
// 3.3 Metric Kinds
// ----------------------------------------------------------------------------

/// How data points of a metric relate to each other over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Monotonic sum, cumulative since the start timestamp
    CumulativeSum,
    /// Point-in-time measurement
    Gauge,
}

/// Aggregation temporality of a sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationTemporality {
    Cumulative,
}

impl MetricKind {
    #[inline]
    pub const fn is_monotonic(&self) -> bool {
        matches!(self, MetricKind::CumulativeSum)
    }

    /// Temporality of the kind, `None` for gauges
    #[inline]
    pub const fn temporality(&self) -> Option<AggregationTemporality> {
        match self {
            MetricKind::CumulativeSum => Some(AggregationTemporality::Cumulative),
            MetricKind::Gauge => None,
        }
    }
}

impl Display for MetricKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::CumulativeSum => write!(f, "cumulative_sum"),
            MetricKind::Gauge => write!(f, "gauge"),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.4 Data Points & Metrics
// ----------------------------------------------------------------------------

/// One timestamped numeric observation with its dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumberDataPoint {
    pub start_timestamp: Timestamp,
    pub timestamp: Timestamp,
    pub value: f64,
    pub attributes: Attributes,
}

/// A named, typed sequence of data points.
///
/// Identity fields come from the static [`MetricDescriptor`] and never change
/// after construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub name: &'static str,
    pub description: &'static str,
    pub unit: &'static str,
    pub kind: MetricKind,
    pub data_points: Vec<NumberDataPoint>,
}

impl Metric {
    /// Create an empty metric with room for `capacity` data points
    pub fn with_capacity(descriptor: &MetricDescriptor, capacity: usize) -> Self {
        Self {
            name: descriptor.name,
            description: descriptor.description,
            unit: descriptor.unit,
            kind: descriptor.kind,
            data_points: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data_points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data_points.is_empty()
    }

    #[inline]
    pub fn is_monotonic(&self) -> bool {
        self.kind.is_monotonic()
    }

    #[inline]
    pub fn temporality(&self) -> Option<AggregationTemporality> {
        self.kind.temporality()
    }
}

impl Display for Metric {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {}) [{} points]", self.name, self.kind, self.unit, self.len())
    }
}

// ----------------------------------------------------------------------------
// 3.5 Resources & Instrumentation Scope
// ----------------------------------------------------------------------------

/// Identity of the monitored entity a snapshot belongs to.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Resource {
    pub attributes: Attributes,
}

impl Resource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> ResourceBuilder {
        ResourceBuilder::default()
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

/// Fluent constructor for [`Resource`]. Later writes to a key win.
#[derive(Debug, Clone, Default)]
pub struct ResourceBuilder {
    attributes: Attributes,
}

impl ResourceBuilder {
    pub fn with_attribute<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        self.attributes.put_str(key, value);
        self
    }

    pub fn with_host_name<V: Into<CompactString>>(self, host_name: V) -> Self {
        self.with_attribute(HOST_NAME_KEY, host_name)
    }

    pub fn build(self) -> Resource {
        Resource {
            attributes: self.attributes,
        }
    }
}

/// Name and version of the instrumentation that produced a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstrumentationScope {
    pub name: CompactString,
    pub version: CompactString,
}

impl InstrumentationScope {
    pub fn new<N, V>(name: N, version: V) -> Self
    where
        N: Into<CompactString>,
        V: Into<CompactString>,
    {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.6 Resource Snapshots & Batches
// ----------------------------------------------------------------------------

/// All metrics emitted for one resource in one `emit_for_resource` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceMetrics {
    pub resource: Resource,
    pub schema_url: &'static str,
    pub scope: InstrumentationScope,
    pub metrics: Vec<Metric>,
}

impl ResourceMetrics {
    /// Create an empty snapshot with room for `capacity` metrics
    pub fn new(scope: InstrumentationScope, capacity: usize) -> Self {
        Self {
            resource: Resource::new(),
            schema_url: SCHEMA_URL,
            scope,
            metrics: Vec::with_capacity(capacity),
        }
    }

    /// Find a metric by name
    pub fn metric(&self, name: &str) -> Option<&Metric> {
        self.metrics.iter().find(|m| m.name == name)
    }

    pub fn data_point_count(&self) -> usize {
        self.metrics.iter().map(Metric::len).sum()
    }

    /// Overwrite the start timestamp of every data point
    pub fn set_start_timestamp(&mut self, start: Timestamp) {
        for dp in self.metrics.iter_mut().flat_map(|m| m.data_points.iter_mut()) {
            dp.start_timestamp = start;
        }
    }
}

/// Ordered resource snapshots produced by one emission cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Metrics {
    pub resource_metrics: Vec<ResourceMetrics>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of resource snapshots in the batch
    #[inline]
    pub fn len(&self) -> usize {
        self.resource_metrics.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.resource_metrics.is_empty()
    }

    pub fn metric_count(&self) -> usize {
        self.resource_metrics.iter().map(|rm| rm.metrics.len()).sum()
    }

    pub fn data_point_count(&self) -> usize {
        self.resource_metrics
            .iter()
            .map(ResourceMetrics::data_point_count)
            .sum()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ResourceMetrics> {
        self.resource_metrics.iter()
    }

    /// First metric with the given name across all resources
    pub fn find_metric(&self, name: &str) -> Option<&Metric> {
        self.resource_metrics.iter().find_map(|rm| rm.metric(name))
    }
}

impl IntoIterator for Metrics {
    type Item = ResourceMetrics;
    type IntoIter = std::vec::IntoIter<ResourceMetrics>;

    fn into_iter(self) -> Self::IntoIter {
        self.resource_metrics.into_iter()
    }
}

impl<'a> IntoIterator for &'a Metrics {
    type Item = &'a ResourceMetrics;
    type IntoIter = std::slice::Iter<'a, ResourceMetrics>;

    fn into_iter(self) -> Self::IntoIter {
        self.resource_metrics.iter()
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// The accumulation core raises no errors of its own: disabled metrics, empty
// metrics and empty snapshots are silently omitted. Errors exist for:
// - Vocabulary misses (explicit failed lookups)
// - Configuration loading and validation
// - Reading the CPU statistics source
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type. All subsystem errors convert into it.
#[derive(Error, Debug)]
pub enum HostMetricsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Scrape error: {0}")]
    Scrape(#[from] ScrapeError),

    #[error("Attribute error: {0}")]
    Attribute(#[from] AttributeError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl HostMetricsError {
    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            HostMetricsError::Config(_) => "config",
            HostMetricsError::Scrape(_) => "scrape",
            HostMetricsError::Attribute(_) => "attribute",
            HostMetricsError::Serialization(_) => "serialization",
            HostMetricsError::Io(_) => "io",
            HostMetricsError::Logging(_) => "logging",
        }
    }

    /// Whether the next scrape cycle may succeed without operator action
    pub fn is_recoverable(&self) -> bool {
        match self {
            HostMetricsError::Scrape(e) => e.is_recoverable(),
            HostMetricsError::Io(_) | HostMetricsError::Serialization(_) => true,
            _ => false,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Attribute Errors
// ----------------------------------------------------------------------------

/// A string that does not belong to a categorical attribute vocabulary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttributeError {
    #[error("unknown value '{value}' for attribute '{attribute}'")]
    UnknownValue { attribute: &'static str, value: String },
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

    #[error("Unknown metric in configuration: {name}")]
    UnknownMetric { name: String },

    #[error("Failed to render configuration: {message}")]
    RenderError { message: String },
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
// 4.4 Scrape Errors
// ----------------------------------------------------------------------------

/// Errors raised while reading CPU statistics
#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed cpu line: '{line}'")]
    MalformedLine { line: String },

    #[error("No per-cpu statistics found in {source_name}")]
    NoCpus { source_name: String },
}

impl ScrapeError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            ScrapeError::Read { source, .. } => source.kind() != io::ErrorKind::NotFound,
            ScrapeError::MalformedLine { .. } => true,
            ScrapeError::NoCpus { .. } => false,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.5 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for engine operations
pub type HostMetricsResult<T> = Result<T, HostMetricsError>;

/// Result type for scrape operations
pub type ScrapeResult<T> = Result<T, ScrapeError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// - TOML file parsing with environment variable overrides
// - Per-metric enabled flags resolved before the builder is constructed
// - Validation happens here; the builder trusts what it is given
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Per-Metric Configuration
// ----------------------------------------------------------------------------

/// Settings for a single metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricConfig {
    pub enabled: bool,
}

/// Metric name to settings. Metrics missing from the map use their
/// descriptor default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricsBuilderConfig {
    pub metrics: BTreeMap<String, MetricConfig>,
}

impl Default for MetricsBuilderConfig {
    fn default() -> Self {
        Self {
            metrics: MetricName::ALL
                .iter()
                .map(|name| {
                    let enabled = name.descriptor().enabled_by_default;
                    (name.as_str().to_owned(), MetricConfig { enabled })
                })
                .collect(),
        }
    }
}

impl MetricsBuilderConfig {
    /// Config with every declared metric enabled
    pub fn all_enabled() -> Self {
        MetricName::ALL
            .iter()
            .fold(Self::default(), |config, name| config.with_metric(*name, true))
    }

    /// Builder: set the enabled flag of one metric
    pub fn with_metric(mut self, name: MetricName, enabled: bool) -> Self {
        self.metrics
            .insert(name.as_str().to_owned(), MetricConfig { enabled });
        self
    }

    /// Resolved settings for a metric
    pub fn metric(&self, name: MetricName) -> MetricConfig {
        self.metrics
            .get(name.as_str())
            .copied()
            .unwrap_or(MetricConfig {
                enabled: name.descriptor().enabled_by_default,
            })
    }

    /// Every configured name must be a declared metric
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.metrics.keys().find(|k| MetricName::from_name(k).is_none()) {
            Some(name) => Err(ConfigError::UnknownMetric { name: name.clone() }),
            None => Ok(()),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.2 Scraper Configuration
// ----------------------------------------------------------------------------

/// CPU scraper configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScraperConfig {
    /// Time between two scrapes
    #[serde(default = "default_collection_interval", with = "humantime_serde")]
    pub collection_interval: Duration,

    /// Path of the kernel CPU statistics file
    #[serde(default = "default_proc_stat_path")]
    pub proc_stat_path: PathBuf,

    /// Override for the `host.name` resource attribute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,

    #[serde(default)]
    pub metrics: MetricsBuilderConfig,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            collection_interval: default_collection_interval(),
            proc_stat_path: default_proc_stat_path(),
            host_name: None,
            metrics: MetricsBuilderConfig::default(),
        }
    }
}

fn default_collection_interval() -> Duration {
    DEFAULT_COLLECTION_INTERVAL
}

fn default_proc_stat_path() -> PathBuf {
    PathBuf::from(DEFAULT_PROC_STAT_PATH)
}

// ----------------------------------------------------------------------------
// 5.3 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    #[serde(default = "default_true")]
    pub colors: bool,

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
    "compact".into()
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.4 Root Configuration
// ----------------------------------------------------------------------------

/// Root configuration of the hostmetrics binary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scraper: ScraperConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("HOSTMETRICS_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML string
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scraper.collection_interval < MIN_COLLECTION_INTERVAL {
            return Err(ConfigError::invalid_value(
                "scraper.collection_interval",
                format!(
                    "Collection interval must be at least {}",
                    humantime::format_duration(MIN_COLLECTION_INTERVAL)
                ),
            ));
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty" | "compact") {
            return Err(ConfigError::invalid_value(
                "logging.format",
                format!("Unsupported log format '{}'", self.logging.format),
            ));
        }

        self.scraper.metrics.validate()
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> Result<String, ConfigError> {
        toml::to_string_pretty(&Self::default()).map_err(|e| ConfigError::RenderError {
            message: e.to_string(),
        })
    }
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> HostMetricsResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    // Metric batches go to stdout, logs go to stderr
    let result = match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .json()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        "pretty" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_writer(io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_writer(io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    result.map_err(|e| HostMetricsError::Logging(e.to_string()))?;

    info!(
        target: "hostmetrics::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: CATEGORICAL ATTRIBUTE VOCABULARIES
// ============================================================================
// Closed sets of string values usable as a dimension. Each vocabulary is an
// enum with a bijective code <-> string mapping. The reverse table is built
// once per process and only read afterwards.
// ============================================================================

/// A closed, named set of string values for one attribute.
pub trait AttributeVocabulary: Sized + Copy + 'static {
    /// Attribute key the vocabulary is used for
    const ATTRIBUTE: &'static str;

    /// Every code, in declaration order
    fn all() -> &'static [Self];

    fn as_str(&self) -> &'static str;

    /// Reverse lookup. Unknown strings yield `None`, never a default code.
    fn lookup(value: &str) -> Option<Self>;

    /// Reverse lookup that reports the miss as an error
    fn parse(value: &str) -> Result<Self, AttributeError> {
        Self::lookup(value).ok_or_else(|| AttributeError::UnknownValue {
            attribute: Self::ATTRIBUTE,
            value: value.to_owned(),
        })
    }
}

/// Declare a categorical attribute vocabulary
macro_rules! attribute_vocabulary {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident for $attr:literal {
            $($variant:ident => $value:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        $vis enum $name {
            $(
                #[serde(rename = $value)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            #[inline]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $value,)+
                }
            }

            /// The process-wide string -> code table
            pub fn mapping() -> &'static AHashMap<&'static str, $name> {
                static TABLE: Lazy<AHashMap<&'static str, $name>> = Lazy::new(|| {
                    let table: AHashMap<&'static str, $name> =
                        $name::ALL.iter().map(|code| (code.as_str(), *code)).collect();
                    debug_assert_eq!(table.len(), $name::ALL.len(), "string forms must be unique");
                    table
                });
                &TABLE
            }
        }

        impl AttributeVocabulary for $name {
            const ATTRIBUTE: &'static str = $attr;

            fn all() -> &'static [Self] {
                Self::ALL
            }

            fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $value,)+
                }
            }

            fn lookup(value: &str) -> Option<Self> {
                Self::mapping().get(value).copied()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str($name::as_str(self))
            }
        }

        impl FromStr for $name {
            type Err = AttributeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                <Self as AttributeVocabulary>::parse(s)
            }
        }
    };
}

attribute_vocabulary! {
    /// CPU state a `system.cpu.*` data point is broken down by.
    pub enum AttributeState for "state" {
        Idle => "idle",
        Interrupt => "interrupt",
        Nice => "nice",
        Softirq => "softirq",
        Steal => "steal",
        System => "system",
        User => "user",
        Wait => "wait",
    }
}

// ============================================================================
// SECTION 8: METRIC DESCRIPTORS & ACCUMULATORS
// ============================================================================
// One static descriptor per declared metric drives a single generic
// accumulator type. The accumulator owns the in-progress buffer, the enabled
// flag and a capacity hint (the widest emit seen so far).
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Metric Descriptors
// ----------------------------------------------------------------------------

/// Static definition of a declared metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub unit: &'static str,
    pub kind: MetricKind,
    /// Dimension keys, in the order record calls supply their values
    pub attributes: &'static [&'static str],
    pub enabled_by_default: bool,
}

/// Every declared metric, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MetricName {
    #[serde(rename = "system.cpu.time")]
    SystemCpuTime,
    #[serde(rename = "system.cpu.utilization")]
    SystemCpuUtilization,
}

/// Descriptor table, indexed by `MetricName as usize`
pub static METRIC_DESCRIPTORS: [MetricDescriptor; MetricName::COUNT] = [
    MetricDescriptor {
        name: "system.cpu.time",
        description: "Total CPU seconds broken down by different states.",
        unit: "s",
        kind: MetricKind::CumulativeSum,
        attributes: &["cpu", "state"],
        enabled_by_default: true,
    },
    MetricDescriptor {
        name: "system.cpu.utilization",
        description: "Percentage of CPU time broken down by different states.",
        unit: "1",
        kind: MetricKind::Gauge,
        attributes: &["cpu", "state"],
        enabled_by_default: false,
    },
];

impl MetricName {
    pub const COUNT: usize = 2;

    pub const ALL: [MetricName; MetricName::COUNT] =
        [MetricName::SystemCpuTime, MetricName::SystemCpuUtilization];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn descriptor(self) -> &'static MetricDescriptor {
        &METRIC_DESCRIPTORS[self.index()]
    }

    #[inline]
    pub fn as_str(self) -> &'static str {
        self.descriptor().name
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.as_str() == name)
    }
}

impl Display for MetricName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// 8.2 Metric Accumulator
// ----------------------------------------------------------------------------

/// Buffers the data points of one metric between two emits.
#[derive(Debug)]
pub struct MetricAccumulator {
    descriptor: &'static MetricDescriptor,
    enabled: bool,
    /// Max number of data points observed in any past emit
    capacity: usize,
    /// Never allocated for a disabled metric
    data: Option<Metric>,
}

impl MetricAccumulator {
    pub fn new(descriptor: &'static MetricDescriptor, config: MetricConfig) -> Self {
        Self {
            descriptor,
            enabled: config.enabled,
            capacity: 0,
            data: config
                .enabled
                .then(|| Metric::with_capacity(descriptor, 0)),
        }
    }

    #[inline]
    pub fn descriptor(&self) -> &'static MetricDescriptor {
        self.descriptor
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The preallocation hint for the next buffer
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of data points recorded since the last emit
    #[inline]
    pub fn pending(&self) -> usize {
        self.data.as_ref().map_or(0, Metric::len)
    }

    /// Allocated room of the current buffer
    #[inline]
    pub fn buffer_capacity(&self) -> usize {
        self.data.as_ref().map_or(0, |m| m.data_points.capacity())
    }

    /// Append a data point. No-op when the metric is disabled.
    ///
    /// `dimensions` are matched positionally to the descriptor's attribute keys.
    pub fn record(&mut self, start: Timestamp, ts: Timestamp, value: f64, dimensions: &[&str]) {
        let Some(data) = self.data.as_mut() else {
            return;
        };
        debug_assert_eq!(
            dimensions.len(),
            self.descriptor.attributes.len(),
            "dimension count mismatch for {}",
            self.descriptor.name
        );

        let attributes: Attributes = self
            .descriptor
            .attributes
            .iter()
            .zip(dimensions)
            .map(|(key, value)| Attribute::new(*key, *value))
            .collect();

        data.data_points.push(NumberDataPoint {
            start_timestamp: start,
            timestamp: ts,
            value,
            attributes,
        });
    }

    /// Take the accumulated metric, leaving a fresh buffer sized to the
    /// capacity hint. `None` when disabled or nothing was recorded.
    pub fn take(&mut self) -> Option<Metric> {
        let data = self.data.as_mut()?;
        if data.is_empty() {
            return None;
        }

        self.capacity = self.capacity.max(data.len());
        let fresh = Metric::with_capacity(self.descriptor, self.capacity);
        Some(mem::replace(data, fresh))
    }

    /// Move the accumulated metric into `out`, if there is one
    pub fn emit(&mut self, out: &mut Vec<Metric>) {
        if let Some(metric) = self.take() {
            out.push(metric);
        }
    }
}

// ============================================================================
// SECTION 9: METRICS BUILDER
// ============================================================================
// Owns the accumulators, the start-time baseline and the batch under
// construction.
//
//   Idle --record*--> Accumulating --emit_for_resource--> Segmented
//   Segmented --record*/emit_for_resource--> Segmented
//   Segmented --emit--> Idle (batch handed to the caller)
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Build Information
// ----------------------------------------------------------------------------

/// Identity of the component embedding the builder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildInfo {
    pub command: CompactString,
    pub description: CompactString,
    pub version: CompactString,
}

impl BuildInfo {
    /// Build info of this binary
    pub fn current() -> Self {
        Self {
            command: ENGINE_NAME.into(),
            description: ENGINE_FULL_NAME.into(),
            version: ENGINE_VERSION.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 9.2 Options
// ----------------------------------------------------------------------------

/// Changes applied to the builder at construction and on `reset`, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderOption {
    /// Fixed start timestamp for every subsequently recorded data point
    StartTime(Timestamp),
}

impl BuilderOption {
    pub fn apply(&self, mb: &mut MetricsBuilder) {
        match self {
            BuilderOption::StartTime(start) => mb.start_time = *start,
        }
    }
}

/// Changes applied to a resource snapshot at emit time, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceMetricsOption {
    /// Replace the snapshot's resource
    WithResource(Resource),
    /// Overwrite the start timestamp of every data point in the snapshot.
    /// Use only when resources in one cycle have different start times.
    StartTimeOverride(Timestamp),
}

impl ResourceMetricsOption {
    pub fn apply(&self, rm: &mut ResourceMetrics) {
        match self {
            ResourceMetricsOption::WithResource(resource) => rm.resource = resource.clone(),
            ResourceMetricsOption::StartTimeOverride(start) => rm.set_start_timestamp(*start),
        }
    }
}

// ----------------------------------------------------------------------------
// 9.3 The Builder
// ----------------------------------------------------------------------------

/// Accumulates data points for every declared metric and emits them as
/// resource-scoped snapshots.
///
/// Not synchronized: one builder per concurrently running scraper.
#[derive(Debug)]
pub struct MetricsBuilder {
    /// Start time applied to all recorded data points
    start_time: Timestamp,
    /// Max number of metrics observed in one resource snapshot
    metrics_capacity: usize,
    /// Snapshots emitted since the last `emit`
    metrics_buffer: Metrics,
    build_info: BuildInfo,
    accumulators: [MetricAccumulator; MetricName::COUNT],
}

impl MetricsBuilder {
    pub fn new(config: &MetricsBuilderConfig, build_info: BuildInfo, options: &[BuilderOption]) -> Self {
        let accumulators =
            MetricName::ALL.map(|name| MetricAccumulator::new(name.descriptor(), config.metric(name)));

        let mut mb = Self {
            start_time: Timestamp::now(),
            metrics_capacity: 0,
            metrics_buffer: Metrics::new(),
            build_info,
            accumulators,
        };
        for op in options {
            op.apply(&mut mb);
        }
        mb
    }

    #[inline]
    pub fn start_time(&self) -> Timestamp {
        self.start_time
    }

    /// Preallocation hint for the metric list of the next snapshot
    #[inline]
    pub fn metrics_capacity(&self) -> usize {
        self.metrics_capacity
    }

    /// Snapshots waiting for the next `emit`
    #[inline]
    pub fn pending_resources(&self) -> usize {
        self.metrics_buffer.len()
    }

    #[inline]
    pub fn accumulator(&self, name: MetricName) -> &MetricAccumulator {
        &self.accumulators[name.index()]
    }

    pub fn build_info(&self) -> &BuildInfo {
        &self.build_info
    }

    // ---- Recording ----

    /// Record a data point for any declared metric, using the builder's
    /// start time
    #[inline]
    pub fn record_data_point(&mut self, metric: MetricName, ts: Timestamp, value: f64, dimensions: &[&str]) {
        let start = self.start_time;
        self.accumulators[metric.index()].record(start, ts, value, dimensions);
    }

    /// Adds a data point to `system.cpu.time`
    pub fn record_system_cpu_time_data_point(
        &mut self,
        ts: Timestamp,
        value: f64,
        cpu: &str,
        state: AttributeState,
    ) {
        self.record_data_point(MetricName::SystemCpuTime, ts, value, &[cpu, state.as_str()]);
    }

    /// Adds a data point to `system.cpu.utilization`
    pub fn record_system_cpu_utilization_data_point(
        &mut self,
        ts: Timestamp,
        value: f64,
        cpu: &str,
        state: AttributeState,
    ) {
        self.record_data_point(
            MetricName::SystemCpuUtilization,
            ts,
            value,
            &[cpu, state.as_str()],
        );
    }

    // ---- Emission ----

    fn update_capacity(&mut self, rm: &ResourceMetrics) {
        self.metrics_capacity = self.metrics_capacity.max(rm.metrics.len());
    }

    /// Move everything recorded so far into a new resource snapshot.
    ///
    /// Call once per resource when one scraper reports several resources,
    /// otherwise `emit` is enough. A snapshot without metrics is discarded.
    pub fn emit_for_resource(&mut self, options: &[ResourceMetricsOption]) {
        let scope = InstrumentationScope::new(SCOPE_NAME, self.build_info.version.clone());
        let mut rm = ResourceMetrics::new(scope, self.metrics_capacity);

        for acc in self.accumulators.iter_mut() {
            acc.emit(&mut rm.metrics);
        }
        for op in options {
            op.apply(&mut rm);
        }

        if rm.metrics.is_empty() {
            trace!(target: "hostmetrics::builder", "Skipping empty resource snapshot");
            return;
        }

        self.update_capacity(&rm);
        debug!(
            target: "hostmetrics::builder",
            metrics = rm.metrics.len(),
            data_points = rm.data_point_count(),
            resource_attributes = rm.resource.attributes.len(),
            "Emitted resource snapshot"
        );
        self.metrics_buffer.resource_metrics.push(rm);
    }

    /// Emit the current resource and return the whole batch, leaving the
    /// builder ready for the next cycle
    pub fn emit(&mut self, options: &[ResourceMetricsOption]) -> Metrics {
        self.emit_for_resource(options);
        mem::take(&mut self.metrics_buffer)
    }

    /// Restart the baseline after the measured source restarted
    pub fn reset(&mut self, options: &[BuilderOption]) {
        self.start_time = Timestamp::now();
        for op in options {
            op.apply(self);
        }
        debug!(target: "hostmetrics::builder", start_time = %self.start_time, "Builder reset");
    }
}

// ============================================================================
// SECTION 10: CPU SCRAPER
// ============================================================================
// Drives a MetricsBuilder once per scrape cycle from cumulative per-CPU times:
// - system.cpu.time straight from the counters
// - system.cpu.utilization from the delta against the previous reading
// - a builder reset when the counters go backwards (reboot, wrap)
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 CPU Times - Cumulative Per-State Seconds
// ----------------------------------------------------------------------------

/// Cumulative seconds spent by one CPU in each state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuTimes {
    /// CPU identifier ("cpu0", "cpu1", ...)
    pub cpu: CompactString,
    pub user: f64,
    pub nice: f64,
    pub system: f64,
    pub idle: f64,
    pub iowait: f64,
    pub irq: f64,
    pub softirq: f64,
    pub steal: f64,
}

impl CpuTimes {
    /// Parse a cpu line from /proc/stat, converting ticks to seconds.
    /// Format: "cpu0 12345 678 9012 34567 890 12 34 56"
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let cpu = CompactString::from(parts.next()?);

        if !cpu.starts_with("cpu") {
            return None;
        }

        let ticks: SmallVec<[u64; 10]> = parts
            .map(|s| s.parse::<u64>().ok())
            .collect::<Option<_>>()?;
        // user, nice, system and idle are always present
        if ticks.len() < 4 {
            return None;
        }
        let secs = |i: usize| ticks.get(i).map_or(0.0, |t| *t as f64 / CLOCK_TICKS_PER_SECOND);

        Some(Self {
            cpu,
            user: secs(0),
            nice: secs(1),
            system: secs(2),
            idle: secs(3),
            iowait: secs(4),
            irq: secs(5),
            softirq: secs(6),
            steal: secs(7),
        })
    }

    /// Total seconds across all states.
    pub fn total(&self) -> f64 {
        self.user + self.nice + self.system + self.idle
            + self.iowait + self.irq + self.softirq + self.steal
    }

    /// Seconds per state, in vocabulary order
    pub fn by_state(&self) -> [(AttributeState, f64); 8] {
        [
            (AttributeState::Idle, self.idle),
            (AttributeState::Interrupt, self.irq),
            (AttributeState::Nice, self.nice),
            (AttributeState::Softirq, self.softirq),
            (AttributeState::Steal, self.steal),
            (AttributeState::System, self.system),
            (AttributeState::User, self.user),
            (AttributeState::Wait, self.iowait),
        ]
    }
}

/// Fraction of time spent in each state between two readings of one CPU.
/// `None` when no time elapsed.
pub fn cpu_utilization(prev: &CpuTimes, curr: &CpuTimes) -> Option<[(AttributeState, f64); 8]> {
    let elapsed = curr.total() - prev.total();
    if elapsed <= 0.0 {
        return None;
    }

    let before = prev.by_state();
    let mut ratios = curr.by_state();
    for ((_, value), (_, earlier)) in ratios.iter_mut().zip(before.iter()) {
        *value = ((*value - earlier) / elapsed).max(0.0);
    }
    Some(ratios)
}

// ----------------------------------------------------------------------------
// 10.2 CPU Times Sources
// ----------------------------------------------------------------------------

/// Where per-CPU times come from.
pub trait CpuTimesSource: Debug + Send {
    /// Human readable identifier for logs and errors
    fn name(&self) -> String;

    /// Host boot time, used as the start of cumulative counters
    fn boot_time(&mut self) -> Option<Timestamp>;

    /// Read the current cumulative times of every CPU
    fn read(&mut self) -> ScrapeResult<Vec<CpuTimes>>;
}

/// Reads `/proc/stat` (or a file with the same layout).
#[derive(Debug, Clone)]
pub struct ProcStatSource {
    path: PathBuf,
}

impl ProcStatSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    fn read_content(&self) -> ScrapeResult<String> {
        fs::read_to_string(&self.path).map_err(|source| ScrapeError::Read {
            path: self.path.clone(),
            source,
        })
    }
}

impl Default for ProcStatSource {
    fn default() -> Self {
        Self::new(DEFAULT_PROC_STAT_PATH)
    }
}

impl CpuTimesSource for ProcStatSource {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn boot_time(&mut self) -> Option<Timestamp> {
        self.read_content().ok().and_then(|c| parse_boot_time(&c))
    }

    fn read(&mut self) -> ScrapeResult<Vec<CpuTimes>> {
        let content = self.read_content()?;
        parse_proc_stat(&content, &self.name())
    }
}

/// Parse every per-CPU line of /proc/stat. The aggregate "cpu" line is
/// skipped.
pub fn parse_proc_stat(content: &str, source_name: &str) -> ScrapeResult<Vec<CpuTimes>> {
    let mut cpus = Vec::new();

    for line in content.lines() {
        let Some(rest) = line.strip_prefix("cpu") else {
            continue;
        };
        if rest.starts_with(char::is_whitespace) {
            continue;
        }

        let times = CpuTimes::parse(line).ok_or_else(|| ScrapeError::MalformedLine {
            line: line.to_owned(),
        })?;
        cpus.push(times);
    }

    if cpus.is_empty() {
        return Err(ScrapeError::NoCpus {
            source_name: source_name.to_owned(),
        });
    }
    Ok(cpus)
}

/// Boot time from the "btime" line of /proc/stat
pub fn parse_boot_time(content: &str) -> Option<Timestamp> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|rest| rest.trim().parse::<i64>().ok())
        .and_then(Timestamp::checked_from_secs)
}

/// Helper to get the host name for the resource
fn host_name() -> CompactString {
    fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .map(CompactString::from)
        .unwrap_or_else(|| CompactString::from("unknown"))
}

// ----------------------------------------------------------------------------
// 10.3 CPU Scraper
// ----------------------------------------------------------------------------

/// Turns CPU time readings into metric batches, one per scrape.
#[derive(Debug)]
pub struct CpuScraper<S: CpuTimesSource = ProcStatSource> {
    source: S,
    builder: MetricsBuilder,
    resource: Resource,
    /// Last reading per CPU, for utilization deltas
    previous: AHashMap<CompactString, CpuTimes>,
}

impl<S: CpuTimesSource> CpuScraper<S> {
    pub fn new(mut source: S, config: &ScraperConfig, build_info: BuildInfo) -> Self {
        let options = Self::start_options(&mut source);
        let builder = MetricsBuilder::new(&config.metrics, build_info, &options);

        let host = config
            .host_name
            .as_deref()
            .map(CompactString::from)
            .unwrap_or_else(host_name);

        info!(
            target: "hostmetrics::scraper",
            source = %source.name(),
            host = %host,
            start_time = %builder.start_time(),
            "CPU scraper created"
        );

        Self {
            source,
            builder,
            resource: Resource::builder().with_host_name(host).build(),
            previous: AHashMap::new(),
        }
    }

    fn start_options(source: &mut S) -> Vec<BuilderOption> {
        source
            .boot_time()
            .map(BuilderOption::StartTime)
            .into_iter()
            .collect()
    }

    pub fn builder(&self) -> &MetricsBuilder {
        &self.builder
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Any CPU whose total went backwards means the counters restarted
    fn source_restarted(&self, current: &[CpuTimes]) -> bool {
        current.iter().any(|times| {
            self.previous
                .get(&times.cpu)
                .is_some_and(|prev| times.total() < prev.total())
        })
    }

    /// Read the source, record every metric and emit the batch.
    ///
    /// On error nothing is recorded and the builder stays usable.
    pub fn scrape(&mut self, now: Timestamp) -> ScrapeResult<Metrics> {
        let current = self.source.read()?;

        if self.source_restarted(&current) {
            warn!(
                target: "hostmetrics::scraper",
                source = %self.source.name(),
                "CPU counters went backwards, resetting start time"
            );
            self.previous.clear();
            let options = Self::start_options(&mut self.source);
            self.builder.reset(&options);
        }

        for times in &current {
            for (state, seconds) in times.by_state() {
                self.builder
                    .record_system_cpu_time_data_point(now, seconds, &times.cpu, state);
            }

            let utilization = self
                .previous
                .get(&times.cpu)
                .and_then(|prev| cpu_utilization(prev, times));
            if let Some(ratios) = utilization {
                for (state, ratio) in ratios {
                    self.builder
                        .record_system_cpu_utilization_data_point(now, ratio, &times.cpu, state);
                }
            }
        }

        self.previous = current
            .into_iter()
            .map(|times| (times.cpu.clone(), times))
            .collect();

        Ok(self
            .builder
            .emit(&[ResourceMetricsOption::WithResource(self.resource.clone())]))
    }
}

// ============================================================================
// SECTION 11: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Host Metrics CLI
#[derive(Parser, Debug)]
#[command(
    name = "hostmetrics",
    version,
    about = "Scrape host CPU metrics and print each batch as JSON",
    long_about = "Periodically scrapes per-CPU times, accumulates them into \
                  system.cpu.* metrics and prints every emitted batch as one \
                  JSON line on stdout."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "hostmetrics.toml", env = "HOSTMETRICS_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "HOSTMETRICS_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the scrape loop
    Run {
        /// Stop after this many scrapes
        #[arg(short = 'n', long)]
        cycles: Option<u64>,
    },

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

    /// Show version and declared metrics
    Version,
}

// ----------------------------------------------------------------------------
// 11.2 CLI Handler Functions
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> HostMetricsResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match AppConfig::load(config_path) {
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
            println!(
                "  • Collection interval: {}",
                humantime::format_duration(config.scraper.collection_interval)
            );
            println!("  • Source: {}", config.scraper.proc_stat_path.display());
            println!("  • Metrics:");
            for name in MetricName::ALL {
                let state = if config.scraper.metrics.metric(name).enabled {
                    "enabled"
                } else {
                    "disabled"
                };
                println!("    - {} ({})", name, state);
            }

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(HostMetricsError::Config(e))
        }
    }
}

fn handle_generate_config(output: Option<&Path>) -> HostMetricsResult<()> {
    let config_str = AppConfig::generate_default_config()?;

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }

    Ok(())
}

fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Scope: {}", SCOPE_NAME);
    println!("Schema: {}", SCHEMA_URL);
    println!();
    println!("Declared metrics:");
    for name in MetricName::ALL {
        let d = name.descriptor();
        println!(
            "  • {} [{}] unit={} default={}",
            d.name,
            d.kind,
            d.unit,
            if d.enabled_by_default { "on" } else { "off" }
        );
    }
}

// ----------------------------------------------------------------------------
// 11.3 Scrape Loop
// ----------------------------------------------------------------------------

/// Scrape on every tick and print each batch as one JSON line until Ctrl-C
/// or `cycles` scrapes have run.
pub async fn run_scraper(config: &ScraperConfig, cycles: Option<u64>) -> HostMetricsResult<()> {
    let source = ProcStatSource::new(&config.proc_stat_path);
    let mut scraper = CpuScraper::new(source, config, BuildInfo::current());

    let mut ticker = interval(config.collection_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut completed: u64 = 0;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!(target: "hostmetrics::run", "Shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                match scraper.scrape(Timestamp::now()) {
                    Ok(batch) => {
                        debug!(
                            target: "hostmetrics::run",
                            resources = batch.len(),
                            metrics = batch.metric_count(),
                            data_points = batch.data_point_count(),
                            "Scrape complete"
                        );
                        if !batch.is_empty() {
                            println!("{}", serde_json::to_string(&batch)?);
                        }
                    }
                    Err(e) if e.is_recoverable() => {
                        warn!(target: "hostmetrics::run", error = %e, "Scrape failed");
                    }
                    Err(e) => return Err(e.into()),
                }

                completed += 1;
                if cycles.is_some_and(|n| completed >= n) {
                    break;
                }
            }
        }
    }

    info!(target: "hostmetrics::run", scrapes = completed, "Scraper stopped");
    Ok(())
}

// ============================================================================
// SECTION 12: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need logging
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
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config_found = cli.config.exists();
    let config = if config_found {
        AppConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        AppConfig::default()
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    if !config_found {
        warn!("Config file not found at {}, using defaults", cli.config.display());
    }
    info!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);

    let cycles = match cli.command {
        Some(Commands::Run { cycles }) => cycles,
        _ => None,
    };
    run_scraper(&config.scraper, cycles).await?;

    Ok(())
}

// ============================================================================
// SECTION 13: TESTS
// ============================================================================


#[cfg(test)]
mod accumulator_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const START: Timestamp = Timestamp::from_secs(100);
    const TS: Timestamp = Timestamp::from_secs(160);

    fn accumulator(enabled: bool) -> MetricAccumulator {
        MetricAccumulator::new(MetricName::SystemCpuTime.descriptor(), MetricConfig { enabled })
    }

    fn record_n(acc: &mut MetricAccumulator, n: usize) {
        for i in 0..n {
            let cpu = format!("cpu{i}");
            acc.record(START, TS, i as f64, &[cpu.as_str(), "user"]);
        }
    }

    #[test]
    fn test_disabled_never_allocates_or_emits() {
        let mut acc = accumulator(false);
        record_n(&mut acc, 3);

        assert!(!acc.is_enabled());
        assert_eq!(acc.pending(), 0);
        assert_eq!(acc.buffer_capacity(), 0);

        let mut out = Vec::new();
        acc.emit(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_empty_emit_is_noop() {
        let mut acc = accumulator(true);
        let mut out = Vec::new();
        acc.emit(&mut out);

        assert!(out.is_empty());
        assert_eq!(acc.capacity(), 0);
    }

    #[test]
    fn test_record_builds_attributes_from_descriptor() {
        let mut acc = accumulator(true);
        acc.record(START, TS, 42.5, &["cpu3", "system"]);

        let metric = acc.take().expect("one point recorded");
        assert_eq!(metric.name, "system.cpu.time");
        assert_eq!(metric.unit, "s");
        assert_eq!(metric.kind, MetricKind::CumulativeSum);
        assert_eq!(
            metric.data_points,
            vec![NumberDataPoint {
                start_timestamp: START,
                timestamp: TS,
                value: 42.5,
                attributes: attributes!["cpu" => "cpu3", "state" => "system"],
            }]
        );
    }

    #[test]
    fn test_emit_moves_and_reinitializes() {
        let mut acc = accumulator(true);
        record_n(&mut acc, 4);

        let mut out = Vec::new();
        acc.emit(&mut out);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 4);
        assert_eq!(acc.pending(), 0);
        assert_eq!(acc.capacity(), 4);
        assert!(acc.buffer_capacity() >= 4);

        // nothing carries over
        acc.emit(&mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_capacity_keeps_high_water_mark() {
        let mut acc = accumulator(true);
        let mut out = Vec::new();

        record_n(&mut acc, 6);
        acc.emit(&mut out);
        record_n(&mut acc, 2);
        acc.emit(&mut out);

        assert_eq!(acc.capacity(), 6);
        assert_eq!(out[1].len(), 2);
    }

    proptest! {
        #[test]
        fn prop_capacity_never_decreases(cycles in proptest::collection::vec(0usize..24, 1..12)) {
            let mut acc = accumulator(true);
            let mut out = Vec::new();
            let mut high_water = 0;

            for n in cycles {
                let before = acc.capacity();
                record_n(&mut acc, n);
                acc.emit(&mut out);
                high_water = high_water.max(n);

                prop_assert!(acc.capacity() >= before);
                prop_assert_eq!(acc.capacity(), high_water);
            }
        }
    }
}


#[cfg(test)]
mod config_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        let config = AppConfig::default();

        assert_eq!(config.scraper.collection_interval, DEFAULT_COLLECTION_INTERVAL);
        assert_eq!(config.scraper.proc_stat_path, PathBuf::from("/proc/stat"));
        assert!(config.scraper.metrics.metric(MetricName::SystemCpuTime).enabled);
        assert!(!config.scraper.metrics.metric(MetricName::SystemCpuUtilization).enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_metrics_fall_back_to_descriptor_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [scraper]
            collection_interval = "30s"

            [scraper.metrics."system.cpu.utilization"]
            enabled = true
            "#,
        )
        .unwrap();

        assert_eq!(config.scraper.collection_interval, Duration::from_secs(30));
        let metrics = &config.scraper.metrics;
        assert!(metrics.metric(MetricName::SystemCpuUtilization).enabled);
        assert!(metrics.metric(MetricName::SystemCpuTime).enabled);
    }

    #[test]
    fn test_unknown_metric_rejected() {
        let err = AppConfig::from_toml_str(
            r#"
            [scraper.metrics."system.cpu.frequency"]
            enabled = true
            "#,
        )
        .unwrap_err();

        assert!(matches!(err, ConfigError::UnknownMetric { ref name } if name == "system.cpu.frequency"));
    }

    #[test]
    fn test_interval_too_small_rejected() {
        let err = AppConfig::from_toml_str(
            r#"
            [scraper]
            collection_interval = "200ms"
            "#,
        )
        .unwrap_err();

        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "scraper.collection_interval"));
    }

    #[test]
    fn test_generated_config_round_trips() {
        let generated = AppConfig::generate_default_config().unwrap();
        let parsed = AppConfig::from_toml_str(&generated).unwrap();
        assert_eq!(parsed, AppConfig::default());
    }

    #[test]
    fn test_generate_config_command_writes_loadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostmetrics.toml");

        handle_generate_config(Some(&path)).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("collection_interval"));
        assert_eq!(AppConfig::load(&path).unwrap(), AppConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [scraper]
            collection_interval = "5s"
            host_name = "db-01"

            [scraper.metrics."system.cpu.time"]
            enabled = false

            [logging]
            format = "json"
            "#
        )
        .unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.scraper.collection_interval, Duration::from_secs(5));
        assert_eq!(config.scraper.host_name.as_deref(), Some("db-01"));
        assert!(!config.scraper.metrics.metric(MetricName::SystemCpuTime).enabled);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_missing_file() {
        let err = AppConfig::load("/nonexistent/hostmetrics.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_error_categories() {
        let err: HostMetricsError = ConfigError::invalid_value("x", "y").into();
        assert_eq!(err.category(), "config");
        assert!(!err.is_recoverable());

        let err: HostMetricsError = ScrapeError::MalformedLine { line: "cpu0 x".into() }.into();
        assert_eq!(err.category(), "scrape");
        assert!(err.is_recoverable());
    }
}

#[cfg(test)]
mod scraper_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;

    const PROC_STAT: &str = "\
cpu  2000 40 600 16000 200 20 40 0 0 0
cpu0 1000 20 300 8000 100 10 20 0 0 0
cpu1 1000 20 300 8000 100 10 20 0 0 0
intr 123456 0 0
ctxt 987654
btime 1700000000
processes 4242
";

    #[derive(Debug)]
    struct FakeSource {
        readings: VecDeque<ScrapeResult<Vec<CpuTimes>>>,
        boot_times: VecDeque<Timestamp>,
    }

    impl FakeSource {
        fn new(readings: Vec<ScrapeResult<Vec<CpuTimes>>>, boot_times: Vec<Timestamp>) -> Self {
            Self {
                readings: readings.into(),
                boot_times: boot_times.into(),
            }
        }
    }

    impl CpuTimesSource for FakeSource {
        fn name(&self) -> String {
            "fake".into()
        }

        fn boot_time(&mut self) -> Option<Timestamp> {
            self.boot_times.pop_front()
        }

        fn read(&mut self) -> ScrapeResult<Vec<CpuTimes>> {
            self.readings.pop_front().unwrap_or_else(|| {
                Err(ScrapeError::NoCpus {
                    source_name: "fake".into(),
                })
            })
        }
    }

    fn times(cpu: &str, user: f64, system: f64, idle: f64) -> CpuTimes {
        CpuTimes {
            cpu: cpu.into(),
            user,
            system,
            idle,
            ..CpuTimes::default()
        }
    }

    fn config(utilization: bool) -> ScraperConfig {
        ScraperConfig {
            host_name: Some("test-host".into()),
            metrics: MetricsBuilderConfig::default()
                .with_metric(MetricName::SystemCpuUtilization, utilization),
            ..ScraperConfig::default()
        }
    }

    fn value(batch: &Metrics, metric: &str, cpu: &str, state: AttributeState) -> Option<f64> {
        batch.find_metric(metric)?.data_points.iter().find_map(|dp| {
            (dp.attributes.get("cpu") == Some(cpu)
                && dp.attributes.get("state") == Some(state.as_str()))
            .then_some(dp.value)
        })
    }

    #[test]
    fn test_parse_proc_stat_skips_aggregate() {
        let cpus = parse_proc_stat(PROC_STAT, "test").unwrap();

        assert_eq!(cpus.len(), 2);
        assert_eq!(cpus[0].cpu.as_str(), "cpu0");
        assert_eq!(cpus[0].user, 10.0);
        assert_eq!(cpus[0].idle, 80.0);
        assert_eq!(cpus[0].iowait, 1.0);
        assert_eq!(cpus[1].cpu.as_str(), "cpu1");
    }

    #[test]
    fn test_parse_proc_stat_errors() {
        assert!(matches!(
            parse_proc_stat("cpu0 10 20 x 40\n", "test"),
            Err(ScrapeError::MalformedLine { .. })
        ));
        assert!(matches!(
            parse_proc_stat("cpu  1 2 3 4\nctxt 5\n", "test"),
            Err(ScrapeError::NoCpus { .. })
        ));
    }

    #[test]
    fn test_cpu_times_parse_short_line() {
        let t = CpuTimes::parse("cpu3 100 200 300 400").unwrap();
        assert_eq!(t.system, 3.0);
        assert_eq!(t.steal, 0.0);
        assert!(CpuTimes::parse("cpu3 100 200").is_none());
        assert!(CpuTimes::parse("intr 1 2 3 4").is_none());
    }

    #[test]
    fn test_parse_boot_time() {
        assert_eq!(parse_boot_time(PROC_STAT), Some(Timestamp::from_secs(1_700_000_000)));
        assert_eq!(parse_boot_time("cpu0 1 2 3 4\n"), None);
        assert_eq!(parse_boot_time("btime 99999999999\n"), None);
        assert_eq!(parse_boot_time("btime -99999999999\n"), None);
    }

    #[test]
    fn test_timestamp_from_secs_saturates() {
        assert_eq!(Timestamp::from_secs(i64::MAX).as_nanos(), i64::MAX);
        assert_eq!(Timestamp::from_secs(i64::MIN).as_nanos(), i64::MIN);
        assert_eq!(Timestamp::checked_from_secs(99_999_999_999), None);
        assert_eq!(
            Timestamp::checked_from_secs(1_700_000_000),
            Some(Timestamp::from_secs(1_700_000_000))
        );
    }

    #[test]
    fn test_proc_stat_source_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stat");
        fs::write(&path, PROC_STAT).unwrap();

        let mut source = ProcStatSource::new(&path);
        assert_eq!(source.boot_time(), Some(Timestamp::from_secs(1_700_000_000)));
        assert_eq!(source.read().unwrap().len(), 2);

        let mut missing = ProcStatSource::new(dir.path().join("absent"));
        let err = missing.read().unwrap_err();
        assert!(matches!(err, ScrapeError::Read { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_utilization_ratios() {
        let prev = times("cpu0", 10.0, 5.0, 85.0);
        let curr = times("cpu0", 13.0, 6.0, 91.0);

        let ratios = cpu_utilization(&prev, &curr).unwrap();
        let get = |s: AttributeState| ratios.iter().find(|(st, _)| *st == s).map(|(_, v)| *v);

        assert_eq!(get(AttributeState::User), Some(0.3));
        assert_eq!(get(AttributeState::System), Some(0.1));
        assert_eq!(get(AttributeState::Idle), Some(0.6));
        assert!(cpu_utilization(&curr, &curr).is_none());
    }

    #[test]
    fn test_first_scrape_records_time_only() {
        let source = FakeSource::new(
            vec![Ok(vec![times("cpu0", 1.0, 2.0, 3.0), times("cpu1", 4.0, 5.0, 6.0)])],
            vec![Timestamp::from_secs(500)],
        );
        let mut scraper = CpuScraper::new(source, &config(true), BuildInfo::current());
        assert_eq!(scraper.builder().start_time(), Timestamp::from_secs(500));

        let now = Timestamp::from_secs(1_000);
        let batch = scraper.scrape(now).unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.resource_metrics[0].resource.get(HOST_NAME_KEY), Some("test-host"));
        let time = batch.find_metric("system.cpu.time").unwrap();
        assert_eq!(time.len(), 16);
        assert!(time.data_points.iter().all(|dp| dp.start_timestamp == Timestamp::from_secs(500)));
        assert!(time.data_points.iter().all(|dp| dp.timestamp == now));
        assert_eq!(value(&batch, "system.cpu.time", "cpu1", AttributeState::System), Some(5.0));
        assert!(batch.find_metric("system.cpu.utilization").is_none());
    }

    #[test]
    fn test_second_scrape_records_utilization() {
        let source = FakeSource::new(
            vec![
                Ok(vec![times("cpu0", 10.0, 5.0, 85.0)]),
                Ok(vec![times("cpu0", 13.0, 6.0, 91.0)]),
            ],
            vec![],
        );
        let mut scraper = CpuScraper::new(source, &config(true), BuildInfo::current());

        scraper.scrape(Timestamp::from_secs(10)).unwrap();
        let batch = scraper.scrape(Timestamp::from_secs(20)).unwrap();

        let utilization = batch.find_metric("system.cpu.utilization").unwrap();
        assert_eq!(utilization.len(), 8);
        assert_eq!(utilization.kind, MetricKind::Gauge);
        assert_eq!(
            value(&batch, "system.cpu.utilization", "cpu0", AttributeState::User),
            Some(0.3)
        );
        assert_eq!(batch.find_metric("system.cpu.time").unwrap().len(), 8);
    }

    #[test]
    fn test_counter_restart_resets_builder() {
        let source = FakeSource::new(
            vec![
                Ok(vec![times("cpu0", 100.0, 50.0, 850.0)]),
                Ok(vec![times("cpu0", 1.0, 1.0, 8.0)]),
            ],
            vec![Timestamp::from_secs(500), Timestamp::from_secs(9_000)],
        );
        let mut scraper = CpuScraper::new(source, &config(true), BuildInfo::current());

        scraper.scrape(Timestamp::from_secs(600)).unwrap();
        let batch = scraper.scrape(Timestamp::from_secs(9_100)).unwrap();

        assert_eq!(scraper.builder().start_time(), Timestamp::from_secs(9_000));
        let time = batch.find_metric("system.cpu.time").unwrap();
        assert!(time.data_points.iter().all(|dp| dp.start_timestamp == Timestamp::from_secs(9_000)));
        // no utilization across a restart
        assert!(batch.find_metric("system.cpu.utilization").is_none());
    }

    #[test]
    fn test_failed_scrape_leaves_builder_usable() {
        let source = FakeSource::new(
            vec![
                Err(ScrapeError::MalformedLine { line: "cpu0 ?".into() }),
                Ok(vec![times("cpu0", 1.0, 1.0, 1.0)]),
            ],
            vec![],
        );
        let mut scraper = CpuScraper::new(source, &config(false), BuildInfo::current());

        assert!(scraper.scrape(Timestamp::from_secs(1)).is_err());
        assert_eq!(scraper.builder().pending_resources(), 0);

        let batch = scraper.scrape(Timestamp::from_secs(2)).unwrap();
        assert_eq!(batch.data_point_count(), 8);
    }
}
