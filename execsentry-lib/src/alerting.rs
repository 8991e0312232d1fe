//! Alert delivery.
//!
//! Sinks are external collaborators from the engine's point of view: an
//! evaluator hands each alert to the [`AlertManager`] exactly once and
//! moves on. There is no retry, rate limiting or deduplication here; a sink
//! that needs those owns them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::models::Alert;

/// Alert delivery errors.
#[derive(Debug, Error)]
pub enum AlertingError {
    #[error("Alert sink error: {0}")]
    SinkError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("File sink error: {path} - {error}")]
    FileSinkError { path: String, error: String },

    #[error("Unknown sink type: {sink_type}")]
    UnknownSinkType { sink_type: String },
}

/// Outcome of handing one alert to one sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryResult {
    /// Sink name
    pub sink_name: String,
    /// Delivery success status
    pub success: bool,
    /// Delivery timestamp
    pub delivered_at: chrono::DateTime<chrono::Utc>,
    /// Error message if delivery failed
    pub error_message: Option<String>,
    /// Delivery duration in milliseconds
    pub duration_ms: u64,
}

impl DeliveryResult {
    fn succeeded(sink_name: &str, started: Instant) -> Self {
        Self {
            sink_name: sink_name.to_owned(),
            success: true,
            delivered_at: chrono::Utc::now(),
            error_message: None,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }

    fn failed(sink_name: &str, started: Instant, error: &AlertingError) -> Self {
        Self {
            sink_name: sink_name.to_owned(),
            success: false,
            delivered_at: chrono::Utc::now(),
            error_message: Some(error.to_string()),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Alert sink trait for different delivery mechanisms.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Send an alert through this sink.
    async fn send(&self, alert: &Alert) -> Result<DeliveryResult, AlertingError>;

    /// Get the sink name.
    fn name(&self) -> &str;

    /// Check if the sink is healthy.
    async fn health_check(&self) -> Result<(), AlertingError>;
}

/// Output format enumeration with string parsing support.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One compact JSON object per line
    #[default]
    Json,
    /// Single-line human readable text
    Human,
    /// `timestamp,id,rule_id,severity,detail,event`
    Csv,
}

impl OutputFormat {
    /// Render one alert as a single line, without the trailing newline.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the alert cannot be encoded as JSON.
    pub fn render(self, alert: &Alert) -> Result<String, AlertingError> {
        Ok(match self {
            OutputFormat::Json => serde_json::to_string(alert)?,
            OutputFormat::Human => alert.to_human(),
            OutputFormat::Csv => alert.to_csv(),
        })
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = AlertingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "human" => Ok(OutputFormat::Human),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(AlertingError::ConfigurationError(format!(
                "Unknown output format: {s}"
            ))),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Human => write!(f, "human"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

/// Standard output alert sink.
pub struct StdoutSink {
    name: String,
    format: OutputFormat,
}

impl StdoutSink {
    /// Create a new stdout sink.
    pub fn new(name: impl Into<String>, format: OutputFormat) -> Self {
        Self {
            name: name.into(),
            format,
        }
    }
}

#[async_trait]
impl AlertSink for StdoutSink {
    async fn send(&self, alert: &Alert) -> Result<DeliveryResult, AlertingError> {
        let start_time = Instant::now();
        let line = self.format.render(alert)?;

        // Locked so concurrent evaluators never interleave within a line.
        let mut out = std::io::stdout().lock();
        writeln!(out, "{line}")?;
        out.flush()?;

        Ok(DeliveryResult::succeeded(&self.name, start_time))
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> Result<(), AlertingError> {
        Ok(())
    }
}

/// Append-only file alert sink.
pub struct FileSink {
    name: String,
    file_path: PathBuf,
    format: OutputFormat,
}

impl FileSink {
    /// Create a new file sink.
    pub fn new(name: impl Into<String>, file_path: impl Into<PathBuf>, format: OutputFormat) -> Self {
        Self {
            name: name.into(),
            file_path: file_path.into(),
            format,
        }
    }

    async fn open(&self) -> Result<tokio::fs::File, AlertingError> {
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
            .await
            .map_err(|e| AlertingError::FileSinkError {
                path: self.file_path.display().to_string(),
                error: e.to_string(),
            })
    }
}

#[async_trait]
impl AlertSink for FileSink {
    async fn send(&self, alert: &Alert) -> Result<DeliveryResult, AlertingError> {
        let start_time = Instant::now();
        let mut line = self.format.render(alert)?;
        line.push('\n');

        let mut file = self.open().await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        Ok(DeliveryResult::succeeded(&self.name, start_time))
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> Result<(), AlertingError> {
        self.open().await.map(|_| ())
    }
}

/// In-memory sink that keeps every alert it receives.
///
/// Clones share the same buffer, so a caller can keep one handle and give
/// another to the [`AlertManager`].
#[derive(Clone, Default)]
pub struct MemorySink {
    name: String,
    alerts: Arc<Mutex<Vec<Alert>>>,
}

impl MemorySink {
    /// Create a new memory sink.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alerts: Arc::default(),
        }
    }

    /// Snapshot of the alerts received so far.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of alerts received so far.
    pub fn len(&self) -> usize {
        self.alerts.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True if no alert has been received.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AlertSink for MemorySink {
    async fn send(&self, alert: &Alert) -> Result<DeliveryResult, AlertingError> {
        let start_time = Instant::now();
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert.clone());
        Ok(DeliveryResult::succeeded(&self.name, start_time))
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> Result<(), AlertingError> {
        Ok(())
    }
}

/// Configuration for creating alert sinks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SinkConfig {
    /// Sink name
    pub name: String,
    /// Sink type: `stdout` or `file`
    pub sink_type: String,
    /// Output format
    #[serde(default)]
    pub format: OutputFormat,
    /// Additional configuration, e.g. `path` for file sinks
    #[serde(default)]
    pub config: HashMap<String, String>,
}

impl SinkConfig {
    /// Create a new sink configuration.
    pub fn new(name: impl Into<String>, sink_type: impl Into<String>, format: OutputFormat) -> Self {
        Self {
            name: name.into(),
            sink_type: sink_type.into(),
            format,
            config: HashMap::new(),
        }
    }

    /// Add a configuration parameter.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

/// Factory for creating alert sinks based on configuration.
pub struct AlertSinkFactory;

impl AlertSinkFactory {
    /// Create an alert sink from configuration.
    ///
    /// # Errors
    ///
    /// Fails for unknown sink types and for file sinks without a `path`.
    pub fn create_sink(config: SinkConfig) -> Result<Box<dyn AlertSink>, AlertingError> {
        match config.sink_type.as_str() {
            "stdout" => Ok(Box::new(StdoutSink::new(config.name, config.format))),
            "file" => {
                let file_path = config.config.get("path").cloned().ok_or_else(|| {
                    AlertingError::ConfigurationError(
                        "File path is required for file sink".to_owned(),
                    )
                })?;
                Ok(Box::new(FileSink::new(config.name, file_path, config.format)))
            }
            _ => Err(AlertingError::UnknownSinkType {
                sink_type: config.sink_type,
            }),
        }
    }

    /// Create multiple sinks from a list of configurations.
    ///
    /// # Errors
    ///
    /// Fails on the first configuration [`Self::create_sink`] rejects.
    pub fn create_sinks(configs: Vec<SinkConfig>) -> Result<Vec<Box<dyn AlertSink>>, AlertingError> {
        configs.into_iter().map(Self::create_sink).collect()
    }
}

/// Fans alerts out to every configured sink.
#[derive(Default)]
pub struct AlertManager {
    sinks: Vec<Box<dyn AlertSink>>,
}

impl AlertManager {
    /// Create an alert manager without sinks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an alert manager with sinks from configurations.
    ///
    /// # Errors
    ///
    /// Propagates sink construction failures.
    pub fn from_configs(configs: Vec<SinkConfig>) -> Result<Self, AlertingError> {
        Ok(Self {
            sinks: AlertSinkFactory::create_sinks(configs)?,
        })
    }

    /// Add an alert sink.
    pub fn add_sink(&mut self, sink: Box<dyn AlertSink>) {
        self.sinks.push(sink);
    }

    /// Number of configured sinks.
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Names of the configured sinks, in delivery order.
    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Deliver one alert to every sink concurrently.
    ///
    /// A failing sink never affects the others; its failure is logged and
    /// reported as an unsuccessful [`DeliveryResult`].
    pub async fn send_alert(&self, alert: &Alert) -> Vec<DeliveryResult> {
        let deliveries = self.sinks.iter().map(|sink| async move {
            let started = Instant::now();
            match sink.send(alert).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(
                        sink = sink.name(),
                        alert_id = %alert.id,
                        rule_id = %alert.rule_id,
                        error = %e,
                        "Alert delivery failed"
                    );
                    DeliveryResult::failed(sink.name(), started, &e)
                }
            }
        });

        let results = futures::future::join_all(deliveries).await;
        debug!(
            alert_id = %alert.id,
            sinks = results.len(),
            failed = results.iter().filter(|r| !r.success).count(),
            "Alert dispatched"
        );
        results
    }

    /// Run every sink's health check.
    pub async fn health_check(&self) -> Vec<(String, Result<(), AlertingError>)> {
        let checks = self
            .sinks
            .iter()
            .map(|sink| async move { (sink.name().to_owned(), sink.health_check().await) });
        futures::future::join_all(checks).await
    }
}
