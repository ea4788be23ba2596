//! Tracing setup for the `pmd` binary
//!
//! This module provides:
//! - Operation context with correlation IDs
//! - Structured logging configuration (logs go to stderr, results to stdout)

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{Level, Span};
use uuid::Uuid;

/// Global operation counter for correlation ID generation
static OPERATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Context of one manager operation issued by the CLI or an embedding service
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Unique correlation ID tying together the logs of one operation
    pub correlation_id: String,
    /// Operation name, e.g. `create_device`
    pub operation: &'static str,
    /// Volume the operation targets, if any
    pub volume_id: Option<String>,
    pub seq: u64,
}

impl OperationContext {
    pub fn new(operation: &'static str) -> Self {
        let (correlation_id, seq) = generate_correlation_id();
        Self {
            correlation_id,
            operation,
            volume_id: None,
            seq,
        }
    }

    pub fn with_volume(mut self, volume_id: Option<&str>) -> Self {
        self.volume_id = volume_id.map(str::to_string);
        self
    }

    /// Create a tracing span for this operation
    pub fn span(&self) -> Span {
        match self.volume_id {
            Some(ref volume_id) => tracing::info_span!(
                "operation",
                correlation_id = %self.correlation_id,
                op = self.operation,
                volume_id = %volume_id,
                seq = self.seq
            ),
            None => tracing::info_span!(
                "operation",
                correlation_id = %self.correlation_id,
                op = self.operation,
                seq = self.seq
            ),
        }
    }
}

/// Generate a unique correlation ID and return it with the sequence number
///
/// First 8 chars of a UUID v7 (time-ordered) plus a monotonic counter, so IDs
/// sort by start time and stay unique within one timestamp.
fn generate_correlation_id() -> (String, u64) {
    let uuid = Uuid::now_v7();
    let counter = OPERATION_COUNTER.fetch_add(1, Ordering::Relaxed);
    let correlation_id = format!("{}-{:06x}", &uuid.to_string()[..8], counter & 0xFFFFFF);
    (correlation_id, counter)
}

/// Parses a log level name, falling back to INFO.
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Subscriber settings for the binary
#[derive(Debug, Clone, Copy)]
pub struct TracingConfig {
    pub level: Level,
    pub json_format: bool,
    /// Source file and line on every event
    pub include_location: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            include_location: false,
        }
    }
}

impl TracingConfig {
    /// JSON lines with source locations, for log collectors
    pub fn production() -> Self {
        Self {
            json_format: true,
            include_location: true,
            ..Self::default()
        }
    }

    /// Installs the global subscriber. `RUST_LOG` overrides `level`.
    pub fn init(self) {
        use tracing_subscriber::prelude::*;
        use tracing_subscriber::{EnvFilter, fmt};

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.to_string()));

        let layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_file(self.include_location)
            .with_line_number(self.include_location);
        let layer = if self.json_format {
            layer.json().boxed()
        } else {
            layer.boxed()
        };

        tracing_subscriber::registry().with(filter).with(layer).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_id_generation() {
        let (id1, seq1) = generate_correlation_id();
        let (id2, seq2) = generate_correlation_id();

        assert_ne!(id1, id2);
        assert!(seq2 > seq1);

        // 8 chars + hyphen + 6 hex chars
        assert_eq!(id1.len(), 15);
        assert_eq!(id1.as_bytes()[8], b'-');
    }

    #[test]
    fn test_operation_context() {
        let ctx = OperationContext::new("create_device").with_volume(Some("pvc-1"));
        assert_eq!(ctx.operation, "create_device");
        assert_eq!(ctx.volume_id.as_deref(), Some("pvc-1"));

        let next = OperationContext::new("list_devices").with_volume(None);
        assert!(next.volume_id.is_none());
        assert!(next.seq > ctx.seq);
    }

    #[test]
    fn test_production_preset() {
        let config = TracingConfig::production();
        assert!(config.json_format);
        assert!(config.include_location);
        assert_eq!(config.level, Level::INFO);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("verbose"), Level::INFO);
    }
}
