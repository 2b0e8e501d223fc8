//! Structured logging setup and span helpers.
//!
//! Every utterance runs inside an `utterance` span carrying its id, and every
//! search pass thread enters a `pass` span of its own, so per-frame events can be
//! attributed without threading identifiers through the search code.

use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, Registry};

use crate::config::DecoderConfig;

/// Configuration for log output.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Service name reported at startup.
    pub service_name: String,
    /// Whether to enable console logging.
    pub enable_console: bool,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
    /// Log level filter used when `RUST_LOG` is not set.
    pub log_level: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "amira-multipass-decoder".to_string(),
            enable_console: true,
            json: false,
            log_level: "info".to_string(),
        }
    }
}

impl From<&DecoderConfig> for TracingConfig {
    fn from(config: &DecoderConfig) -> Self {
        Self {
            json: config.json_logs,
            log_level: config.log_level.clone(),
            ..Self::default()
        }
    }
}

/// Install the global tracing subscriber.
pub fn init_tracing(config: TracingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let subscriber = Registry::default().with(env_filter);

    if !config.enable_console {
        subscriber.try_init()?;
    } else if config.json {
        subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_current_span(true),
            )
            .try_init()?;
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .compact(),
            )
            .try_init()?;
    }

    info!(service = %config.service_name, "Tracing initialized");
    Ok(())
}

/// Create the span covering one utterance.
#[macro_export]
macro_rules! utterance_span {
    ($id:expr) => {
        tracing::info_span!(
            "utterance",
            utt_id = %$id,
            frames = tracing::field::Empty,
            words = tracing::field::Empty,
        )
    };
}

/// Create the span covering one search pass thread.
#[macro_export]
macro_rules! pass_span {
    ($parent:expr, $pass:expr) => {
        tracing::info_span!(
            parent: $parent,
            "pass",
            pass = $pass,
            frames = tracing::field::Empty,
            arcs = tracing::field::Empty,
        )
    };
}

/// Utilities for filling span fields declared as empty.
pub mod span_utils {
    use tracing::Span;

    /// Record the number of frames processed on the current span.
    pub fn add_frames(frames: usize) {
        Span::current().record("frames", frames);
    }

    /// Record the number of arcs emitted on the current span.
    pub fn add_arcs(arcs: usize) {
        Span::current().record("arcs", arcs);
    }

    /// Record the hypothesis length on a span.
    pub fn add_words(span: &Span, words: usize) {
        span.record("words", words);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_config_from_decoder_config() {
        let mut decoder = DecoderConfig::default();
        decoder.json_logs = true;
        decoder.log_level = "debug".to_string();
        let config = TracingConfig::from(&decoder);
        assert!(config.json);
        assert!(config.enable_console);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.service_name, "amira-multipass-decoder");
    }

    #[test]
    fn test_span_macros() {
        let id = uuid::Uuid::new_v4();
        let utt = crate::utterance_span!(id);
        let _pass = crate::pass_span!(&utt, "fwdtree");
        span_utils::add_frames(10);
        span_utils::add_arcs(3);
        span_utils::add_words(&utt, 2);
    }
}
