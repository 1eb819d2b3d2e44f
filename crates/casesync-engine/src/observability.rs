//! Logging setup and the spans every sync run is recorded under.

use std::fmt;
use std::str::FromStr;
use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt as fmt_layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::questionnaire::SyncMode;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event, for log collectors.
    Json,
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(format!("expected 'json' or 'pretty', got '{other}'")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        })
    }
}

/// Installs the global subscriber. Later calls are no-ops.
///
/// `RUST_LOG` controls levels and defaults to `info`.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        // A subscriber installed by the host process wins.
        let _ = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer::layer().pretty())
                .try_init(),
        };
    });
}

/// Span wrapping one whole run.
#[must_use]
pub fn sync_run_span(run_id: &str, mode: SyncMode, prefix: &str) -> Span {
    tracing::info_span!(
        "sync_run",
        run_id = run_id,
        mode = mode.as_str(),
        prefix = prefix,
    )
}

/// Span wrapping the transaction of one questionnaire.
#[must_use]
pub fn questionnaire_span(questionnaire: &str) -> Span {
    tracing::info_span!("questionnaire", questionnaire = questionnaire)
}
