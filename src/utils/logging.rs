//! Diagnostic logging setup using tracing

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const FILTER_ENV: &str = "SURVEY_BACKUP_LOG";
const FORMAT_ENV: &str = "SURVEY_BACKUP_LOG_FORMAT";

/// Initialize the tracing subscriber.
///
/// Level comes from `SURVEY_BACKUP_LOG`, then `RUST_LOG`, defaulting to
/// `survey_backup=info,warn`. `SURVEY_BACKUP_LOG_FORMAT=json` selects JSON
/// lines. Calling this more than once is harmless.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_env(FILTER_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("survey_backup=info,warn"));

    let json = std::env::var(FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let result = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_target(true))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
