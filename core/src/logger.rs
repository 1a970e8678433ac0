use tracing::{debug, level_filters::LevelFilter};
use tracing_subscriber::{
    fmt::format::{Format, Writer},
    EnvFilter,
};

struct CustomTimer;

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, writer: &mut Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        write!(writer, "{} - {}", now.format("%d %B"), now.format("%H:%M:%S%.6f"))
    }
}

/// Installs the global subscriber. `RUST_LOG` directives apply on top of `log_level`, so
/// `RUST_LOG=bulkwrite=debug` shows every executed statement. Returns `false` when a subscriber
/// was already installed.
pub fn setup_logger(log_level: LevelFilter) -> bool {
    let filter = EnvFilter::from_default_env().add_directive(log_level.into());

    let format = Format::default().with_timer(CustomTimer).with_level(true).with_target(false);

    let subscriber =
        tracing_subscriber::fmt().with_env_filter(filter).event_format(format).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        debug!("Logger has already been set up, continuing...");
        return false;
    }

    true
}

pub fn setup_info_logger() -> bool {
    setup_logger(LevelFilter::INFO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_setup_is_not_an_error() {
        setup_logger(LevelFilter::DEBUG);
        assert!(!setup_info_logger());
    }
}
