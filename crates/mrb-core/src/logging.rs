use crate::Result;

/// Initialize tracing for the bot.
///
/// `RUST_LOG` wins when set; otherwise `default_level` (the config's
/// `log_level`, Python-style names accepted) applies to everything.
pub fn init(service_name: &str, default_level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = normalize_level(default_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{level},mrb={level},mrb_core={level},{}={level}",
            service_name.replace('-', "_")
        ))
    });

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .try_init();

    Ok(())
}

fn normalize_level(raw: &str) -> &'static str {
    match raw.trim().to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" | "critical" | "fatal" => "error",
        _ => "info",
    }
}
