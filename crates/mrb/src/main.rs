use std::sync::Arc;

use tracing::{info, warn};

use mrb_core::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Arc::new(Config::load()?);
    mrb_core::logging::init("mrb", &cfg.log_level)?;

    for w in &cfg.warnings {
        warn!("config: {w}");
    }
    info!(
        config = %cfg.config_path.display(),
        data_dir = %cfg.dirs.base.display(),
        ytdlp = %cfg.ytdlp_path.display(),
        "media relay bot starting"
    );

    let downloaders = mrb_ytdlp::downloaders(&cfg)?;

    mrb_telegram::router::run_polling(cfg, downloaders)
        .await
        .map_err(|e| anyhow::anyhow!("telegram bot failed: {e}"))?;

    info!("bye");
    Ok(())
}
