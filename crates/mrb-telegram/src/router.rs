use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mrb_core::{
    config::Config,
    download::{DownloaderSet, NativeMediaSaver},
    messaging::{
        port::{ChatDirectory, MessagingPort},
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    pipeline::{EventPipeline, PipelineReport},
    resolver::{EntityCache, EntityResolver},
    scheduler::MessageScheduler,
    security::AllowList,
    transfer::TransferEngine,
};

use crate::{convert, TelegramMessenger};

#[derive(Clone)]
pub struct AppState {
    pub telegram: TelegramMessenger,
    pub pipeline: Arc<EventPipeline>,
}

/// Bot client, routed through the configured proxy when there is one.
pub fn bot(cfg: &Config) -> anyhow::Result<Bot> {
    let mut builder = teloxide::net::default_reqwest_settings();
    if let Some(proxy) = &cfg.proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy.url())?);
    }
    Ok(Bot::with_client(cfg.bot_token.clone(), builder.build()?))
}

pub async fn run_polling(cfg: Arc<Config>, downloaders: DownloaderSet) -> anyhow::Result<()> {
    cfg.dirs.ensure()?;

    let bot = bot(&cfg)?;
    match bot.get_me().await {
        Ok(me) => info!(bot = %me.username(), "connected to Telegram"),
        Err(e) => warn!("getMe failed: {e}"),
    }

    // Wrap the raw Telegram messenger with a throttling decorator so relay
    // bursts stay under flood control. RetryAfter is still handled below it.
    let telegram = TelegramMessenger::new(bot.clone());
    let directory: Arc<dyn ChatDirectory> = Arc::new(telegram.clone());
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        Arc::new(telegram.clone()),
        ThrottleConfig::default(),
    ));

    let ids = cfg.referenced_ids();
    let found = telegram.discover(&ids).await;
    info!(referenced = ids.len(), found, "known chats discovered");

    let resolver = Arc::new(EntityResolver::new(directory, Arc::new(EntityCache::new())));
    let transfer = Arc::new(TransferEngine::new(
        cfg.transfer_rules.clone(),
        resolver.clone(),
        messenger.clone(),
        cfg.dirs.temp("relay"),
    ));
    let scheduler = Arc::new(MessageScheduler::new(
        cfg.scheduled_messages.clone(),
        resolver.clone(),
        messenger.clone(),
    ));

    let mut warm = transfer.targets();
    warm.extend(scheduler.chats());
    let resolved = resolver.warm(&warm).await;
    info!(
        rules = transfer.rules().len(),
        schedules = scheduler.len(),
        resolved,
        wanted = warm.len(),
        "entity cache warmed"
    );

    let gate = AllowList::from_identifiers(&cfg.allowed_chat_ids);
    if gate.is_open() {
        warn!("allowed_chat_ids is empty; every chat may use the downloader");
    } else {
        info!(allowed = gate.len(), "access control enabled");
    }

    let native = NativeMediaSaver::new(
        messenger.clone(),
        cfg.dirs.temp("telegram"),
        cfg.dirs.telegram(),
    );
    let pipeline = Arc::new(EventPipeline::new(
        transfer,
        gate,
        downloaders,
        native,
        messenger,
    ));

    let cancel = CancellationToken::new();
    let jobs = scheduler.start(cancel.clone());

    let state = Arc::new(AppState { telegram, pipeline });
    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_channel_post().endpoint(handle_channel_post));

    info!("polling for updates");
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .default_handler(|_| async {})
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("dispatcher stopped, cancelling scheduled jobs");
    cancel.cancel();
    for job in jobs {
        let _ = job.await;
    }
    Ok(())
}

async fn handle_message(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    state
        .telegram
        .known()
        .record(convert::conversation(&msg.chat))
        .await;
    let inbound = convert::inbound(&msg);
    let report = state.pipeline.handle(&inbound).await;
    log_report(msg.chat.id.0, &report);
    Ok(())
}

async fn handle_channel_post(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    state
        .telegram
        .known()
        .record(convert::conversation(&msg.chat))
        .await;
    let inbound = convert::inbound(&msg);
    let outcomes = state.pipeline.relay(&inbound).await;
    let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
    debug!(chat_id = msg.chat.id.0, relayed = outcomes.len(), failed, "channel post handled");
    Ok(())
}

fn log_report(chat_id: i64, report: &PipelineReport) {
    let failed = report.transfers.iter().filter(|o| !o.is_ok()).count();
    debug!(
        chat_id,
        relayed = report.transfers.len(),
        failed,
        disposition = ?report.disposition,
        "message handled"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrb_core::config::{EnvOverrides, ProxySettings};

    fn config() -> Config {
        Config::from_yaml_str(
            "log_level: INFO\n",
            EnvOverrides {
                bot_token: Some("123:abc".to_string()),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn bot_builds_with_and_without_proxy() {
        let mut cfg = config();
        assert!(bot(&cfg).is_ok());

        cfg.proxy = Some(ProxySettings {
            host: "127.0.0.1".to_string(),
            port: 7890,
        });
        assert!(bot(&cfg).is_ok());
    }
}
