//! Per-message flow: relay rules, then download routing.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    classify::{classify, extract_link, Route},
    domain::{ChatId, MessageRef},
    download::{DownloadResult, DownloaderSet, NativeMediaSaver},
    formatting::{escape_html, truncate_text},
    messaging::{
        port::MessagingPort,
        types::{Conversation, InboundMessage},
    },
    security::AllowList,
    transfer::{RuleOutcome, TransferEngine},
};

pub const GREETING: &str =
    "👋 Hi! Send me a video, a file, or a YouTube / Douyin / Bilibili link and I'll save it.";

const MAX_LISTED_CHATS: usize = 100;

/// What happened to a message after the relay rules ran.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    Greeted,
    /// `/chats` was answered (or refused, when `false`).
    ListedChats(bool),
    /// Nothing to download.
    Ignored,
    /// The chat is not on the allow-list.
    Denied(Route),
    /// The route has no downloader configured, or the link could not be extracted.
    Unavailable(Route),
    Downloaded(Route, DownloadResult),
}

#[derive(Debug)]
pub struct PipelineReport {
    pub transfers: Vec<RuleOutcome>,
    pub disposition: Disposition,
}

pub struct EventPipeline {
    transfer: Arc<TransferEngine>,
    gate: AllowList,
    downloaders: DownloaderSet,
    native: NativeMediaSaver,
    messenger: Arc<dyn MessagingPort>,
}

impl EventPipeline {
    pub fn new(
        transfer: Arc<TransferEngine>,
        gate: AllowList,
        downloaders: DownloaderSet,
        native: NativeMediaSaver,
        messenger: Arc<dyn MessagingPort>,
    ) -> Self {
        Self {
            transfer,
            gate,
            downloaders,
            native,
            messenger,
        }
    }

    pub fn transfer(&self) -> &Arc<TransferEngine> {
        &self.transfer
    }

    /// Relay only. Used for channel posts, which never trigger downloads.
    pub async fn relay(&self, msg: &InboundMessage) -> Vec<RuleOutcome> {
        self.transfer.route(msg).await
    }

    pub async fn handle(&self, msg: &InboundMessage) -> PipelineReport {
        let transfers = self.transfer.route(msg).await;
        let disposition = self.dispatch(msg).await;
        debug!(chat_id = msg.chat_id().0, ?disposition, "message handled");
        PipelineReport {
            transfers,
            disposition,
        }
    }

    async fn dispatch(&self, msg: &InboundMessage) -> Disposition {
        let chat = msg.chat_id();

        if is_command(&msg.text, "start") {
            self.reply(chat, GREETING).await;
            return Disposition::Greeted;
        }
        if is_command(&msg.text, "chats") {
            return Disposition::ListedChats(self.list_chats(msg).await);
        }

        let route = classify(msg);
        if route == Route::None {
            return Disposition::Ignored;
        }

        if !self.gate.allows(msg) {
            info!(chat_id = chat.0, %route, "download refused for chat outside allow-list");
            self.reply(chat, "⛔ This chat is not allowed to use the downloader.")
                .await;
            return Disposition::Denied(route);
        }

        let (status, result) = if route == Route::NativeMedia {
            let status = self.status(chat, "📥 Downloading media file...").await;
            (status, self.native.save(msg).await)
        } else {
            let downloader = self.downloaders.for_route(route);
            let link = extract_link(route, &msg.text);
            let (Some(downloader), Some(link)) = (downloader, link) else {
                warn!(chat_id = chat.0, %route, "no downloader available for route");
                self.reply(
                    chat,
                    &format!("⚠️ {} downloads are not available.", escape_html(route.as_str())),
                )
                .await;
                return Disposition::Unavailable(route);
            };

            let status = self
                .status(
                    chat,
                    &format!("🔍 Fetching <code>{}</code>...", escape_html(&link)),
                )
                .await;
            info!(chat_id = chat.0, %route, downloader = downloader.name(), "download started");
            (status, downloader.download(&link).await)
        };

        self.finish(chat, status, &result_message(route, &result))
            .await;
        Disposition::Downloaded(route, result)
    }

    /// Answer `/chats` with the chats the directory knows. Only chats named
    /// on a non-empty allow-list may ask.
    async fn list_chats(&self, msg: &InboundMessage) -> bool {
        let chat = msg.chat_id();
        if self.gate.is_open() || !self.gate.allows(msg) {
            info!(chat_id = chat.0, "chat listing refused");
            self.reply(chat, "⛔ This chat is not allowed to list chats.")
                .await;
            return false;
        }

        match self.transfer.resolver().conversations().await {
            Ok(convs) => {
                self.reply(chat, &chat_list_message(&convs)).await;
                true
            }
            Err(e) => {
                warn!(chat_id = chat.0, "chat listing failed: {e}");
                self.reply(chat, "❌ Could not list chats right now.").await;
                false
            }
        }
    }

    async fn reply(&self, chat: ChatId, html: &str) {
        if let Err(e) = self.messenger.send_html(chat, html).await {
            warn!(chat_id = chat.0, "failed to send reply: {e}");
        }
    }

    async fn status(&self, chat: ChatId, html: &str) -> Option<MessageRef> {
        match self.messenger.send_html(chat, html).await {
            Ok(sent) => Some(sent),
            Err(e) => {
                warn!(chat_id = chat.0, "failed to send status: {e}");
                None
            }
        }
    }

    /// Turn the status message into the result, or send the result fresh
    /// when there is no status message to edit.
    async fn finish(&self, chat: ChatId, status: Option<MessageRef>, html: &str) {
        if let Some(status) = status {
            match self.messenger.edit_html(status, html).await {
                Ok(()) => return,
                Err(e) => debug!(chat_id = chat.0, "status edit failed, sending instead: {e}"),
            }
        }
        self.reply(chat, html).await;
    }
}

/// `/name` or `/name@bot` as the first word.
fn is_command(text: &str, name: &str) -> bool {
    let Some(cmd) = text.split_whitespace().next().and_then(|w| w.strip_prefix('/')) else {
        return false;
    };
    cmd == name || cmd.strip_prefix(name).is_some_and(|rest| rest.starts_with('@'))
}

fn chat_list_message(convs: &[Conversation]) -> String {
    if convs.is_empty() {
        return "📋 No known chats yet.".to_string();
    }
    let mut out = format!("📋 Known chats ({}):", convs.len());
    for c in convs.iter().take(MAX_LISTED_CHATS) {
        let title = c.title.as_deref().unwrap_or("(untitled)");
        out.push_str(&format!(
            "\n• {} - ID: <code>{}</code>",
            escape_html(title),
            c.id.0
        ));
        if let Some(handle) = &c.handle {
            out.push_str(&format!(" - @{}", escape_html(handle)));
        }
    }
    if convs.len() > MAX_LISTED_CHATS {
        out.push_str(&format!("\n...and {} more", convs.len() - MAX_LISTED_CHATS));
    }
    out
}

fn result_message(route: Route, result: &DownloadResult) -> String {
    match result {
        DownloadResult::Success {
            artifact_path,
            title,
            metadata,
        } => {
            let heading = match (route, metadata.get("type")) {
                (Route::NativeMedia, Some(kind)) => format!("✅ {} file saved!", escape_html(kind)),
                _ => "✅ Download complete!".to_string(),
            };
            let mut out = format!(
                "{heading}\n📄 {}\n📁 <code>{}</code>",
                escape_html(&truncate_text(title, 200)),
                escape_html(&artifact_path.display().to_string())
            );
            if let Some(summary) = metadata.get("summary") {
                out.push_str(&format!("\n\n{}", escape_html(summary)));
            }
            out
        }
        DownloadResult::Failure { reason } => {
            format!("❌ Download failed: {}", escape_html(&truncate_text(reason, 500)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{MessageId, MessageRef},
        download::Downloader,
        messaging::types::Media,
        resolver::{EntityCache, EntityResolver},
        testing::{scratch_dir, Call, FakeDirectory, FakeMessenger},
        transfer::TransferRule,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeDownloader {
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Downloader for FakeDownloader {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn download(&self, url: &str) -> DownloadResult {
            if let Ok(mut urls) = self.urls.lock() {
                urls.push(url.to_string());
            }
            if url.contains("broken") {
                return DownloadResult::failure("video unavailable");
            }
            DownloadResult::success("/downloads/youtube/clip.mp4", "A <clip>")
        }
    }

    struct Harness {
        pipeline: EventPipeline,
        messenger: Arc<FakeMessenger>,
        youtube: Arc<FakeDownloader>,
        root: std::path::PathBuf,
    }

    fn harness(allowed: &[&str], rules: Vec<TransferRule>) -> Harness {
        let messenger = Arc::new(FakeMessenger::default());
        let directory = Arc::new(FakeDirectory::with(&[(-100456, None)]));
        let resolver = Arc::new(EntityResolver::new(directory, Arc::new(EntityCache::new())));
        let root = scratch_dir("pipeline");
        let transfer = Arc::new(TransferEngine::new(
            rules,
            resolver,
            messenger.clone(),
            root.join("relay"),
        ));
        let youtube = Arc::new(FakeDownloader::default());
        let pipeline = EventPipeline::new(
            transfer,
            AllowList::new(allowed.iter().copied()),
            DownloaderSet {
                site_a: Some(youtube.clone() as Arc<dyn Downloader>),
                ..Default::default()
            },
            NativeMediaSaver::new(messenger.clone(), root.join("temp"), root.join("downloads")),
            messenger.clone(),
        );
        Harness {
            pipeline,
            messenger,
            youtube,
            root,
        }
    }

    fn harness_with_chats(allowed: &[&str], chats: &[(i64, Option<&str>)]) -> Harness {
        let messenger = Arc::new(FakeMessenger::default());
        let directory = Arc::new(FakeDirectory::with(chats));
        let resolver = Arc::new(EntityResolver::new(directory, Arc::new(EntityCache::new())));
        let root = scratch_dir("pipeline");
        let transfer = Arc::new(TransferEngine::new(
            vec![],
            resolver,
            messenger.clone(),
            root.join("relay"),
        ));
        let youtube = Arc::new(FakeDownloader::default());
        let pipeline = EventPipeline::new(
            transfer,
            AllowList::new(allowed.iter().copied()),
            DownloaderSet::default(),
            NativeMediaSaver::new(messenger.clone(), root.join("temp"), root.join("downloads")),
            messenger.clone(),
        );
        Harness {
            pipeline,
            messenger,
            youtube,
            root,
        }
    }

    fn message(chat: i64, text: &str, media: Media) -> InboundMessage {
        InboundMessage {
            message: MessageRef {
                chat_id: ChatId(chat),
                message_id: MessageId(3),
            },
            chat_handle: None,
            chat_title: None,
            text: text.to_string(),
            entities: vec![],
            media,
        }
    }

    #[tokio::test]
    async fn start_command_greets() {
        let h = harness(&[], vec![]);
        let report = h.pipeline.handle(&message(5, "/start@media_bot", Media::None)).await;
        assert_eq!(report.disposition, Disposition::Greeted);
        assert_eq!(h.messenger.html_to(5), vec![GREETING.to_string()]);
    }

    #[tokio::test]
    async fn plain_text_is_ignored() {
        let h = harness(&[], vec![]);
        let report = h.pipeline.handle(&message(5, "hello", Media::None)).await;
        assert_eq!(report.disposition, Disposition::Ignored);
        assert!(h.messenger.calls().is_empty());
    }

    #[tokio::test]
    async fn link_goes_to_downloader_and_result_is_escaped() {
        let h = harness(&["5"], vec![]);
        let report = h
            .pipeline
            .handle(&message(5, "https://youtu.be/abc thanks", Media::None))
            .await;

        assert!(matches!(
            report.disposition,
            Disposition::Downloaded(Route::SiteA, DownloadResult::Success { .. })
        ));
        assert_eq!(
            h.youtube.urls.lock().unwrap().clone(),
            vec!["https://youtu.be/abc".to_string()]
        );
        let sent = h.messenger.html_to(5);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("🔍 Fetching"));
        let edits = h.messenger.edits_to(5);
        assert_eq!(edits.len(), 1);
        assert!(edits[0].contains("A &lt;clip&gt;"));
    }

    #[tokio::test]
    async fn download_failures_are_reported() {
        let h = harness(&[], vec![]);
        let report = h
            .pipeline
            .handle(&message(5, "https://youtu.be/broken", Media::None))
            .await;
        assert!(matches!(
            report.disposition,
            Disposition::Downloaded(_, DownloadResult::Failure { .. })
        ));
        let replies = h.messenger.texts_to(5);
        assert!(replies.last().unwrap().contains("video unavailable"));
    }

    #[tokio::test]
    async fn gate_blocks_downloads_but_not_relays() {
        let h = harness(
            &["111"],
            vec![TransferRule {
                source_chat: 5.into(),
                target_chat: (-100456).into(),
                include_keywords: vec![],
                exclude_words: vec![],
                direct: false,
            }],
        );
        let msg = message(5, "https://youtu.be/abc", Media::None);
        let report = h.pipeline.handle(&msg).await;

        assert_eq!(report.disposition, Disposition::Denied(Route::SiteA));
        assert_eq!(report.transfers.len(), 1);
        assert!(report.transfers[0].is_ok());
        assert!(h.youtube.urls.lock().unwrap().is_empty());
        assert!(h
            .messenger
            .calls()
            .contains(&Call::Forward(ChatId(-100456), msg.message)));
    }

    #[tokio::test]
    async fn unconfigured_route_is_unavailable() {
        let h = harness(&[], vec![]);
        let report = h
            .pipeline
            .handle(&message(5, "https://www.bilibili.com/video/BV1xx411c7mD", Media::None))
            .await;
        assert_eq!(report.disposition, Disposition::Unavailable(Route::SiteC));
    }

    #[tokio::test]
    async fn native_media_is_saved() {
        let h = harness(&[], vec![]);
        let media = Media::Document {
            file_id: "doc1".to_string(),
            mime_type: Some("video/mp4".to_string()),
            file_name: Some("holiday.mp4".to_string()),
        };
        let report = h.pipeline.handle(&message(5, "", media)).await;

        match report.disposition {
            Disposition::Downloaded(Route::NativeMedia, DownloadResult::Success { artifact_path, .. }) => {
                assert_eq!(artifact_path, h.root.join("downloads/videos/holiday.mp4"));
            }
            other => panic!("unexpected disposition: {other:?}"),
        }
        assert!(h.messenger.texts_to(5).last().unwrap().contains("video file saved"));
        let _ = std::fs::remove_dir_all(&h.root);
    }

    #[tokio::test]
    async fn relay_never_downloads() {
        let h = harness(&[], vec![]);
        let out = h
            .pipeline
            .relay(&message(5, "https://youtu.be/abc", Media::None))
            .await;
        assert!(out.is_empty());
        assert!(h.youtube.urls.lock().unwrap().is_empty());
        assert!(h.messenger.calls().is_empty());
    }

    #[tokio::test]
    async fn allow_list_matches_chat_handle() {
        let h = harness(&["@owner"], vec![]);
        let mut msg = message(5, "https://youtu.be/abc", Media::None);
        msg.chat_handle = Some("owner".to_string());
        let report = h.pipeline.handle(&msg).await;
        assert!(matches!(
            report.disposition,
            Disposition::Downloaded(Route::SiteA, DownloadResult::Success { .. })
        ));

        let mut other = message(6, "https://youtu.be/abc", Media::None);
        other.chat_handle = Some("someone".to_string());
        let report = h.pipeline.handle(&other).await;
        assert_eq!(report.disposition, Disposition::Denied(Route::SiteA));
    }

    #[tokio::test]
    async fn chats_command_lists_known_chats_for_allowed_chats() {
        let h = harness_with_chats(&["5"], &[(-100456, Some("mirror")), (7, None)]);
        let report = h.pipeline.handle(&message(5, "/chats", Media::None)).await;
        assert_eq!(report.disposition, Disposition::ListedChats(true));

        let replies = h.messenger.html_to(5);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].starts_with("📋 Known chats (2):"));
        assert!(replies[0].contains("<code>-100456</code> - @mirror"));
        assert!(replies[0].contains("(untitled) - ID: <code>7</code>"));
    }

    #[tokio::test]
    async fn chats_command_needs_an_explicit_allow_list() {
        let open = harness_with_chats(&[], &[(7, None)]);
        let report = open.pipeline.handle(&message(5, "/chats@media_bot", Media::None)).await;
        assert_eq!(report.disposition, Disposition::ListedChats(false));
        assert!(!open.messenger.html_to(5)[0].contains("<code>7</code>"));

        let closed = harness_with_chats(&["9"], &[(7, None)]);
        let report = closed.pipeline.handle(&message(5, "/chats", Media::None)).await;
        assert_eq!(report.disposition, Disposition::ListedChats(false));
    }

    #[test]
    fn commands_match_with_or_without_bot_suffix() {
        assert!(is_command("/start", "start"));
        assert!(is_command("/start@media_bot hi", "start"));
        assert!(!is_command("/starting", "start"));
        assert!(!is_command("start", "start"));
        assert!(is_command("/chats", "chats"));
    }
}
