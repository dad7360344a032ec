use std::{path::PathBuf, sync::Arc, sync::OnceLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::info;

use mrb_core::{
    download::{DownloadResult, Downloader},
    formatting::truncate_text,
    utils::{move_file, non_clobbering_path, sanitize_filename},
};

use crate::{cookies, extension, failure_reason, YtDlp, BROWSER_USER_AGENT};

const MAX_TITLE_CHARS: usize = 60;

pub struct DouyinDownloader {
    ytdlp: Arc<YtDlp>,
    cookie: Option<String>,
    temp_dir: PathBuf,
    dest_dir: PathBuf,
}

/// The `v.douyin.com/<code>/` share link inside a pasted share text.
pub fn share_link(text: &str) -> Option<String> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"(?:https?://)?v\.douyin\.com/[A-Za-z0-9_\-]+/").ok())
        .as_ref()?;
    let m = re.find(text)?.as_str();
    if m.starts_with("http") {
        Some(m.to_string())
    } else {
        Some(format!("https://{m}"))
    }
}

impl DouyinDownloader {
    pub fn new(ytdlp: Arc<YtDlp>, cookie: Option<String>, temp_dir: PathBuf, dest_dir: PathBuf) -> Self {
        Self {
            ytdlp,
            cookie,
            temp_dir,
            dest_dir,
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--no-playlist".to_string(),
            "--add-header".to_string(),
            format!("User-Agent:{BROWSER_USER_AGENT}"),
            "--add-header".to_string(),
            "Referer:https://www.douyin.com/".to_string(),
            "--merge-output-format".to_string(),
            "mp4".to_string(),
        ];
        args.extend(cookies::header_args(self.cookie.as_deref()));
        args
    }
}

#[async_trait]
impl Downloader for DouyinDownloader {
    fn name(&self) -> &'static str {
        "douyin"
    }

    async fn download(&self, url: &str) -> DownloadResult {
        let Some(link) = share_link(url) else {
            return DownloadResult::failure("no Douyin share link found");
        };

        let template = self.temp_dir.join("%(id)s.%(ext)s");
        let out = match self.ytdlp.run(&link, &template, &self.args()).await {
            Ok(out) => out,
            Err(e) => return DownloadResult::failure(e.to_string()),
        };
        let Some(finished) = out.files.first() else {
            return DownloadResult::failure(failure_reason(&out));
        };

        let title = finished
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| finished.id.clone());
        let stem = format!(
            "{}_{}",
            sanitize_filename(&truncate_text(&title, MAX_TITLE_CHARS)),
            finished.id
        );
        let ext = match extension(&finished.filepath) {
            e if e.is_empty() => "mp4".to_string(),
            e => e,
        };
        let dest = non_clobbering_path(&self.dest_dir, &stem, &ext);

        match move_file(&finished.filepath, &dest).await {
            Ok(path) => {
                info!(title = %title, path = %path.display(), "douyin download finished");
                let mut res = DownloadResult::success(path, title).with_meta("video_id", finished.id.clone());
                if let Some(author) = &finished.uploader {
                    res = res.with_meta("author", author.clone());
                }
                res
            }
            Err(e) => DownloadResult::failure(format!("failed to move file: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::scratch_dir;
    use std::time::Duration;

    #[test]
    fn share_link_is_cut_from_share_text() {
        let text = "7.43 abc:/ 看看这个 https://v.douyin.com/iRNBho6u/ 复制此链接";
        assert_eq!(share_link(text).as_deref(), Some("https://v.douyin.com/iRNBho6u/"));
        assert_eq!(
            share_link("v.douyin.com/AbC-1_/").as_deref(),
            Some("https://v.douyin.com/AbC-1_/")
        );
        assert!(share_link("https://v.douyin.com/nope").is_none());
    }

    #[test]
    fn cookie_and_browser_headers_are_sent() {
        let d = DouyinDownloader::new(
            Arc::new(YtDlp::new("yt-dlp", None, Duration::from_secs(1))),
            Some("ttwid=1".to_string()),
            PathBuf::from("/tmp/t"),
            PathBuf::from("/tmp/d"),
        );
        let args = d.args();
        assert!(args.contains(&"Referer:https://www.douyin.com/".to_string()));
        assert!(args.contains(&"Cookie:ttwid=1".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn video_is_named_title_then_id() {
        let root = scratch_dir("douyin");
        let temp = root.join("temp");
        std::fs::create_dir_all(&temp).unwrap();
        let tmp_file = temp.join("7300.mp4");
        std::fs::write(&tmp_file, b"v").unwrap();

        let line = format!(
            r#"{{"id":"7300","title":"cat / dog","filepath":"{}","uploader":"someone","playlist_title":null}}"#,
            tmp_file.display()
        );
        let program = crate::test_support::fake_ytdlp(&root, &line, "", 0);
        let d = DouyinDownloader::new(
            Arc::new(YtDlp::new(program, None, Duration::from_secs(10))),
            None,
            temp,
            root.join("douyin"),
        );

        let res = d.download("share https://v.douyin.com/iRNBho6u/").await;
        match &res {
            DownloadResult::Success { artifact_path, .. } => {
                assert_eq!(artifact_path, &root.join("douyin/cat _ dog_7300.mp4"));
                assert!(artifact_path.exists());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(res.meta("author"), Some("someone"));
        let _ = std::fs::remove_dir_all(root);
    }
}
