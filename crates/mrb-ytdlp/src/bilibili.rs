use std::{path::PathBuf, sync::Arc, sync::OnceLock, time::Duration};

use async_trait::async_trait;
use regex::Regex;
use tracing::{info, warn};

use mrb_core::{
    download::{DownloadResult, Downloader},
    errors::Error,
    utils::{move_file, non_clobbering_path, sanitize_filename},
    Result,
};

use crate::{cookies, extension, failure_reason, YtDlp, BROWSER_USER_AGENT};

pub struct BilibiliDownloader {
    ytdlp: Arc<YtDlp>,
    http: reqwest::Client,
    cookie: Option<String>,
    temp_dir: PathBuf,
    dest_dir: PathBuf,
}

/// `BV` followed by ten word characters.
pub fn extract_bvid(text: &str) -> Option<String> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"BV\w{10}").ok())
        .as_ref()?
        .find(text)
        .map(|m| m.as_str().to_string())
}

pub fn canonical_url(bvid: &str) -> String {
    format!("https://www.bilibili.com/video/{bvid}")
}

impl BilibiliDownloader {
    pub fn new(
        ytdlp: Arc<YtDlp>,
        cookie: Option<String>,
        proxy: Option<String>,
        temp_dir: PathBuf,
        dest_dir: PathBuf,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(BROWSER_USER_AGENT);
        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(&proxy)
                .map_err(|e| Error::Config(format!("invalid proxy {proxy}: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let http = builder
            .build()
            .map_err(|e| Error::External(format!("http client build failed: {e}")))?;

        Ok(Self {
            ytdlp,
            http,
            cookie,
            temp_dir,
            dest_dir,
        })
    }

    /// Follow a `b23.tv` short link to the page it points at.
    async fn expand_short_link(&self, url: &str) -> Result<String> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Download(format!("short link request failed: {e}")))?;
        Ok(resp.url().to_string())
    }

    async fn bvid_for(&self, url: &str) -> Option<String> {
        if let Some(bv) = extract_bvid(url) {
            return Some(bv);
        }
        if !url.contains("b23.tv") {
            return None;
        }
        match self.expand_short_link(url).await {
            Ok(expanded) => extract_bvid(&expanded),
            Err(e) => {
                warn!(url, "{e}");
                None
            }
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--no-playlist".to_string(),
            "--add-header".to_string(),
            "Referer:https://www.bilibili.com".to_string(),
            "--merge-output-format".to_string(),
            "mp4".to_string(),
        ];
        args.extend(cookies::header_args(self.cookie.as_deref()));
        args
    }
}

#[async_trait]
impl Downloader for BilibiliDownloader {
    fn name(&self) -> &'static str {
        "bilibili"
    }

    async fn download(&self, url: &str) -> DownloadResult {
        let Some(bvid) = self.bvid_for(url).await else {
            return DownloadResult::failure("could not find a BV id in the link");
        };

        let template = self.temp_dir.join("%(id)s.%(ext)s");
        let out = match self.ytdlp.run(&canonical_url(&bvid), &template, &self.args()).await {
            Ok(out) => out,
            Err(e) => return DownloadResult::failure(e.to_string()),
        };
        let Some(finished) = out.files.first() else {
            return DownloadResult::failure(failure_reason(&out));
        };

        let title = finished.title.clone().unwrap_or_else(|| bvid.clone());
        let ext = match extension(&finished.filepath) {
            e if e.is_empty() => "mp4".to_string(),
            e => e,
        };
        let dest = non_clobbering_path(&self.dest_dir, &sanitize_filename(&title), &ext);

        match move_file(&finished.filepath, &dest).await {
            Ok(path) => {
                info!(bvid = %bvid, path = %path.display(), "bilibili download finished");
                DownloadResult::success(path, title)
                    .with_meta("type", "video")
                    .with_meta("bvid", bvid)
                    .with_meta("author", finished.uploader.clone().unwrap_or_default())
            }
            Err(e) => DownloadResult::failure(format!("failed to move file: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::scratch_dir;

    #[test]
    fn bv_ids_are_found_anywhere() {
        assert_eq!(
            extract_bvid("【合集】 https://www.bilibili.com/video/BV1xx411c7mD?p=2").as_deref(),
            Some("BV1xx411c7mD")
        );
        assert!(extract_bvid("https://www.bilibili.com/video/av170001").is_none());
        assert_eq!(canonical_url("BV1xx411c7mD"), "https://www.bilibili.com/video/BV1xx411c7mD");
    }

    #[test]
    fn bad_proxy_is_a_config_error() {
        let res = BilibiliDownloader::new(
            Arc::new(YtDlp::new("yt-dlp", None, Duration::from_secs(1))),
            None,
            Some("not a url".to_string()),
            PathBuf::from("/tmp/t"),
            PathBuf::from("/tmp/d"),
        );
        assert!(matches!(res, Err(Error::Config(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn downloads_canonical_page_and_records_author() {
        let root = scratch_dir("bili");
        let temp = root.join("temp");
        std::fs::create_dir_all(&temp).unwrap();
        let tmp_file = temp.join("BV1xx411c7mD.mp4");
        std::fs::write(&tmp_file, b"v").unwrap();

        let line = format!(
            r#"{{"id":"BV1xx411c7mD","title":"Title","filepath":"{}","uploader":"UP主","playlist_title":null}}"#,
            tmp_file.display()
        );
        let program = crate::test_support::fake_ytdlp(&root, &line, "", 0);
        let d = BilibiliDownloader::new(
            Arc::new(YtDlp::new(program, None, Duration::from_secs(10))),
            Some("SESSDATA=x".to_string()),
            None,
            temp,
            root.join("bilibili"),
        )
        .unwrap();

        let res = d
            .download("https://www.bilibili.com/video/BV1xx411c7mD")
            .await;
        assert_eq!(res.meta("author"), Some("UP主"));
        assert_eq!(res.meta("bvid"), Some("BV1xx411c7mD"));
        match res {
            DownloadResult::Success { artifact_path, .. } => {
                assert_eq!(artifact_path, root.join("bilibili/Title.mp4"));
            }
            other => panic!("unexpected {other:?}"),
        }
        let _ = std::fs::remove_dir_all(root);
    }
}
