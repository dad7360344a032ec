//! Pick a downloader route for an inbound message.

use std::{fmt, sync::OnceLock};

use regex::Regex;

use crate::messaging::types::InboundMessage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Route {
    NativeMedia,
    /// YouTube.
    SiteA,
    /// Douyin share links.
    SiteB,
    /// Bilibili.
    SiteC,
    None,
}

impl Route {
    pub fn as_str(self) -> &'static str {
        match self {
            Route::NativeMedia => "native",
            Route::SiteA => "youtube",
            Route::SiteB => "douyin",
            Route::SiteC => "bilibili",
            Route::None => "none",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const SITE_C_DOMAINS: [&str; 2] = ["bilibili.com", "b23.tv"];

fn site_a() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(https?://)?(www\.|m\.)?(youtube\.com|youtu\.be)/").ok())
        .as_ref()
}

fn site_b() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(https?://)?v\.douyin\.com/[A-Za-z0-9_\-]+/").ok())
        .as_ref()
}

/// Route for raw text plus an attachment flag.
///
/// Links win over the attachment, so a link with a preview image still
/// routes by link type.
pub fn classify_text(text: &str, has_media: bool) -> Route {
    if site_a().is_some_and(|re| re.is_match(text)) {
        return Route::SiteA;
    }
    if site_b().is_some_and(|re| re.is_match(text)) {
        return Route::SiteB;
    }
    if SITE_C_DOMAINS.iter().any(|d| text.contains(d)) {
        return Route::SiteC;
    }
    if has_media {
        return Route::NativeMedia;
    }
    Route::None
}

pub fn classify(msg: &InboundMessage) -> Route {
    classify_text(&msg.text, !msg.media.is_none())
}

/// The URL the chosen route should download, cut out of surrounding text.
///
/// Site A links are anchored, so the first whitespace-separated token is the
/// link. Sites B and C may appear mid-sentence (share texts), so the first
/// token carrying the site's domain is taken.
pub fn extract_link(route: Route, text: &str) -> Option<String> {
    let text = text.trim();
    match route {
        Route::SiteA => text.split_whitespace().next().map(str::to_string),
        Route::SiteB => site_b()
            .and_then(|re| re.find(text))
            .map(|m| with_scheme(m.as_str())),
        Route::SiteC => text
            .split_whitespace()
            .find(|tok| SITE_C_DOMAINS.iter().any(|d| tok.contains(d)))
            .map(with_scheme),
        Route::NativeMedia | Route::None => None,
    }
}

fn with_scheme(link: &str) -> String {
    if link.starts_with("http://") || link.starts_with("https://") {
        link.to_string()
    } else {
        format!("https://{link}")
    }
}
