use std::{
    env, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{
    domain::ChatIdentifier,
    scheduler::{ScheduledMessage, DEFAULT_TIME},
    transfer::TransferRule,
    utils::ensure_dirs,
    Error, Result,
};

pub const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";
pub const DEFAULT_YOUTUBE_FORMAT: &str = "bv*+ba/best";
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 1800;

/// Typed configuration, read once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    // Core
    pub bot_token: String,
    pub log_level: String,
    pub config_path: PathBuf,
    pub dirs: Dirs,

    // Routing
    pub allowed_chat_ids: Vec<ChatIdentifier>,
    pub transfer_rules: Vec<TransferRule>,
    pub scheduled_messages: Vec<ScheduledMessage>,

    // Downloaders
    pub ytdlp_path: PathBuf,
    pub download_timeout: Duration,
    pub youtube: YoutubeSettings,
    pub douyin_cookie: Option<String>,
    pub bilibili_cookie: Option<String>,
    pub proxy: Option<ProxySettings>,

    /// Problems found while loading that did not stop the load. Logged by the
    /// caller once the subscriber is installed.
    pub warnings: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct YoutubeSettings {
    pub format: String,
    /// Raw `Cookie:` header value (`name=value; name2=value2`).
    pub cookies: Option<String>,
    /// Audio format to extract next to the video (`mp3`, `m4a`...).
    pub audio_format: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
}

impl ProxySettings {
    pub fn url(&self) -> String {
        format!("socks5://{}:{}", self.host, self.port)
    }
}

/// Values taken from the environment; they win over the file.
#[derive(Clone, Debug, Default)]
pub struct EnvOverrides {
    pub bot_token: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub ytdlp_path: Option<PathBuf>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            bot_token: env_str("TELEGRAM_BOT_TOKEN").and_then(non_empty),
            data_dir: env_path("MRB_DATA_DIR"),
            ytdlp_path: env_path("YTDLP_PATH"),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let config_path = env_path("MRB_CONFIG").unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let (contents, missing) = match fs::read_to_string(&config_path) {
            Ok(s) => (s, false),
            Err(e) if e.kind() == io::ErrorKind::NotFound => (String::new(), true),
            Err(e) => {
                return Err(Error::Config(format!(
                    "cannot read {}: {e}",
                    config_path.display()
                )))
            }
        };

        let mut cfg = Self::from_yaml_str(&contents, EnvOverrides::from_env())?;
        if missing {
            cfg.warnings.insert(
                0,
                format!("{} not found; using defaults", config_path.display()),
            );
        }
        cfg.config_path = config_path;
        Ok(cfg)
    }

    /// Build from YAML text. An empty document yields the defaults.
    pub fn from_yaml_str(yaml: &str, env: EnvOverrides) -> Result<Self> {
        let file: FileConfig = if yaml.trim().is_empty() {
            FileConfig::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        Self::from_parts(file, env)
    }

    fn from_parts(file: FileConfig, env: EnvOverrides) -> Result<Self> {
        let mut warnings = Vec::new();

        let bot_token = env
            .bot_token
            .or_else(|| non_empty(file.bot_account.token.clone()))
            .ok_or_else(|| {
                Error::Config(
                    "bot token is required (TELEGRAM_BOT_TOKEN or bot_account.token)".to_string(),
                )
            })?;

        let allowed_chat_ids = file
            .allowed_chat_ids
            .iter()
            .enumerate()
            .filter_map(|(i, v)| match identifier(v) {
                Ok(Some(id)) => Some(id),
                Ok(None) => None,
                Err(e) => {
                    warnings.push(format!("allowed_chat_ids[{i}] ignored: {e}"));
                    None
                }
            })
            .collect();

        let transfer_rules = file
            .transfer_message
            .into_iter()
            .enumerate()
            .filter_map(|(i, raw)| match raw.into_rule() {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warnings.push(format!("transfer rule #{} skipped: {e}", i + 1));
                    None
                }
            })
            .collect();

        let scheduled_messages = file
            .scheduled_messages
            .into_iter()
            .enumerate()
            .filter_map(|(i, raw)| match raw.into_message() {
                Ok(m) => Some(m),
                Err(e) => {
                    warnings.push(format!("scheduled message #{} skipped: {e}", i + 1));
                    None
                }
            })
            .collect();

        let proxy = if file.proxy.enabled {
            Some(ProxySettings {
                host: file.proxy.host,
                port: file.proxy.port,
            })
        } else {
            None
        };

        let youtube = YoutubeSettings {
            format: non_empty(file.youtube_download.format)
                .unwrap_or_else(|| DEFAULT_YOUTUBE_FORMAT.to_string()),
            cookies: non_empty(file.youtube_download.cookies),
            audio_format: if file.youtube_audio_convert.enabled {
                Some(
                    non_empty(file.youtube_audio_convert.format)
                        .unwrap_or_else(|| "mp3".to_string()),
                )
            } else {
                None
            },
        };

        let ytdlp_path = env
            .ytdlp_path
            .or_else(|| which_in_path("yt-dlp"))
            .unwrap_or_else(|| PathBuf::from("yt-dlp"));

        Ok(Self {
            bot_token,
            log_level: file.log_level,
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            dirs: Dirs::new(env.data_dir.unwrap_or_else(|| PathBuf::from("."))),
            allowed_chat_ids,
            transfer_rules,
            scheduled_messages,
            ytdlp_path,
            download_timeout: Duration::from_secs(file.download_timeout_secs.max(1)),
            youtube,
            douyin_cookie: non_empty(file.douyin.cookie),
            bilibili_cookie: non_empty(file.bilibili.cookie),
            proxy,
            warnings,
        })
    }

    /// Numeric ids referenced by rules and schedules, for chat discovery.
    pub fn referenced_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .transfer_rules
            .iter()
            .flat_map(|r| [r.source_chat.as_id(), r.target_chat.as_id()])
            .chain(self.scheduled_messages.iter().map(|m| m.chat.as_id()))
            .flatten()
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

// ============== Directories ==============

/// On-disk layout under the data directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dirs {
    pub base: PathBuf,
}

impl Dirs {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn downloads(&self) -> PathBuf {
        self.base.join("downloads")
    }

    /// Root of the per-kind chat media folders.
    pub fn telegram(&self) -> PathBuf {
        self.downloads().join("telegram")
    }

    pub fn youtube(&self) -> PathBuf {
        self.downloads().join("youtube")
    }

    pub fn audios(&self) -> PathBuf {
        self.downloads().join("audios")
    }

    pub fn douyin(&self) -> PathBuf {
        self.downloads().join("douyin")
    }

    pub fn bilibili(&self) -> PathBuf {
        self.downloads().join("bilibili")
    }

    pub fn temp(&self, name: &str) -> PathBuf {
        self.base.join("temp").join(name)
    }

    pub fn all(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = ["videos", "audios", "photos", "others"]
            .iter()
            .map(|k| self.telegram().join(k))
            .collect();
        out.extend([self.youtube(), self.audios(), self.douyin(), self.bilibili()]);
        out.extend(
            ["telegram", "youtube", "douyin", "bilibili", "relay"]
                .iter()
                .map(|t| self.temp(t)),
        );
        out
    }

    pub fn ensure(&self) -> Result<()> {
        ensure_dirs(self.all().as_slice())
    }
}

// ============== File Schema ==============

#[derive(Debug, Deserialize)]
#[serde(default)]
struct FileConfig {
    log_level: String,
    bot_account: BotAccount,
    allowed_chat_ids: Vec<serde_yaml::Value>,
    transfer_message: Vec<RawRule>,
    scheduled_messages: Vec<RawSchedule>,
    youtube_download: YoutubeDownload,
    youtube_audio_convert: AudioConvert,
    douyin: CookieOnly,
    bilibili: CookieOnly,
    proxy: RawProxy,
    download_timeout_secs: u64,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            bot_account: BotAccount::default(),
            allowed_chat_ids: Vec::new(),
            transfer_message: Vec::new(),
            scheduled_messages: Vec::new(),
            youtube_download: YoutubeDownload::default(),
            youtube_audio_convert: AudioConvert::default(),
            douyin: CookieOnly::default(),
            bilibili: CookieOnly::default(),
            proxy: RawProxy::default(),
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BotAccount {
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct YoutubeDownload {
    format: String,
    cookies: String,
}

impl Default for YoutubeDownload {
    fn default() -> Self {
        Self {
            format: DEFAULT_YOUTUBE_FORMAT.to_string(),
            cookies: String::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AudioConvert {
    enabled: bool,
    format: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CookieOnly {
    cookie: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawProxy {
    enabled: bool,
    host: String,
    port: u16,
}

impl Default for RawProxy {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 7890,
        }
    }
}

/// A single string is accepted wherever a list is.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringList {
    One(String),
    Many(Vec<String>),
}

impl Default for StringList {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl StringList {
    fn cleaned(self) -> Vec<String> {
        let items = match self {
            Self::One(s) => vec![s],
            Self::Many(v) => v,
        };
        items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRule {
    source_chat: serde_yaml::Value,
    target_chat: serde_yaml::Value,
    #[serde(alias = "keywords")]
    include_keywords: StringList,
    exclude_words: StringList,
    direct: bool,
}

impl RawRule {
    fn into_rule(self) -> std::result::Result<TransferRule, String> {
        let source_chat = identifier(&self.source_chat)?.ok_or("missing source_chat")?;
        let target_chat = identifier(&self.target_chat)?.ok_or("missing target_chat")?;
        Ok(TransferRule {
            source_chat,
            target_chat,
            include_keywords: self.include_keywords.cleaned(),
            exclude_words: self.exclude_words.cleaned(),
            direct: self.direct,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSchedule {
    chat_id: serde_yaml::Value,
    message: String,
    time: Option<String>,
    cron: Option<String>,
}

impl RawSchedule {
    fn into_message(self) -> std::result::Result<ScheduledMessage, String> {
        let chat = identifier(&self.chat_id)?.ok_or("missing chat_id")?;
        if self.message.trim().is_empty() {
            return Err("missing message".to_string());
        }
        let built = match self.cron.as_deref().map(str::trim) {
            Some(expr) if !expr.is_empty() => ScheduledMessage::cron(chat, self.message, expr),
            _ => {
                let time = self.time.as_deref().unwrap_or(DEFAULT_TIME);
                ScheduledMessage::daily(chat, self.message, time)
            }
        };
        built.map_err(|e| e.to_string())
    }
}

/// `Ok(None)` for null / blank values.
fn identifier(v: &serde_yaml::Value) -> std::result::Result<Option<ChatIdentifier>, String> {
    match v {
        serde_yaml::Value::Null => Ok(None),
        serde_yaml::Value::String(s) if s.trim().is_empty() => Ok(None),
        other => serde_yaml::from_value::<ChatIdentifier>(other.clone())
            .map(Some)
            .map_err(|e| e.to_string()),
    }
}

// ============== Env Helpers ==============

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let key = k.trim();
        if key.is_empty() || env::var_os(key).is_some() {
            continue;
        }

        let v = v.trim();
        let val = v
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .or_else(|| v.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
            .unwrap_or(v);

        env::set_var(key, val);
    }
}

fn which_in_path(binary: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable_file(candidate))
}

fn is_executable_file(p: &Path) -> bool {
    if !p.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(md) = fs::metadata(p) {
            return (md.permissions().mode() & 0o111) != 0;
        }
    }
    true
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s.trim().to_string())
    }
}
