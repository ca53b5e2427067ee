//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `REACH__*` 覆盖（双下划线表示嵌套，如 `REACH__BROWSER__MODE=dry-run`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::store::DelayRange;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub server: ServerSection,
    pub store: StoreSection,
    pub llm: LlmSection,
    pub browser: BrowserSection,
    pub session: SessionSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [server] 段：监听地址、事件队列容量、上传大小上限
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 每个观察者的事件队列容量，满则丢弃
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_event_buffer() -> usize {
    256
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            event_buffer: default_event_buffer(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

/// [store] 段：未设置 db_path 时使用内存存储
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreSection {
    pub db_path: Option<PathBuf>,
}

/// [llm] 段：草拟服务后端与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// 全局凭据；会话自带的凭据优先
    pub api_key: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

fn default_provider() -> String {
    "openai".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            base_url: None,
            api_key: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

impl LlmSection {
    /// 全局凭据：配置项优先，其次按后端读取环境变量
    pub fn resolve_api_key(&self) -> Option<String> {
        let from_env = |name: &str| std::env::var(name).ok();
        let key = self.api_key.clone().or_else(|| match self.provider.as_str() {
            "deepseek" => from_env("DEEPSEEK_API_KEY").or_else(|| from_env("OPENAI_API_KEY")),
            _ => from_env("OPENAI_API_KEY"),
        });
        key.filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次草拟请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

/// 浏览器控制方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BrowserMode {
    Chrome,
    /// 不操作真实页面，只记录动作
    #[default]
    DryRun,
}

/// [browser] 段
#[derive(Debug, Clone, Deserialize)]
pub struct BrowserSection {
    #[serde(default)]
    pub mode: BrowserMode,
    #[serde(default = "default_headless")]
    pub headless: bool,
    /// Chrome 用户数据目录（保留登录态）；未设置时读取 CHROME_PROFILE_PATH
    pub profile_dir: Option<PathBuf>,
    #[serde(default = "default_page_timeout_secs")]
    pub page_timeout_secs: u64,
    /// 每次页面操作后的等待（毫秒）
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

fn default_headless() -> bool {
    false
}

fn default_page_timeout_secs() -> u64 {
    30
}

fn default_settle_delay_ms() -> u64 {
    1500
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            mode: BrowserMode::default(),
            headless: default_headless(),
            profile_dir: None,
            page_timeout_secs: default_page_timeout_secs(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

impl BrowserSection {
    pub fn resolve_profile_dir(&self) -> Option<PathBuf> {
        self.profile_dir
            .clone()
            .or_else(|| std::env::var("CHROME_PROFILE_PATH").ok().map(PathBuf::from))
    }
}

/// [session] 段：新会话默认值与循环节奏
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_countdown_secs")]
    pub countdown_secs: u32,
    #[serde(default)]
    pub connection_delay: DelayRange,
    #[serde(default = "default_auto_send")]
    pub auto_send: bool,
    /// 暂停门兜底轮询间隔（毫秒）
    #[serde(default = "default_pause_poll_ms")]
    pub pause_poll_ms: u64,
    /// stop 等待循环退出的上限（秒）
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

fn default_countdown_secs() -> u32 {
    5
}

fn default_auto_send() -> bool {
    true
}

fn default_pause_poll_ms() -> u64 {
    1000
}

fn default_stop_grace_secs() -> u64 {
    10
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            countdown_secs: default_countdown_secs(),
            connection_delay: DelayRange::default(),
            auto_send: default_auto_send(),
            pause_poll_ms: default_pause_poll_ms(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}

impl SessionSection {
    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// 从 config 目录加载配置，环境变量 REACH__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 REACH__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("REACH")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.max_upload_bytes, 10 * 1024 * 1024);
        assert_eq!(config.session.countdown_secs, 5);
        assert_eq!(config.session.connection_delay, DelayRange::new(2, 6));
        assert_eq!(config.session.pause_poll(), Duration::from_secs(1));
        assert_eq!(config.browser.mode, BrowserMode::DryRun);
        assert_eq!(config.llm.timeouts.request, 30);
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[session]\ncountdown_secs = 3\nconnection_delay = \"0-1\"\n\n[browser]\nmode = \"chrome\"\nheadless = true"
        )
        .unwrap();

        let config = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.session.countdown_secs, 3);
        assert_eq!(config.session.connection_delay, DelayRange::new(0, 1));
        assert_eq!(config.browser.mode, BrowserMode::Chrome);
        assert!(config.browser.headless);
        assert_eq!(config.session.stop_grace_secs, 10);
    }
}
