use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// 开启诊断输出的关键字
pub const DEBUG_KEYWORD: &str = "tunnel";

/// 日志配置
///
/// 由调用方显式构造并传给 [`init`]，库本身不读取环境变量。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub enabled: bool,
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: "debug".to_string(),
        }
    }
}

impl LogConfig {
    /// 根据开关值判断是否开启（需完整匹配单词 `tunnel`）
    ///
    /// 例如 `"http,tunnel"` 开启，`"tunnels"` 不开启。
    pub fn from_toggle(value: Option<&str>) -> Self {
        let enabled = value
            .map(|v| {
                v.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .any(|word| word.eq_ignore_ascii_case(DEBUG_KEYWORD))
            })
            .unwrap_or(false);
        Self {
            enabled,
            ..Default::default()
        }
    }

    /// 对应的过滤表达式
    pub fn filter(&self) -> String {
        if self.enabled {
            format!("tunnel_agent={}", self.level)
        } else {
            "off".to_string()
        }
    }
}

/// 安装 fmt 订阅者，重复安装时返回错误
pub fn init(config: &LogConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.filter()))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))
}
