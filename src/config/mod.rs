// 配置管理模块 - 使用模块化设计

mod builder;
mod validator;

// 重新导出 builder 和 validator
pub use builder::AgentConfigBuilder;
pub use validator::ConfigValidator;

use crate::request::{OriginRequest, TunnelTarget};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// 默认最大套接字数（不限制）
pub const DEFAULT_MAX_SOCKETS: usize = usize::MAX;

/// 隧道变体：目标是否 TLS × 代理连接是否 TLS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TunnelVariant {
    /// 明文目标，明文代理
    #[default]
    HttpOverHttp,
    /// TLS 目标，明文代理
    HttpsOverHttp,
    /// 明文目标，TLS 代理
    HttpOverHttps,
    /// TLS 目标，TLS 代理（双重 TLS）
    HttpsOverHttps,
}

impl TunnelVariant {
    /// 隧道建立后是否需要再包一层 TLS
    pub fn destination_uses_tls(self) -> bool {
        matches!(self, Self::HttpsOverHttp | Self::HttpsOverHttps)
    }

    /// 连接代理本身是否使用 TLS
    pub fn proxy_uses_tls(self) -> bool {
        matches!(self, Self::HttpOverHttps | Self::HttpsOverHttps)
    }
}

impl std::fmt::Display for TunnelVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HttpOverHttp => write!(f, "http-over-http"),
            Self::HttpsOverHttp => write!(f, "https-over-http"),
            Self::HttpOverHttps => write!(f, "http-over-https"),
            Self::HttpsOverHttps => write!(f, "https-over-https"),
        }
    }
}

impl std::str::FromStr for TunnelVariant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "http-over-http" => Ok(Self::HttpOverHttp),
            "https-over-http" => Ok(Self::HttpsOverHttp),
            "http-over-https" => Ok(Self::HttpOverHttps),
            "https-over-https" => Ok(Self::HttpsOverHttps),
            _ => anyhow::bail!("Unknown tunnel variant: {}", s),
        }
    }
}

/// TLS 材料（CA 列表、客户端证书/私钥、服务器名）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsMaterial {
    /// CA 证书路径列表（为空时使用系统 CA）
    #[serde(default)]
    pub ca_paths: Vec<PathBuf>,
    /// 客户端证书路径
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// 客户端私钥路径
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// TLS 服务器名
    #[serde(default)]
    pub server_name: Option<String>,
    /// 跳过证书验证（仅用于测试）
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// 代理端点配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// 代理主机
    pub host: String,
    /// 代理端口
    pub port: u16,
    /// 明文凭据 `user:pass`，发送时做 base64 编码
    #[serde(default)]
    pub proxy_auth: Option<String>,
    /// 附加到每个 CONNECT 请求的头
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// 连接代理时的本地绑定地址
    #[serde(default)]
    pub local_address: Option<IpAddr>,
    /// 代理连接的 TLS 材料（*-over-https 变体）
    #[serde(default)]
    pub tls: Option<TlsMaterial>,
    /// TCP keepalive 探测时间（秒）
    #[serde(default)]
    pub keepalive_secs: Option<u64>,
}

impl ProxyConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            proxy_auth: None,
            headers: BTreeMap::new(),
            local_address: None,
            tls: None,
            keepalive_secs: None,
        }
    }

    /// 代理地址 `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_max_sockets() -> usize {
    DEFAULT_MAX_SOCKETS
}

/// Agent 配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// 隧道变体
    #[serde(default)]
    pub variant: TunnelVariant,
    /// 并发隧道套接字上限
    #[serde(default = "default_max_sockets")]
    pub max_sockets: usize,
    /// 代理配置
    pub proxy: ProxyConfig,
    /// Agent 级默认本地绑定地址
    #[serde(default)]
    pub local_address: Option<IpAddr>,
    /// 目标 TLS 材料（https-over-* 变体）
    #[serde(default)]
    pub tls: Option<TlsMaterial>,
}

impl AgentConfig {
    pub fn new(variant: TunnelVariant, proxy: ProxyConfig) -> Self {
        Self {
            variant,
            max_sockets: DEFAULT_MAX_SOCKETS,
            proxy,
            local_address: None,
            tls: None,
        }
    }

    /// 明文经明文代理
    pub fn http_over_http(proxy: ProxyConfig) -> Self {
        Self::new(TunnelVariant::HttpOverHttp, proxy)
    }

    /// TLS 经明文代理
    pub fn https_over_http(proxy: ProxyConfig) -> Self {
        Self::new(TunnelVariant::HttpsOverHttp, proxy)
    }

    /// 明文经 TLS 代理
    pub fn http_over_https(proxy: ProxyConfig) -> Self {
        Self::new(TunnelVariant::HttpOverHttps, proxy)
    }

    /// TLS 经 TLS 代理
    pub fn https_over_https(proxy: ProxyConfig) -> Self {
        Self::new(TunnelVariant::HttpsOverHttps, proxy)
    }

    /// 从 TOML 文本解析并校验
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AgentConfig =
            toml::from_str(content).context("Failed to parse agent configuration")?;
        ConfigValidator::validate_agent_config(&config)?;
        Ok(config)
    }

    /// 从 TOML 文件加载
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml_str(&content)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        ConfigValidator::validate_agent_config(self)
    }

    /// 代理连接使用的 TLS 材料（未配置时使用默认值）
    pub fn proxy_tls(&self) -> TlsMaterial {
        self.proxy.tls.clone().unwrap_or_default()
    }

    /// 目标 TLS 会话使用的 TLS 材料
    pub fn destination_tls(&self) -> TlsMaterial {
        self.tls.clone().unwrap_or_default()
    }
}

/// 归一化请求目标
///
/// `local_address` 的优先级：请求 > Agent > 代理。
pub fn resolve_target(request: &OriginRequest, config: &AgentConfig) -> TunnelTarget {
    TunnelTarget {
        host: request.host.clone(),
        port: request.port,
        local_address: request
            .local_address
            .or(config.local_address)
            .or(config.proxy.local_address),
    }
}
