use anyhow::Result;
use std::collections::BTreeMap;
use std::net::IpAddr;

use super::{validator::ConfigValidator, AgentConfig, ProxyConfig, TlsMaterial, TunnelVariant};

/// AgentConfig Builder
#[derive(Debug, Default)]
pub struct AgentConfigBuilder {
    variant: TunnelVariant,
    max_sockets: Option<usize>,
    proxy_host: Option<String>,
    proxy_port: Option<u16>,
    proxy_auth: Option<String>,
    proxy_headers: BTreeMap<String, String>,
    proxy_local_address: Option<IpAddr>,
    proxy_tls: Option<TlsMaterial>,
    keepalive_secs: Option<u64>,
    local_address: Option<IpAddr>,
    tls: Option<TlsMaterial>,
}

impl AgentConfigBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置隧道变体
    pub fn variant(mut self, variant: TunnelVariant) -> Self {
        self.variant = variant;
        self
    }

    /// 设置套接字上限
    pub fn max_sockets(mut self, max: usize) -> Self {
        self.max_sockets = Some(max);
        self
    }

    /// 设置代理地址
    pub fn proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.proxy_host = Some(host.into());
        self.proxy_port = Some(port);
        self
    }

    /// 设置代理凭据 `user:pass`
    pub fn proxy_auth(mut self, auth: impl Into<String>) -> Self {
        self.proxy_auth = Some(auth.into());
        self
    }

    /// 添加 CONNECT 附加头
    pub fn proxy_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.proxy_headers.insert(name.into(), value.into());
        self
    }

    /// 设置代理级本地绑定地址
    pub fn proxy_local_address(mut self, addr: IpAddr) -> Self {
        self.proxy_local_address = Some(addr);
        self
    }

    /// 设置代理连接 TLS 材料
    pub fn proxy_tls(mut self, tls: TlsMaterial) -> Self {
        self.proxy_tls = Some(tls);
        self
    }

    /// 设置 TCP keepalive
    pub fn keepalive_secs(mut self, secs: u64) -> Self {
        self.keepalive_secs = Some(secs);
        self
    }

    /// 设置 Agent 级本地绑定地址
    pub fn local_address(mut self, addr: IpAddr) -> Self {
        self.local_address = Some(addr);
        self
    }

    /// 设置目标 TLS 材料
    pub fn tls(mut self, tls: TlsMaterial) -> Self {
        self.tls = Some(tls);
        self
    }

    /// 构建 AgentConfig
    pub fn build(self) -> Result<AgentConfig> {
        let host = self
            .proxy_host
            .ok_or_else(|| anyhow::anyhow!("proxy host is required"))?;
        let port = self
            .proxy_port
            .ok_or_else(|| anyhow::anyhow!("proxy port is required"))?;

        let config = AgentConfig {
            variant: self.variant,
            max_sockets: self.max_sockets.unwrap_or(super::DEFAULT_MAX_SOCKETS),
            proxy: ProxyConfig {
                host,
                port,
                proxy_auth: self.proxy_auth,
                headers: self.proxy_headers,
                local_address: self.proxy_local_address,
                tls: self.proxy_tls,
                keepalive_secs: self.keepalive_secs,
            },
            local_address: self.local_address,
            tls: self.tls,
        };

        ConfigValidator::validate_agent_config(&config)?;
        Ok(config)
    }
}
