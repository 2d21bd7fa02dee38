use anyhow::{bail, Result};
use http::{HeaderName, HeaderValue};
use tracing::warn;

use super::{AgentConfig, ProxyConfig, TlsMaterial};

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证套接字上限
    pub fn validate_max_sockets(max_sockets: usize) -> Result<()> {
        if max_sockets == 0 {
            bail!("max_sockets must be greater than 0");
        }
        Ok(())
    }

    /// 验证代理凭据
    pub fn validate_proxy_auth(auth: &str) -> Result<()> {
        if auth.is_empty() {
            bail!("proxy.proxy_auth cannot be empty when set");
        }
        if !auth.contains(':') {
            warn!("proxy.proxy_auth has no ':' separator, sending it as-is");
        }
        Ok(())
    }

    /// 验证附加头名称与值
    pub fn validate_headers<'a>(headers: impl IntoIterator<Item = (&'a String, &'a String)>) -> Result<()> {
        for (name, value) in headers {
            if HeaderName::from_bytes(name.as_bytes()).is_err() {
                bail!("proxy.headers: invalid header name '{}'", name);
            }
            if HeaderValue::from_str(value).is_err() {
                bail!("proxy.headers: invalid value for header '{}'", name);
            }
        }
        Ok(())
    }

    /// 验证 TLS 材料
    pub fn validate_tls_material(tls: &TlsMaterial, context: &str) -> Result<()> {
        match (&tls.cert_path, &tls.key_path) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => bail!("{}: cert_path and key_path must both be set, or both omitted", context),
        }

        if let Some(ref name) = tls.server_name {
            Self::validate_address(name, &format!("{} server_name", context))?;
        }

        if tls.insecure_skip_verify {
            warn!(
                "{}: certificate verification is disabled, use only for testing",
                context
            );
        }
        Ok(())
    }

    /// 验证代理配置
    pub fn validate_proxy_config(proxy: &ProxyConfig) -> Result<()> {
        Self::validate_address(&proxy.host, "proxy.host")?;
        Self::validate_port(proxy.port, "proxy.port")?;

        if let Some(ref auth) = proxy.proxy_auth {
            Self::validate_proxy_auth(auth)?;
        }

        Self::validate_headers(&proxy.headers)?;

        if let Some(ref tls) = proxy.tls {
            Self::validate_tls_material(tls, "proxy.tls")?;
        }

        if proxy.keepalive_secs == Some(0) {
            bail!("proxy.keepalive_secs must be greater than 0");
        }
        Ok(())
    }

    /// 验证 Agent 配置
    pub fn validate_agent_config(config: &AgentConfig) -> Result<()> {
        Self::validate_max_sockets(config.max_sockets)?;
        Self::validate_proxy_config(&config.proxy)?;

        if let Some(ref tls) = config.tls {
            Self::validate_tls_material(tls, "tls")?;
        }

        // 变体与 TLS 材料不匹配时只提示，不视为错误
        if config.proxy.tls.is_some() && !config.variant.proxy_uses_tls() {
            warn!(
                "proxy.tls is set but variant {} does not use TLS to the proxy",
                config.variant
            );
        }
        if config.tls.is_some() && !config.variant.destination_uses_tls() {
            warn!(
                "tls is set but variant {} does not use TLS to the destination",
                config.variant
            );
        }

        Ok(())
    }
}
