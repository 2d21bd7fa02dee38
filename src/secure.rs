use crate::config::TlsMaterial;
use crate::tls;
use crate::transport::BoxedStream;
use anyhow::{Context, Result};
use std::io;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// 目标 TLS 会话包装器
///
/// 在明文隧道建立后，于隧道之上发起到目标的 TLS 会话。
pub struct SecureSocketWrapper {
    connector: TlsConnector,
    /// 配置的服务器名，无 Host 头时使用
    server_name: Option<String>,
}

impl SecureSocketWrapper {
    pub fn from_material(material: &TlsMaterial) -> Result<Self> {
        let config =
            tls::load_client_config(material).context("Failed to load destination TLS material")?;
        Ok(Self {
            connector: TlsConnector::from(config),
            server_name: material.server_name.clone(),
        })
    }

    /// 本次会话使用的服务器名：Host 头 > 配置的 `server_name` > 目标主机
    pub fn server_name_for(&self, host_header: Option<&str>, target_host: &str) -> String {
        let fallback = self.server_name.as_deref().unwrap_or(target_host);
        derive_server_name(host_header, fallback)
    }

    /// 在隧道上完成 TLS 握手，返回 TLS 会话
    pub async fn wrap(&self, stream: BoxedStream, server_name: &str) -> io::Result<BoxedStream> {
        let name = tls::server_name(server_name)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let tls_stream = self.connector.connect(name, stream).await?;
        debug!("TLS session established over tunnel to {}", server_name);
        Ok(Box::pin(tls_stream))
    }
}

/// 推导 TLS 服务器名
///
/// 优先使用源请求的 Host 头（去掉端口），否则回退到隧道目标主机。
pub fn derive_server_name(host_header: Option<&str>, target_host: &str) -> String {
    let Some(header) = host_header.map(str::trim).filter(|h| !h.is_empty()) else {
        return target_host.to_string();
    };

    // [v6]:port
    if let Some(rest) = header.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_string();
        }
    }

    // 裸 IPv6 地址不含端口
    if header.matches(':').count() > 1 {
        return header.to_string();
    }

    match header.split_once(':') {
        Some((host, _port)) => host.to_string(),
        None => header.to_string(),
    }
}
