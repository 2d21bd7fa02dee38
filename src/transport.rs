use crate::config::{AgentConfig, ProxyConfig};
use crate::tls;
use anyhow::Context;
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// 传输层连接抽象
///
/// 统一封装明文 TCP 与 TLS 连接
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

// 为所有满足条件的类型自动实现 Transport
impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 装箱后的传输层连接
pub type BoxedStream = Pin<Box<dyn Transport>>;

/// 连接代理的策略接口
///
/// 不同变体注入不同实现（明文 / TLS），握手过程本身与之无关。
#[async_trait]
pub trait ProxyConnector: Send + Sync {
    /// 建立到代理的连接
    async fn connect(&self, local_address: Option<IpAddr>) -> io::Result<BoxedStream>;

    /// 代理地址描述（用于日志）
    fn describe(&self) -> String;
}

/// 明文 TCP 代理连接器
pub struct PlainProxyConnector {
    host: String,
    port: u16,
    keepalive: Option<Duration>,
}

impl PlainProxyConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            keepalive: None,
        }
    }

    pub fn from_config(proxy: &ProxyConfig) -> Self {
        Self {
            host: proxy.host.clone(),
            port: proxy.port,
            keepalive: proxy.keepalive_secs.map(Duration::from_secs),
        }
    }

    /// 建立 TCP 连接，可选绑定本地地址
    async fn connect_tcp(&self, local_address: Option<IpAddr>) -> io::Result<TcpStream> {
        let stream = match local_address {
            None => TcpStream::connect((self.host.as_str(), self.port)).await?,
            Some(local) => {
                let mut last_err = None;
                let mut connected = None;
                for remote in lookup_host((self.host.as_str(), self.port)).await? {
                    // 本地地址族必须与远端一致
                    if remote.is_ipv4() != local.is_ipv4() {
                        continue;
                    }
                    match connect_from(local, remote).await {
                        Ok(stream) => {
                            connected = Some(stream);
                            break;
                        }
                        Err(e) => last_err = Some(e),
                    }
                }
                match connected {
                    Some(stream) => stream,
                    None => {
                        return Err(last_err.unwrap_or_else(|| {
                            io::Error::new(
                                io::ErrorKind::AddrNotAvailable,
                                format!(
                                    "No address of {}:{} matches local address {}",
                                    self.host, self.port, local
                                ),
                            )
                        }))
                    }
                }
            }
        };

        apply_keepalive(&stream, self.keepalive);
        Ok(stream)
    }
}

async fn connect_from(local: IpAddr, remote: SocketAddr) -> io::Result<TcpStream> {
    let socket = if remote.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.bind(SocketAddr::new(local, 0))?;
    socket.connect(remote).await
}

fn apply_keepalive(stream: &TcpStream, keepalive: Option<Duration>) {
    let Some(time) = keepalive else {
        return;
    };

    let keepalive = TcpKeepalive::new().with_time(time);
    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!(
            "Failed to set TCP keepalive on {}: {}",
            stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".into()),
            e
        );
    }
}

#[async_trait]
impl ProxyConnector for PlainProxyConnector {
    async fn connect(&self, local_address: Option<IpAddr>) -> io::Result<BoxedStream> {
        let stream = self.connect_tcp(local_address).await?;
        debug!("Connected to proxy {}:{}", self.host, self.port);
        Ok(Box::pin(stream))
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// TLS 代理连接器（*-over-https 变体）
pub struct TlsProxyConnector {
    plain: PlainProxyConnector,
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsProxyConnector {
    pub fn new(
        plain: PlainProxyConnector,
        connector: TlsConnector,
        server_name: ServerName<'static>,
    ) -> Self {
        Self {
            plain,
            connector,
            server_name,
        }
    }
}

#[async_trait]
impl ProxyConnector for TlsProxyConnector {
    async fn connect(&self, local_address: Option<IpAddr>) -> io::Result<BoxedStream> {
        let tcp_stream = self.plain.connect_tcp(local_address).await?;
        let tls_stream = self
            .connector
            .connect(self.server_name.clone(), tcp_stream)
            .await?;
        debug!("TLS connection established to proxy {}", self.plain.describe());
        Ok(Box::pin(tls_stream))
    }

    fn describe(&self) -> String {
        format!("tls://{}", self.plain.describe())
    }
}

/// 按变体创建代理连接器
pub fn create_proxy_connector(config: &AgentConfig) -> anyhow::Result<Arc<dyn ProxyConnector>> {
    let plain = PlainProxyConnector::from_config(&config.proxy);

    let connector: Arc<dyn ProxyConnector> = if config.variant.proxy_uses_tls() {
        let material = config.proxy_tls();
        let client_config =
            tls::load_client_config(&material).context("Failed to load proxy TLS material")?;
        let name = material
            .server_name
            .clone()
            .unwrap_or_else(|| config.proxy.host.clone());
        let server_name = tls::server_name(&name)?;
        Arc::new(TlsProxyConnector::new(
            plain,
            TlsConnector::from(client_config),
            server_name,
        ))
    } else {
        Arc::new(plain)
    };

    Ok(connector)
}
