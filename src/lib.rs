/// Tunnel Agent 库入口
///
/// 通过正向代理的 CONNECT 隧道发送 HTTP/HTTPS 请求，
/// 复用同源隧道并限制并发隧道数
pub mod agent;
pub mod config;
pub mod error;
pub mod handshake;
pub mod logging;
pub mod pool;
pub mod request;
pub mod secure;
pub mod socket;
pub mod tls;
pub mod transport;

// 重新导出常用类型
pub use agent::{AgentStats, PendingTunnel, TunnelingAgent};
pub use config::{AgentConfig, AgentConfigBuilder, ProxyConfig, TlsMaterial, TunnelVariant};
pub use error::{Result, TunnelError};
pub use request::{OriginRequest, RequestId, TunnelTarget};
pub use socket::TunnelSocket;
pub use transport::{BoxedStream, PlainProxyConnector, ProxyConnector, TlsProxyConnector};
