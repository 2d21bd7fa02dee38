use crate::error::Result;
use crate::socket::TunnelSocket;
use std::fmt;
use std::net::IpAddr;
use tokio::sync::oneshot;
use uuid::Uuid;

/// 调用方发起的源请求描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginRequest {
    /// 目标主机
    pub host: String,
    /// 目标端口
    pub port: u16,
    /// 请求级本地绑定地址
    pub local_address: Option<IpAddr>,
    /// 源请求声明的 Host 头（用于推导 TLS SNI）
    pub host_header: Option<String>,
}

impl OriginRequest {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            local_address: None,
            host_header: None,
        }
    }

    /// 设置本地绑定地址
    pub fn with_local_address(mut self, addr: IpAddr) -> Self {
        self.local_address = Some(addr);
        self
    }

    /// 设置 Host 头
    pub fn with_host_header(mut self, value: impl Into<String>) -> Self {
        self.host_header = Some(value.into());
        self
    }
}

/// 归一化后的隧道目标 `{host, port, local_address}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub host: String,
    pub port: u16,
    pub local_address: Option<IpAddr>,
}

impl TunnelTarget {
    /// CONNECT 请求路径 `host:port`
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// 是否与另一目标指向同一源（只比较 host 与 port）
    pub fn same_origin(&self, other: &TunnelTarget) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// 请求标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// 等待隧道的请求
///
/// 任一时刻只被等待队列或一次进行中的握手持有（按值移动）。
pub struct TunnelRequest {
    pub id: RequestId,
    pub target: TunnelTarget,
    pub host_header: Option<String>,
    responder: oneshot::Sender<Result<TunnelSocket>>,
}

impl fmt::Debug for TunnelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelRequest")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("host_header", &self.host_header)
            .finish_non_exhaustive()
    }
}

impl TunnelRequest {
    pub fn new(
        id: RequestId,
        target: TunnelTarget,
        host_header: Option<String>,
        responder: oneshot::Sender<Result<TunnelSocket>>,
    ) -> Self {
        Self {
            id,
            target,
            host_header,
            responder,
        }
    }

    /// 调用方是否已放弃等待
    pub fn is_abandoned(&self) -> bool {
        self.responder.is_closed()
    }

    /// 将隧道套接字绑定到请求
    ///
    /// 若调用方已放弃，套接字原样返回，由调用者处理。
    pub fn attach(self, socket: TunnelSocket) -> std::result::Result<(), TunnelSocket> {
        match self.responder.send(Ok(socket)) {
            Ok(()) => Ok(()),
            Err(Ok(socket)) => Err(socket),
            Err(Err(_)) => Ok(()),
        }
    }

    /// 向请求投递错误
    pub fn fail(self, err: crate::error::TunnelError) {
        let _ = self.responder.send(Err(err));
    }
}
