/// 自定义错误类型
///
/// 握手失败、配置错误与生命周期错误都通过请求自己的应答通道送达，
/// 调用者可以按变体区分处理
use std::io;
use thiserror::Error;

/// 隧道代理的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 代理拒绝或重定向了 CONNECT 请求
    #[error("Tunneling socket could not be established, status code: {status}")]
    HandshakeStatus { status: u16 },

    /// 200 应答后携带了多余的数据
    #[error("Proxy replied 200 with {len} unexpected trailing bytes")]
    IllegalBody { len: usize },

    /// 连接或与代理通信时的网络错误
    #[error("Tunneling socket could not be established: {source}")]
    Transport {
        #[source]
        source: io::Error,
    },

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// 排队中的请求被取消
    #[error("Tunnel request was cancelled while queued")]
    Cancelled,

    /// Agent 已关闭
    #[error("Tunneling agent has been shut down")]
    AgentClosed,
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建握手状态码错误
    pub fn handshake_status(status: u16) -> Self {
        Self::HandshakeStatus { status }
    }

    /// 创建非法应答体错误
    pub fn illegal_body(len: usize) -> Self {
        Self::IllegalBody { len }
    }

    /// 创建传输层错误
    pub fn transport(source: io::Error) -> Self {
        Self::Transport { source }
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// 检查是否为握手状态码错误
    pub fn is_handshake_status(&self) -> bool {
        matches!(self, Self::HandshakeStatus { .. })
    }

    /// 检查是否为非法应答体错误
    pub fn is_illegal_body(&self) -> bool {
        matches!(self, Self::IllegalBody { .. })
    }

    /// 检查是否为传输层错误
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// 检查是否为配置错误
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigError(_))
    }

    /// 代理返回的状态码（仅握手状态码错误有）
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::HandshakeStatus { status } => Some(*status),
            _ => None,
        }
    }
}

impl From<io::Error> for TunnelError {
    fn from(source: io::Error) -> Self {
        Self::transport(source)
    }
}
