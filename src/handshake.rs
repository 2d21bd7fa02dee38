/// CONNECT 握手协议
///
/// 在代理连接上发送一次 CONNECT 请求并校验应答，
/// 成功时返回可直接使用的隧道连接。
use crate::config::ProxyConfig;
use crate::error::{Result, TunnelError};
use crate::request::TunnelTarget;
use crate::transport::{BoxedStream, ProxyConnector};
use base64::Engine;
use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// 代理应答头最大大小（8KB）
pub const MAX_REPLY_HEAD_SIZE: usize = 8 * 1024;

const MAX_REPLY_HEADERS: usize = 64;

/// 握手状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    Connecting,
    Established,
    Failed,
}

impl HandshakeState {
    #[cfg(test)]
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, Self::Established | Self::Failed)
    }
}

/// 代理对 CONNECT 的应答
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyReply {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    /// 应答头之后读到的多余字节
    pub trailing: Bytes,
}

impl ProxyReply {
    /// 应答是否以 upgrade 形式到达（`Connection: upgrade` 或带 `Upgrade` 头）
    pub fn announces_upgrade(&self) -> bool {
        self.headers.iter().any(|(name, value)| {
            name.eq_ignore_ascii_case("upgrade")
                || (name.eq_ignore_ascii_case("connection")
                    && value
                        .split(',')
                        .any(|token| token.trim().eq_ignore_ascii_case("upgrade")))
        })
    }
}

/// 应答到达状态机的信号
///
/// 成功的隧道可能以单独的 `Connect` 信号到达，
/// 也可能以 `Response` + `Upgrade` 两个信号到达，两者等价。
#[derive(Debug)]
pub enum ReplySignal {
    Connect(ProxyReply),
    Response(ProxyReply),
    Upgrade,
}

/// `Proxy-Authorization` 头的值
pub fn basic_credential(auth: &str) -> String {
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(auth)
    )
}

/// CONNECT 请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// 请求路径 `host:port`
    pub authority: String,
    pub headers: Vec<(String, String)>,
}

impl ConnectRequest {
    /// 合并代理级头，再设置 Host 与凭据
    pub fn build(target: &TunnelTarget, proxy: &ProxyConfig) -> Self {
        let authority = target.authority();
        let mut headers: Vec<(String, String)> = proxy
            .headers
            .iter()
            .filter(|(name, _)| {
                !name.eq_ignore_ascii_case("host")
                    && !(proxy.proxy_auth.is_some()
                        && name.eq_ignore_ascii_case("proxy-authorization"))
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        headers.push(("Host".to_string(), authority.clone()));

        if let Some(ref auth) = proxy.proxy_auth {
            headers.push(("Proxy-Authorization".to_string(), basic_credential(auth)));
        }

        Self { authority, headers }
    }

    /// 查找头（不区分大小写）
    #[cfg(test)]
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("CONNECT {} HTTP/1.1\r\n", self.authority);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// 单次 CONNECT 握手的状态机
#[derive(Debug)]
pub struct ConnectHandshake {
    state: HandshakeState,
    authority: String,
    pending_response: Option<ProxyReply>,
}

impl ConnectHandshake {
    pub fn new(target: &TunnelTarget) -> Self {
        Self {
            state: HandshakeState::Init,
            authority: target.authority(),
            pending_response: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Init -> Connecting
    pub fn start(&mut self) {
        if self.state == HandshakeState::Init {
            self.state = HandshakeState::Connecting;
        }
    }

    /// 应答到达前的传输层失败
    pub fn fail_transport(&mut self, source: io::Error) -> TunnelError {
        self.state = HandshakeState::Failed;
        self.pending_response = None;
        warn!(
            "Tunneling socket could not be established to {}, cause: {}",
            self.authority, source
        );
        TunnelError::transport(source)
    }

    /// 处理应答信号
    ///
    /// 返回 `None` 表示仍在等待后续信号；终态之后的信号被忽略。
    pub fn on_signal(&mut self, signal: ReplySignal) -> Option<Result<()>> {
        if self.state != HandshakeState::Connecting {
            return None;
        }

        match signal {
            ReplySignal::Connect(reply) => Some(self.finish(reply)),
            ReplySignal::Response(reply) => {
                self.pending_response = Some(reply);
                None
            }
            ReplySignal::Upgrade => match self.pending_response.take() {
                Some(reply) => Some(self.finish(reply)),
                None => Some(Err(self.fail_transport(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "upgrade signal without a preceding response",
                )))),
            },
        }
    }

    fn finish(&mut self, reply: ProxyReply) -> Result<()> {
        if reply.status != 200 {
            self.state = HandshakeState::Failed;
            warn!(
                "Tunneling socket could not be established to {}, status code: {}",
                self.authority, reply.status
            );
            return Err(TunnelError::handshake_status(reply.status));
        }

        if !reply.trailing.is_empty() {
            self.state = HandshakeState::Failed;
            warn!(
                "Got illegal response body from proxy for {} ({} bytes)",
                self.authority,
                reply.trailing.len()
            );
            return Err(TunnelError::illegal_body(reply.trailing.len()));
        }

        self.state = HandshakeState::Established;
        info!("Tunneling connection has established to {}", self.authority);
        Ok(())
    }
}

/// 读取代理应答头，保留头后多余的字节
pub async fn read_reply<S>(stream: &mut S) -> io::Result<ProxyReply>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed the connection before replying to CONNECT",
            ));
        }

        let parsed = {
            let mut headers = [httparse::EMPTY_HEADER; MAX_REPLY_HEADERS];
            let mut resp = httparse::Response::new(&mut headers);
            match resp.parse(&buf) {
                Ok(httparse::Status::Complete(head_len)) => Some((
                    head_len,
                    resp.code.unwrap_or(0),
                    resp.reason.unwrap_or("").to_string(),
                    resp.headers
                        .iter()
                        .map(|h| {
                            (
                                h.name.to_string(),
                                String::from_utf8_lossy(h.value).to_string(),
                            )
                        })
                        .collect::<Vec<_>>(),
                )),
                Ok(httparse::Status::Partial) => None,
                Err(e) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("malformed CONNECT reply: {}", e),
                    ))
                }
            }
        };

        if let Some((head_len, status, reason, headers)) = parsed {
            let trailing = buf.split_off(head_len).freeze();
            return Ok(ProxyReply {
                status,
                reason,
                headers,
                trailing,
            });
        }

        if buf.len() >= MAX_REPLY_HEAD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("CONNECT reply head exceeds {} bytes", MAX_REPLY_HEAD_SIZE),
            ));
        }
    }
}

/// 在已建立的代理连接上完成 CONNECT 握手
pub async fn establish<S>(
    stream: &mut S,
    target: &TunnelTarget,
    proxy: &ProxyConfig,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = ConnectHandshake::new(target);
    handshake.start();

    let request = ConnectRequest::build(target, proxy);
    debug!("Making CONNECT request to {} via {}", request.authority, proxy.address());

    if let Err(e) = stream.write_all(&request.to_bytes()).await {
        return Err(handshake.fail_transport(e));
    }
    if let Err(e) = stream.flush().await {
        return Err(handshake.fail_transport(e));
    }

    let reply = match read_reply(stream).await {
        Ok(reply) => reply,
        Err(e) => return Err(handshake.fail_transport(e)),
    };

    let outcome = if reply.announces_upgrade() {
        handshake.on_signal(ReplySignal::Response(reply));
        // upgrade 信号推迟到下一轮调度处理
        tokio::task::yield_now().await;
        handshake.on_signal(ReplySignal::Upgrade)
    } else {
        handshake.on_signal(ReplySignal::Connect(reply))
    };

    outcome.unwrap_or_else(|| {
        Err(handshake.fail_transport(io::Error::other(
            "CONNECT handshake ended without an outcome",
        )))
    })
}

/// 通过连接器建立代理连接并完成握手
///
/// 失败时原始连接随之丢弃（关闭）。
pub async fn open_tunnel(
    connector: &dyn ProxyConnector,
    target: &TunnelTarget,
    proxy: &ProxyConfig,
) -> Result<BoxedStream> {
    let mut stream = match connector.connect(target.local_address).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                "Failed to reach proxy {} for {}: {}",
                connector.describe(),
                target,
                e
            );
            return Err(e.into());
        }
    };

    establish(&mut stream, target, proxy).await?;
    Ok(stream)
}
