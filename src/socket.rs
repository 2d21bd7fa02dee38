use crate::agent::AgentEvent;
use crate::pool::SlotId;
use crate::request::TunnelTarget;
use crate::transport::{BoxedStream, Transport};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// 绑定到源请求的隧道套接字
///
/// 生命周期信号回送给 Agent：
/// - [`TunnelSocket::release`]：请求结束，套接字可复用（free）
/// - [`TunnelSocket::detach`]：从池中移除并交出底层连接（agent-removed）
/// - 直接丢弃：连接关闭（close）
pub struct TunnelSocket {
    stream: Option<BoxedStream>,
    slot: SlotId,
    target: TunnelTarget,
    secure: bool,
    reused: bool,
    events: mpsc::UnboundedSender<AgentEvent>,
}

impl TunnelSocket {
    pub(crate) fn new(
        stream: BoxedStream,
        slot: SlotId,
        target: TunnelTarget,
        secure: bool,
        reused: bool,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Self {
        Self {
            stream: Some(stream),
            slot,
            target,
            secure,
            reused,
            events,
        }
    }

    /// 所在池槽位
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// 隧道目标
    pub fn target(&self) -> &TunnelTarget {
        &self.target
    }

    /// 是否为 TLS 会话
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// 是否复用了已有隧道（未重新握手）
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// 请求结束，归还套接字供同源请求复用
    pub fn release(mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = self.events.send(AgentEvent::Free {
                slot: self.slot,
                stream,
            });
        }
    }

    /// 从池中移除并取回底层连接
    pub fn detach(mut self) -> BoxedStream {
        let _ = self
            .events
            .send(AgentEvent::AgentRemoved { slot: self.slot });
        match self.stream.take() {
            Some(stream) => stream,
            // stream 只会在消费 self 的方法中取走
            None => unreachable!("tunnel socket stream already taken"),
        }
    }

    /// 取回连接且不发送任何信号（Agent 内部使用）
    pub(crate) fn into_stream(mut self) -> Option<BoxedStream> {
        self.stream.take()
    }

    fn stream_mut(&mut self) -> io::Result<Pin<&mut (dyn Transport + 'static)>> {
        self.stream
            .as_mut()
            .map(|s| s.as_mut())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "tunnel socket released"))
    }
}

impl Drop for TunnelSocket {
    fn drop(&mut self) {
        if self.stream.take().is_some() {
            let _ = self.events.send(AgentEvent::Closed { slot: self.slot });
        }
    }
}

impl fmt::Debug for TunnelSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSocket")
            .field("slot", &self.slot)
            .field("target", &self.target)
            .field("secure", &self.secure)
            .field("reused", &self.reused)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for TunnelSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => stream.poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl AsyncWrite for TunnelSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => stream.poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => stream.poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => stream.poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}
