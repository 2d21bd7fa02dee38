use crate::config::{resolve_target, AgentConfig};
use crate::error::{Result, TunnelError};
use crate::handshake;
use crate::pool::{PendingQueue, SlotId, SocketPool, SocketState};
use crate::request::{OriginRequest, RequestId, TunnelRequest};
use crate::secure::SecureSocketWrapper;
use crate::socket::TunnelSocket;
use crate::transport::{create_proxy_connector, BoxedStream, ProxyConnector};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Agent 内部事件
///
/// 所有池与队列的修改都在 Agent 任务内按事件顺序同步完成。
pub(crate) enum AgentEvent {
    AddRequest(TunnelRequest),
    Cancel {
        id: RequestId,
        reply: oneshot::Sender<bool>,
    },
    /// 等待方已丢弃 [`PendingTunnel`]
    Abandon { id: RequestId },
    /// CONNECT 成功，占位符变为明文隧道
    Established { slot: SlotId },
    HandshakeFinished {
        slot: SlotId,
        request: TunnelRequest,
        outcome: Result<(BoxedStream, bool)>,
    },
    Free {
        slot: SlotId,
        stream: BoxedStream,
    },
    Closed { slot: SlotId },
    AgentRemoved { slot: SlotId },
    Stats(oneshot::Sender<AgentStats>),
    Shutdown,
}

/// Agent 统计信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AgentStats {
    /// 池中套接字总数（含占位符）
    pub sockets: usize,
    pub placeholders: usize,
    pub connected: usize,
    pub secure: usize,
    /// 等待容量的请求数
    pub pending: usize,
    pub max_sockets: usize,
}

/// 隧道代理 Agent
///
/// 池与等待队列由后台任务独占，外部只通过消息交互。
/// 必须在 tokio 运行时内创建。
pub struct TunnelingAgent {
    config: Arc<AgentConfig>,
    events: mpsc::UnboundedSender<AgentEvent>,
}

impl TunnelingAgent {
    /// 按配置变体创建 Agent
    pub fn new(config: AgentConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| TunnelError::config_error(format!("{:#}", e)))?;
        let connector = create_proxy_connector(&config)
            .map_err(|e| TunnelError::config_error(format!("{:#}", e)))?;
        Self::start(config, connector)
    }

    /// 使用自定义的代理连接策略创建 Agent
    pub fn with_connector(config: AgentConfig, connector: Arc<dyn ProxyConnector>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| TunnelError::config_error(format!("{:#}", e)))?;
        Self::start(config, connector)
    }

    fn start(config: AgentConfig, connector: Arc<dyn ProxyConnector>) -> Result<Self> {
        let secure = if config.variant.destination_uses_tls() {
            let wrapper = SecureSocketWrapper::from_material(&config.destination_tls())
                .map_err(|e| TunnelError::config_error(format!("{:#}", e)))?;
            Some(Arc::new(wrapper))
        } else {
            None
        };

        let config = Arc::new(config);
        let (tx, rx) = mpsc::unbounded_channel();

        info!(
            "Tunneling agent started: {} via {} (max_sockets: {})",
            config.variant,
            connector.describe(),
            config.max_sockets
        );

        let actor = AgentActor {
            pool: SocketPool::new(config.max_sockets),
            queue: PendingQueue::new(),
            config: config.clone(),
            connector,
            secure,
            events: tx.clone(),
        };
        tokio::spawn(actor.run(rx));

        Ok(Self { config, events: tx })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// 提交源请求
    ///
    /// 有容量时立即开始握手，否则进入等待队列。结果（套接字或错误）
    /// 通过返回的 [`PendingTunnel`] 送达。Agent 已关闭时返回的句柄
    /// 立即以 `AgentClosed` 完成。
    pub fn add_request(&self, request: OriginRequest) -> PendingTunnel {
        let target = resolve_target(&request, &self.config);
        let id = RequestId::new();
        let (tx, rx) = oneshot::channel();
        let request = TunnelRequest::new(id, target, request.host_header, tx);

        if let Err(mpsc::error::SendError(AgentEvent::AddRequest(request))) =
            self.events.send(AgentEvent::AddRequest(request))
        {
            request.fail(TunnelError::AgentClosed);
        }

        PendingTunnel {
            id,
            rx,
            events: self.events.clone(),
            settled: false,
        }
    }

    /// 提交请求并等待隧道套接字
    pub async fn connect(&self, request: OriginRequest) -> Result<TunnelSocket> {
        self.add_request(request).await
    }

    /// 取消仍在排队的请求
    ///
    /// 已开始握手或已绑定的请求不受影响，返回 false。
    pub async fn cancel(&self, id: RequestId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.events.send(AgentEvent::Cancel { id, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// 获取池与队列统计
    pub async fn stats(&self) -> Result<AgentStats> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(AgentEvent::Stats(reply))
            .map_err(|_| TunnelError::AgentClosed)?;
        rx.await.map_err(|_| TunnelError::AgentClosed)
    }

    /// 关闭 Agent，排队中的请求以 `AgentClosed` 失败
    pub fn shutdown(&self) {
        let _ = self.events.send(AgentEvent::Shutdown);
    }
}

impl Drop for TunnelingAgent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 等待中的隧道请求
///
/// 未完成前丢弃即放弃该请求，排队中的请求会被移出队列。
pub struct PendingTunnel {
    id: RequestId,
    rx: oneshot::Receiver<Result<TunnelSocket>>,
    events: mpsc::UnboundedSender<AgentEvent>,
    settled: bool,
}

impl std::fmt::Debug for PendingTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTunnel")
            .field("id", &self.id)
            .field("settled", &self.settled)
            .finish()
    }
}

impl PendingTunnel {
    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl Future for PendingTunnel {
    type Output = Result<TunnelSocket>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => result,
            Poll::Ready(Err(_)) => Err(TunnelError::AgentClosed),
            Poll::Pending => return Poll::Pending,
        };
        self.settled = true;
        Poll::Ready(result)
    }
}

impl Drop for PendingTunnel {
    fn drop(&mut self) {
        if !self.settled {
            let _ = self.events.send(AgentEvent::Abandon { id: self.id });
        }
    }
}

struct AgentActor {
    config: Arc<AgentConfig>,
    connector: Arc<dyn ProxyConnector>,
    secure: Option<Arc<SecureSocketWrapper>>,
    pool: SocketPool,
    queue: PendingQueue,
    events: mpsc::UnboundedSender<AgentEvent>,
}

impl AgentActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<AgentEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::Shutdown => break,
                event => self.handle(event),
            }
        }

        for request in self.queue.drain() {
            request.fail(TunnelError::AgentClosed);
        }
        info!("Tunneling agent stopped");
    }

    fn handle(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::AddRequest(request) => self.add_request(request),
            AgentEvent::Cancel { id, reply } => {
                let cancelled = match self.queue.remove(id) {
                    Some(request) => {
                        debug!("Cancelled queued request {}", id);
                        request.fail(TunnelError::Cancelled);
                        true
                    }
                    None => false,
                };
                let _ = reply.send(cancelled);
            }
            AgentEvent::Abandon { id } => {
                if self.queue.remove(id).is_some() {
                    debug!("Dropped abandoned request {} from queue", id);
                }
            }
            AgentEvent::Established { slot } => {
                self.pool.mark(slot, SocketState::Connected);
            }
            AgentEvent::HandshakeFinished {
                slot,
                request,
                outcome,
            } => self.on_handshake_finished(slot, request, outcome),
            AgentEvent::Free { slot, stream } => self.on_free(slot, stream),
            AgentEvent::Closed { slot } => {
                debug!("Tunnel socket {} closed", slot);
                self.remove_socket(slot);
            }
            AgentEvent::AgentRemoved { slot } => {
                debug!("Tunnel socket {} removed from agent", slot);
                self.remove_socket(slot);
            }
            AgentEvent::Stats(reply) => {
                let pool = self.pool.stats();
                let _ = reply.send(AgentStats {
                    sockets: pool.total,
                    placeholders: pool.placeholders,
                    connected: pool.connected,
                    secure: pool.secure,
                    pending: self.queue.len(),
                    max_sockets: pool.max_sockets,
                });
            }
            AgentEvent::Shutdown => {}
        }
    }

    fn add_request(&mut self, request: TunnelRequest) {
        match self.pool.reserve(&request.target) {
            Some(slot) => self.start_handshake(slot, request),
            None => {
                debug!(
                    "Pool full ({} sockets), queueing request {} for {}",
                    self.pool.len(),
                    request.id,
                    request.target
                );
                self.queue.push(request);
            }
        }
    }

    fn start_handshake(&self, slot: SlotId, request: TunnelRequest) {
        debug!(
            "Starting CONNECT handshake for request {} to {} on {}",
            request.id, request.target, slot
        );

        let config = self.config.clone();
        let connector = self.connector.clone();
        let secure = self.secure.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let outcome = establish_tunnel(
                slot,
                &request,
                connector.as_ref(),
                &config,
                secure.as_deref(),
                &events,
            )
            .await;
            let _ = events.send(AgentEvent::HandshakeFinished {
                slot,
                request,
                outcome,
            });
        });
    }

    fn on_handshake_finished(
        &mut self,
        slot: SlotId,
        request: TunnelRequest,
        outcome: Result<(BoxedStream, bool)>,
    ) {
        match outcome {
            Ok((stream, secure)) => {
                let state = if secure {
                    SocketState::Secure
                } else {
                    SocketState::Connected
                };
                self.pool.mark(slot, state);

                let socket = TunnelSocket::new(
                    stream,
                    slot,
                    request.target.clone(),
                    secure,
                    false,
                    self.events.clone(),
                );
                if let Err(socket) = request.attach(socket) {
                    // 请求方已放弃，按空闲处理
                    debug!("Request abandoned before {} was attached", slot);
                    if let Some(stream) = socket.into_stream() {
                        self.on_free(slot, stream);
                    }
                }
            }
            Err(err) => {
                request.fail(err);
                self.remove_socket(slot);
            }
        }
    }

    /// 空闲套接字优先交给同源的排队请求，否则销毁
    fn on_free(&mut self, slot: SlotId, mut stream: BoxedStream) {
        let Some(entry) = self.pool.get(slot) else {
            return;
        };
        let target = entry.target.clone();
        let secure = entry.state == SocketState::Secure;

        while let Some(request) = self.queue.take_matching(&target) {
            debug!("Reusing {} for queued request {} to {}", slot, request.id, target);
            let socket = TunnelSocket::new(
                stream,
                slot,
                target.clone(),
                secure,
                true,
                self.events.clone(),
            );
            match request.attach(socket) {
                Ok(()) => return,
                Err(socket) => match socket.into_stream() {
                    Some(returned) => stream = returned,
                    None => return,
                },
            }
        }

        debug!("No pending request for {}, destroying {}", target, slot);
        drop(stream);
        self.remove_socket(slot);
    }

    /// 从池中移除槽位；确有移除时把队首请求推进握手
    fn remove_socket(&mut self, slot: SlotId) {
        if self.pool.remove(slot).is_none() {
            return;
        }

        while self.pool.has_capacity() {
            let Some(request) = self.queue.pop() else {
                break;
            };
            if request.is_abandoned() {
                debug!("Dropping abandoned request {}", request.id);
                continue;
            }
            self.add_request(request);
        }
    }
}

/// 握手任务：连接代理、CONNECT、可选 TLS 包装
async fn establish_tunnel(
    slot: SlotId,
    request: &TunnelRequest,
    connector: &dyn ProxyConnector,
    config: &AgentConfig,
    secure: Option<&SecureSocketWrapper>,
    events: &mpsc::UnboundedSender<AgentEvent>,
) -> Result<(BoxedStream, bool)> {
    let stream = handshake::open_tunnel(connector, &request.target, &config.proxy).await?;
    let _ = events.send(AgentEvent::Established { slot });

    let Some(wrapper) = secure else {
        return Ok((stream, false));
    };

    let server_name = wrapper.server_name_for(request.host_header.as_deref(), &request.target.host);
    match wrapper.wrap(stream, &server_name).await {
        Ok(stream) => Ok((stream, true)),
        Err(e) => {
            warn!(
                "TLS negotiation over tunnel to {} failed: {}",
                request.target, e
            );
            Err(e.into())
        }
    }
}
