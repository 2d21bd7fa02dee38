use crate::request::{RequestId, TunnelRequest, TunnelTarget};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::debug;

/// 池中槽位标识，占位符升级后保持不变
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(u64);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// 池中套接字状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// 已占用容量，握手进行中
    Placeholder,
    /// 明文隧道就绪
    Connected,
    /// TLS 隧道就绪
    Secure,
}

/// 池中的套接字条目
#[derive(Debug, Clone)]
pub struct PooledSocket {
    pub target: TunnelTarget,
    pub state: SocketState,
}

/// 套接字池统计信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub total: usize,
    pub placeholders: usize,
    pub connected: usize,
    pub secure: usize,
    pub max_sockets: usize,
}

/// 有界套接字池
pub struct SocketPool {
    max_sockets: usize,
    slots: HashMap<SlotId, PooledSocket>,
    next_id: u64,
}

impl SocketPool {
    pub fn new(max_sockets: usize) -> Self {
        Self {
            max_sockets,
            slots: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn max_sockets(&self) -> usize {
        self.max_sockets
    }

    pub fn has_capacity(&self) -> bool {
        self.slots.len() < self.max_sockets
    }

    /// 预留一个占位槽位，满时返回 `None`
    pub fn reserve(&mut self, target: &TunnelTarget) -> Option<SlotId> {
        if !self.has_capacity() {
            return None;
        }

        let id = SlotId(self.next_id);
        self.next_id += 1;
        self.slots.insert(
            id,
            PooledSocket {
                target: target.clone(),
                state: SocketState::Placeholder,
            },
        );
        debug!(
            "Reserved {} for {} (sockets: {}/{})",
            id,
            target,
            self.slots.len(),
            self.max_sockets
        );
        Some(id)
    }

    /// 原地更新槽位状态，槽位不存在时返回 false
    pub fn mark(&mut self, id: SlotId, state: SocketState) -> bool {
        match self.slots.get_mut(&id) {
            Some(entry) => {
                entry.state = state;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: SlotId) -> Option<&PooledSocket> {
        self.slots.get(&id)
    }

    /// 移除槽位（幂等）
    pub fn remove(&mut self, id: SlotId) -> Option<PooledSocket> {
        let removed = self.slots.remove(&id);
        if removed.is_some() {
            debug!(
                "Removed {} from pool (sockets: {}/{})",
                id,
                self.slots.len(),
                self.max_sockets
            );
        }
        removed
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            total: self.slots.len(),
            max_sockets: self.max_sockets,
            ..Default::default()
        };
        for entry in self.slots.values() {
            match entry.state {
                SocketState::Placeholder => stats.placeholders += 1,
                SocketState::Connected => stats.connected += 1,
                SocketState::Secure => stats.secure += 1,
            }
        }
        stats
    }
}

/// 等待容量的请求队列（FIFO）
#[derive(Debug, Default)]
pub struct PendingQueue {
    requests: VecDeque<TunnelRequest>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn push(&mut self, request: TunnelRequest) {
        self.requests.push_back(request);
    }

    pub fn pop(&mut self) -> Option<TunnelRequest> {
        self.requests.pop_front()
    }

    /// 按到达顺序取出第一个同源请求
    pub fn take_matching(&mut self, target: &TunnelTarget) -> Option<TunnelRequest> {
        let index = self
            .requests
            .iter()
            .position(|req| req.target.same_origin(target))?;
        self.requests.remove(index)
    }

    /// 按 id 移除（用于取消）
    pub fn remove(&mut self, id: RequestId) -> Option<TunnelRequest> {
        let index = self.requests.iter().position(|req| req.id == id)?;
        self.requests.remove(index)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: RequestId) -> bool {
        self.requests.iter().any(|req| req.id == id)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = TunnelRequest> + '_ {
        self.requests.drain(..)
    }
}
