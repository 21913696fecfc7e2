//! 值流：一条 FIFO 队列加一组订阅者
//!
//! 同一个流可以同时被拉取和订阅。`pull` 挂起等待下一个值，
//! `subscribe` 注册的回调经由工作池异步触发，`emit` 两边都喂。
//! 关闭时投入一个终止哨兵，保证阻塞中的拉取方都能醒来。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use tokio::sync::Notify;

use crate::pool::WorkerPool;

pub mod tagged;

/// 订阅回调的空闲存活时间较短，订阅者少时不留太多 worker
const DISPATCH_LIVE_TIME: Duration = Duration::from_secs(2);

/// `subscribe` 返回的句柄，退订时使用
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

/// 可克隆的流句柄
pub struct VirtualStream<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    pool: WorkerPool,
}

struct State<T> {
    queue: VecDeque<T>,
    subscribers: Vec<Subscriber<T>>,
    closed: bool,
    next_id: u64,
}

/// 一个订阅者：回调加上它专属的待派发队列
///
/// 同一个订阅者的值严格按 emit 顺序串行回调，不同订阅者之间并行，
/// 顺序不作保证。
pub(crate) struct Subscriber<T> {
    id: u64,
    inbox: Arc<Inbox<T>>,
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            inbox: self.inbox.clone(),
        }
    }
}

pub(crate) struct Inbox<T> {
    callback: Box<dyn Fn(T) + Send + Sync>,
    pending: Mutex<Pending<T>>,
}

struct Pending<T> {
    queue: VecDeque<T>,
    /// 是否已有派发任务在消费这个队列，同一时刻至多一个
    draining: bool,
}

impl<T: Send + 'static> Subscriber<T> {
    pub(crate) fn new<F>(id: u64, callback: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            id,
            inbox: Arc::new(Inbox {
                callback: Box::new(callback),
                pending: Mutex::new(Pending {
                    queue: VecDeque::new(),
                    draining: false,
                }),
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// 入队一个值，必要时调度一个派发任务
    pub(crate) fn deliver(&self, value: T, pool: &WorkerPool) {
        let mut pending = self.inbox.pending.lock().unwrap();
        pending.queue.push_back(value);
        if pending.draining {
            return;
        }
        pending.draining = true;
        drop(pending);

        let inbox = self.inbox.clone();
        pool.submit(async move {
            loop {
                let next = {
                    let mut pending = inbox.pending.lock().unwrap();
                    match pending.queue.pop_front() {
                        Some(value) => value,
                        None => {
                            pending.draining = false;
                            return;
                        }
                    }
                };
                (inbox.callback)(next);
            }
        });
    }
}

impl<T: Clone + Send + 'static> VirtualStream<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    subscribers: Vec::new(),
                    closed: false,
                    next_id: 0,
                }),
                notify: Notify::new(),
                pool: WorkerPool::named("stream", DISPATCH_LIVE_TIME),
            }),
        }
    }

    /// 追加到队列并派发给所有订阅者，从不阻塞
    pub fn emit(&self, value: T) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                debug!("emit on a closed stream dropped");
                return;
            }
            state.queue.push_back(value.clone());
            for subscriber in &state.subscribers {
                subscriber.deliver(value.clone(), &self.shared.pool);
            }
        }
        self.shared.notify.notify_waiters();
    }

    /// 挂起等待下一个值，队列严格 FIFO
    ///
    /// 流关闭后先把已入队的值（含终止哨兵）吐完，然后立即返回 `None`。
    pub async fn pull(&self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // 先登记再检查，emit 和检查交错时不会丢唤醒
            notified.as_mut().enable();
            {
                let mut state = self.shared.state.lock().unwrap();
                if let Some(value) = state.queue.pop_front() {
                    return Some(value);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let mut state = self.shared.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.push(Subscriber::new(id, callback));
        SubscriberId(id)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        match state.subscribers.iter().position(|s| s.id() == id.0) {
            Some(pos) => {
                state.subscribers.remove(pos);
                true
            }
            None => false,
        }
    }

    /// 撤回一个还没被消费的值
    pub fn cancel(&self, value: &T) -> bool
    where
        T: PartialEq,
    {
        let mut state = self.shared.state.lock().unwrap();
        match state.queue.iter().position(|v| v == value) {
            Some(pos) => {
                state.queue.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn has_next(&self) -> bool {
        !self.shared.state.lock().unwrap().queue.is_empty()
    }

    /// 关闭流并投入终止哨兵
    ///
    /// 哨兵走一次正常的入队加派发，阻塞中的拉取方全部唤醒。重复关闭是空操作。
    pub fn close(&self, terminal: T) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            state.queue.push_back(terminal.clone());
            for subscriber in &state.subscribers {
                subscriber.deliver(terminal.clone(), &self.shared.pool);
            }
        }
        self.shared.notify.notify_waiters();
        self.shared.pool.destroy();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().unwrap().closed
    }
}

impl<T: Clone + Send + 'static> Default for VirtualStream<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for VirtualStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}
