//! 按 tag 分区的值流
//!
//! 每个 tag 独立一条 FIFO 和一组订阅者，首次引用时惰性创建。
//! 消费方只看到自己关心的 tag，不同 tag 之间不保证相对顺序。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::sync::Notify;

use crate::pool::WorkerPool;

use super::{Subscriber, SubscriberId, DISPATCH_LIVE_TIME};

/// 携带 tag 的值，tag 是应用层定义的通道号
pub trait Tagged {
    fn tag(&self) -> i32;
}

/// 可克隆的流句柄
pub struct TaggedStream<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    /// 所有 tag 的订阅派发共用一个池
    pool: WorkerPool,
}

struct State<T> {
    channels: HashMap<i32, Channel<T>>,
    closed: bool,
    next_id: u64,
}

/// 单个 tag 的队列加订阅者
struct Channel<T> {
    queue: VecDeque<T>,
    subscribers: Vec<Subscriber<T>>,
    notify: Arc<Notify>,
}

impl<T> Channel<T> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            subscribers: Vec::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

impl<T> State<T> {
    fn channel(&mut self, tag: i32) -> &mut Channel<T> {
        self.channels.entry(tag).or_insert_with(Channel::new)
    }
}

impl<T: Tagged + Clone + Send + 'static> TaggedStream<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    channels: HashMap::new(),
                    closed: false,
                    next_id: 0,
                }),
                pool: WorkerPool::named("tagged-stream", DISPATCH_LIVE_TIME),
            }),
        }
    }

    /// 按 `value.tag()` 路由到对应的队列和订阅者
    pub fn emit(&self, value: T) {
        let notify = {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                debug!("emit on a closed stream dropped");
                return;
            }
            let pool = &self.shared.pool;
            let channel = state.channel(value.tag());
            channel.queue.push_back(value.clone());
            for subscriber in &channel.subscribers {
                subscriber.deliver(value.clone(), pool);
            }
            channel.notify.clone()
        };
        notify.notify_waiters();
    }

    /// 挂起等待该 tag 的下一个值，单个 tag 内严格 FIFO
    ///
    /// 流关闭后先吐完该 tag 已入队的值（含终止哨兵），然后立即返回
    /// `None`。关闭之后才第一次引用的 tag 直接读到 `None`，不会挂起。
    pub async fn pull(&self, tag: i32) -> Option<T> {
        let notify = self
            .shared
            .state
            .lock()
            .unwrap()
            .channel(tag)
            .notify
            .clone();
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            // 先登记再检查，emit 和检查交错时不会丢唤醒
            notified.as_mut().enable();
            {
                let mut state = self.shared.state.lock().unwrap();
                let closed = state.closed;
                let channel = state.channel(tag);
                if let Some(value) = channel.queue.pop_front() {
                    return Some(value);
                }
                if closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn subscribe<F>(&self, tag: i32, callback: F) -> SubscriberId
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let mut state = self.shared.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state
            .channel(tag)
            .subscribers
            .push(Subscriber::new(id, callback));
        SubscriberId(id)
    }

    /// 退订，逐个 tag 扫描
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        for channel in state.channels.values_mut() {
            if let Some(pos) = channel.subscribers.iter().position(|s| s.id() == id.0) {
                channel.subscribers.remove(pos);
                return true;
            }
        }
        false
    }

    /// 撤回一个还没被消费的值，按值自带的 tag 定位队列
    pub fn cancel(&self, value: &T) -> bool
    where
        T: PartialEq,
    {
        let mut state = self.shared.state.lock().unwrap();
        let Some(channel) = state.channels.get_mut(&value.tag()) else {
            return false;
        };
        match channel.queue.iter().position(|v| v == value) {
            Some(pos) => {
                channel.queue.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn has_next(&self, tag: i32) -> bool {
        let state = self.shared.state.lock().unwrap();
        state
            .channels
            .get(&tag)
            .map(|c| !c.queue.is_empty())
            .unwrap_or(false)
    }

    /// 关闭流，往关闭时刻已存在的每个 tag 队列各投一个终止哨兵
    ///
    /// 之后才引用的 tag 拿不到哨兵，但读取会立即返回 `None`。
    /// 重复关闭是空操作。
    pub fn close(&self, terminal: T) {
        let notifies = {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            let mut notifies = Vec::with_capacity(state.channels.len());
            for channel in state.channels.values_mut() {
                channel.queue.push_back(terminal.clone());
                for subscriber in &channel.subscribers {
                    subscriber.deliver(terminal.clone(), &self.shared.pool);
                }
                notifies.push(channel.notify.clone());
            }
            notifies
        };
        for notify in notifies {
            notify.notify_waiters();
        }
        self.shared.pool.destroy();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().unwrap().closed
    }
}

impl<T: Tagged + Clone + Send + 'static> Default for TaggedStream<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for TaggedStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}
