//! 弹性工作池
//!
//! 提交的任务优先复用空闲 worker，没有空闲的就新建一个，池的大小没有上限。
//! worker 空闲超过存活时间后向池申请退出；申请和任务指派在同一把锁下判定，
//! 指派先到就继续服务。一个 worker 同一时刻最多持有一个任务，
//! 指派只会发给空闲 worker。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::Future;
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::time;

/// worker 默认的空闲存活时间
const DEFAULT_LIVE_TIME: Duration = Duration::from_secs(20);

type Job = BoxFuture<'static, ()>;

/// 可克隆的池句柄
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    live_time: Duration,
    state: Mutex<State>,
}

struct State {
    workers: Vec<Worker>,
    /// 池内 worker 编号，只增不减
    next_worker: u64,
    destroyed: bool,
}

struct Worker {
    id: u64,
    tx: mpsc::UnboundedSender<Job>,
    busy: bool,
}

impl WorkerPool {
    pub fn new(live_time: Duration) -> Self {
        Self::named("pool", live_time)
    }

    /// 带上属主给的名字，方便日志区分各个池
    pub fn named(name: &str, live_time: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.to_owned(),
                live_time,
                state: Mutex::new(State {
                    workers: Vec::new(),
                    next_worker: 0,
                    destroyed: false,
                }),
            }),
        }
    }

    /// 异步执行一个任务，从不阻塞调用方
    pub fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let job: Job = Box::pin(task);
        let mut state = self.shared.state.lock().unwrap();
        if state.destroyed {
            warn!("pool {}: submit on a destroyed pool dropped", self.shared.name);
            return;
        }

        if let Some(worker) = state.workers.iter_mut().find(|w| !w.busy) {
            worker.busy = true;
            debug!("pool {}: executing on worker {}", self.shared.name, worker.id);
            let _ = worker.tx.send(job);
            return;
        }

        let id = state.next_worker;
        state.next_worker += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(job);
        state.workers.push(Worker { id, tx, busy: true });
        debug!("pool {}: created worker {}", self.shared.name, id);
        tokio::spawn(worker_loop(self.shared.clone(), id, rx));
    }

    /// 关停所有 worker，各自跑完当前/已入队的任务后退出
    pub fn destroy(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.destroyed {
            return;
        }
        state.destroyed = true;
        // 丢掉发送端即通知 worker 收尾
        state.workers.clear();
        debug!("pool {} destroyed", self.shared.name);
    }

    pub fn worker_count(&self) -> usize {
        self.shared.state.lock().unwrap().workers.len()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_LIVE_TIME)
    }
}

async fn worker_loop(shared: Arc<Shared>, id: u64, mut rx: mpsc::UnboundedReceiver<Job>) {
    loop {
        match time::timeout(shared.live_time, rx.recv()).await {
            Ok(Some(job)) => {
                job.await;
                let mut state = shared.state.lock().unwrap();
                match state.workers.iter_mut().find(|w| w.id == id) {
                    Some(worker) => worker.busy = false,
                    // 工作期间池被销毁
                    None => return,
                }
            }
            Ok(None) => return,
            Err(_) => {
                // 空闲超时，申请退出；是否放行和任务指派在同一把锁下判定
                let mut state = shared.state.lock().unwrap();
                let Some(pos) = state.workers.iter().position(|w| w.id == id) else {
                    return;
                };
                if state.workers[pos].busy {
                    // 刚好有任务指派进来，下一轮 recv 就能拿到
                    continue;
                }
                state.workers.remove(pos);
                debug!(
                    "pool {}: released worker {}, {} workers alive",
                    shared.name,
                    id,
                    state.workers.len()
                );
                return;
            }
        }
    }
}
