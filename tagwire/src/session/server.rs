//! 会话服务端
//!
//! 监听一个端口，把每条接受的连接包成服务端会话发布到会话流上。
//! 状态机和 [`Session`](super::Session) 同构：打开即启动唯一的
//! 接收循环，关闭布置看门狗，超时未重开自动销毁。

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info};
use tokio::io;
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::watch;
use tokio::time;

use crate::pool::WorkerPool;
use crate::stream::{SubscriberId, VirtualStream};

use super::conn::SessionStream;
use super::secure::{SecureListener, SecureSocketFactory, ServerCertConfig};
use super::status::ServerStatus;
use super::Session;

/// 关闭后等待重开的宽限期
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(20);

/// 状态迁移要求的后续动作，由调用方在状态锁外执行
enum Effect {
    None,
    StartAcceptor,
    ArmWatchdog { watermark: u64 },
    Teardown,
}

/// 明文或加密的监听 socket
enum Listener {
    Plain(TcpListener),
    Secure(Box<dyn SecureListener>),
}

impl Listener {
    async fn accept(&mut self) -> io::Result<(Box<dyn SessionStream>, SocketAddr)> {
        match self {
            Listener::Plain(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((Box::new(stream) as Box<dyn SessionStream>, addr))
            }
            Listener::Secure(listener) => listener.accept().await,
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Plain(listener) => listener.local_addr().ok(),
            Listener::Secure(_) => None,
        }
    }
}

/// 会话服务端句柄，克隆共享同一个监听端口
#[derive(Clone)]
pub struct SessionServer {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    /// open 串行化
    open_lock: tokio::sync::Mutex<()>,
    /// open 成功到接收循环启动之间暂存监听器
    pending_listener: Mutex<Option<Listener>>,
    status_stream: VirtualStream<ServerStatus>,
    session_stream: VirtualStream<Session>,
    pool: WorkerPool,
    factory: Mutex<Option<Arc<dyn SecureSocketFactory>>>,
}

struct State {
    status: ServerStatus,
    watermark: u64,
    acceptor_alive: bool,
    stop_tx: Option<watch::Sender<bool>>,
    session_timeout: Duration,
    /// 实际绑定的地址，端口传 0 时由系统分配
    local_addr: Option<SocketAddr>,
}

impl SessionServer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    status: ServerStatus::Closed,
                    watermark: 0,
                    acceptor_alive: false,
                    stop_tx: None,
                    session_timeout: DEFAULT_SESSION_TIMEOUT,
                    local_addr: None,
                }),
                open_lock: tokio::sync::Mutex::new(()),
                pending_listener: Mutex::new(None),
                status_stream: VirtualStream::new(),
                session_stream: VirtualStream::new(),
                pool: WorkerPool::named("server", DEFAULT_SESSION_TIMEOUT),
                factory: Mutex::new(None),
            }),
        }
    }

    /// 打开明文监听端口
    ///
    /// 已打开或已销毁的服务端上是空操作。绑定失败只记日志，
    /// 调用方拿到的是未变化的状态，从不报错。
    pub async fn open(&self, port: u16) -> ServerStatus {
        self.open_with(port, None).await
    }

    /// 通过注入的工厂打开加密监听端口，其余行为同 [`SessionServer::open`]
    pub async fn open_secured(&self, port: u16, cert: &ServerCertConfig) -> ServerStatus {
        self.open_with(port, Some(cert)).await
    }

    async fn open_with(&self, port: u16, cert: Option<&ServerCertConfig>) -> ServerStatus {
        let _opening = self.inner.open_lock.lock().await;
        if !self.status().is_closed() {
            return self.status();
        }

        let listener = match self.construct_listener(port, cert).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("server socket couldn't be opened on port {}: {}", port, e);
                return self.status();
            }
        };
        self.inner.state.lock().unwrap().local_addr = listener.local_addr();
        *self.inner.pending_listener.lock().unwrap() = Some(listener);
        let effect = self.transition(ServerStatus::Opened);
        self.apply(effect);
        self.status()
    }

    async fn construct_listener(
        &self,
        port: u16,
        cert: Option<&ServerCertConfig>,
    ) -> io::Result<Listener> {
        match cert {
            None => {
                let listener = TcpListener::bind(("0.0.0.0", port)).await?;
                Ok(Listener::Plain(listener))
            }
            Some(cert) => {
                let factory = self.inner.factory.lock().unwrap().clone();
                match factory {
                    Some(factory) => Ok(Listener::Secure(factory.bind(port, cert).await?)),
                    None => Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "no secure socket factory installed",
                    )),
                }
            }
        }
    }

    /// 状态机唯一的迁移入口，语义同会话侧
    fn transition(&self, next: ServerStatus) -> Effect {
        self.transition_if(next, None)
    }

    fn transition_if(&self, next: ServerStatus, only_at: Option<u64>) -> Effect {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(mark) = only_at {
            if state.watermark != mark {
                return Effect::None;
            }
        }
        if state.status == next || state.status.is_destroyed() {
            return Effect::None;
        }
        state.status = next;
        state.watermark += 1;
        match next {
            ServerStatus::Opened => {
                self.inner.status_stream.emit(next);
                Effect::StartAcceptor
            }
            ServerStatus::Closed => {
                if let Some(stop) = state.stop_tx.take() {
                    let _ = stop.send(true);
                }
                self.inner.status_stream.emit(next);
                Effect::ArmWatchdog {
                    watermark: state.watermark,
                }
            }
            // 终止哨兵就是对外的 Destroyed 信号，由收尾动作发布
            ServerStatus::Destroyed => Effect::Teardown,
        }
    }

    fn apply(&self, effect: Effect) {
        match effect {
            Effect::None => {}
            Effect::StartAcceptor => self.start_acceptor(),
            Effect::ArmWatchdog { watermark } => self.arm_watchdog(watermark),
            Effect::Teardown => self.teardown(),
        }
    }

    /// 启动接收循环，整个服务端同一时刻至多一个
    fn start_acceptor(&self) {
        let listener = self.inner.pending_listener.lock().unwrap().take();
        let Some(listener) = listener else {
            error!("couldn't start a session acceptor, no pending listener");
            return;
        };
        let (stop_tx, stop_rx) = watch::channel(false);
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.acceptor_alive {
                error!("couldn't start a session acceptor, one is already alive");
                return;
            }
            state.acceptor_alive = true;
            state.stop_tx = Some(stop_tx);
        }
        tokio::spawn(accept_loop(self.clone(), listener, stop_rx));
    }

    /// 布置关闭看门狗：宽限期后水位线没动过就销毁服务端
    fn arm_watchdog(&self, watermark: u64) {
        let server = self.clone();
        let timeout = self.inner.state.lock().unwrap().session_timeout;
        self.inner.pool.submit(async move {
            time::sleep(timeout).await;
            let effect = server.transition_if(ServerStatus::Destroyed, Some(watermark));
            if matches!(&effect, Effect::Teardown) {
                info!("server timed out");
                server.apply(effect);
            }
        });
    }

    /// 收尾：关掉两条流并销毁工作池
    fn teardown(&self) {
        debug!("server destroyed");
        self.inner.status_stream.close(ServerStatus::Destroyed);
        self.inner.session_stream.close(Session::new());
        self.inner.pool.destroy();
    }

    /// 挂起等待下一条被接受的会话
    pub async fn next_session(&self) -> Option<Session> {
        self.inner.session_stream.pull().await
    }

    pub fn subscribe_sessions<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(Session) + Send + Sync + 'static,
    {
        self.inner.session_stream.subscribe(callback)
    }

    pub fn unsubscribe_sessions(&self, id: SubscriberId) -> bool {
        self.inner.session_stream.unsubscribe(id)
    }

    /// 撤回一条还没被消费的会话
    pub fn cancel_session(&self, session: &Session) -> bool {
        self.inner.session_stream.cancel(session)
    }

    pub fn subscribe_status<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(ServerStatus) + Send + Sync + 'static,
    {
        self.inner.status_stream.subscribe(callback)
    }

    pub fn unsubscribe_status(&self, id: SubscriberId) -> bool {
        self.inner.status_stream.unsubscribe(id)
    }

    /// 挂起等待下一次状态迁移
    pub async fn next_status(&self) -> Option<ServerStatus> {
        self.inner.status_stream.pull().await
    }

    pub fn status(&self) -> ServerStatus {
        self.inner.state.lock().unwrap().status
    }

    pub fn is_opened(&self) -> bool {
        self.status().is_opened()
    }

    /// 实际绑定的地址，未打开过则为 `None`
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.state.lock().unwrap().local_addr
    }

    pub fn status_stream(&self) -> VirtualStream<ServerStatus> {
        self.inner.status_stream.clone()
    }

    pub fn session_stream(&self) -> VirtualStream<Session> {
        self.inner.session_stream.clone()
    }

    pub fn set_session_timeout(&self, timeout: Duration) {
        self.inner.state.lock().unwrap().session_timeout = timeout;
    }

    pub fn set_socket_factory(&self, factory: Arc<dyn SecureSocketFactory>) {
        *self.inner.factory.lock().unwrap() = Some(factory);
    }

    /// 销毁服务端：关闭监听、收尾，可以重复调用
    ///
    /// 监听器随接收循环退出一起释放，这里没有会失败的资源。
    pub fn destroy(&self) {
        let effect = self.transition(ServerStatus::Closed);
        self.apply(effect);
        let effect = self.transition(ServerStatus::Destroyed);
        self.apply(effect);
    }
}

impl Default for SessionServer {
    fn default() -> Self {
        Self::new()
    }
}

/// 接收循环：每接受一条连接就发布一条服务端会话
///
/// 退出时监听器随之释放。服务端已在关闭则属预期，否则记错误并把
/// 服务端转入关闭，让看门狗接手，而不是悄悄死掉。
async fn accept_loop(server: SessionServer, mut listener: Listener, mut stop: watch::Receiver<bool>) {
    debug!("session acceptor started");
    let outcome = loop {
        select! {
            _ = stop.changed() => break Ok(()),
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("new session coming in: {}", addr);
                    let session = Session::accepted(stream, addr).await;
                    server.inner.session_stream.emit(session);
                }
                Err(e) => break Err(e),
            },
        }
    };

    let was_opened = server.is_opened();
    server.inner.state.lock().unwrap().acceptor_alive = false;
    match outcome {
        Ok(()) => debug!("session acceptor closed normally"),
        Err(e) if !was_opened => debug!("session acceptor closed while shutting down: {}", e),
        Err(e) => {
            error!("session acceptor not normally closed: {}", e);
            let effect = server.transition(ServerStatus::Closed);
            server.apply(effect);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::packet::SPacket;
    use crate::session::status::ConnectionStatus;

    #[tokio::test]
    async fn open_accept_and_publish_sessions() {
        let server = SessionServer::new();
        assert_eq!(server.open(0).await, ServerStatus::Opened);
        let port = server.local_addr().unwrap().port();

        // 打开状态下重复 open 是空操作
        assert_eq!(server.open(0).await, ServerStatus::Opened);

        let client = Session::new();
        assert_eq!(
            client.connect("127.0.0.1", port).await,
            ConnectionStatus::Connected
        );

        let accepted = time::timeout(Duration::from_secs(5), server.next_session())
            .await
            .unwrap()
            .unwrap();
        assert!(accepted.session_type().is_server_side());
        assert!(accepted.is_connected());

        assert!(client.send(&SPacket::new(1).write_string("hi")).await);
        let packet = time::timeout(Duration::from_secs(5), accepted.read(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.read_string(), "hi");

        server.destroy();
        let _ = client.destroy().await;
    }

    #[tokio::test]
    async fn destroy_closes_both_streams_with_terminals() {
        let server = SessionServer::new();
        server.open(0).await;

        server.destroy();
        assert!(server.status().is_destroyed());
        // 状态流的历史加终止哨兵，随后立即见底
        assert_eq!(server.next_status().await, Some(ServerStatus::Opened));
        assert_eq!(server.next_status().await, Some(ServerStatus::Closed));
        assert_eq!(server.next_status().await, Some(ServerStatus::Destroyed));
        assert_eq!(server.next_status().await, None);
        // 会话流以一条全新的断开会话收尾
        let terminal = server.next_session().await.unwrap();
        assert!(!terminal.is_connected());
        assert!(server.next_session().await.is_none());

        // 重复销毁是空操作
        server.destroy();
    }

    #[tokio::test]
    async fn closed_server_times_out_into_destroyed() {
        let server = SessionServer::new();
        server.set_session_timeout(Duration::from_millis(100));
        server.open(0).await;

        let effect = server.transition(ServerStatus::Closed);
        server.apply(effect);
        assert_eq!(server.status(), ServerStatus::Closed);

        time::sleep(Duration::from_millis(300)).await;
        assert!(server.status().is_destroyed());
    }

    #[tokio::test]
    async fn reopen_within_the_window_cancels_the_watchdog() {
        let server = SessionServer::new();
        server.set_session_timeout(Duration::from_millis(200));
        server.open(0).await;

        let effect = server.transition(ServerStatus::Closed);
        server.apply(effect);
        // 等旧接收循环退场，宽限期内重开，水位线前移，旧看门狗过期作废
        time::sleep(Duration::from_millis(50)).await;
        server.open(0).await;
        assert!(server.is_opened());

        time::sleep(Duration::from_millis(500)).await;
        assert!(server.is_opened());
    }
}
