//! 会话层
//!
//! 一个 [`Session`] 独占一条 TCP 连接，向外暴露两条流：
//! 状态流发布连接状态迁移，报文流按 tag 发布收到的报文。
//! 状态机的每次迁移返回一个待执行的动作（启动读循环、布置看门狗、
//! 收尾销毁），由迁移的调用方在锁外执行，状态流只是对外的信号。
//!
//! 断开后有一段宽限期，期间重连则继续存活，超时未重连自动销毁。

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::watch;
use tokio::time;

use crate::error::Error;
use crate::pool::WorkerPool;
use crate::stream::tagged::TaggedStream;
use crate::stream::{SubscriberId, VirtualStream};

use self::conn::{is_connection_broken, FrameReader, FrameWriter, SessionStream};
use self::packet::{RPacket, SPacket};
use self::secure::{ClientCertConfig, SecureSocketFactory};
use self::status::{ConnectionStatus, SessionType};

pub mod conn;
pub mod packet;
pub mod secure;
pub mod server;
pub mod status;

/// 断开后等待重连的宽限期
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(20);

/// 状态迁移要求的后续动作，由调用方在状态锁外执行
enum Effect {
    None,
    StartReader,
    ArmWatchdog { watermark: u64 },
    Teardown,
}

/// 一条连接的会话句柄，克隆共享同一条连接
///
/// 相等性按句柄身份判定，克隆体彼此相等，方便放进
/// [`VirtualStream`] 再按值撤回。
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Session {}

struct Inner {
    session_type: SessionType,
    state: Mutex<State>,
    /// connect/reconnect 串行化，换 socket 只发生在这条路径上
    connect_lock: tokio::sync::Mutex<()>,
    /// 写半边，这把锁同时就是发送锁：同一时刻只有一个写者，
    /// 并发发送不会在线上交错出残帧
    writer: tokio::sync::Mutex<Option<FrameWriter>>,
    /// connect 成功到读循环启动之间暂存读半边
    pending_reader: Mutex<Option<FrameReader>>,
    status_stream: VirtualStream<ConnectionStatus>,
    packet_stream: TaggedStream<RPacket>,
    pool: WorkerPool,
    factory: Mutex<Option<Arc<dyn SecureSocketFactory>>>,
}

struct State {
    status: ConnectionStatus,
    /// 每次迁移单调递增，看门狗据此识别自己是否已过期
    watermark: u64,
    reader_alive: bool,
    stop_tx: Option<watch::Sender<bool>>,
    session_timeout: Duration,
    /// reconnect 重拨用的远端地址
    remote: Option<Remote>,
}

#[derive(Clone)]
struct Remote {
    address: String,
    port: u16,
    secured: bool,
}

impl Session {
    /// 客户端会话，初始为断开状态，由 [`Session::connect`] 建立连接
    pub fn new() -> Self {
        Self::with_type(SessionType::ClientSide)
    }

    fn with_type(session_type: SessionType) -> Self {
        Self {
            inner: Arc::new(Inner {
                session_type,
                state: Mutex::new(State {
                    status: ConnectionStatus::Disconnected,
                    watermark: 0,
                    reader_alive: false,
                    stop_tx: None,
                    session_timeout: DEFAULT_SESSION_TIMEOUT,
                    remote: None,
                }),
                connect_lock: tokio::sync::Mutex::new(()),
                writer: tokio::sync::Mutex::new(None),
                pending_reader: Mutex::new(None),
                status_stream: VirtualStream::new(),
                packet_stream: TaggedStream::new(),
                pool: WorkerPool::named("session", DEFAULT_SESSION_TIMEOUT),
                factory: Mutex::new(None),
            }),
        }
    }

    /// 服务端会话，包装一条已接受的连接，出生即在线
    pub(crate) async fn accepted(stream: Box<dyn SessionStream>, addr: SocketAddr) -> Self {
        let session = Self::with_type(SessionType::ServerSide);
        session.install(stream).await;
        debug!("session accepted from {}", addr);
        let effect = session.transition(ConnectionStatus::Connected);
        session.apply(effect);
        session
    }

    /// 建立明文连接
    ///
    /// 服务端会话、已连接或已销毁的会话上是空操作。socket 层面的失败
    /// 只记日志，调用方拿到的是未变化的状态，从不报错。
    pub async fn connect(&self, address: &str, port: u16) -> ConnectionStatus {
        self.connect_with(address, port, None).await
    }

    /// 通过注入的工厂建立加密连接，其余行为同 [`Session::connect`]
    pub async fn connect_secured(
        &self,
        address: &str,
        port: u16,
        cert: &ClientCertConfig,
    ) -> ConnectionStatus {
        self.connect_with(address, port, Some(cert)).await
    }

    async fn connect_with(
        &self,
        address: &str,
        port: u16,
        cert: Option<&ClientCertConfig>,
    ) -> ConnectionStatus {
        let _connecting = self.inner.connect_lock.lock().await;
        if self.inner.session_type.is_server_side() || !self.status().is_disconnected() {
            return self.status();
        }

        let stream = match self.construct_stream(address, port, cert).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("couldn't open a socket to {}:{}: {}", address, port, e);
                return self.status();
            }
        };
        if !self.integrity_check(stream.as_ref()) {
            return self.status();
        }

        self.install(stream).await;
        self.inner.state.lock().unwrap().remote = Some(Remote {
            address: address.to_owned(),
            port,
            secured: cert.is_some(),
        });
        let effect = self.transition(ConnectionStatus::Connected);
        self.apply(effect);
        self.status()
    }

    /// 重拨上一次 connect 的远端
    ///
    /// 加密会话拒绝重拨，这条路径重建不了 TLS 会话。
    pub async fn reconnect(&self) -> ConnectionStatus {
        let remote = self.inner.state.lock().unwrap().remote.clone();
        let Some(remote) = remote else {
            warn!("nothing to reconnect to");
            return self.status();
        };
        if remote.secured {
            warn!("won't reconnect a secured session");
            return self.status();
        }
        self.connect(&remote.address, remote.port).await
    }

    async fn construct_stream(
        &self,
        address: &str,
        port: u16,
        cert: Option<&ClientCertConfig>,
    ) -> io::Result<Box<dyn SessionStream>> {
        match cert {
            None => {
                let stream = TcpStream::connect((address, port)).await?;
                Ok(Box::new(stream) as Box<dyn SessionStream>)
            }
            Some(cert) => {
                let factory = self.inner.factory.lock().unwrap().clone();
                match factory {
                    Some(factory) => factory.connect(address, port, cert).await,
                    None => Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "no secure socket factory installed",
                    )),
                }
            }
        }
    }

    /// 连接建立后的校验点
    /// TODO 与对端交换客户端密钥，完成真正的握手
    fn integrity_check(&self, _stream: &dyn SessionStream) -> bool {
        true
    }

    /// 拆开双工流，装好读写两半
    async fn install(&self, stream: Box<dyn SessionStream>) {
        let (reader, writer) = conn::split(stream);
        *self.inner.writer.lock().await = Some(writer);
        *self.inner.pending_reader.lock().unwrap() = Some(reader);
    }

    /// 状态机唯一的迁移入口
    ///
    /// 同状态迁移和已销毁会话上的迁移是空操作，两个并发调用只有
    /// 一个生效，输掉的一方拿到 `Effect::None`。状态流的发布在锁内，
    /// 发布顺序即迁移顺序。
    fn transition(&self, next: ConnectionStatus) -> Effect {
        self.transition_if(next, None)
    }

    /// 带水位线守卫的迁移，`only_at` 不匹配当前水位线时什么都不做
    fn transition_if(&self, next: ConnectionStatus, only_at: Option<u64>) -> Effect {
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
            ConnectionStatus::Connected => {
                self.inner.status_stream.emit(next);
                Effect::StartReader
            }
            ConnectionStatus::Disconnected => {
                if let Some(stop) = state.stop_tx.take() {
                    let _ = stop.send(true);
                }
                self.inner.status_stream.emit(next);
                Effect::ArmWatchdog {
                    watermark: state.watermark,
                }
            }
            // 终止哨兵就是对外的 Destroyed 信号，由收尾动作发布
            ConnectionStatus::Destroyed => Effect::Teardown,
        }
    }

    fn apply(&self, effect: Effect) {
        match effect {
            Effect::None => {}
            Effect::StartReader => self.start_reader(),
            Effect::ArmWatchdog { watermark } => self.arm_watchdog(watermark),
            Effect::Teardown => self.teardown(),
        }
    }

    /// 启动读循环，整个会话同一时刻至多一个
    fn start_reader(&self) {
        let reader = self.inner.pending_reader.lock().unwrap().take();
        let Some(reader) = reader else {
            error!("couldn't start a session reader, no pending socket");
            return;
        };
        let (stop_tx, stop_rx) = watch::channel(false);
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.reader_alive {
                error!("couldn't start a session reader, one is already alive");
                return;
            }
            state.reader_alive = true;
            state.stop_tx = Some(stop_tx);
        }
        tokio::spawn(reader_loop(self.clone(), reader, stop_rx));
    }

    /// 布置断开看门狗：宽限期后水位线没动过就销毁会话
    fn arm_watchdog(&self, watermark: u64) {
        let session = self.clone();
        let timeout = self.inner.state.lock().unwrap().session_timeout;
        self.inner.pool.submit(async move {
            time::sleep(timeout).await;
            let effect = session.transition_if(ConnectionStatus::Destroyed, Some(watermark));
            if matches!(&effect, Effect::Teardown) {
                info!("session timed out");
                session.apply(effect);
                // 看门狗销毁时顺带释放 socket
                *session.inner.writer.lock().await = None;
            }
        });
    }

    /// 收尾：关掉两条流并销毁工作池
    fn teardown(&self) {
        debug!("session destroyed");
        self.inner.status_stream.close(ConnectionStatus::Destroyed);
        self.inner.packet_stream.close(RPacket::terminal());
        self.inner.pool.destroy();
    }

    /// 发送一个报文，整帧原子写入
    ///
    /// 连接断掉导致的写失败会把会话转入断开并返回 `false`，
    /// 其它 I/O 失败记日志后返回 `false`，从不报错。
    pub async fn send(&self, packet: &SPacket) -> bool {
        let mut writer = self.inner.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            warn!("send without a connected socket");
            return false;
        };
        match writer.write_frame(packet).await {
            Ok(()) => true,
            Err(conn::Error::Io(e)) if is_connection_broken(&e) => {
                error!("connection broken while sending: {}", e);
                let effect = self.transition(ConnectionStatus::Disconnected);
                self.apply(effect);
                false
            }
            Err(e) => {
                error!("send failed: {}", e);
                false
            }
        }
    }

    /// 挂起等待该 tag 的下一个报文
    pub async fn read(&self, tag: i32) -> Option<RPacket> {
        self.inner.packet_stream.pull(tag).await
    }

    pub fn subscribe_packets<F>(&self, tag: i32, callback: F) -> SubscriberId
    where
        F: Fn(RPacket) + Send + Sync + 'static,
    {
        self.inner.packet_stream.subscribe(tag, callback)
    }

    pub fn unsubscribe_packets(&self, id: SubscriberId) -> bool {
        self.inner.packet_stream.unsubscribe(id)
    }

    pub fn subscribe_status<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        self.inner.status_stream.subscribe(callback)
    }

    pub fn unsubscribe_status(&self, id: SubscriberId) -> bool {
        self.inner.status_stream.unsubscribe(id)
    }

    /// 挂起等待下一次状态迁移
    pub async fn next_status(&self) -> Option<ConnectionStatus> {
        self.inner.status_stream.pull().await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().unwrap().status
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    pub fn session_type(&self) -> SessionType {
        self.inner.session_type
    }

    pub fn status_stream(&self) -> VirtualStream<ConnectionStatus> {
        self.inner.status_stream.clone()
    }

    pub fn packet_stream(&self) -> TaggedStream<RPacket> {
        self.inner.packet_stream.clone()
    }

    pub fn set_session_timeout(&self, timeout: Duration) {
        self.inner.state.lock().unwrap().session_timeout = timeout;
    }

    pub fn set_socket_factory(&self, factory: Arc<dyn SecureSocketFactory>) {
        *self.inner.factory.lock().unwrap() = Some(factory);
    }

    /// 销毁会话：断开、收尾、释放 socket，可以重复调用
    ///
    /// socket 释放失败是本库唯一往外抛的错误。
    pub async fn destroy(&self) -> Result<(), Error> {
        let effect = self.transition(ConnectionStatus::Disconnected);
        self.apply(effect);
        let effect = self.transition(ConnectionStatus::Destroyed);
        self.apply(effect);

        let writer = self.inner.writer.lock().await.take();
        if let Some(mut writer) = writer {
            writer.shutdown().await.map_err(Error::SocketRelease)?;
        }
        Ok(())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// 读循环：持续收帧发布到报文流，退出前恰好把会话转入断开一次
async fn reader_loop(session: Session, mut reader: FrameReader, mut stop: watch::Receiver<bool>) {
    debug!("session reader started");
    let outcome = loop {
        select! {
            _ = stop.changed() => break Ok(()),
            read = reader.read_frame() => match read {
                Ok(Some(packet)) => session.inner.packet_stream.emit(packet),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            },
        }
    };

    // 还自认在线就退出是意外，正被关停则是预期内的收尾
    let was_connected = session.is_connected();
    match outcome {
        Ok(()) if was_connected => debug!("peer closed the connection"),
        Ok(()) => debug!("session reader closed normally"),
        Err(e) if was_connected => error!("session reader not normally closed: {}", e),
        Err(e) => debug!("session reader closed while shutting down: {}", e),
    }

    session.inner.state.lock().unwrap().reader_alive = false;
    let effect = session.transition(ConnectionStatus::Disconnected);
    session.apply(effect);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tokio::io::AsyncWriteExt;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:48000".parse().unwrap()
    }

    /// 对端：原始双工流的另一头
    async fn accepted_pair() -> (Session, conn::FrameReader, conn::FrameWriter) {
        let (near, far) = tokio::io::duplex(4096);
        let session = Session::accepted(Box::new(near), test_addr()).await;
        let (far_read, far_write) = conn::split(Box::new(far));
        (session, far_read, far_write)
    }

    #[tokio::test]
    async fn accepted_session_is_connected_and_reads_frames() {
        let (session, _far_read, mut far_write) = accepted_pair().await;
        assert!(session.is_connected());
        assert!(session.session_type().is_server_side());
        assert_eq!(session.next_status().await, Some(ConnectionStatus::Connected));

        far_write
            .write_frame(&SPacket::new(9).write_string("ping"))
            .await
            .unwrap();
        let packet = session.read(9).await.unwrap();
        assert_eq!(packet.read_string(), "ping");
    }

    #[tokio::test]
    async fn connect_on_a_server_side_session_is_a_noop() {
        let (session, _far_read, _far_write) = accepted_pair().await;
        let status = session.connect("127.0.0.1", 1).await;
        assert_eq!(status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn a_second_reader_start_is_rejected() {
        let (session, _far_read, mut far_write) = accepted_pair().await;

        // 趁读循环在跑再塞一个待启动的读半边进去
        let (spare, _spare_peer) = tokio::io::duplex(64);
        let (reader, _writer) = conn::split(Box::new(spare));
        *session.inner.pending_reader.lock().unwrap() = Some(reader);
        session.start_reader();

        // 第一个读循环还独自活着，照常收帧
        assert!(session.inner.state.lock().unwrap().reader_alive);
        far_write
            .write_frame(&SPacket::new(1).write_string("still here"))
            .await
            .unwrap();
        let packet = session.read(1).await.unwrap();
        assert_eq!(packet.read_string(), "still here");
    }

    #[tokio::test]
    async fn peer_close_moves_the_session_to_disconnected() {
        let (session, far_read, far_write) = accepted_pair().await;
        drop(far_read);
        drop(far_write);

        assert_eq!(session.next_status().await, Some(ConnectionStatus::Connected));
        assert_eq!(
            session.next_status().await,
            Some(ConnectionStatus::Disconnected)
        );
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn send_without_a_socket_returns_false() {
        let session = Session::new();
        assert!(!session.send(&SPacket::new(1).write_string("x")).await);
    }

    #[tokio::test]
    async fn reconnect_with_nothing_remembered_keeps_the_status() {
        let session = Session::new();
        assert_eq!(session.reconnect().await, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn watchdog_destroys_an_unreconnected_session() {
        let (session, far_read, far_write) = accepted_pair().await;
        session.set_session_timeout(Duration::from_millis(100));
        drop(far_read);
        drop(far_write);

        assert_eq!(session.next_status().await, Some(ConnectionStatus::Connected));
        assert_eq!(
            session.next_status().await,
            Some(ConnectionStatus::Disconnected)
        );
        time::sleep(Duration::from_millis(300)).await;
        assert!(session.status().is_destroyed());
        // 两条流都已关闭，终止哨兵兜底
        assert_eq!(session.next_status().await, Some(ConnectionStatus::Destroyed));
        assert_eq!(session.next_status().await, None);
        assert_eq!(session.read(42).await, None);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let (session, _far_read, _far_write) = accepted_pair().await;
        session.destroy().await.unwrap();
        assert!(session.status().is_destroyed());
        session.destroy().await.unwrap();
        assert!(session.status().is_destroyed());
    }

    #[tokio::test]
    async fn frames_already_buffered_still_parse_after_close() {
        // 对端一口气写两帧再断开，两帧都要到位
        let (near, far) = tokio::io::duplex(4096);
        let session = Session::accepted(Box::new(near), test_addr()).await;

        let mut bytes = BytesMut::new();
        SPacket::new(3).write_string("a").write(&mut bytes).unwrap();
        SPacket::new(3).write_string("b").write(&mut bytes).unwrap();
        let (_far_read, mut far_write) = tokio::io::split(far);
        far_write.write_all(&bytes).await.unwrap();
        far_write.shutdown().await.unwrap();

        assert_eq!(session.read(3).await.unwrap().read_string(), "a");
        assert_eq!(session.read(3).await.unwrap().read_string(), "b");
    }
}
