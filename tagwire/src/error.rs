use tokio::io;

use crate::session::conn;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(#[from] conn::Error),
    /// 销毁会话时释放不掉 socket，唯一往外抛的错误
    #[error("Socket release failed: {0}")]
    SocketRelease(#[source] io::Error),
}
