//! 会话底下的帧读写
//! 本层只关心按帧读写 socket，不包含任何会话状态逻辑
//!
//! 使用缓冲区而非按字节从 socket 读写：读端先从缓冲区试解析，
//! 字节不够再从 socket 补；写端先编码进缓冲区再一次性刷入。

use bytes::BytesMut;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use super::packet::{self, RPacket, SPacket};

/// 会话可以骑在任何双工字节流上，TLS 工厂产出的流也走这里
pub trait SessionStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SessionStream for T {}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Packet error: {0}")]
    Packet(#[from] packet::Error),
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
    #[error("Connection closed in the middle of a frame")]
    UnexpectedEof,
}

/// 对端是不是直接断了连接
///
/// 这类写失败意味着会话该转入断开，其它 I/O 失败只记日志。
pub(crate) fn is_connection_broken(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// 把一条双工流拆成帧读写两半
pub(crate) fn split(stream: Box<dyn SessionStream>) -> (FrameReader, FrameWriter) {
    let (read, write) = io::split(stream);
    (
        FrameReader {
            read,
            buffer: BytesMut::new(),
        },
        FrameWriter {
            write,
            buffer: BytesMut::new(),
        },
    )
}

/// 读半边
pub(crate) struct FrameReader {
    read: ReadHalf<Box<dyn SessionStream>>,
    /// 读缓冲区
    buffer: BytesMut,
}

impl FrameReader {
    /// 读取一个帧
    ///
    /// 在帧边界上读到流结束返回 `Ok(None)`，视为对端正常断开；
    /// 帧中途断流是错误。
    pub(crate) async fn read_frame(&mut self) -> Result<Option<RPacket>, Error> {
        loop {
            match RPacket::read_from(&mut self.buffer) {
                Ok(packet) => return Ok(Some(packet)),
                Err(packet::Error::InsufficientBytes(_)) => {}
                Err(e) => return Err(Error::Packet(e)),
            }

            // 数据不足，读取更多数据
            let read = self.read.read_buf(&mut self.buffer).await?;
            if 0 == read {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(Error::UnexpectedEof);
            }
        }
    }
}

/// 写半边
pub(crate) struct FrameWriter {
    write: WriteHalf<Box<dyn SessionStream>>,
    /// 写缓冲区
    buffer: BytesMut,
}

impl FrameWriter {
    /// 编码一个帧并整体写入 socket
    pub(crate) async fn write_frame(&mut self, packet: &SPacket) -> Result<(), Error> {
        packet.write(&mut self.buffer)?;
        self.write.write_all(&self.buffer).await?;
        self.buffer.clear();
        Ok(())
    }

    /// 释放 socket 的写方向
    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        self.write.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time;

    fn framed(stream: tokio::io::DuplexStream) -> (FrameReader, FrameWriter) {
        split(Box::new(stream))
    }

    #[tokio::test]
    async fn frames_cross_the_stream_intact() {
        // 缓冲放得下最大的测试帧，整帧写入不依赖对端同时消费
        let (near, far) = tokio::io::duplex(2 << 20);
        let (mut near_read, mut near_write) = framed(near);
        let (mut far_read, mut far_write) = framed(far);

        near_write
            .write_frame(&SPacket::new(5).write_string("Hello"))
            .await
            .unwrap();
        let packet = far_read.read_frame().await.unwrap().unwrap();
        assert_eq!(packet.tag(), 5);
        assert_eq!(packet.read_string(), "Hello");

        far_write
            .write_frame(&SPacket::new(-3).write_bytes(vec![0u8; 1 << 20]))
            .await
            .unwrap();
        let packet = near_read.read_frame().await.unwrap().unwrap();
        assert_eq!(packet.tag(), -3);
        assert_eq!(packet.data().len(), 1 << 20);
    }

    #[tokio::test]
    async fn short_reads_are_accumulated_into_one_frame() {
        let (near, far) = tokio::io::duplex(4096);
        let (mut far_read, _far_write) = framed(far);

        let mut bytes = BytesMut::new();
        SPacket::new(1)
            .write_bytes(vec![7u8; 32])
            .write(&mut bytes)
            .unwrap();

        // 一个帧分两次慢慢写，读端要能拼起来
        let (_near_read, mut near_write) = tokio::io::split(near);
        let reader = tokio::spawn(async move { far_read.read_frame().await });
        near_write.write_all(&bytes[..10]).await.unwrap();
        time::sleep(Duration::from_millis(50)).await;
        near_write.write_all(&bytes[10..]).await.unwrap();

        let packet = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(packet.tag(), 1);
        assert_eq!(packet.data().as_ref(), &[7u8; 32]);
    }

    #[tokio::test]
    async fn eof_on_a_frame_boundary_is_a_normal_close() {
        let (near, far) = tokio::io::duplex(4096);
        let (mut far_read, _keep) = framed(far);

        let (_near_read, mut near_write) = framed(near);
        near_write
            .write_frame(&SPacket::new(2).write_string("bye"))
            .await
            .unwrap();
        near_write.shutdown().await.unwrap();

        assert!(far_read.read_frame().await.unwrap().is_some());
        assert!(far_read.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_a_frame_is_an_error() {
        let (near, far) = tokio::io::duplex(4096);
        let (mut far_read, _keep) = framed(far);

        let mut bytes = BytesMut::new();
        SPacket::new(2)
            .write_bytes(vec![1, 2, 3, 4])
            .write(&mut bytes)
            .unwrap();

        let (_near_read, mut near_write) = tokio::io::split(near);
        near_write.write_all(&bytes[..bytes.len() - 1]).await.unwrap();
        near_write.shutdown().await.unwrap();

        match far_read.read_frame().await {
            Err(Error::UnexpectedEof) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
