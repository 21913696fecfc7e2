//! 报文的线上格式
//!
//! 每个报文在 socket 上都是一个连续的帧，所有整数大端编码：
//!
//! ```text
//! [4 字节: 负载长度 N]
//! [4 字节: tag]
//! [N 字节: 负载]
//! ```
//!
//! 没有魔数、校验和或版本协商。tag 是应用层定义的通道号，
//! 多个报文可以共享同一个 tag。

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::stream::tagged::Tagged;

/// 长度字段 + tag 字段
pub(crate) const HEADER_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("At least {0} more bytes required")]
    InsufficientBytes(usize),
    #[error("Payload of {0} bytes exceeds the length field")]
    PayloadTooLarge(usize),
}

/// 出站报文，链式填充负载后交给 [`crate::Session::send`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SPacket {
    tag: i32,
    data: Bytes,
}

impl SPacket {
    pub fn new(tag: i32) -> Self {
        Self {
            tag,
            data: Bytes::new(),
        }
    }

    pub fn write_bytes(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    pub fn write_string(mut self, text: &str) -> Self {
        self.data = Bytes::copy_from_slice(text.as_bytes());
        self
    }

    pub fn tag(&self) -> i32 {
        self.tag
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// 编码为一个完整的帧，追加到写缓冲区
    pub(crate) fn write(&self, buf: &mut BytesMut) -> Result<(), Error> {
        if self.data.len() > u32::MAX as usize {
            return Err(Error::PayloadTooLarge(self.data.len()));
        }
        buf.reserve(HEADER_LEN + self.data.len());
        buf.put_u32(self.data.len() as u32);
        buf.put_i32(self.tag);
        buf.put_slice(&self.data);
        Ok(())
    }
}

impl Tagged for SPacket {
    fn tag(&self) -> i32 {
        self.tag
    }
}

/// 入站报文，由读循环解析产生，内容不可变
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RPacket {
    tag: i32,
    data: Bytes,
}

impl RPacket {
    pub(crate) fn new(tag: i32, data: Bytes) -> Self {
        Self { tag, data }
    }

    /// 流关闭时投入各个 tag 队列的哨兵值
    pub(crate) fn terminal() -> Self {
        Self::new(0, Bytes::new())
    }

    pub fn tag(&self) -> i32 {
        self.tag
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn read_string(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// 从读缓冲区解析一个帧
    ///
    /// 数据不足时返回 [`Error::InsufficientBytes`] 并保持缓冲区不变，
    /// 调用方读到更多字节后重试。成功时恰好消费一个帧。
    pub(crate) fn read_from(buf: &mut BytesMut) -> Result<Self, Error> {
        if buf.len() < HEADER_LEN {
            return Err(Error::InsufficientBytes(HEADER_LEN - buf.len()));
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if buf.len() < HEADER_LEN + len {
            return Err(Error::InsufficientBytes(HEADER_LEN + len - buf.len()));
        }

        buf.advance(4);
        let tag = buf.get_i32();
        let data = buf.split_to(len).freeze();
        Ok(Self { tag, data })
    }
}

impl Tagged for RPacket {
    fn tag(&self) -> i32 {
        self.tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(tag: i32, payload: Vec<u8>) {
        let mut buf = BytesMut::new();
        SPacket::new(tag)
            .write_bytes(payload.clone())
            .write(&mut buf)
            .unwrap();
        assert_eq!(buf.len(), HEADER_LEN + payload.len());

        let packet = RPacket::read_from(&mut buf).unwrap();
        assert_eq!(packet.tag(), tag);
        assert_eq!(packet.data().as_ref(), payload.as_slice());
        assert!(buf.is_empty());
    }

    #[test]
    fn roundtrip_preserves_tag_and_payload() {
        roundtrip(5, Vec::new());
        roundtrip(0, vec![0x42]);
        roundtrip(-17, vec![0xAB; 1 << 20]);
    }

    #[test]
    fn string_payload_roundtrips() {
        let mut buf = BytesMut::new();
        SPacket::new(4).write_string("héllo").write(&mut buf).unwrap();

        let packet = RPacket::read_from(&mut buf).unwrap();
        assert_eq!(packet.read_string(), "héllo");
    }

    #[test]
    fn insufficient_bytes_reports_missing_count() {
        let mut buf = BytesMut::new();
        match RPacket::read_from(&mut buf) {
            Err(Error::InsufficientBytes(n)) => assert_eq!(n, 8),
            other => panic!("unexpected: {other:?}"),
        }

        SPacket::new(1)
            .write_bytes(vec![1, 2, 3, 4])
            .write(&mut buf)
            .unwrap();
        let mut truncated = buf.split_to(buf.len() - 2);
        match RPacket::read_from(&mut truncated) {
            Err(Error::InsufficientBytes(n)) => assert_eq!(n, 2),
            other => panic!("unexpected: {other:?}"),
        }
        // 缓冲区未被消费，补齐后可以继续解析
        truncated.unsplit(buf);
        let packet = RPacket::read_from(&mut truncated).unwrap();
        assert_eq!(packet.data().as_ref(), &[1, 2, 3, 4]);
    }

    #[test]
    fn consecutive_frames_parse_one_by_one() {
        let mut buf = BytesMut::new();
        SPacket::new(1).write_string("a").write(&mut buf).unwrap();
        SPacket::new(2).write_string("bb").write(&mut buf).unwrap();

        let first = RPacket::read_from(&mut buf).unwrap();
        assert_eq!((first.tag(), first.read_string().as_str()), (1, "a"));
        let second = RPacket::read_from(&mut buf).unwrap();
        assert_eq!((second.tag(), second.read_string().as_str()), (2, "bb"));
        assert!(buf.is_empty());
    }
}
