#![allow(dead_code)]

//! 一个 TCP 之上的小型消息基座
//!
//! 会话负责把二进制报文按长度成帧收发，服务端接受连接并发布会话，
//! 两者的状态迁移和收到的报文统一经由值流交付：消费方既可以阻塞
//! 拉取，也可以注册回调异步接收。所有异步派发由一个弹性工作池驱动。

pub mod error;
pub mod pool;
pub mod session;
pub mod stream;

pub use error::Error;
pub use session::packet::{RPacket, SPacket};
pub use session::server::SessionServer;
pub use session::status::{ConnectionStatus, ServerStatus, SessionType};
pub use session::Session;
