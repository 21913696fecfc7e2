//! 加密 socket 的接入缝
//!
//! 本库不携带任何 TLS 实现。使用方通过
//! [`crate::Session::set_socket_factory`] /
//! [`crate::SessionServer::set_socket_factory`] 注入一个工厂，
//! 核心只把它当作「给定地址和证书配置，产出一条双工字节流或失败」。

use std::net::SocketAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io;

use super::conn::SessionStream;

/// 客户端证书配置
#[derive(Debug, Clone)]
pub struct ClientCertConfig {
    /// 证书容器文件
    pub source: PathBuf,
    pub password: String,
    pub protocol: SecureProtocol,
    pub format: KeystoreFormat,
}

/// 服务端证书配置
#[derive(Debug, Clone)]
pub struct ServerCertConfig {
    pub source: PathBuf,
    pub password: String,
    pub protocol: SecureProtocol,
    pub format: KeystoreFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureProtocol {
    Sslv3,
    Tlsv1_1,
    Tlsv1_2,
}

impl SecureProtocol {
    pub fn version(self) -> &'static str {
        match self {
            SecureProtocol::Sslv3 => "SSLv3",
            SecureProtocol::Tlsv1_1 => "TLSv1.1",
            SecureProtocol::Tlsv1_2 => "TLSv1.2",
        }
    }
}

/// 证书容器格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeystoreFormat {
    Pkcs12,
    Pem,
}

/// 由使用方实现的加密 socket 工厂
#[async_trait]
pub trait SecureSocketFactory: Send + Sync + 'static {
    /// 建立一条到 `address:port` 的加密连接
    async fn connect(
        &self,
        address: &str,
        port: u16,
        cert: &ClientCertConfig,
    ) -> io::Result<Box<dyn SessionStream>>;

    /// 绑定一个加密监听端口
    async fn bind(&self, port: u16, cert: &ServerCertConfig)
        -> io::Result<Box<dyn SecureListener>>;
}

/// 工厂产出的加密监听器
#[async_trait]
pub trait SecureListener: Send + Sync {
    async fn accept(&mut self) -> io::Result<(Box<dyn SessionStream>, SocketAddr)>;
}
