//! 会话状态枚举
//! DESTROYED / Destroyed 是终态，任何操作都不能离开它

/// 单个会话的连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
    Destroyed,
}

impl ConnectionStatus {
    pub fn is_connected(self) -> bool {
        self == ConnectionStatus::Connected
    }

    pub fn is_disconnected(self) -> bool {
        self == ConnectionStatus::Disconnected
    }

    pub fn is_destroyed(self) -> bool {
        self == ConnectionStatus::Destroyed
    }
}

/// 会话服务端的监听状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Closed,
    Opened,
    Destroyed,
}

impl ServerStatus {
    pub fn is_opened(self) -> bool {
        self == ServerStatus::Opened
    }

    pub fn is_closed(self) -> bool {
        self == ServerStatus::Closed
    }

    pub fn is_destroyed(self) -> bool {
        self == ServerStatus::Destroyed
    }
}

/// 会话由哪一端创建
/// 服务端会话来自 accept，不允许主动 connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    ClientSide,
    ServerSide,
}

impl SessionType {
    pub fn is_client_side(self) -> bool {
        self == SessionType::ClientSide
    }

    pub fn is_server_side(self) -> bool {
        self == SessionType::ServerSide
    }
}
