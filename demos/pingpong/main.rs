use clap::Parser;
use demos::Config;
use log::info;
use tagwire::{SPacket, Session, SessionServer};

#[derive(Parser)]
struct Args {
    /// 配置文件路径
    #[clap(short, long, default_value = "./demos/pingpong.toml")]
    config: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    flexi_logger::Logger::try_with_str("debug")
        .unwrap()
        .start()
        .unwrap();

    // 获取配置
    let cfg = Config::from_path(&args.config).await;

    // 开服务端，每来一条会话就回显它的 4 号报文
    let server = SessionServer::new();
    server.open(cfg.pingpong.port).await;
    server.subscribe_sessions(|session: Session| {
        tokio::spawn(async move {
            while let Some(packet) = session.read(4).await {
                info!("server got: {}", packet.read_string());
                session
                    .send(&SPacket::new(4).write_string(&packet.read_string()))
                    .await;
            }
        });
    });

    // 客户端连上去打一个来回
    let session = Session::new();
    session.connect(&cfg.pingpong.address, cfg.pingpong.port).await;
    session
        .send(&SPacket::new(4).write_string(&cfg.pingpong.message))
        .await;
    let reply = session.read(4).await.unwrap();
    info!("client got: {}", reply.read_string());

    session.destroy().await.unwrap();
    server.destroy();
}
