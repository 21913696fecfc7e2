use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::info;
use tagwire::pool::WorkerPool;
use tokio::time;

#[tokio::main]
async fn main() {
    flexi_logger::Logger::try_with_str("debug")
        .unwrap()
        .start()
        .unwrap();

    let pool = WorkerPool::default();
    let count = Arc::new(AtomicU32::new(0));
    for _ in 0..100 {
        for _ in 0..3 {
            let count = count.clone();
            pool.submit(async move {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
    }

    time::sleep(Duration::from_secs(2)).await;
    info!("count: {}", count.load(Ordering::SeqCst));
    pool.destroy();
}
