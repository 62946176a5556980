//! Several tasks serializing access to one resource.
//!
//! Every task contends for the same lock name through a shared session,
//! holds the lock for a moment of "work", then releases it so the next
//! contender can proceed. Runs against the in-memory store; swap in
//! [`verlease::store::dynamodb::DynamoDbStore`] to spread the contenders
//! across machines.

use std::{sync::Arc, time::Duration};
use tracing::info;
use verlease::{store::memory::MemoryStore, Session};

const TASKS: usize = 5;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let session = Session::builder()
        .host_identifier("basic-demo")
        .build(Arc::new(MemoryStore::new()));

    let mut tasks = Vec::new();
    for worker in 0..TASKS {
        let session = session.clone();
        tasks.push(tokio::spawn(async move {
            // 5s lease, plenty for 1s of work; no refresher needed.
            let mut lock = session.create_lock("my lock", false);
            lock.scoped(5, Duration::from_secs(300), || async move {
                info!(worker, "acquired lock");
                tokio::time::sleep(Duration::from_secs(1)).await;
                info!(worker, "releasing lock");
            })
            .await
            .expect("lock round failed");
        }));
    }

    for task in tasks {
        task.await.expect("worker panicked");
    }
    info!("all workers done");
}
