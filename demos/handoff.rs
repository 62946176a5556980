//! Passing one held lock along a chain of tasks.
//!
//! The lock is acquired once, then travels the chain as serialized bytes:
//! each task deserializes it, works while holding it, re-serializes it and
//! hands it to the next task. The lock is never released in between, so no
//! contender could sneak in mid-chain.

use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::info;
use verlease::{store::memory::MemoryStore, Session};

const TASKS: usize = 4;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let store = Arc::new(MemoryStore::new());
    let session = Session::builder()
        .host_identifier("handoff-demo")
        .build(store.clone());

    // Channels overlap by one: each task's output feeds the next input.
    let mut senders = Vec::new();
    let mut receivers = Vec::new();
    for _ in 0..=TASKS {
        let (tx, rx) = mpsc::channel::<String>(1);
        senders.push(tx);
        receivers.push(rx);
    }
    let first_tx = senders.remove(0);
    let mut last_rx = receivers.pop().expect("one more receiver than task");

    let mut tasks = Vec::new();
    for (stage, (mut rx, tx)) in receivers.into_iter().zip(senders).enumerate() {
        let session = session.clone();
        tasks.push(tokio::spawn(async move {
            let serialized = rx.recv().await.expect("chain broke");
            let mut lock = session
                .deserialize_lock(&serialized, false)
                .await
                .expect("handed-off lock should deserialize");
            info!(stage, "took over the lock, working");
            tokio::time::sleep(Duration::from_millis(500)).await;
            let serialized = lock.serialize().await.expect("serialize failed");
            info!(stage, "passing the lock on");
            tx.send(serialized).await.expect("chain broke");
        }));
    }

    let mut lock = session.create_lock("my lock", false);
    lock.acquire_with(20, Duration::from_secs(300))
        .await
        .expect("initial acquire failed");
    info!("acquired, sending into the chain");
    first_tx
        .send(lock.serialize().await.expect("serialize failed"))
        .await
        .expect("chain broke");

    let serialized = last_rx.recv().await.expect("chain broke");
    let mut lock = session
        .deserialize_lock(&serialized, false)
        .await
        .expect("returned lock should deserialize");
    lock.release().await.expect("release failed");
    info!("lock came back and was released");

    for task in tasks {
        task.await.expect("stage panicked");
    }
}
