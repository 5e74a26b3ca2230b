use crate::*;

use ferry_store::ChunkState;

#[tokio::test]
async fn test_tls_batch_is_persisted_byte_exact() {
    let store = temp_store("tls-batch", 0);
    let (receiver, mut drain) = start_receiver(&test_config(true), &store).unwrap();
    let port = receiver.start_worker().unwrap();

    let chunks = vec![
        (1, payload(1024 * 1024 + 3, 1)),
        (2, Vec::new()),
        (3, payload(70_000, 2)),
    ];
    let mut stream = connect(&receiver, port).await.unwrap();
    send_batch(&mut stream, &chunks).await.unwrap();
    stream.shutdown().await.unwrap();

    assert!(wait_for_exit(&receiver, port).await, "worker should exit after sender closes");

    for (chunk_id, data) in &chunks {
        let on_disk = std::fs::read(store.resolve_path(*chunk_id)).unwrap();
        assert_eq!(on_disk.len(), data.len(), "chunk {chunk_id} length");
        assert!(on_disk == *data, "chunk {chunk_id} contents differ");
        assert_eq!(
            store.state(*chunk_id),
            Some(ChunkState::Downloaded {
                bytes: data.len() as u64,
                is_compressed: false
            })
        );
    }
    assert!(drain.drain_errors().is_empty());
    assert!(!receiver.fault().is_raised());
}

#[tokio::test]
async fn test_connection_carries_several_batches() {
    let store = temp_store("reuse", 0);
    let (receiver, mut drain) = start_receiver(&test_config(true), &store).unwrap();
    let port = receiver.start_worker().unwrap();

    let mut stream = connect(&receiver, port).await.unwrap();
    send_batch(&mut stream, &[(10, payload(500, 1)), (11, payload(600, 2))])
        .await
        .unwrap();
    send_batch(&mut stream, &[(12, payload(700, 3))]).await.unwrap();

    // The first batch ending must not end the connection
    assert!(wait_until(SETTLE, || store.resolve_path(12).exists()).await);
    assert_eq!(receiver.is_worker_running(port), Some(true));

    send_batch(&mut stream, &[(13, payload(800, 4))]).await.unwrap();
    stream.shutdown().await.unwrap();
    assert!(wait_for_exit(&receiver, port).await);

    assert_eq!(store.count(), 4);
    assert_eq!(std::fs::read(store.resolve_path(13)).unwrap(), payload(800, 4));
    assert!(drain.drain_errors().is_empty());
}

#[tokio::test]
async fn test_plaintext_mode() {
    let store = temp_store("plain", 0);
    let (receiver, mut drain) = start_receiver(&test_config(false), &store).unwrap();
    assert!(receiver.certificate().is_none());
    let port = receiver.start_worker().unwrap();

    let data = payload(100_000, 9);
    let mut stream = connect(&receiver, port).await.unwrap();
    send_batch(&mut stream, &[(42, data.clone())]).await.unwrap();
    stream.shutdown().await.unwrap();

    assert!(wait_for_exit(&receiver, port).await);
    assert_eq!(std::fs::read(store.resolve_path(42)).unwrap(), data);
    assert!(drain.drain_errors().is_empty());
}

#[tokio::test]
async fn test_profiling_samples_track_progress() {
    let store = temp_store("profile", 0);
    let (receiver, mut drain) = start_receiver(&test_config(true), &store).unwrap();
    let port = receiver.start_worker().unwrap();

    let len = 200_000;
    let mut stream = connect(&receiver, port).await.unwrap();
    send_batch(&mut stream, &[(7, payload(len, 0))]).await.unwrap();
    stream.shutdown().await.unwrap();
    assert!(wait_for_exit(&receiver, port).await);

    let samples: Vec<_> = drain
        .drain_samples()
        .into_iter()
        .filter(|s| s.chunk_id == 7)
        .collect();
    let worker_id = receiver.worker_id(port).unwrap();
    assert!(samples.len() >= len / (16 * 1024));
    assert!(samples.iter().all(|s| s.worker_id == worker_id));
    assert!(samples.windows(2).all(|w| {
        w[0].cumulative_bytes < w[1].cumulative_bytes && w[0].elapsed_ms <= w[1].elapsed_ms
    }));
    assert_eq!(samples.last().unwrap().cumulative_bytes, len as u64);
}

#[tokio::test]
async fn test_workers_share_one_store() {
    let store = temp_store("shared", 0);
    let (receiver, mut drain) = start_receiver(&test_config(true), &store).unwrap();
    let ports = receiver.start_workers(4).unwrap();

    let mut senders = Vec::new();
    for (i, &port) in ports.iter().enumerate() {
        let mut stream = connect(&receiver, port).await.unwrap();
        let base = (i as u64) * 100;
        senders.push(tokio::spawn(async move {
            let chunks: Vec<_> = (0..5).map(|n| (base + n, payload(30_000, n as u8))).collect();
            send_batch(&mut stream, &chunks).await.unwrap();
            stream.shutdown().await.unwrap();
        }));
    }
    for sender in senders {
        sender.await.unwrap();
    }
    for &port in &ports {
        assert!(wait_for_exit(&receiver, port).await);
    }

    assert_eq!(store.count(), 20);
    assert_eq!(store.used(), 20 * 30_000);
    assert!(drain.drain_errors().is_empty());
}

#[tokio::test]
async fn test_capacity_backpressure_resumes_when_space_frees() {
    let store = temp_store("backpressure", 100_000);
    let (receiver, mut drain) = start_receiver(&test_config(true), &store).unwrap();
    let port = receiver.start_worker().unwrap();

    let mut stream = connect(&receiver, port).await.unwrap();
    send_batch(&mut stream, &[(1, payload(60_000, 1))]).await.unwrap();
    assert!(wait_until(SETTLE, || store.resolve_path(1).exists()).await);

    // 60k of 100k used: the next 60k chunk stalls until chunk 1 is consumed
    send_batch(&mut stream, &[(2, payload(60_000, 2))]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!store.resolve_path(2).exists());
    assert_eq!(receiver.is_worker_running(port), Some(true));

    assert!(store.remove(1).unwrap());
    assert!(wait_until(SETTLE, || store.resolve_path(2).exists()).await);
    assert_eq!(std::fs::read(store.resolve_path(2)).unwrap(), payload(60_000, 2));

    stream.shutdown().await.unwrap();
    assert!(wait_for_exit(&receiver, port).await);
    assert!(drain.drain_errors().is_empty());
}

#[tokio::test]
async fn test_sender_hanging_up_without_reading_loses_nothing() {
    let store = temp_store("hangup", 0);
    let (receiver, mut drain) = start_receiver(&test_config(true), &store).unwrap();
    let ports = receiver.start_workers(2).unwrap();

    let mut sent = Vec::new();
    for (i, &port) in ports.iter().enumerate() {
        let mut stream = connect(&receiver, port).await.unwrap();
        let chunks: Vec<_> = (0..4)
            .map(|n| ((i as u64) * 10 + n, payload(256 * 1024, n as u8)))
            .collect();
        send_batch(&mut stream, &chunks).await.unwrap();
        // No close_notify and nothing ever read back
        drop(stream);
        sent.extend(chunks);
    }
    for &port in &ports {
        assert!(wait_for_exit(&receiver, port).await);
    }

    assert!(drain.drain_errors().is_empty());
    assert!(!receiver.fault().is_raised());
    assert_eq!(store.count(), sent.len());
    for (chunk_id, data) in &sent {
        assert!(std::fs::read(store.resolve_path(*chunk_id)).unwrap() == *data);
    }
}
