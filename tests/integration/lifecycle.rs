use crate::*;

use ferryd::ReceiverError;

async fn refused(port: u16) -> bool {
    TcpStream::connect((LOOPBACK, port)).await.is_err()
}

#[tokio::test]
async fn test_port_serves_a_single_connection() {
    let store = temp_store("single-conn", 0);
    let (receiver, _drain) = start_receiver(&test_config(true), &store).unwrap();
    let port = receiver.start_worker().unwrap();

    let _first = connect(&receiver, port).await.unwrap();
    assert!(refused(port).await, "second connection should be refused");
    assert_eq!(receiver.is_worker_running(port), Some(true));
}

#[tokio::test]
async fn test_stopped_port_refuses_connections() {
    let store = temp_store("stopped", 0);
    let (receiver, _drain) = start_receiver(&test_config(true), &store).unwrap();
    let port = receiver.start_worker().unwrap();

    receiver.stop_worker(port).await.unwrap();
    assert!(refused(port).await);
    assert_eq!(receiver.is_worker_running(port), None);
    assert!(receiver.ports().is_empty());
}

#[tokio::test]
async fn test_unknown_port_is_not_found() {
    let store = temp_store("unknown", 0);
    let (receiver, _drain) = start_receiver(&test_config(false), &store).unwrap();
    let port = receiver.start_worker().unwrap();
    let other = port.wrapping_add(1);

    assert!(matches!(
        receiver.stop_worker(other).await,
        Err(ReceiverError::NotFound(p)) if p == other
    ));
    assert_eq!(receiver.is_worker_running(other), None);
    assert_eq!(receiver.ports(), vec![port]);
}

#[tokio::test]
async fn test_finished_worker_stays_registered_until_stopped() {
    let store = temp_store("reap", 0);
    let (receiver, _drain) = start_receiver(&test_config(true), &store).unwrap();
    let port = receiver.start_worker().unwrap();

    let mut stream = connect(&receiver, port).await.unwrap();
    send_batch(&mut stream, &[(1, payload(10, 0))]).await.unwrap();
    stream.shutdown().await.unwrap();

    assert!(wait_for_exit(&receiver, port).await);
    assert_eq!(receiver.ports(), vec![port]);

    receiver.stop_worker(port).await.unwrap();
    assert!(receiver.ports().is_empty());
}

#[tokio::test]
async fn test_stop_interrupts_idle_connection() {
    let store = temp_store("idle-stop", 0);
    let (receiver, mut drain) = start_receiver(&test_config(true), &store).unwrap();
    let port = receiver.start_worker().unwrap();

    let mut stream = connect(&receiver, port).await.unwrap();
    send_batch(&mut stream, &[(1, payload(1000, 0))]).await.unwrap();
    assert!(wait_until(SETTLE, || store.resolve_path(1).exists()).await);

    // Default stop timeout is far longer than this; the worker must leave on its own
    let started = Instant::now();
    receiver.stop_worker(port).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(drain.drain_errors().is_empty());
    assert!(!receiver.fault().is_raised());
}

#[tokio::test]
async fn test_stuck_worker_is_aborted_after_stop_timeout() {
    let store = temp_store("forced-stop", 0);
    let mut config = test_config(true);
    config.receiver.stop_timeout_secs = 1;
    let (receiver, _drain) = start_receiver(&config, &store).unwrap();
    let port = receiver.start_worker().unwrap();

    // Header promises 1 MiB, only a sliver arrives: the worker sits in a payload read
    let mut stream = connect(&receiver, port).await.unwrap();
    let partial = frame(5, &payload(1024 * 1024, 0), 0);
    stream.write_all(&partial[..4096]).await.unwrap();
    stream.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    tokio::time::timeout(SETTLE, receiver.stop_worker(port))
        .await
        .expect("stop_worker should return after aborting")
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert_eq!(receiver.is_worker_running(port), None);
    assert!(!store.resolve_path(5).exists());
}

#[tokio::test]
async fn test_stop_all_with_mixed_workers() {
    let store = temp_store("stop-all", 0);
    let (receiver, _drain) = start_receiver(&test_config(true), &store).unwrap();
    let ports = receiver.start_workers(3).unwrap();

    // One connected, two still waiting for a sender
    let _stream = connect(&receiver, ports[0]).await.unwrap();

    tokio::time::timeout(SETTLE, receiver.stop_all())
        .await
        .expect("stop_all should finish");
    assert!(receiver.ports().is_empty());
    for port in ports {
        assert!(refused(port).await);
    }
}
