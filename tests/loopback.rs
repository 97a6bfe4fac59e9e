//! 실제 UDP 소켓(루프백)으로 Instance 구동

mod common;

use std::time::Duration;

use bytes::Bytes;
use norm_engine::{
    EventKind, Instance, InstanceConfig, SenderParams, SessionAddress, SessionConfig,
};

#[tokio::test]
async fn test_data_object_over_loopback() {
    common::init_tracing();
    let cache = tempfile::tempdir().unwrap();
    let mut instance = Instance::new(InstanceConfig {
        cache_dir: Some(cache.path().to_path_buf()),
        rng_seed: Some(42),
        ..InstanceConfig::default()
    })
    .unwrap();

    let rx = instance
        .create_session("127.0.0.1/0".parse().unwrap(), 2, SessionConfig::default())
        .unwrap();
    instance.start_receiver(rx, 4 * 1024 * 1024).unwrap();
    let port = instance.rx_local_addr(rx).unwrap().unwrap().port();

    let config = SessionConfig {
        tx_rate: 10_000_000.0,
        grtt_estimate: 0.01,
        ..SessionConfig::default()
    };
    let address: SessionAddress = format!("127.0.0.1/{}", port).parse().unwrap();
    let tx = instance.create_session(address, 1, config).unwrap();
    instance
        .start_sender(tx, SenderParams::new(1024 * 1024, 1200, 32, 4))
        .unwrap();

    let data = Bytes::from(common::random_bytes(200 * 1024, 99));
    instance
        .session_mut(tx)
        .unwrap()
        .enqueue_data(data.clone(), Some(Bytes::from_static(b"hello")))
        .unwrap()
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let event = instance
                .next_event(Some(Duration::from_secs(1)))
                .await
                .unwrap();
            if let Some(event) = event {
                if event.session == rx && event.kind == EventKind::RxObjectCompleted {
                    return event.object.unwrap();
                }
            }
        }
    })
    .await
    .expect("수신 완료 대기 시간 초과");

    assert_eq!(received.data().unwrap(), data);
    assert_eq!(&received.info().unwrap()[..], b"hello");
    assert_eq!(received.sender(), Some(1));
    assert_eq!(instance.session(rx).unwrap().remote_senders(), vec![1]);

    instance.stop_sender(tx, false).unwrap();
    instance.destroy_session(tx).unwrap();
    instance.destroy_session(rx).unwrap();
}
