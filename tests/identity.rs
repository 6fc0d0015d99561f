//! Identity allocation under concurrent connections.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::task::JoinSet;

mod common;
use common::{Behavior, FakeRecorder, TestServer};

#[tokio::test]
async fn burst_of_connections_gets_distinct_identities() {
    const CLIENTS: usize = 32;
    let recorder = FakeRecorder::with_delay(Behavior::Exit(0), Duration::from_millis(20));
    let server = TestServer::start(recorder.clone()).await;

    let mut clients = JoinSet::new();
    for i in 0..CLIENTS {
        let addr = server.addr;
        clients.spawn(async move {
            let path = format!("/page/{i}");
            common::send_request(addr, &common::get_request("example.com", &path)).await
        });
    }
    while let Some(reply) = clients.join_next().await {
        assert!(reply.unwrap().is_empty());
    }

    let ids: BTreeSet<u64> = recorder.calls().iter().map(|(id, _)| id.as_u64()).collect();
    assert_eq!(ids.len(), CLIENTS);
    assert_eq!(ids, (0..CLIENTS as u64).collect());
    assert_eq!(server.stop().await, CLIENTS as u64);
}

#[tokio::test]
async fn identities_increase_in_acceptance_order() {
    let recorder = FakeRecorder::new(Behavior::Exit(0));
    let server = TestServer::start(recorder.clone()).await;

    for i in 0..5 {
        common::send_request(server.addr, &common::get_request("example.com", &format!("/{i}"))).await;
    }

    let calls = recorder.calls();
    for (i, (id, script)) in calls.iter().enumerate() {
        assert_eq!(id.as_u64(), i as u64);
        assert!(script.contains(&format!("example.com/{i}\"")));
    }
}
