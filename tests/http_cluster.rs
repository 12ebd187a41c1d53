//! End-to-end cluster tests over real HTTP/TCP.
//!
//! Each test spins up an in-process cluster with every node serving its
//! peer RPC and client API on a real socket, then drives it exactly the
//! way an external client would.

use std::net::SocketAddr;
use std::time::Duration;

use key_vault::api::{KeyValueResponse, RaftStateResponse, ReplicationStatus};
use key_vault::core::command::Command;
use key_vault::core::config::RaftConfig;
use key_vault::core::raft_core::LogEntry;
use key_vault::testing::TestCluster;

const LEADER_WAIT: Duration = Duration::from_secs(10);

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap()
}

async fn put_key(
    client: &reqwest::Client,
    addr: &SocketAddr,
    key: &str,
    value: &str,
) -> (reqwest::StatusCode, KeyValueResponse) {
    let response = client
        .put(format!("http://{}/vault/key", addr))
        .json(&serde_json::json!({ "key": key, "value": value }))
        .send()
        .await
        .expect("put request failed");
    let status = response.status();
    (status, response.json().await.expect("invalid put response"))
}

async fn get_key(
    client: &reqwest::Client,
    addr: &SocketAddr,
    key: &str,
) -> (reqwest::StatusCode, KeyValueResponse) {
    let response = client
        .get(format!("http://{}/vault/key/{}", addr, key))
        .send()
        .await
        .expect("get request failed");
    let status = response.status();
    (status, response.json().await.expect("invalid get response"))
}

async fn delete_key(
    client: &reqwest::Client,
    addr: &SocketAddr,
    key: &str,
) -> (reqwest::StatusCode, KeyValueResponse) {
    let response = client
        .delete(format!("http://{}/vault/key/{}", addr, key))
        .send()
        .await
        .expect("delete request failed");
    let status = response.status();
    (
        status,
        response.json().await.expect("invalid delete response"),
    )
}

async fn raft_state(client: &reqwest::Client, addr: &SocketAddr) -> RaftStateResponse {
    client
        .get(format!("http://{}/raft/state", addr))
        .send()
        .await
        .expect("state request failed")
        .json()
        .await
        .expect("invalid state response")
}

/// Poll until the key reads back with the expected value on the leader.
async fn wait_for_value(
    client: &reqwest::Client,
    addr: &SocketAddr,
    key: &str,
    expected: &str,
    deadline: Duration,
) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        let (status, body) = get_key(client, addr, key).await;
        if status == reqwest::StatusCode::OK && body.value.as_deref() == Some(expected) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
async fn test_cluster_elects_single_leader() {
    let cluster = TestCluster::new().await;

    let leader = cluster.wait_for_leader(LEADER_WAIT).await;
    assert!(leader.is_some(), "cluster should elect a leader");

    let client = client();
    let mut leader_count = 0;
    for addr in cluster.all_addrs() {
        if raft_state(&client, &addr).await.role == "Leader" {
            leader_count += 1;
        }
    }
    assert_eq!(leader_count, 1, "exactly one leader expected");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_write_read_delete_lifecycle() {
    let cluster = TestCluster::new().await;
    let leader = cluster.wait_for_leader(LEADER_WAIT).await.unwrap();
    let client = client();

    // Write: accepted as pending with a log position.
    let (status, body) = put_key(&client, &leader, "a", "1").await;
    assert_eq!(status, reqwest::StatusCode::ACCEPTED);
    assert_eq!(body.replication_status, Some(ReplicationStatus::Pending));
    let log_index = body.log_index.expect("write receipt carries a log index");
    assert!(log_index >= 1);

    // Read: becomes visible once committed and applied.
    assert!(wait_for_value(&client, &leader, "a", "1", Duration::from_secs(5)).await);
    let (status, body) = get_key(&client, &leader, "a").await;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert!(body.found);
    assert!(body.commit_index.unwrap() >= log_index);
    assert!(body.last_applied_index.unwrap() >= log_index);

    // Delete: accepted, then the key disappears.
    let (status, _) = delete_key(&client, &leader, "a").await;
    assert_eq!(status, reqwest::StatusCode::ACCEPTED);

    let start = std::time::Instant::now();
    loop {
        let (status, _) = get_key(&client, &leader, "a").await;
        if status == reqwest::StatusCode::NOT_FOUND {
            break;
        }
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "deleted key still readable"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_follower_rejects_client_traffic() {
    let cluster = TestCluster::new().await;
    let leader = cluster.wait_for_leader(LEADER_WAIT).await.unwrap();
    let client = client();

    let leader_id = cluster.nodes[cluster.index_of(leader).unwrap()].id;
    let follower = cluster.find_follower().await.expect("follower expected");

    let (status, body) = put_key(&client, &follower, "x", "1").await;
    assert_eq!(status, reqwest::StatusCode::FORBIDDEN);
    assert_eq!(body.leader_id, Some(leader_id));
    assert_eq!(
        body.replication_status,
        Some(ReplicationStatus::NotReplicated)
    );

    let (status, body) = get_key(&client, &follower, "x").await;
    assert_eq!(status, reqwest::StatusCode::FORBIDDEN);
    assert_eq!(body.leader_id, Some(leader_id));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_leader_crash_triggers_failover() {
    let mut cluster = TestCluster::new().await;
    let old_leader = cluster.wait_for_leader(LEADER_WAIT).await.unwrap();
    let client = client();

    let old_term = raft_state(&client, &old_leader).await.term;
    let old_index = cluster.index_of(old_leader).unwrap();

    // Seed a committed write so the new leader must carry it.
    let (status, _) = put_key(&client, &old_leader, "durable", "yes").await;
    assert_eq!(status, reqwest::StatusCode::ACCEPTED);
    assert!(wait_for_value(&client, &old_leader, "durable", "yes", Duration::from_secs(5)).await);

    cluster.shutdown_node(old_index).await;

    // A new leader emerges at a strictly higher term.
    let new_leader = cluster
        .wait_for_leader(LEADER_WAIT)
        .await
        .expect("failover should elect a new leader");
    assert_ne!(new_leader, old_leader);
    let new_term = raft_state(&client, &new_leader).await.term;
    assert!(new_term > old_term);

    // The old committed write survived, and new writes succeed.
    assert!(wait_for_value(&client, &new_leader, "durable", "yes", Duration::from_secs(5)).await);
    let (status, _) = put_key(&client, &new_leader, "after-failover", "ok").await;
    assert_eq!(status, reqwest::StatusCode::ACCEPTED);
    assert!(
        wait_for_value(
            &client,
            &new_leader,
            "after-failover",
            "ok",
            Duration::from_secs(5)
        )
        .await
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_log_repair_after_divergence() {
    let cluster = TestCluster::new().await;
    let leader = cluster.wait_for_leader(LEADER_WAIT).await.unwrap();
    let client = client();

    let (status, _) = put_key(&client, &leader, "k1", "1").await;
    assert_eq!(status, reqwest::StatusCode::ACCEPTED);
    let (status, _) = put_key(&client, &leader, "k2", "2").await;
    assert_eq!(status, reqwest::StatusCode::ACCEPTED);
    assert!(wait_for_value(&client, &leader, "k2", "2", Duration::from_secs(5)).await);

    // Forge an uncommitted garbage tail on a follower, as if it briefly
    // accepted entries from a failed leader.
    let follower_addr = cluster.find_follower().await.unwrap();
    let follower_index = cluster.index_of(follower_addr).unwrap();
    {
        let mut core = cluster.nodes[follower_index].shared_core.lock().await;
        let next = core.last_log_index() + 1;
        for offset in 0..2 {
            core.log.push(LogEntry {
                term: 0,
                index: next + offset,
                command: Command::Put {
                    key: "garbage".to_string(),
                    value: format!("{}", offset),
                },
                created_at: 0,
                applied: false,
            });
        }
    }

    // A new write forces the leader to probe past the forged tail, get a
    // conflict hint back, and rewrite the follower's log.
    let (status, _) = put_key(&client, &leader, "k3", "3").await;
    assert_eq!(status, reqwest::StatusCode::ACCEPTED);

    let leader_core = &cluster.nodes[cluster.index_of(leader).unwrap()].shared_core;
    let follower_core = &cluster.nodes[follower_index].shared_core;

    let start = std::time::Instant::now();
    loop {
        let converged = {
            let leader = leader_core.lock().await;
            let follower = follower_core.lock().await;
            let logs_match = leader.log.len() == follower.log.len()
                && leader
                    .log
                    .iter()
                    .zip(follower.log.iter())
                    .all(|(l, f)| (l.index, l.term) == (f.index, f.term));
            logs_match && follower.commit_index == leader.commit_index
        };
        if converged {
            break;
        }
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "follower log did not converge to leader's"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // No trace of the forged entries anywhere.
    assert_eq!(
        cluster.nodes[follower_index].vault.lock().unwrap().get("garbage"),
        None
    );
    assert!(wait_for_value(&client, &leader, "k3", "3", Duration::from_secs(5)).await);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_snapshot_install_catches_up_wiped_follower() {
    let config = RaftConfig::default()
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_election_timeout(Duration::from_millis(600), Duration::from_millis(1200))
        .with_snapshot_threshold(5);
    let cluster = TestCluster::with_nodes_and_config(3, Some(config)).await;
    let leader = cluster.wait_for_leader(LEADER_WAIT).await.unwrap();
    let client = client();

    for i in 0..12 {
        let (status, _) = put_key(&client, &leader, &format!("key{}", i), &format!("v{}", i)).await;
        assert_eq!(status, reqwest::StatusCode::ACCEPTED);
    }
    assert!(wait_for_value(&client, &leader, "key11", "v11", Duration::from_secs(10)).await);

    let leader_index = cluster.index_of(leader).unwrap();
    {
        // The threshold guarantees the leader compacted its log.
        let core = cluster.nodes[leader_index].shared_core.lock().await;
        assert!(core.snapshot_last_index >= 5);
    }

    // Wipe a follower back to an empty state, as if it lost its disk.
    let follower_addr = cluster.find_follower().await.unwrap();
    let follower_index = cluster.index_of(follower_addr).unwrap();
    {
        let mut core = cluster.nodes[follower_index].shared_core.lock().await;
        core.log.clear();
        core.snapshot_last_index = 0;
        core.snapshot_last_term = 0;
        core.commit_index = 0;
        core.last_applied = 0;
        cluster.nodes[follower_index].vault.lock().unwrap().clear();
    }

    // The leader's next probe gets "retry from 1", which lies inside the
    // compacted range, so the follower receives the snapshot.
    let leader_core = &cluster.nodes[leader_index].shared_core;
    let follower_core = &cluster.nodes[follower_index].shared_core;

    let start = std::time::Instant::now();
    loop {
        let caught_up = {
            let leader = leader_core.lock().await;
            let follower = follower_core.lock().await;
            follower.snapshot_last_index >= 5 && follower.commit_index >= leader.commit_index
        };
        if caught_up {
            break;
        }
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "wiped follower did not catch up via snapshot"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Sampled keys agree between leader and the restored follower, and no
    // compacted entry remains in the follower's log.
    {
        let follower = follower_core.lock().await;
        let snapshot_index = follower.snapshot_last_index;
        assert!(follower.log.iter().all(|e| e.index > snapshot_index));
    }
    let leader_vault = cluster.nodes[leader_index].vault.lock().unwrap().all();
    let follower_vault = cluster.nodes[follower_index].vault.lock().unwrap().all();
    for key in ["key0", "key5", "key11"] {
        assert_eq!(leader_vault.get(key), follower_vault.get(key), "key {}", key);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_writes_all_commit() {
    let cluster = TestCluster::new().await;
    let leader = cluster.wait_for_leader(LEADER_WAIT).await.unwrap();
    let client = client();

    let mut handles = Vec::new();
    for i in 0..20 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            put_key(&client, &leader, &format!("key{}", i), &format!("value{}", i)).await
        }));
    }

    let results = futures::future::join_all(handles).await;
    for result in results {
        let (status, _) = result.unwrap();
        assert_eq!(status, reqwest::StatusCode::ACCEPTED);
    }

    for i in 0..20 {
        assert!(
            wait_for_value(
                &client,
                &leader,
                &format!("key{}", i),
                &format!("value{}", i),
                Duration::from_secs(10)
            )
            .await,
            "key{} never became readable",
            i
        );
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_metrics_surface_records_requests() {
    let cluster = TestCluster::new().await;
    let leader = cluster.wait_for_leader(LEADER_WAIT).await.unwrap();
    let client = client();

    put_key(&client, &leader, "m", "1").await;
    assert!(wait_for_value(&client, &leader, "m", "1", Duration::from_secs(5)).await);

    let events: Vec<serde_json::Value> = client
        .get(format!("http://{}/metrics/events", leader))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(events
        .iter()
        .any(|e| e["event_type"] == "WRITE_REQUEST"));
    assert!(events
        .iter()
        .any(|e| e["event_type"] == "READ_REQUEST"));
    // The write is traceable through commit and apply, with latency.
    assert!(events
        .iter()
        .any(|e| e["event_type"] == "LOG_COMMIT" && e["latency_ms"].is_u64()));
    assert!(events
        .iter()
        .any(|e| e["event_type"] == "STATE_MACHINE_APPLY" && e["latency_ms"].is_u64()));

    let csv = client
        .get(format!("http://{}/metrics/export", leader))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(csv.starts_with("timestamp_ms,node_id,event_type"));
    assert!(csv.contains("WRITE_REQUEST"));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_manual_snapshot_via_ops_surface() {
    let cluster = TestCluster::new().await;
    let leader = cluster.wait_for_leader(LEADER_WAIT).await.unwrap();
    let client = client();

    put_key(&client, &leader, "s", "1").await;
    assert!(wait_for_value(&client, &leader, "s", "1", Duration::from_secs(5)).await);

    let response = client
        .post(format!("http://{}/snapshots/create", leader))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let latest: serde_json::Value = client
        .get(format!("http://{}/snapshots/latest", leader))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(latest["found"], true);
    assert!(latest["last_included_index"].as_u64().unwrap() >= 1);

    cluster.shutdown().await;
}
