use std::time::Duration;

use skdb::{Coordinator, CoordinatorConfig, KvApi};
use tempfile::TempDir;

fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        heartbeat_interval: Duration::from_millis(20),
        heartbeat_timeout: Duration::from_millis(60),
        proxy_timeout: Duration::from_millis(1000),
    }
}

// =========================================================================
// Leader failover: kill the leader, a follower takes over, writes
// land, and a third client observes them
// =========================================================================
#[tokio::test]
async fn test_leader_failover() {
    let dir = TempDir::new().unwrap();
    let coord = Coordinator::with_config(dir.path(), fast_config());

    let c1 = coord.connect("t5").await.unwrap();
    let c2 = coord.connect("t5").await.unwrap();
    assert!(c1.is_leader().await);
    assert!(!c2.is_leader().await);

    c1.kill().await;

    // Within two heartbeat timeouts the survivor promotes itself.
    let mut promoted = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if c2.is_leader().await {
            promoted = true;
            break;
        }
    }
    assert!(promoted, "follower did not take over");

    c2.put(b"k", b"v").await.unwrap();

    let c3 = coord.connect("t5").await.unwrap();
    assert!(!c3.is_leader().await);
    assert_eq!(c3.get(b"k").await.unwrap().unwrap(), b"v");

    c2.close().await.unwrap();
}

// =========================================================================
// Coordinator uniqueness: at most one leader at any instant, and repeated
// leader kills always elect exactly one successor
// =========================================================================
#[tokio::test]
async fn test_at_most_one_leader_through_kill_rounds() {
    let dir = TempDir::new().unwrap();
    let coord = Coordinator::with_config(dir.path(), fast_config());

    let mut clients = Vec::new();
    for _ in 0..4 {
        clients.push(coord.connect("uniq").await.unwrap());
    }

    for round in 0..3 {
        // Wait for exactly one leader among the live clients.
        let mut leader_idx = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut leaders = Vec::new();
            for (i, client) in clients.iter().enumerate() {
                if client.is_leader().await {
                    leaders.push(i);
                }
            }
            assert!(leaders.len() <= 1, "round {round}: multiple leaders {leaders:?}");
            if leaders.len() == 1 {
                leader_idx = Some(leaders[0]);
                break;
            }
        }
        let leader_idx = leader_idx.expect("no leader elected");

        // The leader serves everyone, then dies.
        let key = format!("round-{round}");
        clients[leader_idx].put(key.as_bytes(), b"done").await.unwrap();
        clients[leader_idx].kill().await;
        clients.remove(leader_idx);
    }

    // The last survivor still has every round's write.
    let survivor = &clients[0];
    let mut promoted = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if survivor.is_leader().await {
            promoted = true;
            break;
        }
    }
    assert!(promoted);
    for round in 0..3 {
        let key = format!("round-{round}");
        assert_eq!(survivor.get(key.as_bytes()).await.unwrap().unwrap(), b"done");
    }
    survivor.close().await.unwrap();
}

// =========================================================================
// The full facade works over the proxy route
// =========================================================================
#[tokio::test]
async fn test_follower_uses_full_surface() {
    let dir = TempDir::new().unwrap();
    let coord = Coordinator::with_config(dir.path(), fast_config());

    let leader = coord.connect("surface").await.unwrap();
    let follower = coord.connect("surface").await.unwrap();

    follower.put(b"a", b"1").await.unwrap();
    follower.put_with_ttl(b"short", b"lived", 30).await.unwrap();
    follower
        .commit_transaction(vec![
            skdb::WriteOp::Put { key: b"b".to_vec(), value: b"2".to_vec() },
            skdb::WriteOp::Put { key: b"c".to_vec(), value: b"3".to_vec() },
        ])
        .await
        .unwrap();

    let mut buf = Vec::new();
    for (k, v) in [(b"d", b"4"), (b"e", b"5")] {
        buf.extend_from_slice(&(k.len() as u32).to_le_bytes());
        buf.extend_from_slice(k.as_slice());
        buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
        buf.extend_from_slice(v.as_slice());
    }
    assert_eq!(follower.put_batch(&buf).await.unwrap(), 2);

    let keys: Vec<_> = follower
        .scan_range(b"a", b"f", 100)
        .await
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(
        keys,
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec(), b"e".to_vec()]
    );

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(follower.get(b"short").await.unwrap(), None);

    assert!(follower.verify_integrity().await.unwrap().is_empty());
    follower.flush().await.unwrap();

    leader.close().await.unwrap();
}

// =========================================================================
// Writes survive a full handover: leader closes, follower reopens the
// same on-disk state
// =========================================================================
#[tokio::test]
async fn test_state_survives_handover() {
    let dir = TempDir::new().unwrap();
    let coord = Coordinator::with_config(dir.path(), fast_config());

    let c1 = coord.connect("handover").await.unwrap();
    c1.put(b"durable", b"yes").await.unwrap();
    let c2 = coord.connect("handover").await.unwrap();
    c1.close().await.unwrap();

    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if c2.is_leader().await {
            break;
        }
    }
    assert!(c2.is_leader().await);
    assert_eq!(c2.get(b"durable").await.unwrap().unwrap(), b"yes");
    c2.close().await.unwrap();
}
