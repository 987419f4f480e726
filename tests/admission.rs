//! Coordinator admission-policy integration tests (`spec.md` §8 scenario 1-2
//! groundwork): batch sizing and the "all strands seeded" transition.

use std::net::IpAddr;
use std::time::Duration;

use strandcast::coordinator::{Coordinator, SubcoordSlot};
use strandcast::wire::PeerRecord;

fn localhost() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

fn peer(name: &str, port: u16) -> PeerRecord {
    PeerRecord::new(name, localhost(), port)
}

#[tokio::test]
async fn peers_fill_one_slot_in_batch_size_groups_before_any_strand_is_seeded() {
    let coordinator = Coordinator::new(3);
    {
        let mut tables = coordinator.tables.lock().await;
        tables.slots.push(SubcoordSlot {
            addr: "127.0.0.1:1".parse().unwrap(),
            buffer: 3,
            queue: Vec::new(),
            strand: Vec::new(),
        });
        tables.slots.push(SubcoordSlot {
            addr: "127.0.0.1:2".parse().unwrap(),
            buffer: 3,
            queue: Vec::new(),
            strand: Vec::new(),
        });
    }

    // Before either strand is seeded, a slot only accepts while its own
    // buffer is open — filling slot 0 to exactly B must not spill into slot 1.
    for i in 0..3 {
        let reply = coordinator.register_peer_for_test(peer(&format!("a{i}"), 10_000 + i)).await;
        assert_eq!(reply["message"], "queued");
        assert_eq!(reply["slot"], 0);
    }

    tokio::time::sleep(Duration::from_millis(50)).await;

    let tables = coordinator.tables.lock().await;
    assert_eq!(tables.slots[1].queue.len(), 0);
}

#[tokio::test]
async fn after_all_strands_seeded_any_slot_accepts_more_peers() {
    let coordinator = Coordinator::new(3);
    {
        let mut tables = coordinator.tables.lock().await;
        tables.slots.push(SubcoordSlot {
            addr: "127.0.0.1:1".parse().unwrap(),
            buffer: 0,
            queue: Vec::new(),
            strand: vec![peer("seed", 1)],
        });
        tables.all_strands_have_peers = true;
    }

    let reply = coordinator.register_peer_for_test(peer("late", 20_000)).await;
    assert_eq!(reply["message"], "queued");
}

#[tokio::test]
async fn registration_is_rejected_when_every_slot_is_full() {
    let coordinator = Coordinator::new(3);
    {
        let mut tables = coordinator.tables.lock().await;
        tables.slots.push(SubcoordSlot {
            addr: "127.0.0.1:1".parse().unwrap(),
            buffer: 0,
            queue: vec![peer("a", 1), peer("b", 2), peer("c", 3)],
            strand: Vec::new(),
        });
    }

    let reply = coordinator.register_peer_for_test(peer("d", 4)).await;
    assert_eq!(reply["message"], "full");
}
