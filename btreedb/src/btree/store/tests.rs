use super::*;

use std::collections::BTreeMap;

use rand::Rng;

fn key4(n: u32) -> Vec<u8> {
    n.to_be_bytes().to_vec()
}

fn key5(n: u32) -> Vec<u8> {
    let mut key = vec![0u8];
    key.extend_from_slice(&n.to_be_bytes());
    key
}

#[tokio::test]
async fn it_creates_and_reopens_empty() {
    let db = BTreeDb::try_create("create_empty.db", "World4", 2048, 5)
        .await
        .expect("creates container");
    db.close().await.expect("closes");

    let raw = std::fs::read("create_empty.db").expect("reads file");
    assert_eq!(&raw[0..8], b"BTreeDB5");

    let db = BTreeDb::try_open("create_empty.db")
        .await
        .expect("opens container");
    assert_eq!(db.block_size().await, 2048);
    assert_eq!(db.key_size().await, 5);
    assert_eq!(db.identifier().await, "World4");
    assert_eq!(db.count().await.expect("counts"), 0);
    assert!(!db.contains(&key5(1)).await.expect("contains"));
    db.verify().await.expect("verifies");
    std::fs::remove_file("create_empty.db").expect("cleanup");
}

#[tokio::test]
async fn it_rejects_bad_creation_parameters() {
    assert!(BTreeDb::try_create("bad_params_1.db", "x", 2048, 0)
        .await
        .is_err());
    assert!(BTreeDb::try_create("bad_params_2.db", "x", 32, 4)
        .await
        .is_err());
    assert!(
        BTreeDb::try_create("bad_params_3.db", "an-identifier-too-long", 2048, 4)
            .await
            .is_err()
    );
    for name in ["bad_params_1.db", "bad_params_2.db", "bad_params_3.db"] {
        let _ = std::fs::remove_file(name);
    }
}

#[tokio::test]
async fn it_rejects_foreign_files() {
    std::fs::write("foreign.db", vec![0u8; 4096]).expect("writes junk");
    assert!(BTreeDb::try_open("foreign.db").await.is_err());
    std::fs::remove_file("foreign.db").expect("cleanup");
}

#[tokio::test]
async fn it_rejects_keys_of_the_wrong_width() {
    let db = BTreeDb::try_create("bad_key.db", "keys", 128, 4)
        .await
        .expect("creates container");
    assert!(db.insert(b"abc", b"v").await.is_err());
    assert!(db.get(b"abcde").await.is_err());
    assert!(db.delete(b"").await.is_err());
    std::fs::remove_file("bad_key.db").expect("cleanup");
}

#[test_log::test(tokio::test)]
async fn it_persists_a_single_insert() {
    let db = BTreeDb::try_create("single_insert.db", "World4", 2048, 5)
        .await
        .expect("creates container");
    db.insert(&[0, 1, 2, 3, 4], b"hello")
        .await
        .expect("insert worked");
    db.commit().await.expect("commits");
    drop(db);

    let db = BTreeDb::try_open("single_insert.db")
        .await
        .expect("opens container");
    assert_eq!(db.get(&[0, 1, 2, 3, 4]).await.expect("gets"), b"hello");
    db.verify().await.expect("verifies");
    std::fs::remove_file("single_insert.db").expect("cleanup");
}

#[tokio::test]
async fn it_replaces_values_in_place() {
    let db = BTreeDb::try_create("replace.db", "replace", 128, 4)
        .await
        .expect("creates container");
    assert_eq!(db.insert(&key4(9), b"one").await.expect("inserts"), None);
    assert_eq!(
        db.insert(&key4(9), b"two").await.expect("inserts"),
        Some(b"one".to_vec())
    );
    assert_eq!(db.get(&key4(9)).await.expect("gets"), b"two");
    assert_eq!(db.count().await.expect("counts"), 1);

    // Empty values are records like any other.
    db.insert(&key4(9), b"").await.expect("inserts");
    assert_eq!(db.get(&key4(9)).await.expect("gets"), b"");
    std::fs::remove_file("replace.db").expect("cleanup");
}

#[tokio::test]
async fn it_reports_not_found() {
    let db = BTreeDb::try_create("not_found.db", "missing", 128, 4)
        .await
        .expect("creates container");
    let err = db.get(&key4(1)).await.expect_err("must be absent");
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::NotFound)
    ));
    assert!(db.first().await.is_err());
    assert!(db.last().await.is_err());
    // Deleting an absent key is a quiet no-op.
    assert_eq!(db.delete(&key4(1)).await.expect("deletes"), None);
    std::fs::remove_file("not_found.db").expect("cleanup");
}

#[test_log::test(tokio::test)]
async fn it_splits_under_load() {
    let db = BTreeDb::try_create("forced_split.db", "split", 256, 4)
        .await
        .expect("creates container");
    for n in 0u32..200 {
        db.insert(&key4(n), &[n as u8; 16]).await.expect("insert worked");
    }
    db.verify().await.expect("verifies");

    {
        let inner = db.inner.read().await;
        assert!(!inner.root_is_leaf, "200 records must outgrow a leaf root");
    }

    db.commit().await.expect("commits");
    drop(db);

    let db = BTreeDb::try_open("forced_split.db")
        .await
        .expect("opens container");
    let mut seen = Vec::new();
    db.ascend(|key, value| {
        seen.push(key.to_vec());
        assert_eq!(value, [key[3]; 16]);
    })
    .await
    .expect("ascends");
    assert_eq!(seen, (0u32..200).map(key4).collect::<Vec<_>>());
    db.verify().await.expect("verifies");
    std::fs::remove_file("forced_split.db").expect("cleanup");
}

#[test_log::test(tokio::test)]
async fn it_chains_oversized_values() {
    let db = BTreeDb::try_create("oversized.db", "chains", 256, 4)
        .await
        .expect("creates container");
    let value = vec![0x5a; 1024];
    db.insert(&key4(1), &value).await.expect("insert worked");

    {
        let inner = db.inner.read().await;
        assert!(inner.root_is_leaf);
        let leaf = inner.read_leaf(inner.root).expect("reads leaf");
        assert!(leaf.chain.len() >= 5, "1 KiB must span 5+ leaf blocks");
    }

    assert_eq!(db.get(&key4(1)).await.expect("gets"), value);
    db.commit().await.expect("commits");
    db.verify().await.expect("verifies");
    drop(db);

    let db = BTreeDb::try_open("oversized.db")
        .await
        .expect("opens container");
    assert_eq!(db.get(&key4(1)).await.expect("gets"), value);
    std::fs::remove_file("oversized.db").expect("cleanup");
}

#[test_log::test(tokio::test)]
async fn it_deletes_and_reinserts() {
    let db = BTreeDb::try_create("delete_reinsert.db", "delete", 128, 4)
        .await
        .expect("creates container");
    for n in 0u32..64 {
        db.insert(&key4(n), &n.to_be_bytes()).await.expect("insert worked");
    }
    for n in (0u32..64).step_by(2) {
        assert_eq!(
            db.delete(&key4(n)).await.expect("deletes"),
            Some(n.to_be_bytes().to_vec())
        );
    }
    db.verify().await.expect("verifies");
    assert_eq!(db.count().await.expect("counts"), 32);

    for n in (0u32..64).step_by(2) {
        db.insert(&key4(n), &n.to_be_bytes()).await.expect("insert worked");
    }
    let mut seen = Vec::new();
    db.ascend(|key, _| seen.push(key.to_vec()))
        .await
        .expect("ascends");
    assert_eq!(seen, (0u32..64).map(key4).collect::<Vec<_>>());
    db.verify().await.expect("verifies");
    std::fs::remove_file("delete_reinsert.db").expect("cleanup");
}

#[test_log::test(tokio::test)]
async fn it_deletes_down_to_empty() {
    let db = BTreeDb::try_create("delete_all.db", "wipe", 64, 4)
        .await
        .expect("creates container");
    for n in 0u32..300 {
        db.insert(&key4(n), &n.to_be_bytes()).await.expect("insert worked");
    }
    for n in 0u32..300 {
        db.delete(&key4(n)).await.expect("deletes");
        if n % 50 == 0 {
            db.verify().await.expect("verifies");
        }
    }
    assert_eq!(db.count().await.expect("counts"), 0);
    {
        let inner = db.inner.read().await;
        assert!(inner.root_is_leaf, "an emptied tree collapses to a leaf root");
    }
    db.commit().await.expect("commits");
    db.verify().await.expect("verifies");

    // The emptied container is fully reusable.
    db.insert(&key4(7), b"again").await.expect("insert worked");
    assert_eq!(db.get(&key4(7)).await.expect("gets"), b"again");
    std::fs::remove_file("delete_all.db").expect("cleanup");
}

#[tokio::test]
async fn it_finds_first_and_last() {
    let db = BTreeDb::try_create("edges.db", "edges", 128, 4)
        .await
        .expect("creates container");
    for n in [40u32, 3, 77, 12, 60] {
        db.insert(&key4(n), &n.to_be_bytes()).await.expect("insert worked");
    }
    let (first, _) = db.first().await.expect("first");
    let (last, _) = db.last().await.expect("last");
    assert_eq!(first, key4(3));
    assert_eq!(last, key4(77));
    std::fs::remove_file("edges.db").expect("cleanup");
}

#[tokio::test]
async fn it_bounds_range_traversal() {
    let db = BTreeDb::try_create("ranges.db", "ranges", 128, 4)
        .await
        .expect("creates container");
    for n in 0u32..50 {
        db.insert(&key4(n), b"v").await.expect("insert worked");
    }

    let mut seen = Vec::new();
    db.ascend_range(Some(&key4(10)), Some(&key4(15)), |key, _| {
        seen.push(key.to_vec())
    })
    .await
    .expect("ascends");
    assert_eq!(seen, (10u32..15).map(key4).collect::<Vec<_>>());

    let mut seen = Vec::new();
    db.descend_range(Some(&key4(15)), Some(&key4(10)), |key, _| {
        seen.push(key.to_vec())
    })
    .await
    .expect("descends");
    assert_eq!(seen, (11u32..=15).rev().map(key4).collect::<Vec<_>>());

    let mut seen = Vec::new();
    db.descend(|key, _| seen.push(key.to_vec()))
        .await
        .expect("descends");
    assert_eq!(seen, (0u32..50).rev().map(key4).collect::<Vec<_>>());

    std::fs::remove_file("ranges.db").expect("cleanup");
}

#[test_log::test(tokio::test)]
async fn it_flips_roots_on_commit() {
    let db = BTreeDb::try_create("root_flip.db", "flip", 128, 4)
        .await
        .expect("creates container");
    for round in 0u32..6 {
        db.insert(&key4(round), b"round").await.expect("insert worked");
        db.commit().await.expect("commits");
        let raw = std::fs::read("root_flip.db").expect("reads file");
        assert_eq!(raw[32], ((round + 1) % 2) as u8, "bit follows commit count");
    }
    drop(db);

    let db = BTreeDb::try_open("root_flip.db")
        .await
        .expect("opens container");
    assert_eq!(db.count().await.expect("counts"), 6);
    db.verify().await.expect("verifies");
    std::fs::remove_file("root_flip.db").expect("cleanup");
}

#[test_log::test(tokio::test)]
async fn it_rolls_back_uncommitted_changes() {
    let db = BTreeDb::try_create("rollback.db", "rollback", 128, 4)
        .await
        .expect("creates container");
    db.insert(&key4(1), b"keep").await.expect("insert worked");
    db.commit().await.expect("commits");

    db.insert(&key4(2), b"discard").await.expect("insert worked");
    db.delete(&key4(1)).await.expect("deletes");
    db.rollback().await.expect("rolls back");

    assert_eq!(db.get(&key4(1)).await.expect("gets"), b"keep");
    assert!(!db.contains(&key4(2)).await.expect("contains"));
    db.verify().await.expect("verifies");

    // Rollback with nothing outstanding is also fine.
    db.rollback().await.expect("rolls back");
    assert_eq!(db.count().await.expect("counts"), 1);
    std::fs::remove_file("rollback.db").expect("cleanup");
}

#[test_log::test(tokio::test)]
async fn it_discards_uncommitted_changes_on_drop() {
    let db = BTreeDb::try_create("abandon.db", "abandon", 128, 4)
        .await
        .expect("creates container");
    db.insert(&key4(1), b"keep").await.expect("insert worked");
    db.commit().await.expect("commits");
    db.insert(&key4(2), b"lost").await.expect("insert worked");
    drop(db);

    let db = BTreeDb::try_open("abandon.db")
        .await
        .expect("opens container");
    assert_eq!(db.get(&key4(1)).await.expect("gets"), b"keep");
    assert!(!db.contains(&key4(2)).await.expect("contains"));
    db.verify().await.expect("verifies");
    std::fs::remove_file("abandon.db").expect("cleanup");
}

#[test_log::test(tokio::test)]
async fn it_survives_a_torn_commit() {
    let db = BTreeDb::try_create("torn_commit.db", "torn", 128, 4)
        .await
        .expect("creates container");
    db.insert(&key4(1), b"stable").await.expect("insert worked");
    db.commit().await.expect("commits");
    db.close().await.expect("closes");

    // Simulate a writer that died after staging the inactive descriptor
    // but before flipping the active-root bit: scribble over the inactive
    // slot. The live descriptor must be untouched by reopen.
    let mut raw = std::fs::read("torn_commit.db").expect("reads file");
    let inactive = if raw[32] == 0 { 50 } else { 33 };
    for byte in &mut raw[inactive..inactive + 17] {
        *byte = 0xEE;
    }
    std::fs::write("torn_commit.db", raw).expect("writes file");

    let db = BTreeDb::try_open("torn_commit.db")
        .await
        .expect("opens container");
    assert_eq!(db.get(&key4(1)).await.expect("gets"), b"stable");
    db.verify().await.expect("verifies");
    std::fs::remove_file("torn_commit.db").expect("cleanup");
}

#[test_log::test(tokio::test)]
async fn it_recycles_blocks_across_commits() {
    let db = BTreeDb::try_create("recycle.db", "recycle", 128, 4)
        .await
        .expect("creates container");

    for round in 0u32..20 {
        for n in 0u32..40 {
            db.insert(&key4(n), &round.to_be_bytes())
                .await
                .expect("insert worked");
        }
        for n in (0u32..40).step_by(3) {
            db.delete(&key4(n)).await.expect("deletes");
        }
        db.commit().await.expect("commits");
        db.verify().await.expect("verifies");
    }

    // Copy-on-write churn must feed on the free-list, not the file.
    let capacity = { db.inner.read().await.file.capacity() };
    assert!(
        capacity < 200,
        "{capacity} blocks for a ~40 record working set means the free-list is leaking"
    );

    db.close().await.expect("closes");
    let db = BTreeDb::try_open("recycle.db")
        .await
        .expect("opens container");
    db.verify().await.expect("verifies");
    std::fs::remove_file("recycle.db").expect("cleanup");
}

#[test_log::test(tokio::test)]
async fn it_matches_a_reference_model() {
    let db = BTreeDb::try_create("reference.db", "model", 256, 4)
        .await
        .expect("creates container");
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut rng = rand::thread_rng();

    for op in 0..1_500 {
        let key = key4(rng.gen_range(0..300));
        if rng.gen_bool(0.7) {
            let value = vec![rng.gen::<u8>(); rng.gen_range(0..48)];
            db.insert(&key, &value).await.expect("insert worked");
            model.insert(key, value);
        } else {
            let got = db.delete(&key).await.expect("deletes");
            assert_eq!(got, model.remove(&key));
        }
        if op % 500 == 499 {
            db.commit().await.expect("commits");
            db.verify().await.expect("verifies");
        }
    }

    let mut seen = Vec::new();
    db.ascend(|key, value| seen.push((key.to_vec(), value.to_vec())))
        .await
        .expect("ascends");
    let expected: Vec<(Vec<u8>, Vec<u8>)> =
        model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    assert_eq!(seen, expected);

    for (key, value) in &model {
        assert_eq!(&db.get(key).await.expect("gets"), value);
    }
    std::fs::remove_file("reference.db").expect("cleanup");
}

#[test_log::test(tokio::test)]
async fn it_clears_to_a_fresh_container() {
    let db = BTreeDb::try_create("clear.db", "clear", 128, 4)
        .await
        .expect("creates container");
    for n in 0u32..100 {
        db.insert(&key4(n), b"v").await.expect("insert worked");
    }
    db.commit().await.expect("commits");

    db.clear().await.expect("clears");
    assert_eq!(db.count().await.expect("counts"), 0);
    db.verify().await.expect("verifies");
    {
        let inner = db.inner.read().await;
        assert_eq!(inner.file.capacity(), 1);
    }

    db.insert(&key4(1), b"fresh").await.expect("insert worked");
    db.commit().await.expect("commits");
    drop(db);
    let db = BTreeDb::try_open("clear.db").await.expect("opens container");
    assert_eq!(db.count().await.expect("counts"), 1);
    std::fs::remove_file("clear.db").expect("cleanup");
}

#[tokio::test]
async fn it_reports_utilization() {
    let db = BTreeDb::try_create("utilization.db", "util", 128, 4)
        .await
        .expect("creates container");
    assert!(db.utilization().await.expect("utilization") < 0.1);
    for n in 0u32..64 {
        db.insert(&key4(n), &[7u8; 16]).await.expect("insert worked");
    }
    let utilization = db.utilization().await.expect("utilization");
    assert!(utilization > 0.2, "got {utilization}");
    assert!(utilization <= 1.0, "got {utilization}");
    db.info().await.expect("info");
    std::fs::remove_file("utilization.db").expect("cleanup");
}
