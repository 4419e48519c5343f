use anyhow::Result;
use futures::StreamExt;

use btreedb::btree::BTreeDb;
use btreedb::btree::Direction;

#[tokio::main]
async fn main() -> Result<()> {
    // Create a container with 1 KiB blocks and 4 byte keys
    let db = BTreeDb::try_create("streaming.db", "streaming", 1024, 4).await?;

    for n in 0u32..100 {
        db.insert(&n.to_be_bytes(), format!("value {n}").as_bytes())
            .await?;
    }

    // Stream every entry in key order
    let mut entries = db.entries(Direction::Ascending).await;
    while let Some((key, value)) = entries.next().await {
        println!("{}: {}", hex::encode(key), String::from_utf8_lossy(&value));
    }
    drop(entries);

    // Or just a bounded slice of the keyspace, backwards
    let middle = db
        .entries_range(
            Direction::Descending,
            Some(20u32.to_be_bytes().to_vec()),
            Some(10u32.to_be_bytes().to_vec()),
        )
        .await
        .collect::<Vec<_>>()
        .await;
    println!("{} records between 10 and 20", middle.len());

    std::fs::remove_file("streaming.db")?;
    Ok(())
}
