use anyhow::Result;

use btreedb::btree::BTreeDb;

#[tokio::main]
async fn main() -> Result<()> {
    let key = *b"greeting";
    let value = b"hello world";

    // Create a container with 1 KiB blocks and 8 byte keys
    let db = BTreeDb::try_create("hello.db", "hello", 1024, 8).await?;

    // Make sure we can't find our key yet
    assert!(!db.contains(&key).await?);

    // Insert the greeting and make it durable
    db.insert(&key, value).await?;
    db.commit().await?;

    // Make sure we can find it again
    assert!(db.contains(&key).await?);
    assert_eq!(db.get(&key).await?, value);

    // Remove it; uncommitted changes vanish with the handle
    db.delete(&key).await?;
    assert!(!db.contains(&key).await?);
    drop(db);

    let db = BTreeDb::try_open("hello.db").await?;
    assert_eq!(db.get(&key).await?, value);

    std::fs::remove_file("hello.db")?;
    Ok(())
}
