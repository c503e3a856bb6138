//! Basic Replica Example
//!
//! Two handles sharing a reference-mode store in process, then the same
//! over a TCP channel to a running daemon.
//!
//! Run with: cargo run --example basic

use std::sync::Arc;

use replica_core::{CrdtKind, FieldValue, RawEntity, StorageKey};
use replica_storage::{Handle, HandleOptions, MemoryStorage, StoreManager};
use replica_transport::{Channel, RemoteStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("Replica Basic Example\n");

    println!("=== Embedded Mode ===\n");
    embedded_example().await?;

    println!("\n=== TCP Client Mode ===");
    println!("(Start replicad first with: cargo run --bin replicad)\n");

    // Uncomment to test with running server:
    // tcp_client_example().await?;

    Ok(())
}

fn person(id: &str, name: &str, age: i64) -> RawEntity {
    RawEntity::new(id)
        .with_singleton("name", Some(FieldValue::text(name)))
        .with_singleton("age", Some(FieldValue::int(age)))
}

fn print_entities(label: &str, handle: &Handle) {
    println!("{}:", label);
    for entity in handle.fetch_all() {
        let name = entity
            .singleton("name")
            .and_then(|v| v.as_primitive())
            .and_then(|p| p.as_str().map(String::from))
            .unwrap_or_default();
        println!("  - {} {}", entity.id, name);
    }
}

async fn embedded_example() -> Result<(), Box<dyn std::error::Error>> {
    let manager = StoreManager::new(Arc::new(MemoryStorage::new()));
    let key = StorageKey::reference_mode(StorageKey::ramdisk("people"), StorageKey::ramdisk("team"));

    let alice = Handle::open("alice", manager.get(&key, CrdtKind::Set).await?, HandleOptions::default()).await?;
    let bob = Handle::open("bob", manager.get(&key, CrdtKind::Set).await?, HandleOptions::default()).await?;
    bob.on_update(|entities| println!("  (bob saw {} entities change)", entities.len()));
    alice.idle().await;
    bob.idle().await;

    alice.store(person("p1", "Ann", 30)).await?;
    bob.store(person("p2", "Bo", 41)).await?;
    alice.idle().await;
    bob.idle().await;

    print_entities("Alice sees", &alice);
    print_entities("Bob sees", &bob);

    let entities = alice.fetch_all();
    if let Some(ann) = entities.iter().find(|e| e.id == "p1") {
        alice.remove(ann).await?;
        bob.idle().await;
        print_entities("\nBob after removal", &bob);
    }

    // Singletons keep one entity
    let flag_key = StorageKey::ramdisk("feature-flag");
    let flag = Handle::open(
        "alice",
        manager.get(&flag_key, CrdtKind::Singleton).await?,
        HandleOptions::default(),
    )
    .await?;
    flag.idle().await;
    flag.store(RawEntity::new("dark-mode").with_singleton("on", Some(FieldValue::text("yes"))))
        .await?;
    println!("\nSingleton value: {:?}", flag.fetch().map(|e| e.id));

    manager.close_all().await;
    Ok(())
}

#[allow(dead_code)]
async fn tcp_client_example() -> Result<(), Box<dyn std::error::Error>> {
    let channel = Arc::new(Channel::connect_tcp("127.0.0.1:7380").await?);
    let key = StorageKey::reference_mode(StorageKey::ramdisk("people"), StorageKey::ramdisk("team"));

    let store = RemoteStore::open(channel.clone(), key, CrdtKind::Set).await?;
    let handle = Handle::open("tcp-client", store.clone(), HandleOptions::default()).await?;
    handle.on_sync(|| println!("Synced with server"));
    handle.idle().await;

    handle.store(person("p9", "Cy", 25)).await?;
    handle.idle().await;
    print_entities("Server-backed entities", &handle);

    handle.close().await;
    channel.disconnect();
    Ok(())
}
