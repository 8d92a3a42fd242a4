use serde::{Deserialize, Serialize};
use shared_storage::{DurableStore, FlushPolicy, MemoryBackend, MemoryStore, SyncShim};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
struct Course {
    id: String,
    title: String,
}

#[tokio::main]
async fn main() -> Result<(), shared_storage::Error> {
    let path = std::env::temp_dir().join("shared_storage_demo_admin.json");
    let remote = Arc::new(MemoryBackend::new());

    // admin persists to disk, the visitor keeps everything in memory
    let admin_local: DurableStore = DurableStore::builder(&path)
        .policy(FlushPolicy::Immediate)
        .pretty(true)
        .build()?;
    let admin = SyncShim::builder(admin_local, remote.clone()).build();
    let visitor = SyncShim::builder(MemoryStore::new(), remote.clone()).build();
    println!("admin init:   {:?}", admin.init().await);
    println!("visitor init: {:?}", visitor.init().await);

    visitor.add_listener(|change| {
        println!(
            "visitor saw {} change: {:?} -> {:?}",
            change.key, change.old_value, change.new_value
        );
    });
    let sub = visitor
        .typed()
        .subscribe("course-list", |courses: Option<Vec<Course>>| {
            println!("visitor course list is now {courses:?}");
        })
        .await;

    // syncable: reaches the visitor
    let courses = vec![Course {
        id: "1".into(),
        title: "Biology".into(),
    }];
    admin.typed().write("course-list", &courses).await;

    // session-local: stays with the admin
    admin.set("teacherAuth", "true")?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("visitor teacherAuth = {:?}", visitor.get("teacherAuth"));
    println!("admin file:\n{}", std::fs::read_to_string(&path)?);

    sub.unsubscribe();
    admin.shutdown();
    visitor.shutdown();
    let _ = std::fs::remove_file(&path);
    Ok(())
}
