//! End-to-end pipeline tests: write → semantic → embed → find, then
//! structural changes and their effect on the index.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use viking_store::config::{BackendKind, Config};
use viking_store::objstore::{MemoryFs, ObjectStore};
use viking_store::services::Services;
use viking_store::vfs::{vector_id, WriteContext};
use viking_store_core::filter::Filter;
use viking_store_core::models::ContextType;
use viking_store_core::store::{AggregateRequest, TOTAL_KEY};

const WAIT: Option<Duration> = Some(Duration::from_secs(30));

fn test_config(workspace: &std::path::Path, backend: BackendKind) -> Config {
    let mut config = Config::for_workspace(workspace);
    config.vectordb.backend = backend;
    config.vectordb.dims = 64;
    config.queue.poll_interval_ms = 10;
    config
}

async fn started(config: Config) -> Services {
    let services = Services::open(config).await.unwrap();
    services.start().await.unwrap();
    services
}

async fn seed_docs(services: &Services) {
    let vfs = &services.vfs;
    vfs.write(
        "viking://resources/docs/wal.md",
        b"Write ahead logging makes every write durable. The log is fsynced before pages change.",
    )
    .await
    .unwrap();
    vfs.write(
        "viking://resources/docs/planner.md",
        b"The query planner picks join orders from table statistics.",
    )
    .await
    .unwrap();
    vfs.write(
        "viking://resources/docs/diagrams/arch.png",
        b"\x89PNG not really",
    )
    .await
    .unwrap();
}

async fn rows_under(services: &Services, prefix: &str) -> u64 {
    let mut request = AggregateRequest::count();
    request.filter = Some(Filter::prefix("uri", prefix));
    services
        .vectors
        .aggregate(&services.config.vectordb.collection, &request)
        .await
        .unwrap()
        .get(TOTAL_KEY)
        .copied()
        .unwrap_or(0)
}

#[tokio::test]
async fn test_reindex_builds_summaries_and_vectors() {
    let tmp = TempDir::new().unwrap();
    let services = started(test_config(tmp.path(), BackendKind::Sqlite)).await;
    seed_docs(&services).await;

    let msg = services
        .vfs
        .reindex("viking://resources/docs", None)
        .await
        .unwrap();
    assert_eq!(msg.context_type, ContextType::Resource);
    let statuses = services.wait_indexed(WAIT).await.unwrap();
    assert!(statuses.values().all(|s| s.error_count == 0), "{:?}", statuses);

    let docs_abstract = services
        .vfs
        .abstract_text("viking://resources/docs")
        .await
        .unwrap();
    assert!(!docs_abstract.trim().is_empty());
    let overview = services
        .vfs
        .overview("viking://resources/docs")
        .await
        .unwrap();
    assert!(overview.starts_with("# docs"));
    assert!(overview.contains("wal.md"));
    assert!(!services
        .vfs
        .abstract_text("viking://resources/docs/diagrams")
        .await
        .unwrap()
        .is_empty());

    // docs, diagrams, and three files
    assert_eq!(rows_under(&services, "viking://resources/docs").await, 5);
    let wal = services
        .vectors
        .fetch("context", &[vector_id("viking://resources/docs/wal.md")])
        .await
        .unwrap();
    assert_eq!(wal.found.len(), 1);
    assert_eq!(wal.found[0].field_str("parent_uri"), Some("viking://resources/docs"));

    let result = services
        .vfs
        .find("write ahead logging durable", Some("viking://resources"), 5, None, None)
        .await
        .unwrap();
    assert!(result.memories.is_empty());
    assert!(result
        .resources
        .iter()
        .any(|m| m.uri == "viking://resources/docs/wal.md"));

    services.stop().await;
}

#[tokio::test]
async fn test_mv_and_rm_keep_index_consistent() {
    let tmp = TempDir::new().unwrap();
    let services = started(test_config(tmp.path(), BackendKind::Sqlite)).await;
    seed_docs(&services).await;
    services
        .vfs
        .reindex("viking://resources/docs", None)
        .await
        .unwrap();
    services.wait_indexed(WAIT).await.unwrap();

    let before = services
        .vectors
        .fetch("context", &[vector_id("viking://resources/docs/wal.md")])
        .await
        .unwrap()
        .found
        .remove(0);

    services
        .vfs
        .mv("viking://resources/docs", "viking://resources/notes")
        .await
        .unwrap();
    assert_eq!(rows_under(&services, "viking://resources/docs").await, 0);
    assert_eq!(rows_under(&services, "viking://resources/notes").await, 5);

    let moved = services
        .vectors
        .fetch("context", &[vector_id("viking://resources/notes/wal.md")])
        .await
        .unwrap()
        .found
        .remove(0);
    assert_eq!(moved.vector, before.vector);
    assert_eq!(moved.field_str("parent_uri"), Some("viking://resources/notes"));
    assert_eq!(
        services.vfs.read("viking://resources/notes/wal.md").await.unwrap(),
        b"Write ahead logging makes every write durable. The log is fsynced before pages change."
    );

    let found = services
        .vfs
        .find("write ahead logging durable", Some("viking://resources"), 5, None, None)
        .await
        .unwrap();
    assert!(
        found
            .all()
            .iter()
            .any(|m| m.uri == "viking://resources/notes/wal.md"),
        "{:?}",
        found.all()
    );
    assert!(found.all().iter().all(|m| !m.uri.contains("/docs")));
    let at_old = services
        .vfs
        .find("write ahead logging durable", Some("viking://resources/docs"), 5, None, None)
        .await
        .unwrap();
    assert!(at_old.all().is_empty(), "{:?}", at_old.all());

    services
        .vfs
        .rm("viking://resources/notes", true)
        .await
        .unwrap();
    assert_eq!(rows_under(&services, "viking://resources/notes").await, 0);
    assert!(services.vfs.stat("viking://resources/notes").await.is_err());

    services.stop().await;
}

#[tokio::test]
async fn test_memories_are_searched_in_their_partition() {
    let tmp = TempDir::new().unwrap();
    let services = started(test_config(tmp.path(), BackendKind::Memory)).await;
    services
        .vfs
        .write_context(
            "viking://user/memories/preferences/editor",
            WriteContext {
                content: "Prefers vim keybindings in every editor.",
                abstract_text: "User prefers vim keybindings.",
                ..WriteContext::default()
            },
        )
        .await
        .unwrap();
    services
        .vfs
        .write("viking://resources/guides/vim.md", b"A guide to vim motions.")
        .await
        .unwrap();

    services
        .vfs
        .reindex("viking://user/memories", None)
        .await
        .unwrap();
    services
        .vfs
        .reindex("viking://resources/guides", None)
        .await
        .unwrap();
    services.wait_indexed(WAIT).await.unwrap();

    let result = services
        .vfs
        .find("vim keybindings", Some("viking://user/memories"), 5, None, None)
        .await
        .unwrap();
    assert!(!result.memories.is_empty());
    assert!(result.resources.is_empty());
    assert!(result
        .memories
        .iter()
        .all(|m| m.uri.starts_with("viking://user/memories")));

    let everywhere = services
        .vfs
        .search("vim", None, None, 5, None, None)
        .await
        .unwrap();
    assert!(!everywhere.memories.is_empty());
    assert!(!everywhere.resources.is_empty());

    services.stop().await;
}

#[tokio::test]
async fn test_queued_work_survives_restart() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path(), BackendKind::Sqlite);
    {
        let services = Services::open(config.clone()).await.unwrap();
        services
            .vfs
            .write("viking://resources/a/one.md", b"First document.")
            .await
            .unwrap();
        services.vfs.reindex("viking://resources/a", None).await.unwrap();
        let pending = services.queues.check_status(None).await.unwrap();
        assert_eq!(pending["Semantic"].pending, 1);
    }

    let services = started(config).await;
    services.wait_indexed(WAIT).await.unwrap();
    assert_eq!(rows_under(&services, "viking://resources/a").await, 2);
    services.stop().await;
}

#[tokio::test]
async fn test_services_on_memory_object_store() {
    let tmp = TempDir::new().unwrap();
    let fs: Arc<dyn ObjectStore> = Arc::new(MemoryFs::new());
    let config = test_config(tmp.path(), BackendKind::Memory);
    let services = Services::with_object_store(config, fs.clone()).await.unwrap();
    services.start().await.unwrap();

    services
        .vfs
        .write("viking://resources/x/readme.md", b"Readme text.")
        .await
        .unwrap();
    services.vfs.reindex("viking://resources/x/readme.md", None).await.unwrap();
    services.wait_indexed(WAIT).await.unwrap();
    assert!(fs.exists("/local/resources/x/.abstract.md").await.unwrap());
    assert!(!tmp.path().join("fs").exists());

    services.stop().await;
}
