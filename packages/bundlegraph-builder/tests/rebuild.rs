//! Rebuilder state-machine behavior: startup, idle outcomes, change-driven
//! rebuilds, and shutdown semantics.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use url::Url;

use bundlegraph_builder::fs::write_text;
use bundlegraph_builder::{
    BuildRunner, BuildStatus, FileNode, FileSystem, MemoryDriver, NodeRef, Rebuilder,
    WatchRegistry,
};
use common::{init_tracing, CounterNode, FailingNode};

fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

fn runner_with(
    fs: &Arc<FileSystem>,
    roots: Vec<(&str, NodeRef)>,
) -> BuildRunner {
    let watch = WatchRegistry::new();
    watch.clone().subscribe(fs);
    BuildRunner::new(
        fs.clone(),
        roots
            .into_iter()
            .map(|(name, node)| (name.to_string(), node))
            .collect::<IndexMap<String, NodeRef>>(),
        watch,
    )
}

fn observed_file_fs() -> (Arc<FileSystem>, Arc<AtomicUsize>, NodeRef) {
    let fs = FileSystem::new();
    let driver = Arc::new(MemoryDriver::new());
    driver.seed("a.js", "const a = 1;");
    fs.mount(url("https://local/"), driver);
    let runs = Arc::new(AtomicUsize::new(0));
    let observer: NodeRef = Arc::new(
        CounterNode::new("observe", runs.clone())
            .with_dep("file", Arc::new(FileNode::new(url("https://local/a.js")))),
    );
    (Arc::new(fs), runs, observer)
}

async fn wait_for<F: Fn() -> bool>(predicate: F, what: &str) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_builds_and_lands_idle() {
    init_tracing();
    let (fs, runs, observer) = observed_file_fs();
    let rebuilder = Rebuilder::new(runner_with(&fs, vec![("a", observer)]));
    rebuilder.start();
    rebuilder.is_idle().await;
    assert_eq!(rebuilder.status(), BuildStatus::Succeeded);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_file_change_triggers_exactly_one_rebuild() {
    init_tracing();
    let (fs, runs, observer) = observed_file_fs();
    let rebuilder = Rebuilder::new(runner_with(&fs, vec![("a", observer)]));
    rebuilder.start();
    rebuilder.is_idle().await;

    write_text(&fs, &url("https://local/a.js"), "const a = 2;")
        .await
        .unwrap();
    wait_for(|| runs.load(Ordering::SeqCst) == 2, "the change-driven rebuild").await;
    rebuilder.is_idle().await;
    assert_eq!(rebuilder.status(), BuildStatus::Succeeded);
    // no further builds happen without further changes
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_build_failure_lands_idle_with_failure_outcome() {
    let fs = Arc::new(FileSystem::new());
    let rebuilder = Rebuilder::new(runner_with(&fs, vec![("bad", Arc::new(FailingNode))]));
    rebuilder.start();
    rebuilder.is_idle().await;
    match rebuilder.status() {
        BuildStatus::Failed(message) => assert!(message.contains("refusing to build")),
        other => panic!("expected a failed outcome, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_from_created_reaches_terminal_state() {
    let fs = Arc::new(FileSystem::new());
    let root: NodeRef = Arc::new(bundlegraph_builder::ConstNode::new(
        "root",
        bundlegraph_builder::NodeValue::Unit,
    ));
    let rebuilder = Rebuilder::new(runner_with(&fs, vec![("a", root)]));
    // never started: shutdown must still terminate, not hang
    tokio::time::timeout(Duration::from_secs(5), rebuilder.shutdown())
        .await
        .expect("shutdown must not hang")
        .unwrap();
    assert_eq!(rebuilder.state(), bundlegraph_builder::RebuilderState::Shutdown);

    // is_idle never resolves after shutdown
    let idle = tokio::time::timeout(Duration::from_millis(200), rebuilder.is_idle()).await;
    assert!(idle.is_err(), "is_idle resolved after shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_changes_after_shutdown_are_ignored() {
    let (fs, runs, observer) = observed_file_fs();
    let rebuilder = Rebuilder::new(runner_with(&fs, vec![("a", observer)]));
    rebuilder.start();
    rebuilder.is_idle().await;
    rebuilder.shutdown().await.unwrap();

    write_text(&fs, &url("https://local/a.js"), "const a = 3;")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(rebuilder.status(), BuildStatus::Shutdown);
}

#[test]
fn test_validate_roots_rejects_shared_origin() {
    let err = bundlegraph_builder::validate_roots(&[(
        url("https://local/src/"),
        url("https://local/dist/"),
    )])
    .unwrap_err();
    assert!(err.to_string().contains("run away rebuild"));

    bundlegraph_builder::validate_roots(&[(
        url("https://local/src/"),
        url("https://local-out/dist/"),
    )])
    .unwrap();
}
