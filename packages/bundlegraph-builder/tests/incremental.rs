//! Incremental evaluator properties: pure memoization, per-file change
//! propagation, cross-build node identity, redirects, and contract
//! violations.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use url::Url;

use bundlegraph_builder::fs::write_text;
use bundlegraph_builder::{
    Builder, ConstNode, FileNode, FileSystem, MemoryDriver, NodeRef, NodeValue, WriteFileNode,
};
use common::{BadUnchangedNode, CounterNode, RedirectNode, StatefulNode};

fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

fn memory_fs(seed: &[(&str, &str)]) -> Arc<FileSystem> {
    let fs = FileSystem::new();
    let driver = Arc::new(MemoryDriver::new());
    for (path, text) in seed {
        driver.seed(path, text);
    }
    fs.mount(url("https://local/"), driver);
    Arc::new(fs)
}

fn roots(entries: Vec<(&str, NodeRef)>) -> IndexMap<String, NodeRef> {
    entries
        .into_iter()
        .map(|(name, node)| (name.to_string(), node))
        .collect()
}

#[tokio::test]
async fn test_second_build_runs_zero_non_volatile_nodes() {
    let fs = memory_fs(&[]);
    let leaf_runs = Arc::new(AtomicUsize::new(0));
    let mid_runs = Arc::new(AtomicUsize::new(0));
    let leaf: NodeRef = Arc::new(CounterNode::new("leaf", leaf_runs.clone()));
    let mid: NodeRef = Arc::new(CounterNode::new("mid", mid_runs.clone()).with_dep("leaf", leaf));
    let mut builder = Builder::new(fs, roots(vec![("root", mid)]));

    builder.build().await.unwrap();
    assert_eq!(leaf_runs.load(Ordering::SeqCst), 1);
    assert_eq!(mid_runs.load(Ordering::SeqCst), 1);

    builder.build().await.unwrap();
    // pure memoization: nothing re-ran
    assert_eq!(leaf_runs.load(Ordering::SeqCst), 1);
    assert_eq!(mid_runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_same_cache_key_collapses_to_one_evaluation() {
    let fs = memory_fs(&[]);
    let runs = Arc::new(AtomicUsize::new(0));
    // two distinct node objects with the same cache key
    let first: NodeRef = Arc::new(CounterNode::new("shared", runs.clone()));
    let second: NodeRef = Arc::new(CounterNode::new("shared", runs.clone()));
    let mut builder = Builder::new(fs, roots(vec![("a", first), ("b", second)]));

    builder.build().await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_touching_one_file_changes_only_its_consumers() {
    let fs = memory_fs(&[("a.js", "const a = 1;"), ("b.js", "const b = 2;")]);
    let a_runs = Arc::new(AtomicUsize::new(0));
    let b_runs = Arc::new(AtomicUsize::new(0));
    let observe_a: NodeRef = Arc::new(
        CounterNode::new("observe:a", a_runs.clone())
            .with_dep("file", Arc::new(FileNode::new(url("https://local/a.js")))),
    );
    let observe_b: NodeRef = Arc::new(
        CounterNode::new("observe:b", b_runs.clone())
            .with_dep("file", Arc::new(FileNode::new(url("https://local/b.js")))),
    );
    let mut builder = Builder::new(
        fs.clone(),
        roots(vec![("a", observe_a), ("b", observe_b)]),
    );

    builder.build().await.unwrap();
    assert_eq!(a_runs.load(Ordering::SeqCst), 1);
    assert_eq!(b_runs.load(Ordering::SeqCst), 1);

    write_text(&fs, &url("https://local/a.js"), "const a = 42;")
        .await
        .unwrap();
    let values = builder.build().await.unwrap();
    // only a's consumer re-ran
    assert_eq!(a_runs.load(Ordering::SeqCst), 2);
    assert_eq!(b_runs.load(Ordering::SeqCst), 1);
    assert_eq!(values["a"].as_text().unwrap(), "const a = 42;");
}

#[tokio::test]
async fn test_rewriting_identical_content_is_unchanged() {
    let fs = memory_fs(&[("a.js", "const a = 1;")]);
    let runs = Arc::new(AtomicUsize::new(0));
    let observer: NodeRef = Arc::new(
        CounterNode::new("observe", runs.clone())
            .with_dep("file", Arc::new(FileNode::new(url("https://local/a.js")))),
    );
    let mut builder = Builder::new(fs.clone(), roots(vec![("a", observer)]));

    builder.build().await.unwrap();
    write_text(&fs, &url("https://local/a.js"), "const a = 1;")
        .await
        .unwrap();
    builder.build().await.unwrap();
    // same fingerprint: the file node reports unchanged
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_node_objects_persist_across_builds() {
    let fs = memory_fs(&[]);
    let stateful: NodeRef = Arc::new(StatefulNode::new("stateful"));
    let mut builder = Builder::new(fs, roots(vec![("s", stateful)]));

    let first = builder.build().await.unwrap();
    assert_eq!(first["s"].as_text().unwrap(), "1");
    let second = builder.build().await.unwrap();
    // the same instance ran again: its private counter advanced
    assert_eq!(second["s"].as_text().unwrap(), "2");
}

#[tokio::test]
async fn test_redirect_propagates_the_target_value() {
    let fs = memory_fs(&[]);
    let target: NodeRef = Arc::new(ConstNode::new("target", NodeValue::text("final")));
    let redirect: NodeRef = Arc::new(RedirectNode { target });
    let mut builder = Builder::new(fs, roots(vec![("r", redirect)]));

    let values = builder.build().await.unwrap();
    assert_eq!(values["r"].as_text().unwrap(), "final");
}

#[tokio::test]
async fn test_unchanged_on_first_run_is_a_bug() {
    let fs = memory_fs(&[]);
    let bad: NodeRef = Arc::new(BadUnchangedNode);
    let mut builder = Builder::new(fs, roots(vec![("bad", bad)]));

    let err = builder.build().await.unwrap_err();
    assert!(err.to_string().starts_with("bug:"));
    assert!(err.to_string().contains("unchanged"));
}

#[tokio::test]
async fn test_write_file_node_lands_its_dependency() {
    let fs = memory_fs(&[]);
    fs.mount(url("https://local-out/"), Arc::new(MemoryDriver::new()));

    let source: NodeRef = Arc::new(ConstNode::new("source", NodeValue::text("export {};")));
    let write: NodeRef = Arc::new(WriteFileNode::new(url("https://local-out/out.js"), source));
    let mut builder = Builder::new(fs.clone(), roots(vec![("w", write)]));
    builder.build().await.unwrap();

    let written = bundlegraph_builder::fs::read_text(&fs, &url("https://local-out/out.js"))
        .await
        .unwrap();
    assert_eq!(written, "export {};");
}

#[tokio::test]
async fn test_explain_records_deps_and_changes() {
    let fs = memory_fs(&[("a.js", "1")]);
    let runs = Arc::new(AtomicUsize::new(0));
    let observer: NodeRef = Arc::new(
        CounterNode::new("observe", runs.clone())
            .with_dep("file", Arc::new(FileNode::new(url("https://local/a.js")))),
    );
    let mut builder = Builder::new(fs, roots(vec![("a", observer)]));
    builder.build().await.unwrap();

    let explain = builder.explain();
    let entry = explain.entry("observe").unwrap();
    assert_eq!(entry.deps.len(), 1);
    assert!(entry.deps[0].1.contains("file:"));
    assert!(entry.changed);

    let dot = explain.dot();
    assert!(dot.starts_with("digraph {"));
    assert!(dot.contains("\"observe\" -> \"file:https://local/a.js\""));
}

#[tokio::test]
async fn test_cached_cache_keys_after_build() {
    let fs = memory_fs(&[]);
    let runs = Arc::new(AtomicUsize::new(0));
    let node: NodeRef = Arc::new(CounterNode::new("only", runs));
    let mut builder = Builder::new(fs, roots(vec![("only", node)]));
    builder.build().await.unwrap();
    assert_eq!(builder.cached_cache_keys(), vec!["only".to_string()]);
}
