//! bundlegraph-builder
//!
//! The incremental build engine: a memoized, dependency-aware task graph
//! where each node declares its dependencies dynamically, deduplicates
//! identical work by cache key, caches results across rebuilds, and
//! propagates "changed" status only along the edges that need it. A
//! companion rebuilder drives continuous builds from file-change
//! notifications.
//!
//! Layout:
//! - `fs/`        : virtual filesystem port with memory and disk drivers
//! - `watch`      : watched-file registry and change-batch coalescing
//! - `nodes/`     : the node contract plus file, lock-file, and bundle nodes
//! - `runner`     : the two-table memoized evaluator and `explain()`
//! - `rebuilder`  : the continuous-build state machine

pub mod errors;
pub mod fs;
pub mod nodes;
pub mod rebuilder;
pub mod runner;
pub mod watch;

pub use errors::{BuildError, Result};
pub use fs::{
    drivers::{DiskDriver, MemoryDriver},
    FileChange, FileChangeKind, FileDescriptor, FileKind, FileSystem,
};
pub use nodes::{
    bundle::validate_roots, BuilderNode, BundleInputs, BundleInputsNode, BundleInputsProvider,
    CacheKey, CombineModulesNode, ConstNode, DepMap, FileNode, LockFileNode, MakeBundleNode,
    NodeInputs, NodeOutput, NodeRef, NodeValue, WriteFileNode,
};
pub use rebuilder::{BuildOutcome, BuildStatus, Rebuilder, RebuilderState};
pub use runner::{BuildRunner, Builder, Explain, ExplainEntry};
pub use watch::WatchRegistry;
