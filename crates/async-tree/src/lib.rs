//! Lazily loaded tree model with off-thread child fetching.
//!
//! This crate provides:
//! - An identity-preserving node map reconciled against fresh provider answers
//! - Per-node single-flight fetch commands with coalescing
//! - Resumable tree walks that pause on unloaded nodes
//! - Consumer/worker scheduling with pluggable executors

mod arena;
mod map;
mod node;

pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod object;
pub mod path;
pub mod promise;
pub mod provider;
pub mod reconcile;
pub mod scheduler;
pub mod visitor;
pub mod walker;

// Re-export main types
pub use command::{Command, Refresh};
pub use config::TreeConfig;
pub use error::{Result, TreeError};
pub use events::{ListenerId, TreeEvent, TreeListener};
pub use model::{AsyncTreeModel, Comparator, ModelState, TreeItem, TreeStatus};
pub use node::NodeSnapshot;
pub use object::TreeObject;
pub use path::TreePath;
pub use promise::Pending;
pub use provider::{Children, ChildrenReply, LeafInfo, LeafState, StructureProvider};
pub use reconcile::{diff, ChildDiff};
pub use scheduler::{Executor, ManualQueue, Role, Scheduler, SerialQueue, Task, WorkerPool};
pub use visitor::{PathFinder, Search, TreeVisitor, VisitAction};
pub use walker::{ChildrenSource, Fetch, TreeWalker, WalkResult, WalkState};
