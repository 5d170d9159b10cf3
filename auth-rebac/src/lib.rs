//! Zanzibar-style relationship-based access control engine for RustCare Engine
//!
//! Permissions are derived from a graph of relationship tuples evaluated
//! against per-type rewrite rules, with layered caches in front of the graph:
//! - **Result cache**: recent check answers, short TTL
//! - **Tiger cache**: per-subject roaring bitmaps of accessible resources
//! - **Leopard index**: transitive closure of group membership
//! - **Boundary / visibility caches**: where hierarchical inheritance resolves
//! - **Iterator cache**: snapshot-stable cursors for `list_objects`
//!
//! The tuple store is the only source of truth. Every traversal runs inside a
//! zone and under [`GraphLimits`]; anything uncertain resolves to "denied".
//!
//! # Example
//!
//! ```rust,no_run
//! use auth_rebac::{
//!     CheckRequest, Consistency, EngineConfig, InMemoryTupleRepository, Object,
//!     RebacManager, RelationshipTuple, Schema, Subject,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> auth_rebac::Result<()> {
//! let engine = RebacManager::new(
//!     Arc::new(InMemoryTupleRepository::new()),
//!     Schema::filesystem(),
//!     EngineConfig::default(),
//! )?;
//!
//! let (_, token) = engine
//!     .write(RelationshipTuple::new(Subject::user("alice"), "viewer", Object::file("/doc.txt"), "z1"))
//!     .await?;
//!
//! let request = CheckRequest::new(Subject::user("alice"), "viewer", Object::file("/doc.txt"), "z1");
//! assert!(engine.check(&request, Consistency::Strong(Some(token))).await?);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod check;
pub mod config;
pub mod consistency;
pub mod engine;
pub mod error;
pub mod expand;
pub mod leopard;
pub mod limits;
pub mod logging;
pub mod models;
pub mod repository;
pub mod schema;
pub mod tiger;
pub mod traversal;
pub mod zone;

pub use config::EngineConfig;
pub use consistency::{Consistency, ConsistencyToken, RevisionTracker};
pub use engine::RebacManager;
pub use error::*;
pub use limits::{GraphLimits, NodeBudget, TraversalGuard};
pub use logging::init_tracing;
pub use models::*;
pub use repository::{InMemoryTupleRepository, PostgresTupleRepository, TupleRepository};
pub use schema::*;
