// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Keyspace Migrator
//!
//! A control plane for moving tables between keyspaces of a sharded store
//! while the tables stay online.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                            keyspace-migrator                              │
//! │                                                                           │
//! │  ┌──────────────┐   phases    ┌────────────────┐   CAS   ┌─────────────┐  │
//! │  │ Orchestrator │────────────►│ RoutingRules + │────────►│  TopoStore  │  │
//! │  │ (clone, cut- │             │ Blacklists     │         │ (versioned  │  │
//! │  │  over, ...)  │             └────────────────┘         │  KV)        │  │
//! │  └──────┬───────┘                                        └──────▲──────┘  │
//! │         │ start/stop/resume                                     │ refresh │
//! │         ▼                                                       │         │
//! │  ┌──────────────┐  copy + tail  ┌─────────────┐         ┌──────┴──────┐  │
//! │  │ StreamEngine │──────────────►│ Partitions  │◄────────│ QueryRouter │  │
//! │  │ (task/stream)│               │ (src → dst) │  writes │ (front end) │  │
//! │  └──────┬───────┘               └─────────────┘         └─────────────┘  │
//! │         ▼                                                                 │
//! │  ┌──────────────┐                                                         │
//! │  │ StreamStore  │                                                         │
//! │  │ (SQLite)     │                                                         │
//! │  └──────────────┘                                                         │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Migration Phases
//!
//! 1. **Clone**: Filtered replication streams copy, then tail, the tables
//! 2. **Cutover** (rdonly, replica, primary): Routing rules move one traffic
//!    class at a time; write blacklists keep exactly one side writable
//! 3. **Finalize** or **Cancel**: Streams and the migration record go away
//!
//! Every phase can be reversed while the next one has not begun.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use keyspace_migrator::{
//!     MemoryResolver, MemoryTopo, MigrationKey, MigratorConfig, Orchestrator, StreamEngine,
//!     StreamStore, Topology, TrafficClass,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> keyspace_migrator::Result<()> {
//! let config = MigratorConfig::default();
//! let store = Arc::new(StreamStore::new(&config.store.sqlite_path, config.store.wal_mode).await?);
//! let resolver = Arc::new(MemoryResolver::new());
//! let topo = Topology::new(Arc::new(MemoryTopo::new()));
//!
//! let engine = Arc::new(StreamEngine::new(store, resolver.clone(), config.stream.clone()));
//! engine.recover().await?;
//!
//! let orchestrator = Orchestrator::new(topo, engine, resolver, config.orchestrator.clone());
//! let key = MigrationKey::new("commerce", "customer");
//! orchestrator.clone_tables(&key, &["customer".to_string()]).await?;
//! for class in TrafficClass::ALL {
//!     orchestrator.cutover(&key, class, true).await?;
//! }
//! orchestrator.finalize(&key).await?;
//! # Ok(())
//! # }
//! ```

pub mod blacklist;
pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod memory;
pub mod metrics;
pub mod orchestrator;
pub mod partition;
pub mod position;
pub mod resilience;
pub mod router;
pub mod routing;
pub mod stream;
pub mod stream_store;
pub mod topo;

// Re-exports for convenience
pub use blacklist::{BlacklistAction, BlacklistChange, BlacklistStore};
pub use config::{MigratorConfig, OrchestratorSettings, RouterSettings, StoreConfig, StreamSettings};
pub use error::{ErrorClass, MigrationError, Result};
pub use event::{Row, RowChange, RowOp, Snapshot, SourceEvent};
pub use filter::{Filter, FilterSpec, KeyRange};
pub use memory::{MemoryPartition, MemoryResolver};
pub use orchestrator::{Direction, MigrationKey, MigrationRecord, MigrationStatus, Orchestrator, Phase};
pub use partition::{PartitionBackend, PartitionError, PartitionRef, PartitionResolver, TrafficClass};
pub use position::Position;
pub use router::{QueryRouter, RoutingView};
pub use routing::{RoutingRuleStore, RoutingRules, RuleKey};
pub use stream::{StreamEngine, StreamId, StreamState, StreamStatus};
pub use stream_store::StreamStore;
pub use topo::{MemoryTopo, SqliteTopo, TopoStore, Topology};
