// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # kgrl-engine
//!
//! A knowledge graph engine for agents acting in interactive environments.
//! The agent consults the graph while deciding and feeds it evidence while
//! acting; the engine keeps both sides consistent.
//!
//! ## Architecture
//!
//! - **Graph store** (`graph`): typed nodes and confidence-weighted edges over
//!   a petgraph `StableDiGraph`, behind one reader/writer lock
//! - **Indexer** (`index`): keyword postings and embedding vectors, with
//!   tombstones for retired facts
//! - **Retriever** (`retrieve`): keyword, semantic, path and hybrid queries
//!   ranked by a weighted score under a soft deadline
//! - **Updater** (`update`): evidence aggregation, single-valued conflict
//!   arbitration, temporal decay
//! - **Memory tiers** (`memory`): short/medium/long LRU caches of fact copies
//! - **Mode controller** (`controller`): per-step ordering of retrieval and
//!   update, with a throughput guard
//! - **Persistence** (`store`): versioned JSON snapshots and a redb store
//!
//! ## Library usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kgrl_engine::config::EngineConfig;
//! use kgrl_engine::controller::{ExecutionMode, ModeController};
//! use kgrl_engine::engine::Engine;
//! use kgrl_engine::graph::{NodeSpec, Relation};
//! use kgrl_engine::retrieve::Query;
//! use kgrl_engine::update::CandidateFact;
//!
//! let engine = Arc::new(Engine::new(EngineConfig::default()).unwrap());
//! let mut controller = ModeController::new(Arc::clone(&engine));
//! controller.start_episode(ExecutionMode::JointRetrieveUpdate).unwrap();
//! controller.begin_step().unwrap();
//! controller
//!     .submit(CandidateFact::new(
//!         NodeSpec::entity("kitchen"),
//!         Relation::Contains,
//!         NodeSpec::entity("fridge"),
//!         0.9,
//!     ))
//!     .unwrap();
//! let facts = controller.retrieve(&Query::keyword(&["fridge"])).unwrap();
//! println!("{}", facts.render(false));
//! controller.end_step().unwrap();
//! controller.end_episode().unwrap();
//! ```

pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod graph;
pub mod index;
pub mod memory;
pub mod retrieve;
pub mod store;
pub mod update;
