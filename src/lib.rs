//! # Grenzwanderer - progression core for a location-based exploration game
//!
//! Players walk a real-world map, discover points by QR scan or by standing close
//! enough to them, and progress through quests. This crate holds the client-side
//! progression state and keeps it in step with a remote document store.
//!
//! ## Features
//!
//! - **Quest lifecycle**: start, advance, complete, batch updates and server hydration,
//!   with a single tracked quest that is re-elected when it completes.
//! - **Player state**: phase, reputation, inventory, credits, skills, flags and a
//!   per-field merge policy for server snapshots.
//! - **Discovery**: QR scans and location fixes resolved against map points with
//!   per-point radii and phase gating.
//! - **Optimistic sync**: local changes apply immediately and roll back exactly when
//!   the backend fails, without clobbering newer writes.
//! - **Local persistence**: sled trees with versioned bincode blobs and migrations.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use grenzwanderer::progression::{
//!     system_clock, EngineSettings, Identity, InMemoryBackend, ProgressionEngine, ProgressionEvent,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let clock = system_clock();
//!     let backend = Arc::new(InMemoryBackend::new(clock.clone()));
//!     let mut engine = ProgressionEngine::new(
//!         Identity::anonymous("3f0c9a2e"),
//!         backend,
//!         clock,
//!         EngineSettings::default(),
//!     );
//!     engine.dispatch(ProgressionEvent::start("intro", "meet_guide")).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`progression`] - stores, engine, backend contract, persistence
//! - [`config`] - configuration loading and validation
//! - [`validation`] - identifier, scan code and credential checks

pub mod config;
pub mod progression;
pub mod validation;
