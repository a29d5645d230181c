//! # Persona Harness
//!
//! Answers questions in the voice of historical and spiritual
//! personalities, grounded in each personality's own corpus.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────┐   ┌──────────────┐   ┌──────────────────────────────┐
//!  │ CLI/HTTP │──▶│ Orchestrator │──▶│ rate limit → cache → retrieve │
//!  └──────────┘   └──────┬───────┘   │ → render → generate → store   │
//!                        │           └──────────────────────────────┘
//!            ┌───────────┼──────────────┬───────────────┐
//!            ▼           ▼              ▼               ▼
//!       ┌─────────┐ ┌───────────┐ ┌───────────┐ ┌─────────────┐
//!       │ corpus  │ │ templates │ │ cache     │ │ embedder /  │
//!       │ (SQLite)│ │ (SQLite)  │ │ mem/shared│ │ generator   │
//!       └─────────┘ └───────────┘ │ /SQLite   │ └─────────────┘
//!                                 └───────────┘
//! ```
//!
//! Pure domain logic (models, retrieval, citations, template rendering,
//! rate limiting) lives in `persona_harness_core`. This crate wires it to
//! SQLite, HTTP providers, and the two transports.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] / [`migrate`] | SQLite pool and schema |
//! | [`sqlite_store`] | Corpus and template repositories |
//! | [`embedding`] | Embedding providers |
//! | [`generation`] | Generation providers and retry policy |
//! | [`http`] | Shared HTTP client helpers |
//! | [`templates`] | Versioned template store |
//! | [`cache`] | Tiered response cache with single-flight |
//! | [`orchestrator`] | Request pipeline |
//! | [`ingest`] | Corpus ingestion |
//! | [`server`] | HTTP server |
//! | [`stats`] | Database statistics |

pub mod cache;
pub mod config;
pub mod db;
pub mod embedding;
pub mod generation;
pub mod http;
pub mod ingest;
pub mod migrate;
pub mod orchestrator;
pub mod server;
pub mod sqlite_store;
pub mod stats;
pub mod templates;
