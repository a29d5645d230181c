//! # Persona Harness Core
//!
//! Runtime-independent logic for Persona Harness: data models, the error
//! taxonomy, partitioned retrieval, citation assembly, prompt templates,
//! tiered rate limiting, and the ingestion chunking contract.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. Storage and
//! embedding backends are reached through the [`store::CorpusStore`],
//! [`template::TemplateRepository`], and [`embedding::Embedder`] traits.

pub mod chunk;
pub mod citation;
pub mod embedding;
pub mod error;
pub mod models;
pub mod personality;
pub mod ratelimit;
pub mod retrieval;
pub mod store;
pub mod template;
