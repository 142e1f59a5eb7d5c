//! # docket
//!
//! Hybrid retrieval over a historical corpus of contract filings and live
//! filings fetched on demand, with incremental, deduplicated ingestion.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │   Corpus    │──▶│  Ingestion   │──▶│  VectorIndex     │
//! │  (files)    │   │ norm+dedup+  │   │ SQLite + HNSW    │
//! └─────────────┘   │    embed     │   └────────┬─────────┘
//! ┌─────────────┐   │              │            │
//! │ LiveFetcher │──▶│              │            ▼
//! │  (sec-api)  │   └──────────────┘   ┌──────────────────┐   ┌─────────┐
//! └─────────────┘          ▲           │ HybridQueryEngine│◀─▶│  Cache  │
//!        ▲                 └───────────│  corpus + live   │   └─────────┘
//!        └─────────────────────────────└────────┬─────────┘
//!                                       ┌───────┴───────┐
//!                                       ▼               ▼
//!                                  ┌────────┐      ┌────────┐
//!                                  │  CLI   │      │  HTTP  │
//!                                  └────────┘      └────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`app`] | Composition root |
//! | [`cache`] | Bounded TTL result cache |
//! | [`chunk`] | Splitting of long embedding input |
//! | [`config`] | TOML configuration parsing |
//! | [`corpus`] | Historical corpus loader |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`error`] | Error types and codes |
//! | [`index`] | Persistent vector index |
//! | [`ingest`] | Normalize, deduplicate, embed, insert |
//! | [`live`] | Live filing fetchers |
//! | [`models`] | Core data types |
//! | [`normalize`] | Text normalization and hashing |
//! | [`query`] | Hybrid query engine |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod app;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod corpus;
pub mod db;
pub mod embedding;
pub mod error;
pub mod index;
pub mod ingest;
pub mod live;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod query;
pub mod server;
