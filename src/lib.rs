//! # Docs Harness
//!
//! A self-hosted documentation site crawler and search server for AI tools.
//!
//! Docs Harness registers documentation sites as *projects*, crawls them
//! breadth-first into a local SQLite store, indexes the extracted pages for
//! keyword (FTS5) and optional vector search, and serves low-latency search
//! and document retrieval over a CLI and a JSON HTTP API.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌─────────────┐   ┌───────────┐
//! │  Crawler  │──▶│  Extractor  │──▶│  SQLite   │
//! │ BFS fetch │   │  HTML → Md  │   │ FTS5+Vec  │
//! └─────┬─────┘   └─────────────┘   └─────┬─────┘
//!       │                                 │
//! ┌─────┴─────┐                   ┌───────┴──────┐
//! │ Lifecycle │                   │  Aggregated  │
//! │  Manager  │                   │    Search    │
//! └───────────┘                   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! dsh init                                   # create database
//! dsh project add tokio https://tokio.rs     # register a project
//! dsh scrape tokio                           # crawl and index it
//! dsh search "graceful shutdown"             # query across projects
//! dsh serve                                  # start the HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`extract`] | HTML content extraction |
//! | [`fetch`] | HTTP fetch collaborator |
//! | [`robots`] | robots.txt policy |
//! | [`crawler`] | Breadth-first site crawl |
//! | [`store`] | Project and document persistence |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Search backend builds and publication |
//! | [`search`] | Cross-backend result aggregation |
//! | [`lifecycle`] | Project state machine and scrape jobs |
//! | [`notify`] | Scrape event delivery |
//! | [`server`] | JSON HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod crawler;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod index;
pub mod lifecycle;
pub mod migrate;
pub mod models;
pub mod notify;
pub mod robots;
pub mod search;
pub mod server;
pub mod store;
