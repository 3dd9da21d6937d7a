//! # Microblog
//!
//! A microblogging service: accounts, posts, followers, private messages,
//! a polled notification feed, full-text search and background jobs.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────┐  Session   ┌──────────┐ post-commit ┌────────────┐  ┌──────────────┐
//!  │   HTTP   │──────────▶│  Store   │────────────▶│ IndexSync  │─▶│ SearchIndex  │
//!  │  (axum)  │           │ (SQLite) │             └────────────┘  └──────────────┘
//!  └────┬─────┘           └────▲─────┘
//!       │ launch_task          │ set_task_progress / notifications
//!       ▼                      │
//!  ┌──────────┐  claim   ┌─────┴────┐
//!  │ JobQueue │─────────▶│  Worker  │
//!  │ (SQLite) │          │  (jobs)  │
//!  └──────────┘          └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`store`] | Tracked transactions and commit observers |
//! | [`index_sync`] | Mirrors committed changes into the search index |
//! | [`search_index`] | Search backends (memory, SQLite FTS5, Elasticsearch) |
//! | [`queue`] | Durable job queue |
//! | [`tasks`] | Task launch and progress tracking |
//! | [`worker`] | Background job runner |
//! | [`notifications`] | Per-user notification feed |
//! | [`server`] | JSON HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod app;
pub mod auth;
pub mod config;
pub mod db;
pub mod email;
pub mod export;
pub mod index_sync;
pub mod logging;
pub mod messages;
pub mod migrate;
pub mod models;
pub mod notifications;
pub mod posts;
pub mod queue;
pub mod search_cmd;
pub mod search_index;
pub mod server;
pub mod store;
pub mod tasks;
pub mod translate;
pub mod users;
pub mod worker;
