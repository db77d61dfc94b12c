//! # Sitekeeper
//!
//! Content administration for static sites whose source lives in a GitHub
//! repository and whose images live on Cloudinary.
//!
//! Every write becomes a commit through the GitHub Contents API. Deleted
//! posts and pages are parked in a bin directory instead of being removed,
//! and each commit's CI deployment is tracked until it finishes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────┐   ┌──────────────┐
//! │ HTTP API │──▶│ Content / Bin /  │──▶│ GitHub       │
//! │  (axum)  │   │ Taxonomy / Sett. │   │ Contents API │
//! └────┬─────┘   └──────────────────┘   └──────────────┘
//!      │         ┌──────────────────┐   ┌──────────────┐
//!      ├────────▶│ Deployment       │──▶│ GitHub       │
//!      │         │ tracker/monitor  │   │ Actions runs │
//!      │         └──────────────────┘   └──────────────┘
//!      │         ┌──────────────────┐   ┌──────────────┐
//!      └────────▶│ Media / audit    │──▶│ Cloudinary   │
//!                └──────────────────┘   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy and HTTP mapping |
//! | [`clock`] | Injectable clock and timestamp formats |
//! | [`http`] | Shared outbound HTTP client and error mapping |
//! | [`fanout`] | Bounded concurrent per-item fetches |
//! | [`schedule`] | Cancellable periodic tasks |
//! | [`models`] | Core data types and filename rules |
//! | [`frontmatter`] | Markdown header codec |
//! | [`store`] | Content store trait and in-memory store |
//! | [`github`] | GitHub Contents and Actions client |
//! | [`cloudinary`] | Image listing and signed uploads |
//! | [`content`] | Post and page CRUD |
//! | [`bin`] | Bin lifecycle: move, restore, purge, list |
//! | [`taxonomy`] | Categories and tags |
//! | [`site_settings`] | Whitelisted site config fields |
//! | [`audit`] | Image reference audit |
//! | [`lazy_images`] | Lazy-loading pass over post images |
//! | [`deployments`] | Deployment records, CI history, local log |
//! | [`tracker`] | Deployment tracking state machine |
//! | [`monitor`] | Polling schedules for the tracker |
//! | [`auth`] | Session and sign-in events |
//! | [`local_state`] | Persistent local state and app settings |
//! | [`server`] | Admin HTTP API |
//! | [`commands`] | CLI command implementations |

pub mod audit;
pub mod auth;
pub mod bin;
pub mod clock;
pub mod cloudinary;
pub mod commands;
pub mod config;
pub mod content;
pub mod deployments;
pub mod error;
pub mod fanout;
pub mod frontmatter;
pub mod github;
pub mod http;
pub mod lazy_images;
pub mod local_state;
pub mod models;
pub mod monitor;
pub mod schedule;
pub mod server;
pub mod site_settings;
pub mod store;
pub mod taxonomy;
pub mod tracker;
