//! Unique Keys Bot - hands every Telegram user exactly one unique key
//!
//! ## Architecture
//!
//! - **store**: SQLite `Users` table, one row per user, written by a single
//!   conditional insert so concurrent `/start`s cannot issue two keys
//! - **issuer**: turns an issuance attempt into the reply text
//! - **telegram**: Bot API client, long-polling loop and `/start` dispatch
//! - **config**: TOML file + CLI/env overrides, passed in at construction
//!
//! ## Storage Layout
//!
//! ```text
//! Users(Id INTEGER PRIMARY KEY, UserId INTEGER UNIQUE, UniqueKey TEXT, IssuedAt INTEGER)
//! schema_version(version INTEGER)
//! ```

pub mod config;
pub mod error;
pub mod issuer;
pub mod store;
pub mod telegram;

pub use config::{Config, ConfigError, DatabaseLocation};
pub use error::StoreError;
pub use issuer::{KeyIssuer, StartOutcome};
pub use store::{IssuanceRecord, KeyIssuanceStore};
