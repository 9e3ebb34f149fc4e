//! # messages-archiver
//!
//! A CLI tool that exports Messages conversation history to standalone HTML files.
//!
//! ## What it does
//!
//! macOS Messages keeps conversations in a SQLite database (`chat.db`). This tool
//! reads that database, resolves contact identifiers to display names through the
//! AddressBook store, and writes each conversation as a browsable HTML file with
//! its attachments copied into a sibling directory.
//!
//! The source database is opened **read-only** — your data is never modified.
//!
//! ## Incremental sync
//!
//! Extracted messages are reconciled into a durable local store
//! (`messages-archiver.db` in the output directory). Re-running against an
//! unchanged source adds zero rows and rewrites byte-identical HTML. The store
//! survives contact renames (historical rows and attachment directories are
//! migrated to the new conversation title) and the seconds-vs-nanoseconds
//! timestamp defect found in older `chat.db` files.
//!
//! ## Usage
//!
//! ```sh
//! # Archive everything into a directory
//! messages-archiver -o ~/messages-archive
//!
//! # One file per year, filtered to a date range
//! messages-archiver -o ~/messages-archive --path-template "%Y/{chat_title}" \
//!     --date-start 2019-01-01 --date-stop 2019-12-31
//! ```
//!
//! Preferences can be persisted in `~/.config/messages-archiver/config.toml`.
//!
//! ## Limitations
//!
//! Concurrent runs against the same store are unsupported. Group-chat titles are
//! never rename-migrated; only one-on-one conversations follow a contact's
//! display-name changes.

pub mod attachments;
pub mod config;
pub mod contacts;
pub mod extract;
pub mod paths;
pub mod render;
pub mod store;
pub mod timestamp;
