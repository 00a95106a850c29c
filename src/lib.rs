//! # cursor-chat-export
//!
//! A CLI tool that exports [Cursor](https://cursor.com) AI chat conversations
//! to Markdown files packaged in a zip archive.
//!
//! ## What it does
//!
//! Cursor stores chat history across two generations of records in its local
//! SQLite state databases: legacy "chat tabs" live whole in each workspace's
//! `state.vscdb`, while the newer "composer" conversations keep their index
//! per workspace and their message bodies in a shared global `state.vscdb`.
//! This tool reads both, reconciles them into one de-duplicated,
//! chronologically ordered conversation list per workspace, and writes each
//! conversation as a Markdown file inside a `cursor_chats_<timestamp>.zip`
//! archive, one folder per workspace.
//!
//! All databases are opened **read-only** - your data is never modified.
//!
//! ## Usage
//!
//! ```sh
//! # Export every workspace's conversations into ./cursor_chats_<ts>.zip
//! cursor-chat-export
//!
//! # Only two workspaces, custom output directory and Cursor location
//! cursor-chat-export ~/exports --workspace a1b2c3 --workspace d4e5f6 \
//!     --cursor-dir ~/.config/Cursor/User
//!
//! # Dump the reconciled conversations as JSON instead of an archive
//! cursor-chat-export --json
//! ```
//!
//! Preferences can be persisted in `~/.config/cursor-chat-export/config.toml`.
//!
//! ## Compatibility
//!
//! Tracks Cursor's internal (undocumented) storage schema across both its
//! chat generations. Workspaces whose databases are missing or unreadable
//! export empty rather than failing the run.

pub mod archive;
pub mod exporter;
pub mod importer;
pub mod reconcile;
