//! # Workbook QA
//!
//! Question answering over spreadsheet workbooks.
//!
//! An uploaded workbook is indexed once: small sheets are rendered to images
//! for a vision check, big sheets are materialized into SQLite. A question
//! then runs through a fixed sequence of completion-backed stages.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────────────────┐
//! │  .xlsx   │──▶│   Indexer    │──▶│ images / CSV / SQLite │
//! └──────────┘   └──────────────┘   └──────────┬───────────┘
//!                                              │
//!   question ──▶ small-sheet check ─(answer)───┼──▶ humanizer ──▶ answer
//!                     │ (no answer)            │
//!                     ▼                        │
//!        extract ─▶ fuzzy locate ─▶ correct ─▶ select ─▶ SQL ─▶ execute
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Pipeline error taxonomy |
//! | [`models`] | Core data types |
//! | [`workbook`] | xlsx reading |
//! | [`tabular`] | Datasets and CSV persistence |
//! | [`render`] | Sheet image rendering |
//! | [`store`] | SQLite relational store |
//! | [`index`] | Workbook indexing and session metadata |
//! | [`fuzzy`] | Fuzzy substring locator |
//! | [`prompt`] | Structured prompts |
//! | [`session`] | Usage ledger and audit log |
//! | [`completion`] | Completion backend client |
//! | [`stages`] | Pipeline stages |
//! | [`orchestrator`] | Question state machine |
//! | [`progress`] | Progress events |
//! | [`server`] | HTTP server |

pub mod completion;
pub mod config;
pub mod error;
pub mod fuzzy;
pub mod index;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod prompt;
pub mod render;
pub mod server;
pub mod session;
pub mod stages;
pub mod store;
pub mod tabular;
pub mod workbook;

#[cfg(test)]
mod testutil;
