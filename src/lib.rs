// src/lib.rs

//! BPM Package Manager
//!
//! Installs, upgrades, removes and queries packages distributed as tar
//! archives on a file-tree rooted target system.
//!
//! # Architecture
//!
//! - Plain-file state: installed packages live under `<root>/var/lib/bpm/installed`
//! - Operations: planned as an ordered action list, executed in one pass
//! - Catalogs: repository descriptors passed explicitly to the planner
//! - File-level tracking: shared ownership, keep lists, reverse-order removal

pub mod config;
pub mod db;
mod error;
pub mod filesystem;
pub mod lock;
pub mod operation;
pub mod packages;
pub mod repository;
pub mod resolver;
#[cfg(test)]
mod test_support;
pub mod version;

pub use error::{Error, Result};
