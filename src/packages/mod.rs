// src/packages/mod.rs

//! Package record support for BPM
//!
//! This module provides the parsed representation of one package: its
//! metadata (`PackageInfo`), its file manifest (`PackageFileEntry`) and the
//! pairing of both read from an archive or the registry (`BpmPackage`).

pub mod archive;
pub mod info;
pub mod manifest;

pub use archive::{BpmPackage, LifecycleScript};
pub use info::{PackageInfo, PackageType};
pub use manifest::PackageFileEntry;
