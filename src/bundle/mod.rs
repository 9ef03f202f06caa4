//! Bundle acquisition and validation.
//!
//! A bundle is a zip archive containing `manifest.json`, `checksums.json`,
//! one baseline SQL file and an ordered list of migration SQL files. These
//! modules download it, expand it safely, verify its content hashes, and
//! interpret its manifest.

pub mod archive;
pub mod checksum;
pub mod fetch;
pub mod manifest;
