//! # src/models/mod.rs
//!
//! Bündelt die serialisierbaren Datenstrukturen der Bibliothek.

pub mod check_in;
pub mod document;
pub mod key_bundle;
