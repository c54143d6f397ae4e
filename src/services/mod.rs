//! # src/services/mod.rs
//!
//! Bündelt die fachlichen Services der Bibliothek.

pub mod check_in_manager;
pub mod cose;
pub mod crypto_utils;
pub mod document_manager;
pub mod document_providers;
pub mod document_validity;
pub mod ecies;
pub mod qr_codec;
pub mod secret_store;
pub mod sync_utils;
pub mod trace_id;
pub mod utils;
