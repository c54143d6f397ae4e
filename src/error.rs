//! # src/error.rs
//!
//! Definiert den zentralen Fehlertyp `TraceCoreError` der Bibliothek.
//! Die Fehler der einzelnen Services werden über `#[from]` aggregiert,
//! sodass Aufrufer an jeder Stelle mit `?` arbeiten können und dennoch
//! den konkreten Grund behalten.

use thiserror::Error;

use crate::keystore::KeystoreError;
use crate::network::NetworkError;
use crate::services::check_in_manager::{CheckInError, CheckOutError};
use crate::services::cose::CoseError;
use crate::services::document_providers::DocumentError;
use crate::services::ecies::EciesError;
use crate::services::qr_codec::CodecError;
use crate::services::secret_store::SecretError;
use crate::storage::StorageError;

/// Der zentrale Fehlertyp der Bibliothek.
#[derive(Debug, Error)]
pub enum TraceCoreError {
    #[error("Secret management error: {0}")]
    Secret(#[from] SecretError),

    #[error("ECIES error: {0}")]
    Ecies(#[from] EciesError),

    #[error("QR payload codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("COSE error: {0}")]
    Cose(#[from] CoseError),

    #[error("Check-in error: {0}")]
    CheckIn(#[from] CheckInError),

    #[error("Check-out error: {0}")]
    CheckOut(#[from] CheckOutError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Keystore error: {0}")]
    Keystore(#[from] KeystoreError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CBOR serialization error: {0}")]
    Cbor(#[from] serde_cbor::Error),

    /// Kryptographische Basisoperationen ohne eigenen Fehlertyp.
    #[error("Cryptography error: {0}")]
    Crypto(String),
}
