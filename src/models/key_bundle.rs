//! # src/models/key_bundle.rs
//!
//! Definiert das periodisch vom Backend geholte Schlüsselbündel für das
//! versiegelte Dokumentenformat. Das Bündel ist selbst ein signiertes
//! Dokument: seine COSE-Signatur muss gegen einen gepinnten Schlüssel
//! geprüft werden, bevor irgendein Datensatz-Schlüssel daraus verwendet wird.

use serde::{Deserialize, Serialize};

/// Ein einzelner Datensatz-Schlüssel des Bündels.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct KeyBundleEntry {
    /// Die ID, auf die der `kid`-Header eines versiegelten Dokuments verweist.
    pub key_id: u8,
    /// Der symmetrische 32-Byte-Schlüssel.
    pub key: Vec<u8>,
}

/// Das entschlüsselte, verifizierte Schlüsselbündel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct DocumentKeyBundle {
    pub keys: Vec<KeyBundleEntry>,
    /// Zeitpunkt, ab dem das Bündel als veraltet gilt und neu geholt wird.
    pub expires_at_ms: u64,
}

impl DocumentKeyBundle {
    /// Sucht den Datensatz-Schlüssel zur gegebenen ID.
    pub fn key_for(&self, key_id: u8) -> Option<&[u8]> {
        self.keys
            .iter()
            .find(|entry| entry.key_id == key_id)
            .map(|entry| entry.key.as_slice())
    }

    /// Prüft, ob das Bündel zum Zeitpunkt `now_ms` noch frisch ist.
    pub fn is_fresh(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }
}
