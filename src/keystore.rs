//! # src/keystore.rs
//!
//! Definiert die Fassade für den sicheren Schlüsselspeicher des Geräts.
//! Die Kernlogik erzeugt und verwendet Schlüssel ausschließlich über dieses
//! Trait; die konkrete (ggf. hardwaregestützte) Mechanik liegt beim
//! Kollaborateur. Operationen dürfen blockieren und werden von Aufrufern
//! entsprechend außerhalb latenzkritischer Pfade verwendet.

use std::collections::HashMap;
use std::sync::Mutex;

use p256::{PublicKey, SecretKey};
use thiserror::Error;

/// Ein generischer Fehler-Typ für alle Keystore-Operationen.
#[derive(Debug, Error)]
pub enum KeystoreError {
    /// Der Keystore ist (vorübergehend) nicht verfügbar.
    #[error("Keystore unavailable: {0}")]
    Unavailable(String),

    /// Unter dem Alias bzw. Label existiert kein Eintrag.
    #[error("No entry found for alias '{0}'.")]
    NotFound(String),

    /// Der Eintrag existiert, enthält aber unbrauchbares Schlüsselmaterial.
    #[error("Invalid key material for alias '{0}'.")]
    InvalidKeyMaterial(String),
}

/// Ein asymmetrisches P-256-Schlüsselpaar, wie es der Keystore herausgibt.
///
/// Der geheime Teil verbleibt konzeptionell im Keystore; diese Struktur ist
/// nur das Arbeits-Handle für eine einzelne Operation.
#[derive(Clone)]
pub struct StoredKeyPair {
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl StoredKeyPair {
    pub fn from_secret(secret: SecretKey) -> Self {
        let public = secret.public_key();
        Self { secret, public }
    }
}

/// Die Schnittstelle zum sicheren Schlüsselspeicher.
pub trait Keystore: Send + Sync {
    /// Erzeugt ein neues P-256-Schlüsselpaar unter dem Alias und gibt es zurück.
    /// Ein bestehendes Paar unter demselben Alias wird ersetzt.
    fn generate_key_pair(&self, alias: &str) -> Result<StoredKeyPair, KeystoreError>;

    /// Liefert das Schlüsselpaar zum Alias.
    fn get_key_pair(&self, alias: &str) -> Result<StoredKeyPair, KeystoreError>;

    /// Prüft, ob unter dem Alias ein Schlüsselpaar existiert.
    fn has_key_pair(&self, alias: &str) -> Result<bool, KeystoreError>;

    /// Löscht das Schlüsselpaar zum Alias. Ein fehlender Eintrag ist kein Fehler.
    fn delete_key_pair(&self, alias: &str) -> Result<(), KeystoreError>;

    /// Verschlüsselt ("wrappt") ein symmetrisches Secret und persistiert es
    /// unter dem Label.
    fn wrap_and_persist(&self, label: &str, secret: &[u8; 32]) -> Result<(), KeystoreError>;

    /// Entschlüsselt das unter dem Label persistierte Secret.
    /// `Ok(None)`, wenn unter dem Label nichts abgelegt ist.
    fn unwrap_secret(&self, label: &str) -> Result<Option<[u8; 32]>, KeystoreError>;
}

/// Eine rein software-basierte Keystore-Implementierung.
///
/// Dient Tests und Einbettungen ohne Hardware-Keystore. Die "Wrap"-Operation
/// ist hier schlicht das Halten im Prozess-Speicher; die Vertraulichkeit am
/// Gerät ist Aufgabe des echten Kollaborateurs.
#[derive(Default)]
pub struct SoftwareKeystore {
    key_pairs: Mutex<HashMap<String, SecretKey>>,
    wrapped_secrets: Mutex<HashMap<String, [u8; 32]>>,
}

impl SoftwareKeystore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Keystore for SoftwareKeystore {
    fn generate_key_pair(&self, alias: &str) -> Result<StoredKeyPair, KeystoreError> {
        let secret = crate::services::crypto_utils::generate_secret_key();
        self.key_pairs
            .lock()
            .map_err(|_| KeystoreError::Unavailable("key pair lock poisoned".to_string()))?
            .insert(alias.to_string(), secret.clone());
        Ok(StoredKeyPair::from_secret(secret))
    }

    fn get_key_pair(&self, alias: &str) -> Result<StoredKeyPair, KeystoreError> {
        let secret = self
            .key_pairs
            .lock()
            .map_err(|_| KeystoreError::Unavailable("key pair lock poisoned".to_string()))?
            .get(alias)
            .cloned()
            .ok_or_else(|| KeystoreError::NotFound(alias.to_string()))?;
        Ok(StoredKeyPair::from_secret(secret))
    }

    fn has_key_pair(&self, alias: &str) -> Result<bool, KeystoreError> {
        Ok(self
            .key_pairs
            .lock()
            .map_err(|_| KeystoreError::Unavailable("key pair lock poisoned".to_string()))?
            .contains_key(alias))
    }

    fn delete_key_pair(&self, alias: &str) -> Result<(), KeystoreError> {
        self.key_pairs
            .lock()
            .map_err(|_| KeystoreError::Unavailable("key pair lock poisoned".to_string()))?
            .remove(alias);
        Ok(())
    }

    fn wrap_and_persist(&self, label: &str, secret: &[u8; 32]) -> Result<(), KeystoreError> {
        self.wrapped_secrets
            .lock()
            .map_err(|_| KeystoreError::Unavailable("secret lock poisoned".to_string()))?
            .insert(label.to_string(), *secret);
        Ok(())
    }

    fn unwrap_secret(&self, label: &str) -> Result<Option<[u8; 32]>, KeystoreError> {
        Ok(self
            .wrapped_secrets
            .lock()
            .map_err(|_| KeystoreError::Unavailable("secret lock poisoned".to_string()))?
            .get(label)
            .copied())
    }
}
