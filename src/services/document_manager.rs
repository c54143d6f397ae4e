//! # src/services/document_manager.rs
//!
//! Verwaltet die lokale Sammlung importierter Gesundheitsnachweise: Import
//! über die Provider-Kette, Persistenz samt Historie, Re-Verifikation,
//! Einlösen beim Backend sowie das signierte Schlüsselbündel für
//! versiegelte Dokumente.
//!
//! Der persistierte `DocumentStore` ist die Quelle der Wahrheit; die
//! In-Memory-Kopie ist ein Cache, der bei jeder Änderung in derselben
//! Operation durchgeschrieben wird.

use std::sync::{Arc, Mutex, MutexGuard};

use p256::ecdsa::VerifyingKey;
use tracing::{info, warn};

use crate::error::TraceCoreError;
use crate::models::document::{
    Document, DocumentHistoryAction, DocumentHistoryEntry, DocumentStore,
};
use crate::models::key_bundle::DocumentKeyBundle;
use crate::network::NetworkClient;
use crate::services::cose::CoseSign1;
use crate::services::document_providers::{
    self, DocumentError, DocumentProvider, ProviderContext, RegisteredName,
    VerificationFailureReason,
};
use crate::services::document_validity;
use crate::services::sync_utils::SingleFlight;
use crate::services::utils::Clock;
use crate::storage::Storage;

/// Speicher-Schlüssel der persistierten Dokumenten-Sammlung.
const STORE_KEY: &str = "documents.store";

/// Die Vertrauensanker der Dokumenten-Verifikation.
pub struct DocumentManagerConfig {
    /// Aussteller-Schlüssel für signierte Laborbefunde.
    pub lab_issuer_keys: Vec<VerifyingKey>,
    /// Signatur-Schlüssel für COSE-Zertifikate.
    pub certificate_signer_keys: Vec<VerifyingKey>,
    /// Der gepinnte Schlüssel, gegen den das Schlüsselbündel geprüft wird.
    pub bundle_signer_key: VerifyingKey,
}

/// Verwaltet Import, Persistenz und Lebenszyklus der Dokumente.
pub struct DocumentManager {
    network: Arc<dyn NetworkClient>,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    config: DocumentManagerConfig,
    providers: Vec<Box<dyn DocumentProvider>>,
    store: Mutex<DocumentStore>,
    load_flight: SingleFlight<()>,
    registered_name: Mutex<Option<RegisteredName>>,
    key_bundle: Mutex<Option<DocumentKeyBundle>>,
}

impl DocumentManager {
    pub fn new(
        network: Arc<dyn NetworkClient>,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        config: DocumentManagerConfig,
    ) -> Self {
        Self {
            network,
            storage,
            clock,
            config,
            providers: document_providers::default_providers(),
            store: Mutex::new(DocumentStore::default()),
            load_flight: SingleFlight::new(),
            registered_name: Mutex::new(None),
            key_bundle: Mutex::new(None),
        }
    }

    fn lock_store(&self) -> MutexGuard<'_, DocumentStore> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lädt die persistierte Sammlung genau einmal in den Cache.
    fn ensure_loaded(&self) -> Result<(), TraceCoreError> {
        self.load_flight.get_or_try_init(|| {
            if let Some(bytes) = self.storage.restore(STORE_KEY)? {
                *self.lock_store() = serde_json::from_slice(&bytes)?;
            }
            Ok(())
        })
    }

    fn persist_store(&self, store: &DocumentStore) -> Result<(), TraceCoreError> {
        self.storage.persist(STORE_KEY, &serde_json::to_vec(store)?)?;
        Ok(())
    }

    /// Setzt den registrierten Namen, gegen den Dokumente geprüft werden.
    pub fn set_registered_name(&self, name: Option<RegisteredName>) {
        *self
            .registered_name
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = name;
    }

    /// Liefert das verifizierte Schlüsselbündel; holt es frisch, wenn keines
    /// gecacht oder das gecachte veraltet ist.
    ///
    /// Die COSE-Signatur des Bündels wird gegen den gepinnten Schlüssel
    /// geprüft, bevor irgendein Datensatz-Schlüssel verwendet wird.
    pub fn key_bundle(&self) -> Result<DocumentKeyBundle, TraceCoreError> {
        let now = self.clock.now_millis();
        let mut cached = self
            .key_bundle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(bundle) = &*cached {
            if bundle.is_fresh(now) {
                return Ok(bundle.clone());
            }
        }

        let raw = self.network.fetch_key_bundle()?;
        let sign1 = CoseSign1::decode(&raw)?;
        sign1.verify_es256(&self.config.bundle_signer_key).map_err(|_| {
            DocumentError::VerificationFailed(VerificationFailureReason::KeyBundleUntrusted)
        })?;
        let bundle: DocumentKeyBundle = serde_cbor::from_slice(&sign1.payload)?;

        info!(keys = bundle.keys.len(), "document key bundle refreshed");
        *cached = Some(bundle.clone());
        Ok(bundle)
    }

    /// Führt `f` mit einem frischen Provider-Kontext aus.
    ///
    /// Ein nicht beschaffbares Schlüsselbündel ist hier kein harter Fehler:
    /// der Kontext läuft dann ohne Bündel, und nur versiegelte Dokumente
    /// schlagen mit `KeyBundleUntrusted` fehl.
    fn with_context<R>(
        &self,
        f: impl FnOnce(&ProviderContext<'_>) -> Result<R, TraceCoreError>,
    ) -> Result<R, TraceCoreError> {
        let bundle = match self.key_bundle() {
            Ok(bundle) => Some(bundle),
            Err(e) => {
                warn!(error = %e, "key bundle unavailable, sealed documents cannot be imported");
                None
            }
        };
        let registered_name = self
            .registered_name
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let ctx = ProviderContext {
            now_ms: self.clock.now_millis(),
            registered_name: registered_name.as_ref(),
            lab_issuer_keys: &self.config.lab_issuer_keys,
            certificate_signer_keys: &self.config.certificate_signer_keys,
            key_bundle: bundle.as_ref(),
        };
        f(&ctx)
    }

    /// Importiert ein kodiertes Dokument in die Sammlung.
    ///
    /// Reihenfolge der Prüfungen: Provider-Kette (Parsen + Signatur +
    /// Nachvalidierung), dann Duplikat, dann Ablauf. Erst danach wird die
    /// Sammlung verändert und durchgeschrieben.
    pub fn add_document(&self, encoded: &str) -> Result<Document, TraceCoreError> {
        self.ensure_loaded()?;

        let mut document = self.with_context(|ctx| {
            Ok(document_providers::parse_and_validate(&self.providers, encoded, ctx)?)
        })?;

        let now = self.clock.now_millis();
        let mut store = self.lock_store();
        if store.contains(&document.id) {
            return Err(DocumentError::AlreadyImported.into());
        }
        if document_validity::is_expired(&document, now) {
            return Err(DocumentError::Expired.into());
        }

        document.import_timestamp_ms = now;
        store.documents.push(document.clone());
        store.history.push(DocumentHistoryEntry {
            document_id: document.id.clone(),
            action: DocumentHistoryAction::Imported,
            timestamp_ms: now,
        });
        let snapshot = store.clone();
        drop(store);
        self.persist_store(&snapshot)?;

        info!(document_id = %document.id, "document imported");
        Ok(document)
    }

    /// Die aktuelle Sammlung.
    pub fn get_documents(&self) -> Result<Vec<Document>, TraceCoreError> {
        self.ensure_loaded()?;
        Ok(self.lock_store().documents.clone())
    }

    /// Die Import-Historie.
    pub fn get_history(&self) -> Result<Vec<DocumentHistoryEntry>, TraceCoreError> {
        self.ensure_loaded()?;
        Ok(self.lock_store().history.clone())
    }

    /// Die zum Zeitpunkt `now` gültigen Dokumente (inklusive Booster-Regel).
    pub fn valid_documents(&self) -> Result<Vec<Document>, TraceCoreError> {
        self.ensure_loaded()?;
        let now = self.clock.now_millis();
        let store = self.lock_store();
        Ok(store
            .documents
            .iter()
            .filter(|d| document_validity::is_valid(d, &store.documents, now))
            .cloned()
            .collect())
    }

    /// Löscht ein Dokument aus der Sammlung.
    pub fn delete_document(&self, document_id: &str) -> Result<(), TraceCoreError> {
        self.ensure_loaded()?;

        let mut store = self.lock_store();
        let before = store.documents.len();
        store.documents.retain(|d| d.id != document_id);
        if store.documents.len() == before {
            return Err(DocumentError::ParsingFailed(format!(
                "no document with id {document_id}"
            ))
            .into());
        }
        store.history.push(DocumentHistoryEntry {
            document_id: document_id.to_string(),
            action: DocumentHistoryAction::Deleted,
            timestamp_ms: self.clock.now_millis(),
        });
        let snapshot = store.clone();
        drop(store);
        self.persist_store(&snapshot)
    }

    /// Meldet ein Dokument beim Backend als eingelöst.
    ///
    /// `tag` bindet die Einlösung an den einlösenden Kontext; das Backend
    /// sieht nur `SHA-256(encoded_data)` und das Tag, nie den Inhalt.
    pub fn redeem_document(&self, document_id: &str, tag: &[u8]) -> Result<(), TraceCoreError> {
        self.ensure_loaded()?;
        let hash = {
            let store = self.lock_store();
            let document = store.get(document_id).ok_or_else(|| {
                DocumentError::ParsingFailed(format!("no document with id {document_id}"))
            })?;
            document.redeem_hash()
        };

        self.network.redeem_document(&hash, tag)?;

        let mut store = self.lock_store();
        store.history.push(DocumentHistoryEntry {
            document_id: document_id.to_string(),
            action: DocumentHistoryAction::Redeemed,
            timestamp_ms: self.clock.now_millis(),
        });
        let snapshot = store.clone();
        drop(store);
        self.persist_store(&snapshot)
    }

    /// Nimmt die Einlösung eines Dokuments zurück.
    pub fn unredeem_document(&self, document_id: &str) -> Result<(), TraceCoreError> {
        self.ensure_loaded()?;
        let hash = {
            let store = self.lock_store();
            let document = store.get(document_id).ok_or_else(|| {
                DocumentError::ParsingFailed(format!("no document with id {document_id}"))
            })?;
            document.redeem_hash()
        };

        self.network.unredeem_document(&hash)?;

        let mut store = self.lock_store();
        store.history.push(DocumentHistoryEntry {
            document_id: document_id.to_string(),
            action: DocumentHistoryAction::Unredeemed,
            timestamp_ms: self.clock.now_millis(),
        });
        let snapshot = store.clone();
        drop(store);
        self.persist_store(&snapshot)
    }

    /// Prüft alle Dokumente erneut gegen die aktuellen Vertrauensanker.
    ///
    /// Dokumente, deren Prüfung nicht mehr gelingt, werden nicht gelöscht,
    /// sondern als unverifiziert markiert.
    pub fn re_verify_documents(&self) -> Result<(), TraceCoreError> {
        self.ensure_loaded()?;
        let documents = self.lock_store().documents.clone();

        let mut verified_ids = Vec::new();
        let mut failed_ids = Vec::new();
        self.with_context(|ctx| {
            for document in &documents {
                match document_providers::parse_and_validate(
                    &self.providers,
                    &document.encoded_data,
                    ctx,
                ) {
                    Ok(_) => verified_ids.push(document.id.clone()),
                    // Duplikat-/Ablauf-Regeln greifen beim Re-Check nicht;
                    // hier zählt nur die kryptographische Prüfung.
                    Err(DocumentError::VerificationFailed(reason)) => {
                        warn!(document_id = %document.id, reason = %reason, "document no longer verifies");
                        failed_ids.push(document.id.clone());
                    }
                    Err(_) => verified_ids.push(document.id.clone()),
                }
            }
            Ok(())
        })?;

        let mut store = self.lock_store();
        for document in &mut store.documents {
            if failed_ids.contains(&document.id) {
                document.verified = false;
            } else if verified_ids.contains(&document.id) && document.document_type
                != crate::models::document::DocumentType::Appointment
            {
                document.verified = true;
            }
        }
        let snapshot = store.clone();
        drop(store);
        self.persist_store(&snapshot)
    }
}
