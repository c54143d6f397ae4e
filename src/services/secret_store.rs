//! # src/services/secret_store.rs
//!
//! Verwaltet das rotierende Tages-Secret, aus dem alle Trace-IDs abgeleitet
//! werden. Pro UTC-Kalendertag existiert genau ein 32-Byte-Secret; es wird
//! beim ersten Zugriff kryptographisch zufällig erzeugt, vom Keystore
//! "gewrappt" persistiert und ist danach unveränderlich.
//!
//! Die Erzeugung ist single-flight: konkurrierende Aufrufer am selben Tag
//! warten auf dieselbe Initialisierung, statt mehrere Secrets zu erzeugen.

use std::sync::Arc;

use thiserror::Error;
use zeroize::Zeroizing;

use crate::keystore::{Keystore, KeystoreError};
use crate::services::crypto_utils::random_bytes_32;
use crate::services::sync_utils::SingleFlightMap;
use crate::services::utils::{start_of_day_ms, Clock, DAY_MS};
use crate::storage::{Storage, StorageError};

/// Speicher-Schlüssel für den Index der Tage, für die ein Secret existiert.
const DAY_INDEX_KEY: &str = "tracing.secret.days";
/// Präfix des Keystore-Labels, unter dem ein Tages-Secret gewrappt liegt.
const WRAP_LABEL_PREFIX: &str = "tracing.secret.";

/// Definiert die Fehler des Secret-Stores.
#[derive(Debug, Error)]
pub enum SecretError {
    /// Keystore oder Speicher sind nicht erreichbar; fatal für alle
    /// Trace-ID- und QR-Operationen, bis das Problem behoben ist.
    /// Es wird niemals stillschweigend ein Null-Secret geliefert.
    #[error("Tracing secret unavailable: {0}")]
    Unavailable(String),
}

impl From<KeystoreError> for SecretError {
    fn from(e: KeystoreError) -> Self {
        SecretError::Unavailable(e.to_string())
    }
}

impl From<StorageError> for SecretError {
    fn from(e: StorageError) -> Self {
        SecretError::Unavailable(e.to_string())
    }
}

/// Ein Tages-Secret mit dem Tagesbeginn, für den es gilt.
#[derive(Clone)]
pub struct TracingSecret {
    /// Beginn des UTC-Kalendertags (Unix-Millisekunden).
    pub day_start_ms: u64,
    /// Das 32-Byte-Secret; wird beim Verwerfen genullt.
    pub secret: Zeroizing<[u8; 32]>,
}

/// Verwaltet Erzeugung, Persistenz und Abfrage der Tages-Secrets.
pub struct TracingSecretStore {
    keystore: Arc<dyn Keystore>,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    flights: SingleFlightMap<u64, [u8; 32]>,
}

impl TracingSecretStore {
    pub fn new(
        keystore: Arc<dyn Keystore>,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            keystore,
            storage,
            clock,
            flights: SingleFlightMap::new(),
        }
    }

    fn wrap_label(day_start_ms: u64) -> String {
        format!("{WRAP_LABEL_PREFIX}{day_start_ms}")
    }

    fn load_day_index(&self) -> Result<Vec<u64>, SecretError> {
        match self.storage.restore(DAY_INDEX_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| SecretError::Unavailable(format!("corrupt day index: {e}"))),
            None => Ok(Vec::new()),
        }
    }

    fn add_day_to_index(&self, day_start_ms: u64) -> Result<(), SecretError> {
        let mut days = self.load_day_index()?;
        if !days.contains(&day_start_ms) {
            days.push(day_start_ms);
            let bytes = serde_json::to_vec(&days)
                .map_err(|e| SecretError::Unavailable(e.to_string()))?;
            self.storage.persist(DAY_INDEX_KEY, &bytes)?;
        }
        Ok(())
    }

    /// Liefert das Secret für den Tag, in den `timestamp_ms` fällt.
    ///
    /// Existiert noch keines, wird genau eines erzeugt — auch unter
    /// konkurrierenden Aufrufern (single-flight pro Tag).
    pub fn get_secret_for_day(&self, timestamp_ms: u64) -> Result<TracingSecret, SecretError> {
        let day_start_ms = start_of_day_ms(timestamp_ms);
        let secret = self.flights.get_or_try_init(&day_start_ms, || {
            let label = Self::wrap_label(day_start_ms);
            if let Some(existing) = self.keystore.unwrap_secret(&label)? {
                return Ok::<[u8; 32], SecretError>(existing);
            }
            let fresh = random_bytes_32();
            self.keystore.wrap_and_persist(&label, &fresh)?;
            self.add_day_to_index(day_start_ms)?;
            Ok(fresh)
        })?;

        Ok(TracingSecret {
            day_start_ms,
            secret: Zeroizing::new(secret),
        })
    }

    /// Liefert das Secret des heutigen Tages; erzeugt es bei Bedarf.
    pub fn get_current_secret(&self) -> Result<TracingSecret, SecretError> {
        self.get_secret_for_day(self.clock.now_millis())
    }

    /// Liefert die tatsächlich vorhandenen Secrets der letzten `days` Tage
    /// (heute eingeschlossen). Fehlende Tage werden nicht fabriziert; die
    /// Reihenfolge ist unspezifiziert, der Aufrufer sortiert bei Bedarf.
    pub fn get_recent_secrets(&self, days: u32) -> Result<Vec<TracingSecret>, SecretError> {
        let today = start_of_day_ms(self.clock.now_millis());
        let oldest = today.saturating_sub(DAY_MS * days.saturating_sub(1) as u64);

        let mut secrets = Vec::new();
        for day_start_ms in self.load_day_index()? {
            if day_start_ms < oldest || day_start_ms > today {
                continue;
            }
            let label = Self::wrap_label(day_start_ms);
            if let Some(secret) = self.keystore.unwrap_secret(&label)? {
                secrets.push(TracingSecret {
                    day_start_ms,
                    secret: Zeroizing::new(secret),
                });
            }
        }
        Ok(secrets)
    }
}
