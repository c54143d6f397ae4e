//! # src/storage/mod.rs
//!
//! Definiert die Abstraktion für die persistente Speicherung der
//! Kern-Zustände (Trace-ID-Liste, Check-in-Daten, Dokumenten-Sammlung).
//! Dies entkoppelt die Kernlogik von der konkreten Speichermethode; der
//! Speicher ist ein opaker Key/Value-Store mit Änderungs-Benachrichtigung.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

/// Ein generischer Fehler-Typ für alle Speicheroperationen.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Data is corrupted or has an invalid format: {0}")]
    InvalidFormat(String),

    #[error("Underlying I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("An unexpected error occurred: {0}")]
    Generic(String),
}

/// Ein Listener, der nach jeder Änderung des zugehörigen Schlüssels
/// aufgerufen wird. Der Parameter ist der geänderte Schlüssel.
pub type ChangeListener = Box<dyn Fn(&str) + Send + Sync>;

/// Die Schnittstelle für persistente Speicherung.
///
/// Jede Methode ist eine atomare Operation für einen kompletten Datensatz;
/// die Kernlogik schreibt Zustandsänderungen immer in derselben Operation
/// durch, in der sie den In-Memory-Cache anpasst.
pub trait Storage: Send + Sync {
    /// Lädt den Datensatz zum Schlüssel. `Ok(None)`, wenn nichts abgelegt ist.
    fn restore(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Speichert den Datensatz unter dem Schlüssel und benachrichtigt
    /// registrierte Listener nach erfolgreichem Schreiben.
    fn persist(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Löscht den Datensatz. Ein fehlender Eintrag ist kein Fehler.
    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Registriert einen Änderungs-Listener für den Schlüssel.
    fn subscribe(&self, key: &str, listener: ChangeListener);
}

/// Eine In-Memory-Implementierung des Speichers.
///
/// Dient Tests und als Referenz für die Benachrichtigungs-Semantik:
/// Listener laufen nach dem Schreiben, außerhalb des Daten-Locks.
#[derive(Default)]
pub struct MemoryStorage {
    data: Mutex<HashMap<String, Vec<u8>>>,
    listeners: Mutex<HashMap<String, Vec<ChangeListener>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self, key: &str) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(for_key) = listeners.get(key) {
            for listener in for_key {
                listener(key);
            }
        }
    }
}

impl Storage for MemoryStorage {
    fn restore(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .data
            .lock()
            .map_err(|_| StorageError::Generic("storage lock poisoned".to_string()))?
            .get(key)
            .cloned())
    }

    fn persist(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.data
            .lock()
            .map_err(|_| StorageError::Generic("storage lock poisoned".to_string()))?
            .insert(key.to_string(), value.to_vec());
        self.notify(key);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data
            .lock()
            .map_err(|_| StorageError::Generic("storage lock poisoned".to_string()))?
            .remove(key);
        self.notify(key);
        Ok(())
    }

    fn subscribe(&self, key: &str, listener: ChangeListener) {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(key.to_string())
            .or_default()
            .push(listener);
    }
}
