//! # src/network.rs
//!
//! Definiert die Schnittstelle zum Netzwerk-Kollaborateur. Die Kernlogik
//! kennt weder HTTP noch Retries auf Transport-Ebene; sie formuliert nur
//! fachliche Anfragen und erhält typisierte Antworten oder Fehler.

use p256::PublicKey;
use thiserror::Error;

use crate::models::check_in::{Location, TraceId};

/// Ein Fehler des Netzwerk-Kollaborateurs.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Die angefragte Ressource existiert beim Backend nicht.
    #[error("Resource not found on the backend.")]
    NotFound,

    /// Transport-Fehler; für idempotente Polling-Anfragen wiederholbar.
    #[error("Network transport failure: {0}")]
    Unavailable(String),
}

impl NetworkError {
    /// Nur Transport-Fehler werden in Polling-Schleifen wiederholt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NetworkError::Unavailable(_))
    }
}

/// Der rotierende Tages-Public-Key des Gesundheitsamts, unter dem die
/// Check-in-Payloads verschlüsselt werden.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyPublicKey {
    /// Die ID des Schlüssels; wandert als `key_id` in den QR-Payload.
    pub key_id: u8,
    pub public_key: PublicKey,
}

/// Die Auskunft des Backends zu einem Scanner.
#[derive(Debug, Clone)]
pub struct ScannerInfo {
    pub scanner_id: String,
    /// Der P-256-Public-Key des Scanners für den äußeren ECIES-Umschlag.
    pub public_key: PublicKey,
    /// Die Metadaten des Standorts, zu dem der Scanner gehört.
    pub location: Location,
}

/// Eine Check-in-Einreichung: der bereits signierte Gast-Payload, erneut
/// unter dem Scanner-Schlüssel verschlüsselt (doppelter Umschlag).
#[derive(Debug, Clone)]
pub struct CheckInRequest {
    pub scanner_id: String,
    pub trace_id: TraceId,
    /// Minutengenau gerundeter Zeitpunkt des Check-ins (Unix-Millisekunden).
    pub timestamp_ms: u64,
    /// ECIES-Chiffrat des kodierten QR-Payloads.
    pub encrypted_payload: Vec<u8>,
    /// Der separate MAC-Tag des äußeren Umschlags.
    pub mac: [u8; 16],
    /// Die deterministisch abgeleitete IV des äußeren Umschlags.
    pub iv: [u8; 12],
    /// Der komprimierte ephemere Public Key des äußeren Umschlags.
    pub ephemeral_public_key: [u8; 33],
}

/// Verschlüsselte Zusatz-Eigenschaften zu einem Check-in.
#[derive(Debug, Clone)]
pub struct AdditionalDataRequest {
    pub trace_id: TraceId,
    pub encrypted_properties: Vec<u8>,
    pub mac: [u8; 16],
    pub iv: [u8; 12],
    pub ephemeral_public_key: [u8; 33],
}

/// Die Schnittstelle zum Backend.
///
/// Implementierungen kapseln Transport, Verbindungsaufbau und Auth; alle
/// Methoden blockieren bis zur Antwort.
pub trait NetworkClient: Send + Sync {
    /// Holt den aktuellen Tages-Public-Key des Gesundheitsamts.
    fn fetch_daily_key(&self) -> Result<DailyPublicKey, NetworkError>;

    /// Holt Public Key und Standort-Metadaten zu einer Scanner-ID.
    fn fetch_scanner(&self, scanner_id: &str) -> Result<ScannerInfo, NetworkError>;

    /// Reicht einen Check-in ein. Wird von der Kernlogik nie automatisch
    /// wiederholt, um doppelte Check-ins zu vermeiden.
    fn submit_check_in(&self, request: &CheckInRequest) -> Result<(), NetworkError>;

    /// Meldet einen Check-out für die Trace-ID. `NotFound` bedeutet: das
    /// Backend kennt den Trace nicht (mehr) — lokal als erledigt behandeln.
    fn submit_check_out(&self, trace_id: &TraceId) -> Result<(), NetworkError>;

    /// Fragt, welche der übergebenen Trace-IDs beim Backend noch offen sind.
    fn fetch_open_traces(&self, trace_ids: &[TraceId]) -> Result<Vec<TraceId>, NetworkError>;

    /// Übermittelt verschlüsselte Zusatz-Eigenschaften zu einem Check-in.
    fn post_additional_data(&self, request: &AdditionalDataRequest) -> Result<(), NetworkError>;

    /// Holt das signierte Schlüsselbündel für versiegelte Dokumente
    /// (rohe COSE-Bytes; die Signaturprüfung übernimmt der Aufrufer).
    fn fetch_key_bundle(&self) -> Result<Vec<u8>, NetworkError>;

    /// Meldet ein Dokument als eingelöst (Hash + Tag).
    fn redeem_document(&self, hash: &[u8; 32], tag: &[u8]) -> Result<(), NetworkError>;

    /// Nimmt die Einlösung eines Dokuments zurück.
    fn unredeem_document(&self, hash: &[u8; 32]) -> Result<(), NetworkError>;
}
