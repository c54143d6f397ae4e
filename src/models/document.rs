//! # src/models/document.rs
//!
//! Definiert die Datenstrukturen für importierte Gesundheitsnachweise
//! (Testergebnisse, Impf- und Genesenenzertifikate, Termine) sowie die
//! persistierte Dokumenten-Sammlung mit Import-Historie.

use serde::{Deserialize, Serialize};

use crate::services::crypto_utils::sha256;

/// Der Typ eines Dokuments.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentType {
    /// Antigen-Schnelltest.
    Fast,
    /// PCR-Test.
    Pcr,
    /// Impfzertifikat.
    Vaccination,
    /// Genesenenzertifikat.
    Recovery,
    /// Testtermin (nur ein Link, kein Nachweis).
    Appointment,
    Unknown,
}

/// Das fachliche Ergebnis eines Dokuments.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentOutcome {
    Unknown,
    Positive,
    Negative,
    PartiallyImmune,
    FullyImmune,
}

/// Die Art einer einzelnen Prozedur innerhalb eines Dokuments.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcedureType {
    Vaccination,
    RapidAntigenTest,
    PcrTest,
}

impl ProcedureType {
    /// Impf-Prozeduren und Test-Prozeduren dürfen nie gemischt auftreten.
    pub fn is_vaccination(self) -> bool {
        matches!(self, ProcedureType::Vaccination)
    }
}

/// Eine einzelne Prozedur (Impfdosis oder Testdurchführung).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Procedure {
    #[serde(rename = "type")]
    pub procedure_type: ProcedureType,
    /// Zeitpunkt der Durchführung (Unix-Millisekunden).
    pub timestamp_ms: u64,
    /// Nummer dieser Dosis (bei Tests immer 1).
    pub dose_number: u32,
    /// Anzahl der für vollständigen Schutz nötigen Dosen (bei Tests 1).
    pub total_doses: u32,
}

/// Ein importierter Gesundheitsnachweis.
///
/// Invariante: `id` ist deterministisch aus den dekodierten Payload-Bytes
/// abgeleitet (content-addressed), sodass Doppel-Importe erkennbar sind.
/// `verified` wird ausschließlich nach einer erfolgreichen kryptographischen
/// Signaturprüfung des jeweiligen Provider-Formats gesetzt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Document {
    /// Die content-addressed ID: `hex(SHA-256(hashable_encoded_data))`.
    pub id: String,
    #[serde(rename = "type")]
    pub document_type: DocumentType,
    pub outcome: DocumentOutcome,
    /// Zeitpunkt der Probenentnahme bzw. der (letzten) Impfung.
    pub testing_timestamp_ms: u64,
    /// Zeitpunkt des Befunds bzw. der Ausstellung.
    pub result_timestamp_ms: u64,
    /// Zeitpunkt des Imports in die lokale Sammlung.
    pub import_timestamp_ms: u64,
    /// Expliziter Gültigkeitsbeginn; überschreibt die berechnete Regel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validity_start_timestamp_ms: Option<u64>,
    /// Explizites Ablaufdatum; überschreibt die Dauer-Tabelle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_timestamp_ms: Option<u64>,
    /// Die Prozeduren dieses Dokuments, aufsteigend nach Zeit sortiert.
    pub procedures: Vec<Procedure>,
    /// Nur nach erfolgreicher Signaturprüfung `true`.
    pub verified: bool,
    /// Vorname der nachgewiesenen Person (leer bei Terminen).
    pub first_name: String,
    /// Nachname der nachgewiesenen Person (leer bei Terminen).
    pub last_name: String,
    /// Die ursprünglich importierte, kodierte Form.
    pub encoded_data: String,
    /// Die Bytes, aus denen die `id` abgeleitet wird.
    pub hashable_encoded_data: String,
}

impl Document {
    /// Leitet die content-addressed ID aus den hashbaren Bytes ab.
    pub fn derive_id(hashable_encoded_data: &str) -> String {
        hex::encode(sha256(hashable_encoded_data.as_bytes()))
    }

    /// Der SHA-256-Hash der kodierten Form, wie er beim Einlösen an das
    /// Backend übermittelt wird.
    pub fn redeem_hash(&self) -> [u8; 32] {
        sha256(self.encoded_data.as_bytes())
    }
}

/// Transienter Wrapper, den ein Provider beim Parsen erzeugt.
/// Immer verlustfrei in ein `Document` umwandelbar.
#[derive(Debug, Clone)]
pub struct ProvidedDocument {
    /// Der Name des Providers, der das Dokument erkannt hat.
    pub provider: &'static str,
    pub document: Document,
}

impl ProvidedDocument {
    pub fn into_document(self) -> Document {
        self.document
    }
}

/// Die Aktion eines Historien-Eintrags.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentHistoryAction {
    Imported,
    Deleted,
    Redeemed,
    Unredeemed,
}

/// Ein Eintrag der Import-Historie.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DocumentHistoryEntry {
    pub document_id: String,
    pub action: DocumentHistoryAction,
    pub timestamp_ms: u64,
}

/// Die persistierte Dokumenten-Sammlung samt Historie.
///
/// Die Sammlung wird als Ganzes serialisiert gespeichert; der Speicher ist
/// die einzige Quelle der Wahrheit, In-Memory-Kopien sind reine Caches.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DocumentStore {
    pub documents: Vec<Document>,
    pub history: Vec<DocumentHistoryEntry>,
}

impl DocumentStore {
    pub fn contains(&self, document_id: &str) -> bool {
        self.documents.iter().any(|d| d.id == document_id)
    }

    pub fn get(&self, document_id: &str) -> Option<&Document> {
        self.documents.iter().find(|d| d.id == document_id)
    }
}
