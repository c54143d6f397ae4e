//! # src/services/document_validity.rs
//!
//! Reine Funktionen zur Berechnung von Gültigkeitsfenstern und Ablaufdaten
//! von Dokumenten, inklusive der Booster-Regel: eine Impfung bzw. Genesung
//! gilt sofort, wenn zu ihrem Zeitpunkt bereits ein gültiger älterer
//! Nachweis bestand.
//!
//! Explizite Zeitstempel am Dokument haben immer Vorrang vor den hier
//! berechneten Regeln.

use crate::models::document::{Document, DocumentOutcome, DocumentType};
use crate::services::utils::{DAY_MS, HOUR_MS};

/// Karenzzeit, bis eine Impfung/Genesung ohne Vorbefund gültig wird.
pub const IMMUNITY_DELAY_MS: u64 = 15 * DAY_MS;

/// Gültigkeitsdauer eines Schnelltests.
pub const FAST_TEST_DURATION_MS: u64 = 2 * DAY_MS;
/// Gültigkeitsdauer eines negativen PCR-Tests.
pub const PCR_TEST_DURATION_MS: u64 = 3 * DAY_MS;
/// Gültigkeitsdauer eines positiven PCR-Tests bzw. Genesenennachweises.
pub const RECOVERY_DURATION_MS: u64 = 180 * DAY_MS;
/// Gültigkeitsdauer eines Impfnachweises.
pub const VACCINATION_DURATION_MS: u64 = 365 * DAY_MS;
/// Gültigkeitsdauer eines Termins.
pub const APPOINTMENT_DURATION_MS: u64 = 2 * HOUR_MS;

/// Die feste Dauer-Tabelle pro Typ/Ergebnis.
pub fn expiration_duration_ms(
    document_type: DocumentType,
    outcome: DocumentOutcome,
) -> u64 {
    match (document_type, outcome) {
        (DocumentType::Fast, _) => FAST_TEST_DURATION_MS,
        (DocumentType::Pcr, DocumentOutcome::Positive) => RECOVERY_DURATION_MS,
        (DocumentType::Pcr, _) => PCR_TEST_DURATION_MS,
        (DocumentType::Vaccination, _) => VACCINATION_DURATION_MS,
        (DocumentType::Recovery, _) => RECOVERY_DURATION_MS,
        (DocumentType::Appointment, _) => APPOINTMENT_DURATION_MS,
        (DocumentType::Unknown, _) => 0,
    }
}

/// Prüft, ob das Dokument grundsätzlich als Immunitätsnachweis zählt
/// (vollständige Impfung, Genesung oder positiver PCR als Genesenen-Ersatz).
fn grants_immunity(document: &Document) -> bool {
    match document.document_type {
        DocumentType::Vaccination => document.outcome == DocumentOutcome::FullyImmune,
        DocumentType::Recovery => true,
        DocumentType::Pcr => document.outcome == DocumentOutcome::Positive,
        _ => false,
    }
}

/// Der Gültigkeitsbeginn ohne Berücksichtigung der Booster-Regel.
///
/// Tests gelten sofort; Immunitätsnachweise erst nach der Karenzzeit.
/// Ein expliziter Zeitstempel am Dokument hat Vorrang.
pub fn base_validity_start(document: &Document) -> u64 {
    if let Some(explicit) = document.validity_start_timestamp_ms {
        return explicit;
    }
    if grants_immunity(document) {
        document.testing_timestamp_ms + IMMUNITY_DELAY_MS
    } else {
        document.testing_timestamp_ms
    }
}

/// Das Ablaufdatum des Dokuments; ein expliziter Zeitstempel hat Vorrang.
pub fn expiration(document: &Document) -> u64 {
    if let Some(explicit) = document.expiration_timestamp_ms {
        return explicit;
    }
    document.testing_timestamp_ms
        + expiration_duration_ms(document.document_type, document.outcome)
}

/// Prüft, ob das Dokument zum Zeitpunkt `now_ms` ein gültiger
/// Genesenennachweis ist: Genesung oder positiver PCR, und `now` liegt
/// strikt zwischen Gültigkeitsbeginn und Ablauf.
pub fn is_valid_recovery(document: &Document, now_ms: u64) -> bool {
    let is_recovery_kind = document.document_type == DocumentType::Recovery
        || (document.document_type == DocumentType::Pcr
            && document.outcome == DocumentOutcome::Positive);
    if !is_recovery_kind {
        return false;
    }
    base_validity_start(document) < now_ms && now_ms < expiration(document)
}

/// Prüft die Booster-Regel: existiert in der Sammlung ein *anderer*
/// Immunitätsnachweis, dessen (ungeboostertes) Gültigkeitsfenster den
/// Zeitpunkt der neuen Impfung/Genesung abdeckt?
///
/// Die Semantik ist eine reine Existenzprüfung; die Reihenfolge der
/// Dokumente in der Sammlung kann das Ergebnis nie beeinflussen.
pub fn is_boostered(document: &Document, collection: &[Document]) -> bool {
    if !grants_immunity(document) {
        return false;
    }
    let boost_time = document.testing_timestamp_ms;
    collection.iter().any(|other| {
        other.id != document.id
            && grants_immunity(other)
            && base_validity_start(other) <= boost_time
            && boost_time < expiration(other)
    })
}

/// Der effektive Gültigkeitsbeginn unter Berücksichtigung der Booster-Regel:
/// Auffrischungen, die auf einen noch gültigen Nachweis folgen, gelten sofort.
pub fn validity_start(document: &Document, collection: &[Document]) -> u64 {
    if document.validity_start_timestamp_ms.is_some() {
        return base_validity_start(document);
    }
    if grants_immunity(document) && is_boostered(document, collection) {
        return document.testing_timestamp_ms;
    }
    base_validity_start(document)
}

/// Prüft, ob das Dokument zum Zeitpunkt `now_ms` abgelaufen ist.
pub fn is_expired(document: &Document, now_ms: u64) -> bool {
    now_ms >= expiration(document)
}

/// Prüft, ob das Dokument zum Zeitpunkt `now_ms` gültig ist
/// (Gültigkeitsbeginn erreicht und nicht abgelaufen).
pub fn is_valid(document: &Document, collection: &[Document], now_ms: u64) -> bool {
    let start = validity_start(document, collection);
    start <= now_ms && !is_expired(document, now_ms)
}
