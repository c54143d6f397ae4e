//! # src/services/document_providers/mod.rs
//!
//! Die Provider-Kette der Dokumenten-Verifikation. Ein Provider erkennt ein
//! kodiertes Dokumentenformat (`can_parse`), prüft dessen Signatur und
//! extrahiert die Felder (`verify_and_parse`). Die Registry probiert die
//! Provider in fester Reihenfolge; der erste Treffer entscheidet.
//!
//! Die Kurzschluss-Semantik ist eine explizite, testbare Policy:
//! - [`parse_and_validate`]: der erste Provider mit `can_parse == true` wird
//!   verwendet; schlägt dessen Prüfung fehl, wird der Fehler gemeldet und
//!   *nicht* stillschweigend auf einen anderen Provider ausgewichen.
//! - [`parse_with_any_provider`]: probiert alle Provider, die das Format
//!   plausibel erkennen; der erste erfolgreich verifizierte gewinnt.
//!   "Kein Provider erkennt die Bytes" (`ParsingFailed`) bleibt dabei von
//!   "ein Provider erkannte sie, aber die Prüfung schlug fehl" unterscheidbar.

mod appointment;
mod cose_certificate;
mod lab_result;
mod sealed_bundle;

pub use appointment::AppointmentProvider;
pub use cose_certificate::CoseCertificateProvider;
pub use lab_result::LabResultProvider;
pub use sealed_bundle::SealedBundleProvider;

use p256::ecdsa::VerifyingKey;
use thiserror::Error;

use crate::models::document::{
    Document, DocumentOutcome, DocumentType, ProcedureType, ProvidedDocument,
};
use crate::models::key_bundle::DocumentKeyBundle;
use crate::services::document_validity;

/// Der konkrete Grund einer fehlgeschlagenen Dokumenten-Verifikation.
/// Verifikationsfehler sind für das Dokument fatal und werden nie
/// automatisch wiederholt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationFailureReason {
    /// Die kryptographische Signatur ist ungültig.
    InvalidSignature,
    /// Der Name im Dokument passt nicht zum registrierten Nutzer.
    NameMismatch,
    /// Das Dokument enthält keine Prozeduren.
    EmptyProcedures,
    /// Impf- und Test-Prozeduren sind gemischt.
    MixedProcedures,
    /// Das Ergebnis ist UNKNOWN, obwohl das Dokument kein Termin ist.
    UnknownOutcome,
    /// Ein Zeitstempel liegt in der Zukunft.
    FutureTimestamp,
    /// Das Schlüsselbündel fehlt oder seine Signatur ist nicht vertrauenswürdig.
    KeyBundleUntrusted,
    /// Das Schlüsselbündel kennt die referenzierte Schlüssel-ID nicht.
    UnknownKeyId(u8),
    /// Die authentisierte Entschlüsselung des inneren Payloads schlug fehl.
    PayloadDecryptionFailed,
}

impl std::fmt::Display for VerificationFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSignature => write!(f, "document signature is invalid"),
            Self::NameMismatch => write!(f, "document name does not match the registered user"),
            Self::EmptyProcedures => write!(f, "document contains no procedures"),
            Self::MixedProcedures => write!(f, "document mixes vaccination and test procedures"),
            Self::UnknownOutcome => write!(f, "document outcome is unknown"),
            Self::FutureTimestamp => write!(f, "document timestamp lies in the future"),
            Self::KeyBundleUntrusted => write!(f, "document key bundle is missing or untrusted"),
            Self::UnknownKeyId(id) => write!(f, "document references unknown key id {id}"),
            Self::PayloadDecryptionFailed => write!(f, "sealed payload decryption failed"),
        }
    }
}

/// Definiert die Fehler der Dokumenten-Pipeline.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// Kein Provider hat die Bytes erkannt, oder die strukturelle
    /// Dekodierung schlug vor jeder Signaturprüfung fehl.
    #[error("Document parsing failed: {0}")]
    ParsingFailed(String),

    /// Ein Provider hat das Dokument erkannt, aber die Prüfung schlug fehl.
    #[error("Document verification failed: {0}")]
    VerificationFailed(VerificationFailureReason),

    /// Ein Dokument mit derselben content-addressed ID existiert bereits.
    #[error("Document has already been imported.")]
    AlreadyImported,

    /// Das Dokument ist bereits abgelaufen.
    #[error("Document has already expired.")]
    Expired,

    /// Ein positives Testergebnis, das kein gültiger Genesenennachweis ist.
    #[error("Positive test result cannot be imported.")]
    TestResultPositive,
}

/// Der registrierte Name des Nutzers, gegen den Dokumente geprüft werden.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredName {
    pub first_name: String,
    pub last_name: String,
}

impl RegisteredName {
    fn matches(&self, first_name: &str, last_name: &str) -> bool {
        fn normalize(s: &str) -> String {
            s.trim().to_lowercase()
        }
        normalize(&self.first_name) == normalize(first_name)
            && normalize(&self.last_name) == normalize(last_name)
    }
}

/// Der Kontext, den Provider für Prüfung und Parsen benötigen.
pub struct ProviderContext<'a> {
    /// Der aktuelle Zeitpunkt (Unix-Millisekunden).
    pub now_ms: u64,
    /// Der registrierte Nutzername; `None` überspringt die Namensprüfung.
    pub registered_name: Option<&'a RegisteredName>,
    /// Vertrauenswürdige Aussteller-Schlüssel für signierte Laborbefunde.
    pub lab_issuer_keys: &'a [VerifyingKey],
    /// Vertrauenswürdige Signatur-Schlüssel für COSE-Zertifikate.
    pub certificate_signer_keys: &'a [VerifyingKey],
    /// Das bereits verifizierte Schlüsselbündel für versiegelte Dokumente.
    pub key_bundle: Option<&'a DocumentKeyBundle>,
}

/// Ein Dokumenten-Provider: erkennt, prüft und parst genau ein Wire-Format.
pub trait DocumentProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Billige, strukturelle Erkennung ohne Kryptographie.
    fn can_parse(&self, encoded: &str) -> bool;

    /// Prüft die Signatur und extrahiert die Felder.
    fn verify_and_parse(
        &self,
        encoded: &str,
        ctx: &ProviderContext<'_>,
    ) -> Result<ProvidedDocument, DocumentError>;
}

/// Die feste, prioritätsgeordnete Provider-Registry.
pub fn default_providers() -> Vec<Box<dyn DocumentProvider>> {
    vec![
        Box::new(AppointmentProvider),
        Box::new(LabResultProvider),
        Box::new(CoseCertificateProvider),
        Box::new(SealedBundleProvider),
    ]
}

/// Die Standard-Policy: der erste erkennende Provider entscheidet.
pub fn parse_and_validate(
    providers: &[Box<dyn DocumentProvider>],
    encoded: &str,
    ctx: &ProviderContext<'_>,
) -> Result<Document, DocumentError> {
    let provider = providers
        .iter()
        .find(|p| p.can_parse(encoded))
        .ok_or_else(|| {
            DocumentError::ParsingFailed("no provider recognized the encoded data".to_string())
        })?;

    let provided = provider.verify_and_parse(encoded, ctx)?;
    let mut document = provided.into_document();
    validate_document(&mut document, ctx)?;
    Ok(document)
}

/// Die "alle Varianten probieren"-Policy für Aufrufer, bei denen mehrere
/// Provider dieselben Bytes plausibel erkennen können. Der erste Provider,
/// dessen Prüfung und Parsen gelingt, gewinnt.
pub fn parse_with_any_provider(
    providers: &[Box<dyn DocumentProvider>],
    encoded: &str,
    ctx: &ProviderContext<'_>,
) -> Result<Document, DocumentError> {
    let mut last_error = None;
    for provider in providers.iter().filter(|p| p.can_parse(encoded)) {
        match provider.verify_and_parse(encoded, ctx) {
            Ok(provided) => {
                let mut document = provided.into_document();
                validate_document(&mut document, ctx)?;
                return Ok(document);
            }
            Err(error) => last_error = Some(error),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        DocumentError::ParsingFailed("no provider recognized the encoded data".to_string())
    }))
}

/// Die einheitliche Nachvalidierung, unabhängig vom Provider.
///
/// Prozeduren werden dabei aufsteigend nach Zeit sortiert; alle übrigen
/// Regeln sind reine Prüfungen.
pub fn validate_document(
    document: &mut Document,
    ctx: &ProviderContext<'_>,
) -> Result<(), DocumentError> {
    use DocumentError::VerificationFailed;
    use VerificationFailureReason as Reason;

    // 1. Zeitstempel dürfen nicht in der Zukunft liegen. Das gilt auch für
    //    Termine: ein Termin wird erst ab seinem Terminzeitpunkt importierbar.
    if document.testing_timestamp_ms > ctx.now_ms || document.result_timestamp_ms > ctx.now_ms {
        return Err(VerificationFailed(Reason::FutureTimestamp));
    }

    // Termine tragen weder Ergebnis noch Prozeduren oder Namen.
    if document.document_type == DocumentType::Appointment {
        return Ok(());
    }

    // 2. Ein unbekanntes Ergebnis ist nur für Termine zulässig.
    if document.outcome == DocumentOutcome::Unknown {
        return Err(VerificationFailed(Reason::UnknownOutcome));
    }

    // 3. Prozeduren: nicht leer, homogen, aufsteigend sortiert.
    if document.procedures.is_empty() {
        return Err(VerificationFailed(Reason::EmptyProcedures));
    }
    let all_vaccinations = document.procedures.iter().all(|p| p.procedure_type.is_vaccination());
    let all_tests = document.procedures.iter().all(|p| !p.procedure_type.is_vaccination());
    if !all_vaccinations && !all_tests {
        return Err(VerificationFailed(Reason::MixedProcedures));
    }
    document.procedures.sort_by_key(|p| p.timestamp_ms);

    // 4. Der Name muss zum registrierten Nutzer passen.
    if let Some(registered) = ctx.registered_name {
        if !registered.matches(&document.first_name, &document.last_name) {
            return Err(VerificationFailed(Reason::NameMismatch));
        }
    }

    // 5. Positive Testergebnisse: nur akzeptiert, wenn sie als gültiger
    //    Genesenennachweis durchgehen (alte positive PCR); alles andere wird
    //    als Positivbefund abgewiesen.
    if document.outcome == DocumentOutcome::Positive
        && matches!(document.document_type, DocumentType::Fast | DocumentType::Pcr)
        && !document_validity::is_valid_recovery(document, ctx.now_ms)
    {
        return Err(DocumentError::TestResultPositive);
    }

    Ok(())
}

/// Gemeinsame Feld-Mapper der Provider.
pub(crate) fn parse_document_type(value: &str) -> Option<DocumentType> {
    match value {
        "FAST" => Some(DocumentType::Fast),
        "PCR" => Some(DocumentType::Pcr),
        "VACCINATION" => Some(DocumentType::Vaccination),
        "RECOVERY" => Some(DocumentType::Recovery),
        _ => None,
    }
}

pub(crate) fn parse_outcome(value: &str) -> DocumentOutcome {
    match value {
        "POSITIVE" => DocumentOutcome::Positive,
        "NEGATIVE" => DocumentOutcome::Negative,
        "PARTIALLY_IMMUNE" => DocumentOutcome::PartiallyImmune,
        "FULLY_IMMUNE" => DocumentOutcome::FullyImmune,
        _ => DocumentOutcome::Unknown,
    }
}

pub(crate) fn parse_procedure_type(value: &str) -> Option<ProcedureType> {
    match value {
        "VACCINATION" => Some(ProcedureType::Vaccination),
        "RAPID_ANTIGEN_TEST" => Some(ProcedureType::RapidAntigenTest),
        "PCR_TEST" => Some(ProcedureType::PcrTest),
        _ => None,
    }
}
