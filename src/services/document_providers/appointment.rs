//! # src/services/document_providers/appointment.rs
//!
//! Provider für Testtermine: eine `https`-URL mit `/appointment` im Pfad und
//! dem Terminzeitpunkt als Query-Parameter. Termine tragen keine Signatur
//! und gelten deshalb nie als verifiziert.

use crate::models::document::{Document, DocumentOutcome, DocumentType, ProvidedDocument};

use super::{DocumentError, DocumentProvider, ProviderContext};

pub struct AppointmentProvider;

/// Extrahiert einen Query-Parameter aus einer URL, ohne URL-Dekodierung
/// (die erwarteten Werte sind reine Ziffern bzw. ASCII-Namen).
fn query_param<'a>(url: &'a str, name: &str) -> Option<&'a str> {
    let (_, query) = url.split_once('?')?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

impl DocumentProvider for AppointmentProvider {
    fn name(&self) -> &'static str {
        "appointment"
    }

    fn can_parse(&self, encoded: &str) -> bool {
        let Some(rest) = encoded.strip_prefix("https://") else {
            return false;
        };
        let path = rest.split('?').next().unwrap_or(rest);
        path.contains("/appointment")
    }

    fn verify_and_parse(
        &self,
        encoded: &str,
        _ctx: &ProviderContext<'_>,
    ) -> Result<ProvidedDocument, DocumentError> {
        let timestamp_ms: u64 = query_param(encoded, "timestamp")
            .ok_or_else(|| {
                DocumentError::ParsingFailed(
                    "appointment URL is missing the timestamp parameter".to_string(),
                )
            })?
            .parse()
            .map_err(|_| {
                DocumentError::ParsingFailed(
                    "appointment timestamp is not a valid integer".to_string(),
                )
            })?;

        let document = Document {
            id: Document::derive_id(encoded),
            document_type: DocumentType::Appointment,
            outcome: DocumentOutcome::Unknown,
            testing_timestamp_ms: timestamp_ms,
            result_timestamp_ms: timestamp_ms,
            import_timestamp_ms: 0,
            validity_start_timestamp_ms: None,
            expiration_timestamp_ms: None,
            procedures: Vec::new(),
            verified: false,
            first_name: String::new(),
            last_name: String::new(),
            encoded_data: encoded.to_string(),
            hashable_encoded_data: encoded.to_string(),
        };

        Ok(ProvidedDocument {
            provider: self.name(),
            document,
        })
    }
}
