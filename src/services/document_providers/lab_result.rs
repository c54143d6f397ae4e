//! # src/services/document_providers/lab_result.rs
//!
//! Provider für signierte Laborbefunde: Base64-kodiertes JSON-Objekt, dessen
//! ECDSA-Signatur über die kanonische JSON-Form (RFC 8785) des Objekts ohne
//! das `signature`-Feld gebildet wird. Geprüft wird gegen die Liste der
//! vertrauenswürdigen Aussteller-Schlüssel; ein Treffer genügt.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;

use crate::models::document::{Document, DocumentType, Procedure, ProcedureType, ProvidedDocument};
use crate::services::crypto_utils::verify_ecdsa_raw;
use crate::services::utils::to_canonical_json;

use super::{
    parse_document_type, parse_outcome, DocumentError, DocumentProvider, ProviderContext,
    VerificationFailureReason,
};

pub struct LabResultProvider;

/// Die Felder eines Laborbefunds, wie sie der Aussteller signiert.
#[derive(Debug, Deserialize)]
struct LabResultRecord {
    #[serde(rename = "type")]
    result_type: String,
    outcome: String,
    #[serde(rename = "testingTimestamp")]
    testing_timestamp_ms: u64,
    #[serde(rename = "resultTimestamp")]
    result_timestamp_ms: u64,
    #[serde(rename = "firstName")]
    first_name: String,
    #[serde(rename = "lastName")]
    last_name: String,
    /// Rohe `r ‖ s`-Signatur, Base64-kodiert.
    signature: String,
}

fn decode_record(encoded: &str) -> Option<Value> {
    let bytes = BASE64.decode(encoded.trim()).ok()?;
    serde_json::from_slice(&bytes).ok()
}

impl DocumentProvider for LabResultProvider {
    fn name(&self) -> &'static str {
        "lab-result"
    }

    fn can_parse(&self, encoded: &str) -> bool {
        match decode_record(encoded) {
            Some(Value::Object(map)) => map.contains_key("signature") && map.contains_key("type"),
            _ => false,
        }
    }

    fn verify_and_parse(
        &self,
        encoded: &str,
        ctx: &ProviderContext<'_>,
    ) -> Result<ProvidedDocument, DocumentError> {
        // 1. Strukturelle Dekodierung, noch ohne Kryptographie.
        let raw = decode_record(encoded).ok_or_else(|| {
            DocumentError::ParsingFailed("lab result is not base64-encoded JSON".to_string())
        })?;
        let record: LabResultRecord = serde_json::from_value(raw.clone())
            .map_err(|e| DocumentError::ParsingFailed(format!("malformed lab result: {e}")))?;
        let signature = BASE64.decode(&record.signature).map_err(|_| {
            DocumentError::ParsingFailed("lab result signature is not valid base64".to_string())
        })?;

        // 2. Die signierten Bytes rekonstruieren: kanonisches JSON des
        //    Objekts ohne das `signature`-Feld.
        let mut unsigned = raw;
        if let Value::Object(map) = &mut unsigned {
            map.remove("signature");
        }
        let canonical = to_canonical_json(&unsigned).map_err(|e| {
            DocumentError::ParsingFailed(format!("lab result cannot be canonicalized: {e}"))
        })?;

        // 3. Gegen jeden vertrauenswürdigen Aussteller-Schlüssel prüfen.
        let verified = ctx.lab_issuer_keys.iter().any(|key| {
            verify_ecdsa_raw(key, canonical.as_bytes(), &signature).unwrap_or(false)
        });
        if !verified {
            return Err(DocumentError::VerificationFailed(
                VerificationFailureReason::InvalidSignature,
            ));
        }

        // 4. Felder mappen.
        let document_type = parse_document_type(&record.result_type)
            .filter(|t| matches!(t, DocumentType::Fast | DocumentType::Pcr))
            .ok_or_else(|| {
                DocumentError::ParsingFailed(format!(
                    "unknown lab result type '{}'",
                    record.result_type
                ))
            })?;
        let procedure_type = match document_type {
            DocumentType::Pcr => ProcedureType::PcrTest,
            _ => ProcedureType::RapidAntigenTest,
        };

        let document = Document {
            id: Document::derive_id(&canonical),
            document_type,
            outcome: parse_outcome(&record.outcome),
            testing_timestamp_ms: record.testing_timestamp_ms,
            result_timestamp_ms: record.result_timestamp_ms,
            import_timestamp_ms: 0,
            validity_start_timestamp_ms: None,
            expiration_timestamp_ms: None,
            procedures: vec![Procedure {
                procedure_type,
                timestamp_ms: record.testing_timestamp_ms,
                dose_number: 1,
                total_doses: 1,
            }],
            verified: true,
            first_name: record.first_name,
            last_name: record.last_name,
            encoded_data: encoded.to_string(),
            hashable_encoded_data: canonical,
        };

        Ok(ProvidedDocument {
            provider: self.name(),
            document,
        })
    }
}
