//! # src/services/document_providers/cose_certificate.rs
//!
//! Provider für COSE-signierte Zertifikate (Impfung, Genesung, Test):
//! das Präfix `DGC1:` gefolgt von einer Base64-kodierten `COSE_Sign1`-
//! Nachricht. Der Payload ist ein CWT-Claim-Set:
//!
//! - `1` (iss): ausstellendes Land (Text, nur informativ)
//! - `6` (iat): Ausstellungszeitpunkt (Unix-Sekunden)
//! - `4` (exp): Ablaufzeitpunkt (Unix-Sekunden, optional)
//! - `-260` → `{ 1: hcert }` mit `nam: {gn, fn}` und genau einem der
//!   Einträge `v` (Impfungen), `t` (Test) oder `r` (Genesung).
//!
//! Alle Wire-Zeitstempel sind Sekunden und werden beim Parsen in die
//! internen Unix-Millisekunden umgerechnet.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_cbor::Value;

use crate::models::document::{
    Document, DocumentOutcome, DocumentType, Procedure, ProcedureType, ProvidedDocument,
};
use crate::services::cose::CoseSign1;

use super::{DocumentError, DocumentProvider, ProviderContext, VerificationFailureReason};

const PREFIX: &str = "DGC1:";

const CLAIM_IAT: i128 = 6;
const CLAIM_EXP: i128 = 4;
const CLAIM_HCERT: i128 = -260;

pub struct CoseCertificateProvider;

fn parsing(detail: impl Into<String>) -> DocumentError {
    DocumentError::ParsingFailed(detail.into())
}

/// Dekodiert eine CBOR-Map mit Integer-Schlüsseln (CWT-Claims).
fn int_map(value: &Value) -> Option<BTreeMap<i128, &Value>> {
    match value {
        Value::Map(entries) => Some(
            entries
                .iter()
                .filter_map(|(key, entry)| match key {
                    Value::Integer(label) => Some((*label, entry)),
                    _ => None,
                })
                .collect(),
        ),
        _ => None,
    }
}

/// Dekodiert eine CBOR-Map mit Text-Schlüsseln (hcert-Felder).
fn text_map(value: &Value) -> Option<BTreeMap<&str, &Value>> {
    match value {
        Value::Map(entries) => Some(
            entries
                .iter()
                .filter_map(|(key, entry)| match key {
                    Value::Text(label) => Some((label.as_str(), entry)),
                    _ => None,
                })
                .collect(),
        ),
        _ => None,
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Integer(n) if *n >= 0 => u64::try_from(*n).ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<&str> {
    match value {
        Value::Text(text) => Some(text.as_str()),
        _ => None,
    }
}

fn seconds_to_ms(seconds: u64) -> u64 {
    seconds * 1000
}

/// Die aus dem hcert extrahierten fachlichen Felder.
struct CertificateContent {
    document_type: DocumentType,
    outcome: DocumentOutcome,
    testing_timestamp_ms: u64,
    validity_start_override_ms: Option<u64>,
    expiration_override_ms: Option<u64>,
    procedures: Vec<Procedure>,
}

fn parse_vaccinations(entries: &[Value]) -> Result<CertificateContent, DocumentError> {
    let mut procedures = Vec::with_capacity(entries.len());
    let mut fully_immune = false;
    for entry in entries {
        let fields = text_map(entry).ok_or_else(|| parsing("vaccination entry is not a map"))?;
        let dose_number = fields
            .get("dn")
            .and_then(|v| as_u64(v))
            .ok_or_else(|| parsing("vaccination entry is missing 'dn'"))?;
        let total_doses = fields
            .get("sd")
            .and_then(|v| as_u64(v))
            .ok_or_else(|| parsing("vaccination entry is missing 'sd'"))?;
        let timestamp_ms = fields
            .get("ts")
            .and_then(|v| as_u64(v))
            .map(seconds_to_ms)
            .ok_or_else(|| parsing("vaccination entry is missing 'ts'"))?;
        fully_immune |= dose_number >= total_doses;
        procedures.push(Procedure {
            procedure_type: ProcedureType::Vaccination,
            timestamp_ms,
            dose_number: dose_number as u32,
            total_doses: total_doses as u32,
        });
    }

    let testing_timestamp_ms = procedures
        .iter()
        .map(|p| p.timestamp_ms)
        .max()
        .ok_or_else(|| parsing("vaccination certificate contains no entries"))?;

    Ok(CertificateContent {
        document_type: DocumentType::Vaccination,
        outcome: if fully_immune {
            DocumentOutcome::FullyImmune
        } else {
            DocumentOutcome::PartiallyImmune
        },
        testing_timestamp_ms,
        validity_start_override_ms: None,
        expiration_override_ms: None,
        procedures,
    })
}

fn parse_test(entries: &[Value]) -> Result<CertificateContent, DocumentError> {
    let entry = entries
        .first()
        .ok_or_else(|| parsing("test certificate contains no entries"))?;
    let fields = text_map(entry).ok_or_else(|| parsing("test entry is not a map"))?;

    let (document_type, procedure_type) = match fields.get("tt").and_then(|v| as_text(v)) {
        Some("PCR") => (DocumentType::Pcr, ProcedureType::PcrTest),
        Some("FAST") => (DocumentType::Fast, ProcedureType::RapidAntigenTest),
        other => return Err(parsing(format!("unknown test type {other:?}"))),
    };
    let outcome = match fields.get("tr").and_then(|v| as_text(v)) {
        Some("POSITIVE") => DocumentOutcome::Positive,
        Some("NEGATIVE") => DocumentOutcome::Negative,
        other => return Err(parsing(format!("unknown test result {other:?}"))),
    };
    let testing_timestamp_ms = fields
        .get("ts")
        .and_then(|v| as_u64(v))
        .map(seconds_to_ms)
        .ok_or_else(|| parsing("test entry is missing 'ts'"))?;

    Ok(CertificateContent {
        document_type,
        outcome,
        testing_timestamp_ms,
        validity_start_override_ms: None,
        expiration_override_ms: None,
        procedures: vec![Procedure {
            procedure_type,
            timestamp_ms: testing_timestamp_ms,
            dose_number: 1,
            total_doses: 1,
        }],
    })
}

fn parse_recovery(entries: &[Value]) -> Result<CertificateContent, DocumentError> {
    let entry = entries
        .first()
        .ok_or_else(|| parsing("recovery certificate contains no entries"))?;
    let fields = text_map(entry).ok_or_else(|| parsing("recovery entry is not a map"))?;

    let testing_timestamp_ms = fields
        .get("ts")
        .and_then(|v| as_u64(v))
        .map(seconds_to_ms)
        .ok_or_else(|| parsing("recovery entry is missing 'ts'"))?;

    Ok(CertificateContent {
        document_type: DocumentType::Recovery,
        outcome: DocumentOutcome::FullyImmune,
        testing_timestamp_ms,
        // Aussteller-seitige Gültigkeitsfenster haben Vorrang vor den
        // lokal berechneten Regeln.
        validity_start_override_ms: fields.get("vf").and_then(|v| as_u64(v)).map(seconds_to_ms),
        expiration_override_ms: fields.get("vu").and_then(|v| as_u64(v)).map(seconds_to_ms),
        procedures: vec![Procedure {
            procedure_type: ProcedureType::PcrTest,
            timestamp_ms: testing_timestamp_ms,
            dose_number: 1,
            total_doses: 1,
        }],
    })
}

impl DocumentProvider for CoseCertificateProvider {
    fn name(&self) -> &'static str {
        "cose-certificate"
    }

    fn can_parse(&self, encoded: &str) -> bool {
        encoded
            .strip_prefix(PREFIX)
            .map(|rest| BASE64.decode(rest.trim()).is_ok())
            .unwrap_or(false)
    }

    fn verify_and_parse(
        &self,
        encoded: &str,
        ctx: &ProviderContext<'_>,
    ) -> Result<ProvidedDocument, DocumentError> {
        // 1. Struktur dekodieren; Fehler hier sind Parse-, keine
        //    Verifikationsfehler.
        let rest = encoded
            .strip_prefix(PREFIX)
            .ok_or_else(|| parsing("certificate is missing the DGC1 prefix"))?;
        let bytes = BASE64
            .decode(rest.trim())
            .map_err(|_| parsing("certificate is not valid base64"))?;
        let sign1 = CoseSign1::decode(&bytes).map_err(|e| parsing(e.to_string()))?;

        // 2. Signatur gegen die vertrauenswürdigen Zertifikats-Schlüssel.
        let verified = ctx
            .certificate_signer_keys
            .iter()
            .any(|key| sign1.verify_es256(key).is_ok());
        // Ein unbekannter Algorithmus zählt ebenfalls als harter
        // Verifikationsfehler, kein Parse-Problem.
        if !verified {
            return Err(DocumentError::VerificationFailed(
                VerificationFailureReason::InvalidSignature,
            ));
        }

        // 3. CWT-Claims aus dem Payload extrahieren.
        let claims_value: Value = serde_cbor::from_slice(&sign1.payload)
            .map_err(|e| parsing(format!("certificate payload is not CBOR: {e}")))?;
        let claims = int_map(&claims_value)
            .ok_or_else(|| parsing("certificate payload is not a claim map"))?;

        let issued_at_ms = claims
            .get(&CLAIM_IAT)
            .and_then(|v| as_u64(v))
            .map(seconds_to_ms)
            .ok_or_else(|| parsing("certificate is missing the iat claim"))?;
        let exp_ms = claims
            .get(&CLAIM_EXP)
            .and_then(|v| as_u64(v))
            .map(seconds_to_ms);

        let hcert_container = claims
            .get(&CLAIM_HCERT)
            .and_then(|v| int_map(v))
            .ok_or_else(|| parsing("certificate is missing the hcert claim"))?;
        let hcert = hcert_container
            .get(&1)
            .and_then(|v| text_map(v))
            .ok_or_else(|| parsing("certificate hcert container is malformed"))?;

        let name = hcert
            .get("nam")
            .and_then(|v| text_map(v))
            .ok_or_else(|| parsing("certificate is missing the name"))?;
        let first_name = name.get("gn").and_then(|v| as_text(v)).unwrap_or_default();
        let last_name = name.get("fn").and_then(|v| as_text(v)).unwrap_or_default();

        // 4. Genau eine der drei Eintragsarten muss vorhanden sein.
        let entries_of = |key: &str| match hcert.get(key) {
            Some(Value::Array(entries)) => Some(entries.as_slice()),
            _ => None,
        };
        let content = match (entries_of("v"), entries_of("t"), entries_of("r")) {
            (Some(v), None, None) => parse_vaccinations(v)?,
            (None, Some(t), None) => parse_test(t)?,
            (None, None, Some(r)) => parse_recovery(r)?,
            _ => {
                return Err(parsing(
                    "certificate must contain exactly one of v, t or r",
                ))
            }
        };

        let hashable = BASE64.encode(&sign1.payload);
        let document = Document {
            id: Document::derive_id(&hashable),
            document_type: content.document_type,
            outcome: content.outcome,
            testing_timestamp_ms: content.testing_timestamp_ms,
            result_timestamp_ms: issued_at_ms,
            import_timestamp_ms: 0,
            validity_start_timestamp_ms: content.validity_start_override_ms,
            expiration_timestamp_ms: content.expiration_override_ms.or(exp_ms),
            procedures: content.procedures,
            verified: true,
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            encoded_data: encoded.to_string(),
            hashable_encoded_data: hashable,
        };

        Ok(ProvidedDocument {
            provider: self.name(),
            document,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::Signer;
    use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
    use rand_core::OsRng;

    use crate::services::cose::{sig_structure_bytes, ALG_ES256, HEADER_ALG};

    fn cbor_text_map(entries: Vec<(&str, Value)>) -> Value {
        Value::Map(
            entries
                .into_iter()
                .map(|(key, value)| (Value::Text(key.to_string()), value))
                .collect(),
        )
    }

    fn cbor_int_map(entries: Vec<(i128, Value)>) -> Value {
        Value::Map(
            entries
                .into_iter()
                .map(|(key, value)| (Value::Integer(key), value))
                .collect(),
        )
    }

    fn build_certificate(signing_key: &SigningKey, hcert: Value) -> String {
        let claims = cbor_int_map(vec![
            (1, Value::Text("DE".to_string())),
            (CLAIM_IAT, Value::Integer(1_700_000_000)),
            (CLAIM_HCERT, cbor_int_map(vec![(1, hcert)])),
        ]);
        let payload = serde_cbor::to_vec(&claims).unwrap();

        let protected =
            serde_cbor::to_vec(&cbor_int_map(vec![(HEADER_ALG, Value::Integer(ALG_ES256))]))
                .unwrap();
        let message = sig_structure_bytes(&protected, &payload).unwrap();
        let signature: Signature = signing_key.sign(&message);

        let sign1 = Value::Array(vec![
            Value::Bytes(protected),
            Value::Map(Default::default()),
            Value::Bytes(payload),
            Value::Bytes(signature.to_bytes().to_vec()),
        ]);
        format!("{PREFIX}{}", BASE64.encode(serde_cbor::to_vec(&sign1).unwrap()))
    }

    fn vaccination_hcert() -> Value {
        cbor_text_map(vec![
            (
                "nam",
                cbor_text_map(vec![
                    ("gn", Value::Text("Erika".to_string())),
                    ("fn", Value::Text("Mustermann".to_string())),
                ]),
            ),
            (
                "v",
                Value::Array(vec![
                    cbor_text_map(vec![
                        ("dn", Value::Integer(1)),
                        ("sd", Value::Integer(2)),
                        ("ts", Value::Integer(1_680_000_000)),
                    ]),
                    cbor_text_map(vec![
                        ("dn", Value::Integer(2)),
                        ("sd", Value::Integer(2)),
                        ("ts", Value::Integer(1_690_000_000)),
                    ]),
                ]),
            ),
        ])
    }

    fn ctx(keys: &[VerifyingKey]) -> ProviderContext<'_> {
        ProviderContext {
            now_ms: 1_700_100_000_000,
            registered_name: None,
            lab_issuer_keys: &[],
            certificate_signer_keys: keys,
            key_bundle: None,
        }
    }

    #[test]
    fn parses_signed_vaccination_certificate() {
        let signing_key = SigningKey::random(&mut OsRng);
        let keys = [VerifyingKey::from(&signing_key)];
        let encoded = build_certificate(&signing_key, vaccination_hcert());

        assert!(CoseCertificateProvider.can_parse(&encoded));
        let document = CoseCertificateProvider
            .verify_and_parse(&encoded, &ctx(&keys))
            .unwrap()
            .into_document();

        assert_eq!(document.document_type, DocumentType::Vaccination);
        assert_eq!(document.outcome, DocumentOutcome::FullyImmune);
        assert_eq!(document.testing_timestamp_ms, 1_690_000_000_000);
        assert_eq!(document.result_timestamp_ms, 1_700_000_000_000);
        assert_eq!(document.procedures.len(), 2);
        assert_eq!(document.first_name, "Erika");
        assert!(document.verified);
    }

    #[test]
    fn rejects_certificate_from_unknown_signer() {
        let signing_key = SigningKey::random(&mut OsRng);
        let other_key = SigningKey::random(&mut OsRng);
        let keys = [VerifyingKey::from(&other_key)];
        let encoded = build_certificate(&signing_key, vaccination_hcert());

        assert!(matches!(
            CoseCertificateProvider.verify_and_parse(&encoded, &ctx(&keys)),
            Err(DocumentError::VerificationFailed(
                VerificationFailureReason::InvalidSignature
            ))
        ));
    }

    #[test]
    fn parses_recovery_with_issuer_windows() {
        let signing_key = SigningKey::random(&mut OsRng);
        let keys = [VerifyingKey::from(&signing_key)];
        let hcert = cbor_text_map(vec![
            (
                "nam",
                cbor_text_map(vec![
                    ("gn", Value::Text("Erika".to_string())),
                    ("fn", Value::Text("Mustermann".to_string())),
                ]),
            ),
            (
                "r",
                Value::Array(vec![cbor_text_map(vec![
                    ("ts", Value::Integer(1_680_000_000)),
                    ("vf", Value::Integer(1_682_000_000)),
                    ("vu", Value::Integer(1_695_000_000)),
                ])]),
            ),
        ]);
        let encoded = build_certificate(&signing_key, hcert);

        let document = CoseCertificateProvider
            .verify_and_parse(&encoded, &ctx(&keys))
            .unwrap()
            .into_document();
        assert_eq!(document.document_type, DocumentType::Recovery);
        assert_eq!(document.validity_start_timestamp_ms, Some(1_682_000_000_000));
        assert_eq!(document.expiration_timestamp_ms, Some(1_695_000_000_000));
    }

    #[test]
    fn certificate_without_entries_fails_parsing() {
        let signing_key = SigningKey::random(&mut OsRng);
        let keys = [VerifyingKey::from(&signing_key)];
        let hcert = cbor_text_map(vec![(
            "nam",
            cbor_text_map(vec![("gn", Value::Text("Erika".to_string()))]),
        )]);
        let encoded = build_certificate(&signing_key, hcert);

        assert!(matches!(
            CoseCertificateProvider.verify_and_parse(&encoded, &ctx(&keys)),
            Err(DocumentError::ParsingFailed(_))
        ));
    }
}
