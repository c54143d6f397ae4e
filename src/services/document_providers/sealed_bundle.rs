//! # src/services/document_providers/sealed_bundle.rs
//!
//! Provider für versiegelte Dokumente: eine Base64-kodierte CBOR-Map
//! `{ envelope, signer_key }`. `envelope` ist eine `COSE_Sign1`-Nachricht,
//! deren Signatur gegen den mitgelieferten `signer_key` geprüft wird; ihr
//! Payload ist ein Encrypt0-artiger Container:
//!
//! - protected Header: `alg = A256GCM`, `kid` (Schlüssel-ID im Bündel),
//!   `iv` (12 Bytes)
//! - `ciphertext`: AES-256-GCM-Chiffrat des CBOR-Klartexts, mit der
//!   `Enc_structure` über die protected Header als AAD
//!
//! Der Datensatz-Schlüssel stammt aus dem verifizierten Schlüsselbündel;
//! ohne Bündel oder mit unbekannter `kid` schlägt die Prüfung hart fehl.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use p256::ecdsa::VerifyingKey;
use serde::Deserialize;
use serde_cbor::Value;

use crate::models::document::{Document, Procedure, ProvidedDocument};
use crate::services::cose::{
    decode_header_map, enc_structure_aad, CoseSign1, ALG_A256GCM, HEADER_ALG, HEADER_IV,
    HEADER_KID,
};

use super::{
    parse_document_type, parse_outcome, parse_procedure_type, DocumentError, DocumentProvider,
    ProviderContext, VerificationFailureReason,
};

pub struct SealedBundleProvider;

fn parsing(detail: impl Into<String>) -> DocumentError {
    DocumentError::ParsingFailed(detail.into())
}

/// Der entschlüsselte Klartext eines versiegelten Dokuments.
#[derive(Debug, Deserialize)]
struct SealedDocumentPayload {
    #[serde(rename = "type")]
    document_type: String,
    outcome: String,
    #[serde(rename = "testingTimestamp")]
    testing_timestamp_ms: u64,
    #[serde(rename = "resultTimestamp")]
    result_timestamp_ms: u64,
    #[serde(rename = "firstName")]
    first_name: String,
    #[serde(rename = "lastName")]
    last_name: String,
    procedures: Vec<SealedProcedure>,
}

#[derive(Debug, Deserialize)]
struct SealedProcedure {
    #[serde(rename = "type")]
    procedure_type: String,
    #[serde(rename = "timestamp")]
    timestamp_ms: u64,
    #[serde(rename = "doseNumber")]
    dose_number: u32,
    #[serde(rename = "totalDoses")]
    total_doses: u32,
}

/// Die äußere Map des Formats; `envelope` und `signer_key` sind Pflicht.
struct OuterBundle {
    envelope: Vec<u8>,
    signer_key: Vec<u8>,
}

fn decode_outer(encoded: &str) -> Option<OuterBundle> {
    let bytes = BASE64.decode(encoded.trim()).ok()?;
    let value: Value = serde_cbor::from_slice(&bytes).ok()?;
    let entries = match value {
        Value::Map(entries) => entries,
        _ => return None,
    };

    let mut envelope = None;
    let mut signer_key = None;
    for (key, entry) in entries {
        if let (Value::Text(label), Value::Bytes(bytes)) = (key, entry) {
            match label.as_str() {
                "envelope" => envelope = Some(bytes),
                "signer_key" => signer_key = Some(bytes),
                _ => {}
            }
        }
    }
    Some(OuterBundle {
        envelope: envelope?,
        signer_key: signer_key?,
    })
}

impl DocumentProvider for SealedBundleProvider {
    fn name(&self) -> &'static str {
        "sealed-bundle"
    }

    fn can_parse(&self, encoded: &str) -> bool {
        decode_outer(encoded).is_some()
    }

    fn verify_and_parse(
        &self,
        encoded: &str,
        ctx: &ProviderContext<'_>,
    ) -> Result<ProvidedDocument, DocumentError> {
        // 1. Äußere Struktur und Envelope dekodieren (noch ohne Kryptographie).
        let outer = decode_outer(encoded)
            .ok_or_else(|| parsing("sealed bundle is not a base64 CBOR map"))?;
        let sign1 = CoseSign1::decode(&outer.envelope).map_err(|e| parsing(e.to_string()))?;
        let signer_key = VerifyingKey::from_sec1_bytes(&outer.signer_key)
            .map_err(|_| parsing("sealed bundle signer key is not a valid curve point"))?;

        // 2. Envelope-Signatur prüfen.
        sign1.verify_es256(&signer_key).map_err(|_| {
            DocumentError::VerificationFailed(VerificationFailureReason::InvalidSignature)
        })?;

        // 3. Den Encrypt0-artigen Container aus dem signierten Payload lesen.
        let container: Value = serde_cbor::from_slice(&sign1.payload)
            .map_err(|e| parsing(format!("sealed payload is not CBOR: {e}")))?;
        let (protected, ciphertext) = match &container {
            Value::Map(entries) => {
                let mut protected = None;
                let mut ciphertext = None;
                for (key, entry) in entries {
                    if let (Value::Text(label), Value::Bytes(bytes)) = (key, entry) {
                        match label.as_str() {
                            "protected" => protected = Some(bytes.clone()),
                            "ciphertext" => ciphertext = Some(bytes.clone()),
                            _ => {}
                        }
                    }
                }
                (
                    protected.ok_or_else(|| parsing("sealed payload is missing 'protected'"))?,
                    ciphertext.ok_or_else(|| parsing("sealed payload is missing 'ciphertext'"))?,
                )
            }
            _ => return Err(parsing("sealed payload is not a map")),
        };

        let headers = decode_header_map(&protected).map_err(|e| parsing(e.to_string()))?;
        match headers.get(&HEADER_ALG) {
            Some(Value::Integer(alg)) if *alg == ALG_A256GCM => {}
            Some(Value::Integer(alg)) => {
                return Err(parsing(format!("unsupported sealed payload algorithm {alg}")))
            }
            _ => return Err(parsing("sealed payload is missing the alg header")),
        }
        let key_id = match headers.get(&HEADER_KID) {
            Some(Value::Integer(kid)) => u8::try_from(*kid)
                .map_err(|_| parsing("sealed payload kid is out of range"))?,
            _ => return Err(parsing("sealed payload is missing the kid header")),
        };
        let iv = match headers.get(&HEADER_IV) {
            Some(Value::Bytes(iv)) if iv.len() == 12 => iv.clone(),
            _ => return Err(parsing("sealed payload is missing a 12-byte iv header")),
        };

        // 4. Datensatz-Schlüssel aus dem verifizierten Bündel beziehen.
        let bundle = ctx.key_bundle.ok_or(DocumentError::VerificationFailed(
            VerificationFailureReason::KeyBundleUntrusted,
        ))?;
        let record_key = bundle.key_for(key_id).ok_or(DocumentError::VerificationFailed(
            VerificationFailureReason::UnknownKeyId(key_id),
        ))?;

        // 5. Authentisiert entschlüsseln; die AAD bindet die protected Header.
        let aad = enc_structure_aad(&protected).map_err(|e| parsing(e.to_string()))?;
        let cipher = Aes256Gcm::new_from_slice(record_key).map_err(|_| {
            DocumentError::VerificationFailed(VerificationFailureReason::PayloadDecryptionFailed)
        })?;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: &ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| {
                DocumentError::VerificationFailed(
                    VerificationFailureReason::PayloadDecryptionFailed,
                )
            })?;

        // 6. Klartext mappen.
        let payload: SealedDocumentPayload = serde_cbor::from_slice(&plaintext)
            .map_err(|e| parsing(format!("sealed plaintext is malformed: {e}")))?;
        let document_type = parse_document_type(&payload.document_type).ok_or_else(|| {
            parsing(format!("unknown sealed document type '{}'", payload.document_type))
        })?;

        let mut procedures = Vec::with_capacity(payload.procedures.len());
        for procedure in payload.procedures {
            let procedure_type =
                parse_procedure_type(&procedure.procedure_type).ok_or_else(|| {
                    parsing(format!(
                        "unknown sealed procedure type '{}'",
                        procedure.procedure_type
                    ))
                })?;
            procedures.push(Procedure {
                procedure_type,
                timestamp_ms: procedure.timestamp_ms,
                dose_number: procedure.dose_number,
                total_doses: procedure.total_doses,
            });
        }

        let hashable = BASE64.encode(&plaintext);
        let document = Document {
            id: Document::derive_id(&hashable),
            document_type,
            outcome: parse_outcome(&payload.outcome),
            testing_timestamp_ms: payload.testing_timestamp_ms,
            result_timestamp_ms: payload.result_timestamp_ms,
            import_timestamp_ms: 0,
            validity_start_timestamp_ms: None,
            expiration_timestamp_ms: None,
            procedures,
            verified: true,
            first_name: payload.first_name,
            last_name: payload.last_name,
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
    use p256::ecdsa::{Signature, SigningKey};
    use rand_core::OsRng;
    use serde_cbor::Value;

    use crate::models::document::{DocumentOutcome, DocumentType};
    use crate::models::key_bundle::{DocumentKeyBundle, KeyBundleEntry};
    use crate::services::cose::{sig_structure_bytes, ALG_ES256};

    fn cbor_map(entries: Vec<(Value, Value)>) -> Value {
        Value::Map(entries.into_iter().collect())
    }

    fn sealed_plaintext() -> Vec<u8> {
        let payload = cbor_map(vec![
            (Value::Text("type".into()), Value::Text("VACCINATION".into())),
            (Value::Text("outcome".into()), Value::Text("FULLY_IMMUNE".into())),
            (
                Value::Text("testingTimestamp".into()),
                Value::Integer(1_690_000_000_000),
            ),
            (
                Value::Text("resultTimestamp".into()),
                Value::Integer(1_690_100_000_000),
            ),
            (Value::Text("firstName".into()), Value::Text("Erika".into())),
            (Value::Text("lastName".into()), Value::Text("Mustermann".into())),
            (
                Value::Text("procedures".into()),
                Value::Array(vec![cbor_map(vec![
                    (Value::Text("type".into()), Value::Text("VACCINATION".into())),
                    (Value::Text("timestamp".into()), Value::Integer(1_690_000_000_000)),
                    (Value::Text("doseNumber".into()), Value::Integer(2)),
                    (Value::Text("totalDoses".into()), Value::Integer(2)),
                ])]),
            ),
        ]);
        serde_cbor::to_vec(&payload).unwrap()
    }

    fn build_bundle(signing_key: &SigningKey, record_key: &[u8; 32], key_id: u8) -> String {
        let iv = [0x42u8; 12];
        let protected = serde_cbor::to_vec(&cbor_map(vec![
            (Value::Integer(HEADER_ALG), Value::Integer(ALG_A256GCM)),
            (Value::Integer(HEADER_KID), Value::Integer(key_id as i128)),
            (Value::Integer(HEADER_IV), Value::Bytes(iv.to_vec())),
        ]))
        .unwrap();

        let aad = enc_structure_aad(&protected).unwrap();
        let ciphertext = Aes256Gcm::new_from_slice(record_key)
            .unwrap()
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: &sealed_plaintext(),
                    aad: &aad,
                },
            )
            .unwrap();

        let container = serde_cbor::to_vec(&cbor_map(vec![
            (Value::Text("protected".into()), Value::Bytes(protected)),
            (Value::Text("ciphertext".into()), Value::Bytes(ciphertext)),
        ]))
        .unwrap();

        let sign_protected =
            serde_cbor::to_vec(&cbor_map(vec![(
                Value::Integer(HEADER_ALG),
                Value::Integer(ALG_ES256),
            )]))
            .unwrap();
        let message = sig_structure_bytes(&sign_protected, &container).unwrap();
        let signature: Signature = signing_key.sign(&message);
        let envelope = serde_cbor::to_vec(&Value::Array(vec![
            Value::Bytes(sign_protected),
            Value::Map(Default::default()),
            Value::Bytes(container),
            Value::Bytes(signature.to_bytes().to_vec()),
        ]))
        .unwrap();

        let signer_key = signing_key.verifying_key().to_sec1_bytes().to_vec();
        let outer = serde_cbor::to_vec(&cbor_map(vec![
            (Value::Text("envelope".into()), Value::Bytes(envelope)),
            (Value::Text("signer_key".into()), Value::Bytes(signer_key)),
        ]))
        .unwrap();
        BASE64.encode(outer)
    }

    fn ctx(bundle: &DocumentKeyBundle) -> ProviderContext<'_> {
        ProviderContext {
            now_ms: 1_700_000_000_000,
            registered_name: None,
            lab_issuer_keys: &[],
            certificate_signer_keys: &[],
            key_bundle: Some(bundle),
        }
    }

    fn bundle_with(key_id: u8, record_key: [u8; 32]) -> DocumentKeyBundle {
        DocumentKeyBundle {
            keys: vec![KeyBundleEntry {
                key_id,
                key: record_key.to_vec(),
            }],
            expires_at_ms: u64::MAX,
        }
    }

    #[test]
    fn decrypts_and_parses_sealed_document() {
        let signing_key = SigningKey::random(&mut OsRng);
        let record_key = [7u8; 32];
        let encoded = build_bundle(&signing_key, &record_key, 3);
        let bundle = bundle_with(3, record_key);

        assert!(SealedBundleProvider.can_parse(&encoded));
        let document = SealedBundleProvider
            .verify_and_parse(&encoded, &ctx(&bundle))
            .unwrap()
            .into_document();
        assert_eq!(document.document_type, DocumentType::Vaccination);
        assert_eq!(document.outcome, DocumentOutcome::FullyImmune);
        assert_eq!(document.first_name, "Erika");
        assert!(document.verified);
    }

    #[test]
    fn missing_bundle_is_untrusted() {
        let signing_key = SigningKey::random(&mut OsRng);
        let encoded = build_bundle(&signing_key, &[7u8; 32], 3);
        let ctx = ProviderContext {
            now_ms: 1_700_000_000_000,
            registered_name: None,
            lab_issuer_keys: &[],
            certificate_signer_keys: &[],
            key_bundle: None,
        };

        assert!(matches!(
            SealedBundleProvider.verify_and_parse(&encoded, &ctx),
            Err(DocumentError::VerificationFailed(
                VerificationFailureReason::KeyBundleUntrusted
            ))
        ));
    }

    #[test]
    fn unknown_key_id_is_reported() {
        let signing_key = SigningKey::random(&mut OsRng);
        let record_key = [7u8; 32];
        let encoded = build_bundle(&signing_key, &record_key, 3);
        let bundle = bundle_with(9, record_key);

        assert!(matches!(
            SealedBundleProvider.verify_and_parse(&encoded, &ctx(&bundle)),
            Err(DocumentError::VerificationFailed(
                VerificationFailureReason::UnknownKeyId(3)
            ))
        ));
    }

    #[test]
    fn wrong_record_key_fails_decryption() {
        let signing_key = SigningKey::random(&mut OsRng);
        let encoded = build_bundle(&signing_key, &[7u8; 32], 3);
        let bundle = bundle_with(3, [8u8; 32]);

        assert!(matches!(
            SealedBundleProvider.verify_and_parse(&encoded, &ctx(&bundle)),
            Err(DocumentError::VerificationFailed(
                VerificationFailureReason::PayloadDecryptionFailed
            ))
        ));
    }
}
