//! # src/services/cose.rs
//!
//! Minimaler COSE-Baustein für die Dokumenten-Verifikation: Dekodierung von
//! `COSE_Sign1`-Nachrichten, die byte-exakte Rekonstruktion der kanonischen
//! `Sig_structure` sowie die AAD-Konstruktion (`Enc_structure`) für die
//! authentisierte Entschlüsselung versiegelter Payloads.
//!
//! Wire-Verträge, die exakt erhalten bleiben müssen:
//! - `Sig_structure = ["Signature1", protected, external_aad = b"", payload]`
//! - `Enc_structure = ["Encrypt0", protected, external_aad = b""]`
//! - Signaturen sind rohe `r ‖ s`-Paare (64 Bytes) und werden vor der
//!   Verifikation nach DER konvertiert.

use std::collections::BTreeMap;

use p256::ecdsa::VerifyingKey;
use serde_cbor::Value;
use thiserror::Error;

use crate::services::crypto_utils::verify_ecdsa_raw;

/// COSE-Algorithmus-Kennung für ECDSA mit SHA-256 auf P-256.
pub const ALG_ES256: i128 = -7;
/// COSE-Algorithmus-Kennung für AES-256-GCM.
pub const ALG_A256GCM: i128 = 3;

/// Header-Label für den Algorithmus.
pub const HEADER_ALG: i128 = 1;
/// Header-Label für die Schlüssel-ID.
pub const HEADER_KID: i128 = 4;
/// Header-Label für die IV.
pub const HEADER_IV: i128 = 5;

/// Definiert die Fehler der COSE-Verarbeitung.
#[derive(Debug, Error)]
pub enum CoseError {
    #[error("Malformed COSE structure: {0}")]
    Decode(String),

    #[error("Unsupported COSE algorithm {0}.")]
    UnsupportedAlgorithm(i128),

    #[error("Missing COSE header or field: {0}")]
    MissingField(&'static str),

    /// Die Signatur passt nicht zur kanonischen `Sig_structure`.
    #[error("COSE signature verification failed.")]
    InvalidSignature,
}

/// Eine dekodierte `COSE_Sign1`-Nachricht.
#[derive(Debug, Clone, PartialEq)]
pub struct CoseSign1 {
    /// Die serialisierten protected Header (bleiben byte-exakt erhalten,
    /// da sie in die `Sig_structure` eingehen).
    pub protected: Vec<u8>,
    pub payload: Vec<u8>,
    /// Rohe `r ‖ s`-Signatur.
    pub signature: Vec<u8>,
}

fn as_bytes(value: &Value, field: &'static str) -> Result<Vec<u8>, CoseError> {
    match value {
        Value::Bytes(bytes) => Ok(bytes.clone()),
        _ => Err(CoseError::Decode(format!("field '{field}' is not a byte string"))),
    }
}

impl CoseSign1 {
    /// Dekodiert eine `COSE_Sign1`-Nachricht (mit oder ohne CBOR-Tag 18).
    pub fn decode(bytes: &[u8]) -> Result<Self, CoseError> {
        let value: Value =
            serde_cbor::from_slice(bytes).map_err(|e| CoseError::Decode(e.to_string()))?;
        let value = match value {
            Value::Tag(18, inner) => *inner,
            other => other,
        };

        let items = match value {
            Value::Array(items) if items.len() == 4 => items,
            _ => {
                return Err(CoseError::Decode(
                    "COSE_Sign1 must be a 4-element array".to_string(),
                ))
            }
        };

        Ok(Self {
            protected: as_bytes(&items[0], "protected")?,
            // items[1] sind die unprotected Header; sie gehen nicht in die
            // Signatur ein und werden hier nicht benötigt.
            payload: as_bytes(&items[2], "payload")?,
            signature: as_bytes(&items[3], "signature")?,
        })
    }

    /// Die kanonische `Sig_structure` dieser Nachricht.
    pub fn sig_structure(&self) -> Result<Vec<u8>, CoseError> {
        sig_structure_bytes(&self.protected, &self.payload)
    }

    /// Der Algorithmus aus den protected Headern.
    pub fn algorithm(&self) -> Result<i128, CoseError> {
        let headers = decode_header_map(&self.protected)?;
        match headers.get(&HEADER_ALG) {
            Some(Value::Integer(alg)) => Ok(*alg),
            _ => Err(CoseError::MissingField("alg")),
        }
    }

    /// Verifiziert die ES256-Signatur gegen die kanonische `Sig_structure`.
    ///
    /// Die rohe Signatur wird vor der Prüfung nach DER konvertiert.
    pub fn verify_es256(&self, public_key: &VerifyingKey) -> Result<(), CoseError> {
        let algorithm = self.algorithm()?;
        if algorithm != ALG_ES256 {
            return Err(CoseError::UnsupportedAlgorithm(algorithm));
        }

        let message = self.sig_structure()?;
        let valid = verify_ecdsa_raw(public_key, &message, &self.signature)
            .map_err(|_| CoseError::InvalidSignature)?;
        if !valid {
            return Err(CoseError::InvalidSignature);
        }
        Ok(())
    }
}

/// Baut die kanonischen `Sig_structure`-Bytes für eine `COSE_Sign1`-Nachricht.
///
/// Die Struktur ist durch das Format deterministisch vorgegeben; sie wird
/// beim Verifizieren byte-exakt rekonstruiert, nie aus dem Wire übernommen.
pub fn sig_structure_bytes(protected: &[u8], payload: &[u8]) -> Result<Vec<u8>, CoseError> {
    let structure = Value::Array(vec![
        Value::Text("Signature1".to_string()),
        Value::Bytes(protected.to_vec()),
        Value::Bytes(Vec::new()),
        Value::Bytes(payload.to_vec()),
    ]);
    serde_cbor::to_vec(&structure).map_err(|e| CoseError::Decode(e.to_string()))
}

/// Baut die AAD für die authentisierte Entschlüsselung eines versiegelten
/// Payloads: `Enc_structure = ["Encrypt0", protected, b""]`.
pub fn enc_structure_aad(protected: &[u8]) -> Result<Vec<u8>, CoseError> {
    let structure = Value::Array(vec![
        Value::Text("Encrypt0".to_string()),
        Value::Bytes(protected.to_vec()),
        Value::Bytes(Vec::new()),
    ]);
    serde_cbor::to_vec(&structure).map_err(|e| CoseError::Decode(e.to_string()))
}

/// Dekodiert einen CBOR-Header-Block in eine Map mit Integer-Labels.
pub fn decode_header_map(bytes: &[u8]) -> Result<BTreeMap<i128, Value>, CoseError> {
    let value: Value =
        serde_cbor::from_slice(bytes).map_err(|e| CoseError::Decode(e.to_string()))?;
    let entries = match value {
        Value::Map(entries) => entries,
        _ => return Err(CoseError::Decode("header block is not a map".to_string())),
    };

    let mut headers = BTreeMap::new();
    for (key, entry) in entries {
        if let Value::Integer(label) = key {
            headers.insert(label, entry);
        }
    }
    Ok(headers)
}
