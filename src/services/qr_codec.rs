//! # src/services/qr_codec.rs
//!
//! Packt und entpackt den binären Check-in-QR-Payload. Feld-Reihenfolge und
//! -Breiten sind Teil des Wire-Vertrags und dürfen sich nicht ändern:
//!
//! ```text
//! version:u8 | device_type:u8 | entry_policy:u8 | key_id:u8 |
//! timestamp:u32 LE (Unix-Sekunden, minutengenau) | trace_id:16B |
//! encrypted_data: 0 oder 48 B | ephemeral_public_key: 33 B (SEC1 komprimiert) |
//! verification_tag: 8 B | checksum: 4 B
//! ```
//!
//! `checksum` sind die ersten 4 Bytes von SHA-256 über alle vorangehenden
//! Felder. `verification_tag` sind die ersten 8 Bytes eines HMAC-SHA256 über
//! `timestamp_le ‖ encrypted_data`, geschlüsselt mit einem aus dem
//! Daten-Secret abgeleiteten Tag-Schlüssel. Zur Anzeige wird der gepackte
//! Payload Base32-kodiert (RFC 4648, ohne Padding).

use data_encoding::BASE32_NOPAD;
use thiserror::Error;

use crate::models::check_in::TraceId;
use crate::services::crypto_utils::{hkdf_sha256, hmac_sha256, sha256};

/// Aktuelle Protokoll-Version des Payloads.
pub const QR_PAYLOAD_VERSION: u8 = 3;
/// Länge des verschlüsselten Datenblocks (Chiffrat 32 B + MAC 16 B).
pub const ENCRYPTED_DATA_LEN: usize = 48;
/// Länge des Verification-Tags.
pub const VERIFICATION_TAG_LEN: usize = 8;
/// Länge der Prüfsumme.
pub const CHECKSUM_LEN: usize = 4;

/// Gesamtlänge ohne verschlüsselte Daten (anonymer Check-in).
const BASE_LEN: usize = 4 + 4 + 16 + 33 + VERIFICATION_TAG_LEN + CHECKSUM_LEN;

/// HKDF-Label für den Tag-Schlüssel.
const TAG_KEY_INFO: &[u8] = b"qr-verification-tag";

/// Definiert die Fehler beim Packen und Entpacken des QR-Payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("QR payload has unexpected length {found} (expected {expected_anonymous} or {expected_full}).")]
    UnexpectedLength {
        found: usize,
        expected_anonymous: usize,
        expected_full: usize,
    },

    #[error("Unsupported QR payload version {0}.")]
    UnsupportedVersion(u8),

    /// Die Prüfsumme passt nicht zu den vorangehenden Feldern.
    #[error("QR payload checksum mismatch.")]
    ChecksumMismatch,

    #[error("QR payload is not valid base32: {0}")]
    InvalidEncoding(String),
}

/// Der versionierte, binäre QR-Payload eines Gasts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrCodePayload {
    pub version: u8,
    pub device_type: u8,
    /// Bitmaske der Zutritts-Richtlinien des Standorts.
    pub entry_policy: u8,
    /// ID des Tages-Public-Keys, unter dem `encrypted_data` verschlüsselt ist.
    pub key_id: u8,
    /// Minutengenau gerundeter Unix-Zeitstempel in Sekunden.
    pub timestamp: u32,
    pub trace_id: TraceId,
    /// Leer bei anonymem Check-in, sonst genau 48 Bytes.
    pub encrypted_data: Vec<u8>,
    /// Der komprimierte ephemere Public Key des Gasts.
    pub ephemeral_public_key: [u8; 33],
    pub verification_tag: [u8; VERIFICATION_TAG_LEN],
}

/// Berechnet das Verification-Tag über `timestamp ‖ encrypted_data`.
///
/// Der Tag-Schlüssel wird per HKDF aus dem Check-in-Daten-Secret abgeleitet.
pub fn compute_verification_tag(
    data_secret: &[u8],
    timestamp: u32,
    encrypted_data: &[u8],
) -> Result<[u8; VERIFICATION_TAG_LEN], crate::error::TraceCoreError> {
    let tag_key = hkdf_sha256(data_secret, TAG_KEY_INFO)?;

    let mut message = Vec::with_capacity(4 + encrypted_data.len());
    message.extend_from_slice(&timestamp.to_le_bytes());
    message.extend_from_slice(encrypted_data);

    let digest = hmac_sha256(&tag_key, &message);
    let mut tag = [0u8; VERIFICATION_TAG_LEN];
    tag.copy_from_slice(&digest[..VERIFICATION_TAG_LEN]);
    Ok(tag)
}

impl QrCodePayload {
    /// Packt den Payload in seine binäre Form; die Prüfsumme wird dabei
    /// über alle vorangehenden Felder berechnet und angehängt.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BASE_LEN + self.encrypted_data.len());
        out.push(self.version);
        out.push(self.device_type);
        out.push(self.entry_policy);
        out.push(self.key_id);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.trace_id);
        out.extend_from_slice(&self.encrypted_data);
        out.extend_from_slice(&self.ephemeral_public_key);
        out.extend_from_slice(&self.verification_tag);

        let checksum = sha256(&out);
        out.extend_from_slice(&checksum[..CHECKSUM_LEN]);
        out
    }

    /// Entpackt und prüft die binäre Form.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let encrypted_len = match bytes.len() {
            l if l == BASE_LEN => 0,
            l if l == BASE_LEN + ENCRYPTED_DATA_LEN => ENCRYPTED_DATA_LEN,
            l => {
                return Err(CodecError::UnexpectedLength {
                    found: l,
                    expected_anonymous: BASE_LEN,
                    expected_full: BASE_LEN + ENCRYPTED_DATA_LEN,
                })
            }
        };

        // Prüfsumme zuerst: alles vor den letzten 4 Bytes muss passen.
        let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        if sha256(body)[..CHECKSUM_LEN] != *checksum {
            return Err(CodecError::ChecksumMismatch);
        }

        let version = body[0];
        if version != QR_PAYLOAD_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }

        let mut offset = 4;
        let timestamp = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
        offset += 4;

        let mut trace_id = [0u8; 16];
        trace_id.copy_from_slice(&body[offset..offset + 16]);
        offset += 16;

        let encrypted_data = body[offset..offset + encrypted_len].to_vec();
        offset += encrypted_len;

        let mut ephemeral_public_key = [0u8; 33];
        ephemeral_public_key.copy_from_slice(&body[offset..offset + 33]);
        offset += 33;

        let mut verification_tag = [0u8; VERIFICATION_TAG_LEN];
        verification_tag.copy_from_slice(&body[offset..offset + VERIFICATION_TAG_LEN]);

        Ok(Self {
            version,
            device_type: body[1],
            entry_policy: body[2],
            key_id: body[3],
            timestamp,
            trace_id,
            encrypted_data,
            ephemeral_public_key,
            verification_tag,
        })
    }

    /// Die Base32-Form für Anzeige und Scan.
    pub fn to_base32(&self) -> String {
        BASE32_NOPAD.encode(&self.encode())
    }

    /// Dekodiert die Base32-Form zurück in den Payload.
    pub fn from_base32(encoded: &str) -> Result<Self, CodecError> {
        let bytes = BASE32_NOPAD
            .decode(encoded.as_bytes())
            .map_err(|e| CodecError::InvalidEncoding(e.to_string()))?;
        Self::decode(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload(encrypted_data: Vec<u8>) -> QrCodePayload {
        QrCodePayload {
            version: QR_PAYLOAD_VERSION,
            device_type: 1,
            entry_policy: 0b0000_0101,
            key_id: 7,
            timestamp: 1_700_000_040,
            trace_id: [0xAB; 16],
            encrypted_data,
            ephemeral_public_key: {
                let mut point = [0u8; 33];
                point[0] = 0x02;
                point[1] = 0x11;
                point
            },
            verification_tag: [0xCD; 8],
        }
    }

    #[test]
    fn round_trip_with_encrypted_data() {
        let payload = sample_payload(vec![0x5A; ENCRYPTED_DATA_LEN]);
        let decoded = QrCodePayload::decode(&payload.encode()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn round_trip_anonymous() {
        let payload = sample_payload(Vec::new());
        let decoded = QrCodePayload::from_base32(&payload.to_base32()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn corrupted_checksum_fails() {
        let mut bytes = sample_payload(Vec::new()).encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            QrCodePayload::decode(&bytes),
            Err(CodecError::ChecksumMismatch)
        ));
    }

    #[test]
    fn corrupted_body_fails_checksum() {
        let mut bytes = sample_payload(vec![0x5A; ENCRYPTED_DATA_LEN]).encode();
        bytes[10] ^= 0x01;
        assert!(matches!(
            QrCodePayload::decode(&bytes),
            Err(CodecError::ChecksumMismatch)
        ));
    }

    #[test]
    fn unexpected_length_is_rejected() {
        assert!(matches!(
            QrCodePayload::decode(&[0u8; 10]),
            Err(CodecError::UnexpectedLength { .. })
        ));
    }

    #[test]
    fn verification_tag_depends_on_inputs() {
        let secret = [1u8; 16];
        let a = compute_verification_tag(&secret, 60, b"data").unwrap();
        let b = compute_verification_tag(&secret, 60, b"data").unwrap();
        let c = compute_verification_tag(&secret, 120, b"data").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
