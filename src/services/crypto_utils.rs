//! # src/services/crypto_utils.rs
//!
//! Kryptographische Basisfunktionen der Bibliothek: SHA-256-Hashes und
//! deterministische Kürzungen, HMAC-SHA256, HKDF-Ableitungen sowie die
//! Kodierung von P-256-Kurvenpunkten und ECDSA-Signaturen.
//!
//! Alle "Trims" sind definiert als "nimm die ersten N Bytes eines längeren
//! Digests" und werden nie durch erneutes Hashen ersetzt.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand_core::OsRng;
use sha2::{Digest, Sha256};

use crate::error::TraceCoreError;

type HmacSha256 = Hmac<Sha256>;

/// Länge eines komprimierten SEC1-Kurvenpunkts auf P-256.
pub const COMPRESSED_POINT_LEN: usize = 33;
/// Länge einer rohen ECDSA-Signatur (`r ‖ s`).
pub const RAW_SIGNATURE_LEN: usize = 64;

/// Berechnet einen SHA-256-Hash über die Eingabe.
pub fn sha256(input: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(input.as_ref());
    hasher.finalize().into()
}

/// Berechnet einen HMAC-SHA256 über die Nachricht mit dem gegebenen Schlüssel.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    // HMAC akzeptiert Schlüssel beliebiger Länge; `new_from_slice` kann daher
    // nicht fehlschlagen.
    let mut mac = HmacSha256::new_from_slice(key)
        .expect("HMAC accepts keys of any length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Leitet mit HKDF-SHA256 einen 32-Byte-Schlüssel aus dem Eingangsmaterial ab.
///
/// # Arguments
/// * `ikm` - Das Eingangs-Schlüsselmaterial (z.B. ein DH-Shared-Secret).
/// * `info` - Das Kontext-Label zur Domänentrennung.
pub fn hkdf_sha256(ikm: &[u8], info: &[u8]) -> Result<[u8; 32], TraceCoreError> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; 32];
    hkdf.expand(info, &mut okm)
        .map_err(|_| TraceCoreError::Crypto("HKDF expansion failed".to_string()))?;
    Ok(okm)
}

/// Erzeugt 32 kryptographisch zufällige Bytes aus dem OS-RNG.
pub fn random_bytes_32() -> [u8; 32] {
    use rand_core::RngCore;
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Erzeugt einen frischen P-256-Geheimschlüssel.
pub fn generate_secret_key() -> SecretKey {
    SecretKey::random(&mut OsRng)
}

/// Kodiert einen P-256-Public-Key als komprimierten SEC1/X9.62-Punkt (33 Bytes).
pub fn encode_compressed_point(public_key: &PublicKey) -> [u8; COMPRESSED_POINT_LEN] {
    let encoded = public_key.to_encoded_point(true);
    let mut out = [0u8; COMPRESSED_POINT_LEN];
    out.copy_from_slice(encoded.as_bytes());
    out
}

/// Dekodiert einen SEC1-kodierten P-256-Kurvenpunkt (komprimiert oder unkomprimiert).
pub fn decode_point(bytes: &[u8]) -> Result<PublicKey, TraceCoreError> {
    PublicKey::from_sec1_bytes(bytes)
        .map_err(|_| TraceCoreError::Crypto("Invalid P-256 curve point".to_string()))
}

/// Konvertiert eine rohe `r ‖ s`-Signatur (64 Bytes) in die DER-Struktur,
/// die die ECDSA-Bibliothek für die Verifikation erwartet.
pub fn raw_signature_to_der(raw: &[u8]) -> Result<p256::ecdsa::DerSignature, TraceCoreError> {
    if raw.len() != RAW_SIGNATURE_LEN {
        return Err(TraceCoreError::Crypto(format!(
            "Raw ECDSA signature must be {} bytes, got {}",
            RAW_SIGNATURE_LEN,
            raw.len()
        )));
    }
    let signature = Signature::from_slice(raw)
        .map_err(|e| TraceCoreError::Crypto(format!("Invalid raw ECDSA signature: {e}")))?;
    Ok(signature.to_der())
}

/// Verifiziert eine rohe `r ‖ s`-ECDSA-Signatur über die Nachricht.
///
/// Die Signatur wird vor der Prüfung explizit nach DER konvertiert, da das
/// Wire-Format der Dokumente ausschließlich die feste `r ‖ s`-Form transportiert.
pub fn verify_ecdsa_raw(
    public_key: &VerifyingKey,
    message: &[u8],
    raw_signature: &[u8],
) -> Result<bool, TraceCoreError> {
    let der = raw_signature_to_der(raw_signature)?;
    Ok(public_key.verify(message, &der).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::Signer;
    use p256::ecdsa::SigningKey;

    #[test]
    fn hmac_is_deterministic() {
        let a = hmac_sha256(b"key", b"message");
        let b = hmac_sha256(b"key", b"message");
        assert_eq!(a, b);
        assert_ne!(a, hmac_sha256(b"key", b"other"));
    }

    #[test]
    fn compressed_point_round_trip() {
        let secret = generate_secret_key();
        let encoded = encode_compressed_point(&secret.public_key());
        let decoded = decode_point(&encoded).unwrap();
        assert_eq!(decoded, secret.public_key());
    }

    #[test]
    fn raw_signature_verifies_after_der_conversion() {
        let signing_key = SigningKey::random(&mut OsRng);
        let message = b"signed bytes";
        let signature: Signature = signing_key.sign(message);
        let raw = signature.to_bytes();

        let verifying_key = VerifyingKey::from(&signing_key);
        assert!(verify_ecdsa_raw(&verifying_key, message, &raw).unwrap());
        assert!(!verify_ecdsa_raw(&verifying_key, b"tampered", &raw).unwrap());
    }
}
