//! # src/services/ecies.rs
//!
//! Der ECIES-Baustein des Check-in-Protokolls: ECDH-Schlüsselvereinbarung auf
//! NIST P-256, Schlüsselableitung per HKDF-SHA256 und authentisierte
//! Verschlüsselung mit AES-256-GCM.
//!
//! Format-Vertrag:
//! - Kurvenpunkte werden komprimiert (SEC1/X9.62) übertragen.
//! - Die IV wird deterministisch aus dem Hash des ephemeren Public Keys
//!   gekürzt abgeleitet (keine Zufalls-IV, damit die Payload-Größe fix bleibt).
//!   Pro ephemerem Schlüsselpaar wird genau eine Nachricht verschlüsselt.
//! - Der GCM-Tag wird als separater MAC neben dem Chiffrat transportiert.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use p256::ecdh::diffie_hellman;
use p256::{PublicKey, SecretKey};
use thiserror::Error;

use crate::services::crypto_utils::{
    encode_compressed_point, generate_secret_key, hkdf_sha256, sha256,
};

/// Länge der deterministischen IV.
pub const IV_LEN: usize = 12;
/// Länge des separaten MAC-Tags (GCM-Tag).
pub const MAC_LEN: usize = 16;

/// HKDF-Label für den symmetrischen Schlüssel.
const KEY_INFO: &[u8] = b"ecies-aes";

/// Definiert die Fehler der ECIES-Operationen.
#[derive(Debug, Error)]
pub enum EciesError {
    /// Die AEAD-Verschlüsselung ist fehlgeschlagen.
    #[error("AEAD encryption failed.")]
    EncryptionFailed,

    /// MAC- bzw. AEAD-Prüfung fehlgeschlagen. Es wird niemals teilweise
    /// entschlüsselter Klartext herausgegeben.
    #[error("AEAD decryption failed. The key may be wrong or the data tampered with.")]
    DecryptionFailed,

    /// Die Schlüsselableitung ist fehlgeschlagen.
    #[error("Key derivation failed.")]
    KeyDerivationFailed,
}

/// Ein ephemeres P-256-Schlüsselpaar für genau einen ECIES-Umschlag.
#[derive(Clone)]
pub struct EphemeralKeyPair {
    secret: SecretKey,
}

impl EphemeralKeyPair {
    /// Erzeugt ein frisches ephemeres Schlüsselpaar.
    pub fn generate() -> Self {
        Self {
            secret: generate_secret_key(),
        }
    }

    /// Übernimmt ein bereits existierendes Secret (z.B. aus dem Keystore).
    pub fn from_secret(secret: SecretKey) -> Self {
        Self { secret }
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    /// Der komprimierte SEC1-Punkt des Public Keys.
    pub fn compressed_public_key(&self) -> [u8; 33] {
        encode_compressed_point(&self.public_key())
    }
}

/// Das Ergebnis einer ECIES-Verschlüsselung: Chiffrat, separater MAC und IV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EciesEnvelope {
    pub ciphertext: Vec<u8>,
    pub mac: [u8; MAC_LEN],
    pub iv: [u8; IV_LEN],
}

/// Leitet IV und AES-Schlüssel für ein Paar (ephemer, Empfänger) ab.
fn derive_key_and_iv(
    shared_secret: &[u8],
    ephemeral_public: &PublicKey,
) -> Result<([u8; 32], [u8; IV_LEN]), EciesError> {
    let key = hkdf_sha256(shared_secret, KEY_INFO).map_err(|_| EciesError::KeyDerivationFailed)?;

    // IV = erste 12 Bytes von SHA-256 über den komprimierten ephemeren Punkt.
    let digest = sha256(encode_compressed_point(ephemeral_public));
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&digest[..IV_LEN]);

    Ok((key, iv))
}

/// Verschlüsselt den Klartext für den Empfänger.
///
/// # Arguments
/// * `plaintext` - Die zu schützenden Bytes.
/// * `ephemeral` - Das ephemere Schlüsselpaar des Absenders.
/// * `recipient_public` - Der P-256-Public-Key des Empfängers.
pub fn encrypt(
    plaintext: &[u8],
    ephemeral: &EphemeralKeyPair,
    recipient_public: &PublicKey,
) -> Result<EciesEnvelope, EciesError> {
    // 1. Shared Secret via ECDH (x-Koordinate des gemeinsamen Punkts).
    let shared =
        diffie_hellman(ephemeral.secret.to_nonzero_scalar(), recipient_public.as_affine());

    // 2. Symmetrischen Schlüssel und deterministische IV ableiten.
    let (key, iv) = derive_key_and_iv(shared.raw_secret_bytes(), &ephemeral.public_key())?;

    // 3. Authentisiert verschlüsseln; den GCM-Tag als separaten MAC abtrennen.
    let cipher = Aes256Gcm::new(key.as_slice().into());
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| EciesError::EncryptionFailed)?;

    let mac_offset = sealed.len() - MAC_LEN;
    let mut mac = [0u8; MAC_LEN];
    mac.copy_from_slice(&sealed[mac_offset..]);
    sealed.truncate(mac_offset);

    Ok(EciesEnvelope {
        ciphertext: sealed,
        mac,
        iv,
    })
}

/// Entschlüsselt einen ECIES-Umschlag mit dem passenden privaten Schlüssel.
///
/// Schlägt die MAC-Prüfung fehl, wird ausschließlich `DecryptionFailed`
/// gemeldet; teilweiser Klartext verlässt die Funktion nie.
pub fn decrypt(
    envelope: &EciesEnvelope,
    recipient_secret: &SecretKey,
    ephemeral_public: &PublicKey,
) -> Result<Vec<u8>, EciesError> {
    let shared =
        diffie_hellman(recipient_secret.to_nonzero_scalar(), ephemeral_public.as_affine());
    let (key, _) = derive_key_and_iv(shared.raw_secret_bytes(), ephemeral_public)?;

    // Chiffrat und MAC wieder zur AEAD-Eingabe zusammensetzen; die IV kommt
    // aus dem Umschlag, damit auch manipulierte IVs sicher fehlschlagen.
    let mut sealed = Vec::with_capacity(envelope.ciphertext.len() + MAC_LEN);
    sealed.extend_from_slice(&envelope.ciphertext);
    sealed.extend_from_slice(&envelope.mac);

    let cipher = Aes256Gcm::new(key.as_slice().into());
    cipher
        .decrypt(
            Nonce::from_slice(&envelope.iv),
            Payload {
                msg: &sealed,
                aad: b"",
            },
        )
        .map_err(|_| EciesError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_recovers_plaintext() {
        let ephemeral = EphemeralKeyPair::generate();
        let recipient = generate_secret_key();

        let envelope = encrypt(b"guest payload", &ephemeral, &recipient.public_key()).unwrap();
        let plaintext = decrypt(&envelope, &recipient, &ephemeral.public_key()).unwrap();
        assert_eq!(plaintext, b"guest payload");
    }

    #[test]
    fn iv_is_deterministic_per_ephemeral_key() {
        let ephemeral = EphemeralKeyPair::generate();
        let recipient = generate_secret_key();

        let a = encrypt(b"a", &ephemeral, &recipient.public_key()).unwrap();
        let b = encrypt(b"b", &ephemeral, &recipient.public_key()).unwrap();
        assert_eq!(a.iv, b.iv);
    }

    #[test]
    fn tampering_fails_closed() {
        let ephemeral = EphemeralKeyPair::generate();
        let recipient = generate_secret_key();
        let envelope = encrypt(b"sensitive", &ephemeral, &recipient.public_key()).unwrap();

        let mut flipped_ct = envelope.clone();
        flipped_ct.ciphertext[0] ^= 0x01;
        assert!(matches!(
            decrypt(&flipped_ct, &recipient, &ephemeral.public_key()),
            Err(EciesError::DecryptionFailed)
        ));

        let mut flipped_mac = envelope;
        flipped_mac.mac[0] ^= 0x01;
        assert!(matches!(
            decrypt(&flipped_mac, &recipient, &ephemeral.public_key()),
            Err(EciesError::DecryptionFailed)
        ));
    }

    #[test]
    fn wrong_recipient_key_fails() {
        let ephemeral = EphemeralKeyPair::generate();
        let recipient = generate_secret_key();
        let other = generate_secret_key();
        let envelope = encrypt(b"sensitive", &ephemeral, &recipient.public_key()).unwrap();

        assert!(matches!(
            decrypt(&envelope, &other, &ephemeral.public_key()),
            Err(EciesError::DecryptionFailed)
        ));
    }
}
