//! # src/services/utils.rs
//!
//! Enthält allgemeine Hilfsfunktionen für Zeitstempel-Arithmetik und
//! kanonische Serialisierung. Alle Protokoll-Zeitstempel sind Unix-Millisekunden
//! (UTC) als `u64`.

use chrono::Utc;
use serde::Serialize;
use serde_json_canonicalizer::to_string;

/// Eine Minute in Millisekunden.
pub const MINUTE_MS: u64 = 60 * 1000;
/// Eine Stunde in Millisekunden.
pub const HOUR_MS: u64 = 60 * MINUTE_MS;
/// Ein Tag in Millisekunden.
pub const DAY_MS: u64 = 24 * HOUR_MS;

/// Serialisiert eine beliebige `Serialize`-bare Struktur in einen kanonischen JSON-String
/// gemäß RFC 8785 (JCS - JSON Canonicalization Scheme).
///
/// Dies stellt sicher, dass die Ausgabe deterministisch ist:
/// - Schlüssel in Objekten sind alphabetisch sortiert.
/// - Keine überflüssigen Leerzeichen.
///
/// Diese Funktion ist essenziell für Signatur und Verifizierung, da sie garantiert,
/// dass derselbe logische Inhalt immer dieselben Bytes erzeugt.
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    to_string(value)
}

/// Rundet einen Zeitstempel auf die volle Minute ab.
pub fn round_to_minute_ms(timestamp_ms: u64) -> u64 {
    timestamp_ms - (timestamp_ms % MINUTE_MS)
}

/// Rundet einen Zeitstempel auf den Beginn des UTC-Kalendertages ab.
pub fn start_of_day_ms(timestamp_ms: u64) -> u64 {
    timestamp_ms - (timestamp_ms % DAY_MS)
}

/// Abstraktion über die aktuelle Uhrzeit.
///
/// Die gesamte Kernlogik bezieht "jetzt" ausschließlich über dieses Trait,
/// damit Tests die Zeit deterministisch kontrollieren können.
pub trait Clock: Send + Sync {
    /// Liefert die aktuelle Uhrzeit als Unix-Millisekunden (UTC).
    fn now_millis(&self) -> u64;
}

/// Die Standard-Implementierung auf Basis der Systemuhr.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        // Negative Zeitstempel (vor 1970) treten auf realen Geräten nicht auf.
        Utc::now().timestamp_millis().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_down_to_minute() {
        assert_eq!(round_to_minute_ms(90_500), 60_000);
        assert_eq!(round_to_minute_ms(60_000), 60_000);
        assert_eq!(round_to_minute_ms(59_999), 0);
    }

    #[test]
    fn rounds_down_to_day() {
        assert_eq!(start_of_day_ms(DAY_MS + 123), DAY_MS);
        assert_eq!(start_of_day_ms(DAY_MS - 1), 0);
    }
}
