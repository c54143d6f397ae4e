//! # src/models/check_in.rs
//!
//! Definiert die Datenstrukturen rund um den Check-in-Prozess: zeitgebundene
//! Trace-IDs, den lokalen Check-in-Zustand und die Metadaten eines Standorts.
//! Diese Strukturen werden serialisiert im opaken Key/Value-Speicher abgelegt.

use serde::{Deserialize, Serialize};

/// Eine zeitgebundene, pseudonyme Kennung: die ersten 16 Bytes eines
/// HMAC-SHA256 über `user_id ‖ minute_timestamp`, geschlüsselt mit dem
/// Tages-Secret. Ohne das Secret nicht mit dem Nutzer verknüpfbar.
pub type TraceId = [u8; 16];

/// Ein Eintrag der lokal geführten Trace-ID-Historie.
///
/// Invariante: `trace_id` ist deterministisch aus `(user_id, Secret des Tages,
/// timestamp_ms)` abgeleitet; `timestamp_ms` ist auf die Minute abgerundet.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TraceIdWrapper {
    /// Der minutengenau abgerundete Erzeugungszeitpunkt (Unix-Millisekunden).
    pub timestamp_ms: u64,
    /// Die abgeleitete, gekürzte Trace-ID.
    pub trace_id: TraceId,
}

/// Die persistierte, append-only Liste aller erzeugten Trace-IDs.
/// Einträge werden erst durch `prune_unused_trace_data` entfernt.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TraceIdList {
    pub wrappers: Vec<TraceIdWrapper>,
}

/// Eine geographische Position (WGS84).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct GeoPosition {
    pub latitude: f64,
    pub longitude: f64,
}

/// Die Metadaten eines Standorts, wie sie der Scanner-Endpunkt liefert.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Location {
    /// Die eindeutige ID des Standorts beim Backend.
    pub location_id: String,
    /// Der anzeigbare Name des Standorts.
    pub name: String,
    /// Die Position des Standorts.
    pub position: GeoPosition,
    /// Radius des Geofence in Metern; `0` bedeutet: kein Geofence.
    pub radius_meters: f64,
    /// Mindestaufenthaltsdauer in Millisekunden; `0` bedeutet: keine.
    pub minimum_duration_ms: u64,
    /// Durchschnittliche Aufenthaltsdauer am Standort in Millisekunden.
    pub average_check_in_duration_ms: u64,
    /// Kennzeichnet ein privates Treffen statt eines öffentlichen Standorts.
    pub is_private_meeting: bool,
    /// Gibt an, ob Kontaktdaten für diesen Standort verpflichtend sind.
    pub is_contact_data_mandatory: bool,
    /// Der komprimierte P-256-Public-Key des Standort-Betreibers. Unter diesem
    /// Schlüssel werden zusätzliche Check-in-Eigenschaften verschlüsselt.
    pub owner_public_key: Vec<u8>,
}

/// Der lokale Zustand eines bestätigten Check-ins.
///
/// Es existiert höchstens eine aktive Instanz; beim Check-out wird sie
/// archiviert (nur die Trace-ID bleibt referenziert) und gelöscht.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CheckInData {
    /// Die Trace-ID, unter der dieser Check-in beim Backend geführt wird.
    pub trace_id: TraceId,
    /// Der Zeitpunkt des Check-ins (Unix-Millisekunden).
    pub timestamp_ms: u64,
    /// Die Metadaten des Standorts.
    pub location: Location,
}

/// Die dem Check-out übergebene Positionsauskunft des Geräts.
///
/// Die Geofencing-Mechanik selbst ist ein externer Kollaborateur; die
/// Kernlogik bewertet nur das Ergebnis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DevicePosition {
    /// Eine aktuelle Position liegt vor.
    Available(GeoPosition),
    /// Die Standort-Berechtigung fehlt.
    PermissionMissing,
    /// Berechtigung vorhanden, aber keine Position ermittelbar.
    Unavailable,
}

/// Optionen für einen Check-out-Versuch.
///
/// Die beiden Skip-Flags erlauben automatisierten Abläufen (z.B. dem
/// Geofence-Austritt im Hintergrund), einzelne Vorbedingungen explizit zu
/// überspringen.
#[derive(Debug, Clone, Copy)]
pub struct CheckOutOptions {
    /// Überspringt die Prüfung der Mindestaufenthaltsdauer.
    pub skip_minimum_duration: bool,
    /// Überspringt die Prüfung des Mindestabstands zum Standort.
    pub skip_minimum_distance: bool,
    /// Die aktuelle Positionsauskunft des Geräts.
    pub position: DevicePosition,
}

impl Default for CheckOutOptions {
    fn default() -> Self {
        Self {
            skip_minimum_duration: false,
            skip_minimum_distance: false,
            position: DevicePosition::Unavailable,
        }
    }
}
