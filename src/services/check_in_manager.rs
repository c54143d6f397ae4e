//! # src/services/check_in_manager.rs
//!
//! Orchestriert den Check-in-Lebenszyklus eines Gasts: Erzeugung des
//! QR-Payloads, Selbst-Check-in über einen Scanner (doppelter
//! ECIES-Umschlag), Abgleich des Zustands mit dem Backend, Check-out mit
//! Vorbedingungen sowie das Nachreichen verschlüsselter Zusatzdaten.
//!
//! Zustandsautomat: `NotCheckedIn → AwaitingConfirmation → CheckedIn →
//! NotCheckedIn`. Nur der bestätigte Zustand wird persistiert; eine
//! unbestätigte Einreichung verfällt nach einem Timeout. Beim Check-out
//! bleibt ausschließlich die Trace-ID in einem Archiv referenziert, damit
//! die zugehörigen Schlüsselpaare erst nach Ablauf der
//! Aufbewahrungsfrist entsorgt werden.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::TraceCoreError;
use crate::keystore::Keystore;
use crate::models::check_in::{
    CheckInData, CheckOutOptions, DevicePosition, GeoPosition, TraceId, TraceIdWrapper,
};
use crate::network::{AdditionalDataRequest, CheckInRequest, DailyPublicKey, NetworkClient};
use crate::services::crypto_utils::decode_point;
use crate::services::ecies::{self, EphemeralKeyPair};
use crate::services::qr_codec::{compute_verification_tag, QrCodePayload, QR_PAYLOAD_VERSION};
use crate::services::sync_utils::{RetryPolicy, SingleFlight};
use crate::services::trace_id::TraceIdGenerator;
use crate::services::utils::{Clock, DAY_MS, MINUTE_MS};
use crate::storage::Storage;

/// Speicher-Schlüssel des bestätigten Check-in-Zustands.
const CHECK_IN_STATE_KEY: &str = "tracing.check_in";
/// Speicher-Schlüssel des Archivs ausgecheckter Trace-IDs.
const ARCHIVE_KEY: &str = "tracing.archive";
/// Keystore-Label des Nutzer-Geheimnisses (`user_id ‖ data_secret`).
const USER_SECRET_LABEL: &str = "tracing.user_secret";

/// Maximales Alter des gecachten Tages-Public-Keys.
const DAILY_KEY_MAX_AGE_MS: u64 = DAY_MS;
/// Verfallszeit einer unbestätigten Check-in-Einreichung.
const CONFIRMATION_TIMEOUT_MS: u64 = 5 * MINUTE_MS;
/// Aufbewahrungsfrist archivierter Trace-IDs.
const ARCHIVE_RETENTION_MS: u64 = 28 * DAY_MS;

/// Mittlerer Erdradius in Metern, für die Haversine-Distanz.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Definiert die Fehler des Check-in-Ablaufs.
#[derive(Debug, Error)]
pub enum CheckInError {
    /// Es existiert bereits ein aktiver oder unbestätigter Check-in.
    #[error("A check-in is already active or awaiting confirmation.")]
    AlreadyActive,

    /// Die Operation erfordert einen bestätigten Check-in.
    #[error("No active check-in.")]
    NotCheckedIn,
}

/// Der Grund, aus dem ein Check-out-Versuch abgelehnt wurde.
#[derive(Debug, Error)]
pub enum CheckOutError {
    #[error("No active check-in to check out from.")]
    NotCheckedIn,

    /// Die Standort-Berechtigung fehlt; die Abstandsprüfung kann nicht laufen.
    #[error("Location permission is missing.")]
    MissingPermission,

    /// Berechtigung vorhanden, aber keine Geräteposition ermittelbar.
    #[error("Device location is unavailable.")]
    LocationUnavailable,

    /// Die Mindestaufenthaltsdauer ist noch nicht erreicht.
    #[error("Minimum check-in duration not reached; {remaining_ms} ms remaining.")]
    MinimumDurationNotReached { remaining_ms: u64 },

    /// Das Gerät befindet sich noch innerhalb des Geofence des Standorts.
    #[error("Minimum distance to the venue not reached.")]
    MinimumDistanceNotReached,
}

/// Der lokale Protokoll-Zustand des Gasts.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolState {
    NotCheckedIn,
    /// Eingereicht, aber vom Backend noch nicht als offen gemeldet.
    AwaitingConfirmation {
        data: CheckInData,
        /// Zeitpunkt der Einreichung, für den Bestätigungs-Timeout.
        submitted_at_ms: u64,
    },
    CheckedIn(CheckInData),
}

/// Distanz zweier WGS84-Positionen in Metern (Haversine).
pub fn distance_meters(a: GeoPosition, b: GeoPosition) -> f64 {
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Verwaltet den Check-in-Lebenszyklus.
pub struct CheckInManager {
    network: Arc<dyn NetworkClient>,
    keystore: Arc<dyn Keystore>,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    trace_ids: Arc<TraceIdGenerator>,
    state: Mutex<ProtocolState>,
    daily_key: Mutex<Option<(DailyPublicKey, u64)>>,
    load_flight: SingleFlight<()>,
}

impl CheckInManager {
    pub fn new(
        network: Arc<dyn NetworkClient>,
        keystore: Arc<dyn Keystore>,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        trace_ids: Arc<TraceIdGenerator>,
    ) -> Self {
        Self {
            network,
            keystore,
            storage,
            clock,
            trace_ids,
            state: Mutex::new(ProtocolState::NotCheckedIn),
            daily_key: Mutex::new(None),
            load_flight: SingleFlight::new(),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ProtocolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stellt einen persistierten, bestätigten Check-in genau einmal wieder her.
    fn ensure_loaded(&self) -> Result<(), TraceCoreError> {
        self.load_flight.get_or_try_init(|| {
            if let Some(bytes) = self.storage.restore(CHECK_IN_STATE_KEY)? {
                let data: CheckInData = serde_json::from_slice(&bytes)?;
                *self.lock_state() = ProtocolState::CheckedIn(data);
            }
            Ok(())
        })
    }

    /// Der aktuelle Protokoll-Zustand.
    pub fn state(&self) -> Result<ProtocolState, TraceCoreError> {
        self.ensure_loaded()?;
        Ok(self.lock_state().clone())
    }

    /// Liefert `(user_id, data_secret)`; erzeugt beide beim ersten Zugriff
    /// und legt sie gewrappt im Keystore ab.
    fn user_credentials(&self) -> Result<([u8; 16], [u8; 16]), TraceCoreError> {
        let combined = match self.keystore.unwrap_secret(USER_SECRET_LABEL)? {
            Some(existing) => existing,
            None => {
                let fresh = crate::services::crypto_utils::random_bytes_32();
                self.keystore.wrap_and_persist(USER_SECRET_LABEL, &fresh)?;
                fresh
            }
        };
        let mut user_id = [0u8; 16];
        let mut data_secret = [0u8; 16];
        user_id.copy_from_slice(&combined[..16]);
        data_secret.copy_from_slice(&combined[16..]);
        Ok((user_id, data_secret))
    }

    /// Der Tages-Public-Key des Gesundheitsamts, höchstens einmal pro Tag
    /// frisch geholt.
    fn daily_public_key(&self) -> Result<DailyPublicKey, TraceCoreError> {
        let now = self.clock.now_millis();
        let mut cached = self
            .daily_key
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some((key, fetched_at)) = &*cached {
            if now.saturating_sub(*fetched_at) < DAILY_KEY_MAX_AGE_MS {
                return Ok(key.clone());
            }
        }
        let fresh = self.network.fetch_daily_key()?;
        *cached = Some((fresh.clone(), now));
        Ok(fresh)
    }

    /// Erzeugt den anzeigbaren QR-Payload (Base32) für die aktuelle Minute.
    ///
    /// Bei `anonymous` bleibt der verschlüsselte Datenblock leer; Trace-ID,
    /// ephemerer Schlüssel und Verification-Tag sind in beiden Varianten
    /// vorhanden.
    pub fn generate_qr_payload(
        &self,
        device_type: u8,
        entry_policy: u8,
        anonymous: bool,
    ) -> Result<String, TraceCoreError> {
        let (user_id, data_secret) = self.user_credentials()?;
        let wrapper = self.trace_ids.get_or_create_wrapper(&user_id)?;
        let key_pair = self.trace_ids.key_pair_for(&wrapper.trace_id)?;
        let ephemeral = EphemeralKeyPair::from_secret(key_pair.secret);

        let daily_key = self.daily_public_key()?;
        let timestamp = (wrapper.timestamp_ms / 1000) as u32;

        // Der verschlüsselte Block transportiert `user_id ‖ data_secret`
        // unter dem Tages-Public-Key: Chiffrat (32 B) gefolgt vom MAC (16 B).
        let encrypted_data = if anonymous {
            Vec::new()
        } else {
            let mut plaintext = [0u8; 32];
            plaintext[..16].copy_from_slice(&user_id);
            plaintext[16..].copy_from_slice(&data_secret);

            let envelope = ecies::encrypt(&plaintext, &ephemeral, &daily_key.public_key)?;
            let mut block = envelope.ciphertext;
            block.extend_from_slice(&envelope.mac);
            block
        };

        let verification_tag = compute_verification_tag(&data_secret, timestamp, &encrypted_data)?;
        let payload = QrCodePayload {
            version: QR_PAYLOAD_VERSION,
            device_type,
            entry_policy,
            key_id: daily_key.key_id,
            timestamp,
            trace_id: wrapper.trace_id,
            encrypted_data,
            ephemeral_public_key: ephemeral.compressed_public_key(),
            verification_tag,
        };
        Ok(payload.to_base32())
    }

    /// Selbst-Check-in: reicht den eigenen QR-Payload über den Scanner-Kanal
    /// ein. Der bereits fertige Payload wird dafür ein zweites Mal, unter dem
    /// Public Key des Scanners, verschlüsselt (doppelter Umschlag).
    ///
    /// Die Einreichung wird nie automatisch wiederholt; erst der Abgleich mit
    /// dem Backend bestätigt den Check-in.
    pub fn check_in(
        &self,
        scanner_id: &str,
        qr_payload_base32: &str,
    ) -> Result<(), TraceCoreError> {
        self.ensure_loaded()?;
        if !matches!(&*self.lock_state(), ProtocolState::NotCheckedIn) {
            return Err(CheckInError::AlreadyActive.into());
        }

        let payload = QrCodePayload::from_base32(qr_payload_base32)?;
        let scanner = self.network.fetch_scanner(scanner_id)?;

        let ephemeral = EphemeralKeyPair::generate();
        let envelope = ecies::encrypt(&payload.encode(), &ephemeral, &scanner.public_key)?;

        let timestamp_ms = payload.timestamp as u64 * 1000;
        let request = CheckInRequest {
            scanner_id: scanner.scanner_id.clone(),
            trace_id: payload.trace_id,
            timestamp_ms,
            encrypted_payload: envelope.ciphertext,
            mac: envelope.mac,
            iv: envelope.iv,
            ephemeral_public_key: ephemeral.compressed_public_key(),
        };
        self.network.submit_check_in(&request)?;

        info!(location = %scanner.location.name, "check-in submitted, awaiting confirmation");
        *self.lock_state() = ProtocolState::AwaitingConfirmation {
            data: CheckInData {
                trace_id: payload.trace_id,
                timestamp_ms,
                location: scanner.location,
            },
            submitted_at_ms: self.clock.now_millis(),
        };
        Ok(())
    }

    fn persist_checked_in(&self, data: &CheckInData) -> Result<(), TraceCoreError> {
        let bytes = serde_json::to_vec(data)?;
        self.storage.persist(CHECK_IN_STATE_KEY, &bytes)?;
        Ok(())
    }

    fn load_archive(&self) -> Result<Vec<TraceIdWrapper>, TraceCoreError> {
        match self.storage.restore(ARCHIVE_KEY)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    fn archive_trace_id(&self, trace_id: TraceId, timestamp_ms: u64) -> Result<(), TraceCoreError> {
        let mut archive = self.load_archive()?;
        archive.push(TraceIdWrapper {
            timestamp_ms,
            trace_id,
        });
        self.storage.persist(ARCHIVE_KEY, &serde_json::to_vec(&archive)?)?;
        Ok(())
    }

    /// Beendet den aktiven Check-in lokal: archiviert die Trace-ID und löscht
    /// den persistierten Zustand.
    fn finish_check_in(&self, data: &CheckInData) -> Result<(), TraceCoreError> {
        self.archive_trace_id(data.trace_id, data.timestamp_ms)?;
        self.storage.delete(CHECK_IN_STATE_KEY)?;
        *self.lock_state() = ProtocolState::NotCheckedIn;
        Ok(())
    }

    /// Gleicht den lokalen Zustand mit dem Backend ab.
    ///
    /// - Unbestätigt: meldet das Backend die Trace-ID als offen, wird der
    ///   Check-in bestätigt und persistiert; nach dem Timeout verfällt die
    ///   Einreichung.
    /// - Eingecheckt: meldet das Backend die Trace-ID nicht mehr als offen,
    ///   wurde remote ausgecheckt; der lokale Zustand wird beendet.
    pub fn poll_backend_status(&self) -> Result<ProtocolState, TraceCoreError> {
        self.ensure_loaded()?;
        let snapshot = self.lock_state().clone();

        match snapshot {
            ProtocolState::NotCheckedIn => Ok(ProtocolState::NotCheckedIn),
            ProtocolState::AwaitingConfirmation {
                data,
                submitted_at_ms,
            } => {
                let open = self.network.fetch_open_traces(&[data.trace_id])?;
                if open.contains(&data.trace_id) {
                    info!(location = %data.location.name, "check-in confirmed by backend");
                    self.persist_checked_in(&data)?;
                    *self.lock_state() = ProtocolState::CheckedIn(data.clone());
                    return Ok(ProtocolState::CheckedIn(data));
                }
                if self.clock.now_millis().saturating_sub(submitted_at_ms)
                    >= CONFIRMATION_TIMEOUT_MS
                {
                    warn!("check-in was never confirmed, discarding submission");
                    *self.lock_state() = ProtocolState::NotCheckedIn;
                    return Ok(ProtocolState::NotCheckedIn);
                }
                Ok(ProtocolState::AwaitingConfirmation {
                    data,
                    submitted_at_ms,
                })
            }
            ProtocolState::CheckedIn(data) => {
                let open = self.network.fetch_open_traces(&[data.trace_id])?;
                if open.contains(&data.trace_id) {
                    return Ok(ProtocolState::CheckedIn(data));
                }
                info!(location = %data.location.name, "checked out remotely");
                self.finish_check_in(&data)?;
                Ok(ProtocolState::NotCheckedIn)
            }
        }
    }

    /// Prüft die Check-out-Vorbedingungen gegen die Standort-Metadaten.
    fn check_out_preconditions(
        &self,
        data: &CheckInData,
        options: &CheckOutOptions,
    ) -> Result<(), CheckOutError> {
        if data.location.minimum_duration_ms > 0 && !options.skip_minimum_duration {
            let elapsed = self.clock.now_millis().saturating_sub(data.timestamp_ms);
            if elapsed < data.location.minimum_duration_ms {
                return Err(CheckOutError::MinimumDurationNotReached {
                    remaining_ms: data.location.minimum_duration_ms - elapsed,
                });
            }
        }

        if data.location.radius_meters > 0.0 && !options.skip_minimum_distance {
            match options.position {
                DevicePosition::PermissionMissing => {
                    return Err(CheckOutError::MissingPermission)
                }
                DevicePosition::Unavailable => return Err(CheckOutError::LocationUnavailable),
                DevicePosition::Available(position) => {
                    if distance_meters(position, data.location.position)
                        <= data.location.radius_meters
                    {
                        return Err(CheckOutError::MinimumDistanceNotReached);
                    }
                }
            }
        }
        Ok(())
    }

    /// Check-out des aktiven Check-ins.
    ///
    /// Meldet das Backend `NotFound`, ist der Trace dort bereits geschlossen;
    /// das gilt als Erfolg. Alle anderen Netzwerkfehler lassen den lokalen
    /// Zustand unverändert.
    pub fn check_out(&self, options: CheckOutOptions) -> Result<(), TraceCoreError> {
        self.ensure_loaded()?;
        let data = match &*self.lock_state() {
            ProtocolState::CheckedIn(data) => data.clone(),
            _ => return Err(CheckOutError::NotCheckedIn.into()),
        };

        self.check_out_preconditions(&data, &options)
            .map_err(TraceCoreError::from)?;

        match self.network.submit_check_out(&data.trace_id) {
            Ok(()) => {}
            Err(crate::network::NetworkError::NotFound) => {
                debug!("backend no longer knows the trace, treating check-out as done");
            }
            Err(e) => return Err(e.into()),
        }

        info!(location = %data.location.name, "checked out");
        self.finish_check_in(&data)
    }

    /// Reicht verschlüsselte Zusatz-Eigenschaften zum aktiven Check-in nach,
    /// verschlüsselt unter dem Public Key des Standort-Betreibers.
    pub fn upload_additional_data<T: serde::Serialize>(
        &self,
        properties: &T,
    ) -> Result<(), TraceCoreError> {
        self.ensure_loaded()?;
        let data = match &*self.lock_state() {
            ProtocolState::CheckedIn(data) => data.clone(),
            _ => return Err(CheckInError::NotCheckedIn.into()),
        };

        let owner_key = decode_point(&data.location.owner_public_key)?;
        let plaintext = crate::services::utils::to_canonical_json(properties)?;

        let ephemeral = EphemeralKeyPair::generate();
        let envelope = ecies::encrypt(plaintext.as_bytes(), &ephemeral, &owner_key)?;

        self.network.post_additional_data(&AdditionalDataRequest {
            trace_id: data.trace_id,
            encrypted_properties: envelope.ciphertext,
            mac: envelope.mac,
            iv: envelope.iv,
            ephemeral_public_key: ephemeral.compressed_public_key(),
        })?;
        Ok(())
    }

    /// Entsorgt Trace-IDs und Schlüsselpaare, die weder vom aktiven Check-in
    /// noch vom Archiv innerhalb der Aufbewahrungsfrist referenziert werden.
    pub fn prune_unused_trace_data(&self) -> Result<(), TraceCoreError> {
        self.ensure_loaded()?;

        let oldest = self.clock.now_millis().saturating_sub(ARCHIVE_RETENTION_MS);
        let mut archive = self.load_archive()?;
        archive.retain(|entry| entry.timestamp_ms >= oldest);
        self.storage.persist(ARCHIVE_KEY, &serde_json::to_vec(&archive)?)?;

        let mut referenced: Vec<TraceId> =
            archive.iter().map(|entry| entry.trace_id).collect();
        match &*self.lock_state() {
            ProtocolState::CheckedIn(data)
            | ProtocolState::AwaitingConfirmation { data, .. } => {
                referenced.push(data.trace_id);
            }
            ProtocolState::NotCheckedIn => {}
        }
        // Unreferenzierte, aber noch junge IDs bleiben erhalten: sie könnten
        // zu einem gerade angezeigten, noch nicht gescannten QR-Code gehören.
        referenced.extend(self.trace_ids.recent_trace_ids(2 * MINUTE_MS)?);

        self.trace_ids.prune_unused(&referenced)
    }

    /// Startet den Hintergrund-Abgleich mit dem Backend.
    ///
    /// Transport-Fehler werden gemäß der Policy wiederholt; alle anderen
    /// Fehler werden geloggt und beenden die Schleife nicht. Der Handle
    /// stoppt den Thread kooperativ.
    pub fn start_status_polling(
        self: &Arc<Self>,
        interval: Duration,
        policy: RetryPolicy,
    ) -> PollingHandle {
        let manager = Arc::clone(self);
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let stop_for_thread = Arc::clone(&stop);

        let thread = std::thread::spawn(move || {
            let (flag, condvar) = &*stop_for_thread;
            let mut failed_attempts: u32 = 0;
            loop {
                let wait = if failed_attempts > 0 { policy.delay } else { interval };
                let guard = flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                let (guard, _) = condvar
                    .wait_timeout(guard, wait)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if *guard {
                    break;
                }
                drop(guard);

                match manager.poll_backend_status() {
                    Ok(_) => failed_attempts = 0,
                    Err(TraceCoreError::Network(e)) if e.is_retryable() => {
                        failed_attempts += 1;
                        if !policy.should_retry(failed_attempts) {
                            warn!(error = %e, "status polling gave up after repeated transport failures");
                            failed_attempts = 0;
                        } else {
                            debug!(error = %e, attempt = failed_attempts, "status polling will retry");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "status polling failed");
                        failed_attempts = 0;
                    }
                }
            }
        });

        PollingHandle {
            stop,
            thread: Some(thread),
        }
    }
}

/// Handle auf den Polling-Thread; stoppt kooperativ, spätestens beim Drop.
pub struct PollingHandle {
    stop: Arc<(Mutex<bool>, Condvar)>,
    thread: Option<JoinHandle<()>>,
}

impl PollingHandle {
    /// Signalisiert dem Thread zu stoppen und wartet auf sein Ende.
    pub fn stop(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        let (flag, condvar) = &*self.stop;
        *flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        condvar.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PollingHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
