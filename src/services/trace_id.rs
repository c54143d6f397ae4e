//! # src/services/trace_id.rs
//!
//! Leitet zeitgebundene, unverknüpfbare Trace-IDs aus dem Tages-Secret ab und
//! pflegt die persistierte Liste der erzeugten IDs samt der zugehörigen
//! ephemeren Schlüsselpaare im Keystore.

use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::TraceCoreError;
use crate::keystore::{Keystore, StoredKeyPair};
use crate::models::check_in::{TraceId, TraceIdList, TraceIdWrapper};
use crate::services::crypto_utils::hmac_sha256;
use crate::services::secret_store::TracingSecretStore;
use crate::services::sync_utils::SingleFlight;
use crate::services::utils::{round_to_minute_ms, Clock};
use crate::storage::Storage;

/// Speicher-Schlüssel der persistierten Trace-ID-Liste.
const TRACE_ID_LIST_KEY: &str = "tracing.trace_ids";

/// Länge der gekürzten Trace-ID.
pub const TRACE_ID_LEN: usize = 16;

/// Der Keystore-Alias des ephemeren Schlüsselpaars einer Trace-ID.
pub fn key_pair_alias(trace_id: &TraceId) -> String {
    BASE64.encode(trace_id)
}

/// Berechnet die Trace-ID für `(user_id, minute_timestamp_ms)`.
///
/// Vertrag: `minute_timestamp_ms` ist vom Aufrufer bereits auf die Minute
/// abgerundet; die Funktion rundet nicht erneut. Das Ergebnis sind die ersten
/// 16 Bytes von `HMAC-SHA256(Tages-Secret, user_id ‖ minute_timestamp_le)`.
pub fn generate_trace_id(
    secret_store: &TracingSecretStore,
    user_id: &[u8; 16],
    minute_timestamp_ms: u64,
) -> Result<TraceId, TraceCoreError> {
    let secret = secret_store.get_secret_for_day(minute_timestamp_ms)?;

    let mut message = [0u8; 24];
    message[..16].copy_from_slice(user_id);
    message[16..].copy_from_slice(&minute_timestamp_ms.to_le_bytes());

    let digest = hmac_sha256(secret.secret.as_slice(), &message);
    let mut trace_id = [0u8; TRACE_ID_LEN];
    trace_id.copy_from_slice(&digest[..TRACE_ID_LEN]);
    Ok(trace_id)
}

/// Verwaltet die Trace-ID-Historie eines Nutzers.
///
/// Die persistierte Liste ist die Quelle der Wahrheit; die In-Memory-Kopie
/// ist ein Cache, der in derselben Operation durchgeschrieben wird.
pub struct TraceIdGenerator {
    secret_store: Arc<TracingSecretStore>,
    keystore: Arc<dyn Keystore>,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    list: Mutex<TraceIdList>,
    load_flight: SingleFlight<()>,
}

impl TraceIdGenerator {
    pub fn new(
        secret_store: Arc<TracingSecretStore>,
        keystore: Arc<dyn Keystore>,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            secret_store,
            keystore,
            storage,
            clock,
            list: Mutex::new(TraceIdList::default()),
            load_flight: SingleFlight::new(),
        }
    }

    /// Lädt die persistierte Liste genau einmal in den Cache.
    fn ensure_loaded(&self) -> Result<(), TraceCoreError> {
        self.load_flight.get_or_try_init(|| {
            let restored = match self.storage.restore(TRACE_ID_LIST_KEY)? {
                Some(bytes) => serde_json::from_slice(&bytes)?,
                None => TraceIdList::default(),
            };
            *self.lock_list() = restored;
            Ok(())
        })
    }

    fn lock_list(&self) -> std::sync::MutexGuard<'_, TraceIdList> {
        self.list.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist_list(&self, list: &TraceIdList) -> Result<(), TraceCoreError> {
        let bytes = serde_json::to_vec(list)?;
        self.storage.persist(TRACE_ID_LIST_KEY, &bytes)?;
        Ok(())
    }

    /// Liefert den Wrapper für die aktuelle Minute; erzeugt und persistiert
    /// ihn bei Bedarf, inklusive des ephemeren Schlüsselpaars im Keystore.
    ///
    /// Für dieselbe Minute entsteht kein Duplikat; da die ID deterministisch
    /// ist, ist "last writer wins" bei einem Rennen unkritisch.
    pub fn get_or_create_wrapper(
        &self,
        user_id: &[u8; 16],
    ) -> Result<TraceIdWrapper, TraceCoreError> {
        self.ensure_loaded()?;
        let minute_ms = round_to_minute_ms(self.clock.now_millis());

        if let Some(existing) = self
            .lock_list()
            .wrappers
            .iter()
            .find(|w| w.timestamp_ms == minute_ms)
            .cloned()
        {
            return Ok(existing);
        }

        let trace_id = generate_trace_id(&self.secret_store, user_id, minute_ms)?;
        let alias = key_pair_alias(&trace_id);
        if !self.keystore.has_key_pair(&alias)? {
            self.keystore.generate_key_pair(&alias)?;
        }

        let wrapper = TraceIdWrapper {
            timestamp_ms: minute_ms,
            trace_id,
        };

        let mut list = self.lock_list();
        if !list.wrappers.iter().any(|w| w.timestamp_ms == minute_ms) {
            list.wrappers.push(wrapper.clone());
        }
        let snapshot = list.clone();
        drop(list);
        self.persist_list(&snapshot)?;

        Ok(wrapper)
    }

    /// Liefert das ephemere Schlüsselpaar zu einer Trace-ID.
    pub fn key_pair_for(&self, trace_id: &TraceId) -> Result<StoredKeyPair, TraceCoreError> {
        Ok(self.keystore.get_key_pair(&key_pair_alias(trace_id))?)
    }

    /// Liefert alle Trace-IDs, die in den letzten `duration_ms` erzeugt wurden.
    pub fn recent_trace_ids(&self, duration_ms: u64) -> Result<Vec<TraceId>, TraceCoreError> {
        self.ensure_loaded()?;
        let oldest = self.clock.now_millis().saturating_sub(duration_ms);
        Ok(self
            .lock_list()
            .wrappers
            .iter()
            .filter(|w| w.timestamp_ms >= oldest)
            .map(|w| w.trace_id)
            .collect())
    }

    /// Entfernt Wrapper und ephemere Schlüsselpaare, deren Trace-ID in keinem
    /// aktiven oder archivierten Check-in mehr referenziert ist.
    ///
    /// Läuft periodisch; Atomarität ist nicht sicherheitskritisch.
    pub fn prune_unused(&self, referenced: &[TraceId]) -> Result<(), TraceCoreError> {
        self.ensure_loaded()?;

        let mut list = self.lock_list();
        let (kept, removed): (Vec<_>, Vec<_>) = list
            .wrappers
            .drain(..)
            .partition(|w| referenced.contains(&w.trace_id));
        list.wrappers = kept;
        let snapshot = list.clone();
        drop(list);

        self.persist_list(&snapshot)?;
        for wrapper in removed {
            self.keystore.delete_key_pair(&key_pair_alias(&wrapper.trace_id))?;
        }
        Ok(())
    }
}
