//! # src/services/sync_utils.rs
//!
//! Nebenläufigkeits-Bausteine der Bibliothek: einmalige, teure Initialisierung
//! unter konkurrierenden Aufrufern ("single flight") sowie eine explizite
//! Retry-Policy für Netzwerk-Schleifen.
//!
//! Die Initialisierung ist als mutex-geschützter Zustandsautomat
//! `{Uninitialized, InProgress, Ready}` mit einer Condvar umgesetzt:
//! Konkurrierende Aufrufer warten auf denselben Abschluss, statt die
//! Initialisierung zu wiederholen. Schlägt der Initialisierer fehl, fällt der
//! Zustand auf `Uninitialized` zurück, damit ein späterer Aufrufer erneut
//! versuchen kann.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

enum FlightState<T> {
    Uninitialized,
    InProgress,
    Ready(T),
}

/// Garantiert, dass ein teurer Initialisierer höchstens einmal erfolgreich
/// ausgeführt wird, auch wenn mehrere Threads gleichzeitig anfragen.
pub struct SingleFlight<T> {
    state: Mutex<FlightState<T>>,
    condvar: Condvar,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FlightState::Uninitialized),
            condvar: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FlightState<T>> {
        // Ein vergifteter Mutex enthält hier nie inkonsistente Daten: der
        // Zustand wird nur in abgeschlossenen Schritten gesetzt.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Liefert den initialisierten Wert oder führt `init` aus.
    ///
    /// Läuft bereits eine Initialisierung, blockiert der Aufrufer bis zu deren
    /// Abschluss und erhält das geteilte Ergebnis. Ein Fehler des
    /// Initialisierers wird nur dem auslösenden Aufrufer gemeldet; wartende
    /// Aufrufer starten danach einen eigenen Versuch.
    pub fn get_or_try_init<E>(
        &self,
        init: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        let mut state = self.lock();
        loop {
            match &*state {
                FlightState::Ready(value) => return Ok(value.clone()),
                FlightState::Uninitialized => {
                    *state = FlightState::InProgress;
                    break;
                }
                FlightState::InProgress => {
                    state = self
                        .condvar
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
        }
        drop(state);

        let result = init();

        let mut state = self.lock();
        match &result {
            Ok(value) => *state = FlightState::Ready(value.clone()),
            Err(_) => *state = FlightState::Uninitialized,
        }
        drop(state);
        self.condvar.notify_all();

        result
    }

    /// Liefert den Wert, falls die Initialisierung bereits abgeschlossen ist.
    pub fn get(&self) -> Option<T> {
        match &*self.lock() {
            FlightState::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }
}

/// Wie [`SingleFlight`], aber mit einem Wert pro Schlüssel.
///
/// Wird vom Tracing-Secret-Store verwendet, um pro Kalendertag genau ein
/// Secret zu erzeugen, auch unter konkurrierenden Aufrufern.
pub struct SingleFlightMap<K, V> {
    states: Mutex<HashMap<K, FlightState<V>>>,
    condvar: Condvar,
}

impl<K: Eq + Hash + Clone, V: Clone> Default for SingleFlightMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> SingleFlightMap<K, V> {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            condvar: Condvar::new(),
        }
    }

    /// Liefert den Wert für `key` oder führt `init` genau einmal aus.
    pub fn get_or_try_init<E>(
        &self,
        key: &K,
        init: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        let mut states = self
            .states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            match states.get(key) {
                Some(FlightState::Ready(value)) => return Ok(value.clone()),
                Some(FlightState::InProgress) => {
                    states = self
                        .condvar
                        .wait(states)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some(FlightState::Uninitialized) | None => {
                    states.insert(key.clone(), FlightState::InProgress);
                    break;
                }
            }
        }
        drop(states);

        let result = init();

        let mut states = self
            .states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match &result {
            Ok(value) => {
                states.insert(key.clone(), FlightState::Ready(value.clone()));
            }
            Err(_) => {
                states.remove(key);
            }
        }
        drop(states);
        self.condvar.notify_all();

        result
    }
}

/// Explizite Retry-Policy für Netzwerk-Operationen in Hintergrund-Schleifen.
///
/// `max_attempts = None` bedeutet "bis zur externen Cancellation", nie
/// unbegrenzt ohne Abbruchmöglichkeit. Kryptographie- und
/// Validierungsfehler werden grundsätzlich nicht wiederholt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximale Anzahl Versuche; `None` heißt: nur durch Cancellation begrenzt.
    pub max_attempts: Option<u32>,
    /// Feste Wartezeit zwischen zwei Versuchen.
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            delay,
        }
    }

    /// Prüft, ob nach `attempts` fehlgeschlagenen Versuchen ein weiterer folgt.
    pub fn should_retry(&self, attempts: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts < max,
            None => true,
        }
    }
}
