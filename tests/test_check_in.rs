//! Integrationstests für den Check-in-Lebenszyklus: QR-Payload, doppelter
//! ECIES-Umschlag, Bestätigung durch das Backend, Check-out-Vorbedingungen
//! und das Entsorgen nicht mehr referenzierter Trace-Daten.

mod common;

use std::sync::Arc;

use p256::SecretKey;
use serde_json::json;

use common::{location, secret_key, ManualClock, MockNetwork};
use trace_lib::models::check_in::{CheckOutOptions, DevicePosition, GeoPosition};
use trace_lib::network::{DailyPublicKey, ScannerInfo};
use trace_lib::services::crypto_utils::sha256;
use trace_lib::services::ecies::{self, EciesEnvelope};
use trace_lib::services::qr_codec::{compute_verification_tag, QR_PAYLOAD_VERSION};
use trace_lib::services::trace_id::key_pair_alias;
use trace_lib::{
    CheckInError, CheckInManager, CheckOutError, Clock, Keystore, MemoryStorage, NetworkClient,
    ProtocolState, QrCodePayload, SoftwareKeystore, Storage, TraceCoreError, TraceIdGenerator,
    TracingSecretStore,
};

const START_MS: u64 = 1_700_000_000_000;

struct Stack {
    manager: Arc<CheckInManager>,
    keystore: Arc<SoftwareKeystore>,
    storage: Arc<MemoryStorage>,
    clock: Arc<ManualClock>,
    network: Arc<MockNetwork>,
    trace_ids: Arc<TraceIdGenerator>,
    daily_secret: SecretKey,
    scanner_secret: SecretKey,
    owner_secret: SecretKey,
}

fn stack(minimum_duration_ms: u64, radius_meters: f64) -> Stack {
    let clock = Arc::new(ManualClock::new(START_MS));
    let keystore = Arc::new(SoftwareKeystore::new());
    let storage = Arc::new(MemoryStorage::new());
    let network = MockNetwork::new();

    let daily_secret = secret_key(10);
    *network.daily_key.lock().unwrap() = Some(DailyPublicKey {
        key_id: 7,
        public_key: daily_secret.public_key(),
    });

    let scanner_secret = secret_key(11);
    let owner_secret = secret_key(12);
    network.scanners.lock().unwrap().insert(
        "scanner-1".to_string(),
        ScannerInfo {
            scanner_id: "scanner-1".to_string(),
            public_key: scanner_secret.public_key(),
            location: location(minimum_duration_ms, radius_meters, &owner_secret),
        },
    );

    let secret_store = Arc::new(TracingSecretStore::new(
        Arc::clone(&keystore) as Arc<dyn Keystore>,
        Arc::clone(&storage) as Arc<dyn Storage>,
        Arc::clone(&clock) as Arc<dyn Clock>,
    ));
    let trace_ids = Arc::new(TraceIdGenerator::new(
        secret_store,
        Arc::clone(&keystore) as Arc<dyn Keystore>,
        Arc::clone(&storage) as Arc<dyn Storage>,
        Arc::clone(&clock) as Arc<dyn Clock>,
    ));
    let manager = Arc::new(CheckInManager::new(
        Arc::clone(&network) as Arc<dyn NetworkClient>,
        Arc::clone(&keystore) as Arc<dyn Keystore>,
        Arc::clone(&storage) as Arc<dyn Storage>,
        Arc::clone(&clock) as Arc<dyn Clock>,
        Arc::clone(&trace_ids),
    ));

    Stack {
        manager,
        keystore,
        storage,
        clock,
        network,
        trace_ids,
        daily_secret,
        scanner_secret,
        owner_secret,
    }
}

/// Rekonstruiert die deterministische ECIES-IV aus dem ephemeren Punkt.
fn derived_iv(compressed_ephemeral: &[u8; 33]) -> [u8; 12] {
    let digest = sha256(compressed_ephemeral);
    let mut iv = [0u8; 12];
    iv.copy_from_slice(&digest[..12]);
    iv
}

fn checked_in_stack(minimum_duration_ms: u64, radius_meters: f64) -> (Stack, String) {
    let stack = stack(minimum_duration_ms, radius_meters);
    let payload = stack.manager.generate_qr_payload(1, 0, false).unwrap();
    stack.manager.check_in("scanner-1", &payload).unwrap();
    stack.network.confirm_submitted_check_ins();
    assert!(matches!(
        stack.manager.poll_backend_status().unwrap(),
        ProtocolState::CheckedIn(_)
    ));
    (stack, payload)
}

#[test]
fn daily_key_holder_can_decrypt_qr_payload() {
    let stack = stack(0, 0.0);
    let encoded = stack.manager.generate_qr_payload(1, 0b101, false).unwrap();

    let payload = QrCodePayload::from_base32(&encoded).unwrap();
    assert_eq!(payload.version, QR_PAYLOAD_VERSION);
    assert_eq!(payload.key_id, 7);
    assert_eq!(payload.entry_policy, 0b101);
    assert_eq!(payload.encrypted_data.len(), 48);
    // Minutengenau gerundeter Zeitstempel in Sekunden.
    assert_eq!(payload.timestamp as u64 * 1000, START_MS - (START_MS % 60_000));

    // Das Gesundheitsamt entschlüsselt mit dem Tages-Geheimschlüssel.
    let ephemeral_public =
        p256::PublicKey::from_sec1_bytes(&payload.ephemeral_public_key).unwrap();
    let envelope = EciesEnvelope {
        ciphertext: payload.encrypted_data[..32].to_vec(),
        mac: payload.encrypted_data[32..].try_into().unwrap(),
        iv: derived_iv(&payload.ephemeral_public_key),
    };
    let plaintext = ecies::decrypt(&envelope, &stack.daily_secret, &ephemeral_public).unwrap();
    assert_eq!(plaintext.len(), 32);

    // Das Verification-Tag ist mit dem enthaltenen Daten-Secret prüfbar.
    let data_secret = &plaintext[16..];
    let expected =
        compute_verification_tag(data_secret, payload.timestamp, &payload.encrypted_data)
            .unwrap();
    assert_eq!(expected, payload.verification_tag);
}

#[test]
fn anonymous_payload_carries_no_encrypted_block() {
    let stack = stack(0, 0.0);
    let full = QrCodePayload::from_base32(
        &stack.manager.generate_qr_payload(1, 0, false).unwrap(),
    )
    .unwrap();
    let anonymous = QrCodePayload::from_base32(
        &stack.manager.generate_qr_payload(1, 0, true).unwrap(),
    )
    .unwrap();

    assert!(anonymous.encrypted_data.is_empty());
    // Gleiche Minute, gleiche Trace-ID: die Anonymität liegt im Datenblock.
    assert_eq!(anonymous.trace_id, full.trace_id);
}

#[test]
fn check_in_submits_doubly_wrapped_payload() {
    let stack = stack(0, 0.0);
    let encoded = stack.manager.generate_qr_payload(1, 0, false).unwrap();
    stack.manager.check_in("scanner-1", &encoded).unwrap();

    let requests = stack.network.check_ins.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    // Der Scanner entpackt den äußeren Umschlag und erhält den QR-Payload.
    let ephemeral_public =
        p256::PublicKey::from_sec1_bytes(&request.ephemeral_public_key).unwrap();
    let envelope = EciesEnvelope {
        ciphertext: request.encrypted_payload.clone(),
        mac: request.mac,
        iv: request.iv,
    };
    let inner = ecies::decrypt(&envelope, &stack.scanner_secret, &ephemeral_public).unwrap();
    assert_eq!(inner, QrCodePayload::from_base32(&encoded).unwrap().encode());
    assert_eq!(request.trace_id, QrCodePayload::from_base32(&encoded).unwrap().trace_id);
}

#[test]
fn second_check_in_is_rejected_while_active() {
    let stack = stack(0, 0.0);
    let encoded = stack.manager.generate_qr_payload(1, 0, false).unwrap();
    stack.manager.check_in("scanner-1", &encoded).unwrap();

    assert!(matches!(
        stack.manager.check_in("scanner-1", &encoded),
        Err(TraceCoreError::CheckIn(CheckInError::AlreadyActive))
    ));
}

#[test]
fn confirmation_times_out() {
    let stack = stack(0, 0.0);
    let encoded = stack.manager.generate_qr_payload(1, 0, false).unwrap();
    stack.manager.check_in("scanner-1", &encoded).unwrap();

    // Keine Bestätigung durch das Backend; vor dem Timeout bleibt der
    // Zustand unbestätigt, danach verfällt die Einreichung.
    assert!(matches!(
        stack.manager.poll_backend_status().unwrap(),
        ProtocolState::AwaitingConfirmation { .. }
    ));
    stack.clock.advance(5 * 60_000);
    assert_eq!(
        stack.manager.poll_backend_status().unwrap(),
        ProtocolState::NotCheckedIn
    );
}

#[test]
fn confirmed_check_in_survives_restart() {
    let (stack, _) = checked_in_stack(0, 0.0);

    let restarted = CheckInManager::new(
        Arc::clone(&stack.network) as Arc<dyn NetworkClient>,
        Arc::clone(&stack.keystore) as Arc<dyn Keystore>,
        Arc::clone(&stack.storage) as Arc<dyn Storage>,
        Arc::clone(&stack.clock) as Arc<dyn Clock>,
        Arc::clone(&stack.trace_ids),
    );
    assert!(matches!(
        restarted.state().unwrap(),
        ProtocolState::CheckedIn(_)
    ));
}

#[test]
fn minimum_duration_blocks_early_check_out() {
    let (stack, _) = checked_in_stack(120_000, 0.0);

    match stack.manager.check_out(CheckOutOptions::default()) {
        Err(TraceCoreError::CheckOut(CheckOutError::MinimumDurationNotReached {
            remaining_ms,
        })) => assert!(remaining_ms > 0 && remaining_ms <= 120_000),
        other => panic!("expected minimum duration error, got {other:?}"),
    }

    stack.clock.advance(120_000);
    stack.manager.check_out(CheckOutOptions::default()).unwrap();
    assert_eq!(stack.manager.state().unwrap(), ProtocolState::NotCheckedIn);
    assert_eq!(stack.network.check_outs.lock().unwrap().len(), 1);
}

#[test]
fn geofence_preconditions_are_enforced() {
    let (stack, _) = checked_in_stack(0, 100.0);
    let venue = GeoPosition {
        latitude: 52.5200,
        longitude: 13.4050,
    };
    let far_away = GeoPosition {
        latitude: 48.1351,
        longitude: 11.5820,
    };

    let attempt = |position: DevicePosition| {
        stack.manager.check_out(CheckOutOptions {
            skip_minimum_duration: false,
            skip_minimum_distance: false,
            position,
        })
    };

    assert!(matches!(
        attempt(DevicePosition::PermissionMissing),
        Err(TraceCoreError::CheckOut(CheckOutError::MissingPermission))
    ));
    assert!(matches!(
        attempt(DevicePosition::Unavailable),
        Err(TraceCoreError::CheckOut(CheckOutError::LocationUnavailable))
    ));
    assert!(matches!(
        attempt(DevicePosition::Available(venue)),
        Err(TraceCoreError::CheckOut(
            CheckOutError::MinimumDistanceNotReached
        ))
    ));

    attempt(DevicePosition::Available(far_away)).unwrap();
    assert_eq!(stack.manager.state().unwrap(), ProtocolState::NotCheckedIn);
}

#[test]
fn skip_flags_bypass_preconditions() {
    let (stack, _) = checked_in_stack(120_000, 100.0);

    stack
        .manager
        .check_out(CheckOutOptions {
            skip_minimum_duration: true,
            skip_minimum_distance: true,
            position: DevicePosition::Unavailable,
        })
        .unwrap();
    assert_eq!(stack.manager.state().unwrap(), ProtocolState::NotCheckedIn);
}

#[test]
fn backend_not_found_counts_as_checked_out() {
    let (stack, payload) = checked_in_stack(0, 0.0);
    let trace_id = QrCodePayload::from_base32(&payload).unwrap().trace_id;

    // Das Backend kennt den Trace nicht mehr; lokal trotzdem abschließen.
    stack.network.close_trace(&trace_id);
    stack.manager.check_out(CheckOutOptions::default()).unwrap();
    assert_eq!(stack.manager.state().unwrap(), ProtocolState::NotCheckedIn);
    assert!(stack.network.check_outs.lock().unwrap().is_empty());
}

#[test]
fn remote_check_out_is_detected_by_polling() {
    let (stack, payload) = checked_in_stack(0, 0.0);
    let trace_id = QrCodePayload::from_base32(&payload).unwrap().trace_id;

    stack.network.close_trace(&trace_id);
    assert_eq!(
        stack.manager.poll_backend_status().unwrap(),
        ProtocolState::NotCheckedIn
    );
    assert_eq!(stack.manager.state().unwrap(), ProtocolState::NotCheckedIn);
}

#[test]
fn transport_failure_leaves_state_untouched() {
    let (stack, _) = checked_in_stack(0, 0.0);

    *stack.network.offline.lock().unwrap() = true;
    assert!(stack.manager.check_out(CheckOutOptions::default()).is_err());
    *stack.network.offline.lock().unwrap() = false;
    assert!(matches!(
        stack.manager.state().unwrap(),
        ProtocolState::CheckedIn(_)
    ));
}

#[test]
fn additional_data_is_encrypted_for_the_owner() {
    let (stack, _) = checked_in_stack(0, 0.0);

    stack
        .manager
        .upload_additional_data(&json!({ "table": 4 }))
        .unwrap();

    let requests = stack.network.additional_data.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    let ephemeral_public =
        p256::PublicKey::from_sec1_bytes(&request.ephemeral_public_key).unwrap();
    let envelope = EciesEnvelope {
        ciphertext: request.encrypted_properties.clone(),
        mac: request.mac,
        iv: request.iv,
    };
    let plaintext = ecies::decrypt(&envelope, &stack.owner_secret, &ephemeral_public).unwrap();
    assert_eq!(plaintext, br#"{"table":4}"#);
}

#[test]
fn additional_data_requires_active_check_in() {
    let stack = stack(0, 0.0);
    assert!(matches!(
        stack.manager.upload_additional_data(&json!({ "table": 4 })),
        Err(TraceCoreError::CheckIn(CheckInError::NotCheckedIn))
    ));
}

#[test]
fn background_polling_confirms_and_detects_remote_check_out() {
    use std::time::{Duration, Instant};
    use trace_lib::services::sync_utils::RetryPolicy;

    let stack = stack(0, 0.0);
    let payload = stack.manager.generate_qr_payload(1, 0, false).unwrap();
    stack.manager.check_in("scanner-1", &payload).unwrap();
    stack.network.confirm_submitted_check_ins();

    let handle = stack
        .manager
        .start_status_polling(Duration::from_millis(10), RetryPolicy::new(3, Duration::from_millis(10)));

    let wait_for = |predicate: &dyn Fn(&ProtocolState) -> bool| {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if predicate(&stack.manager.state().unwrap()) {
                break;
            }
            assert!(Instant::now() < deadline, "polling did not converge");
            std::thread::sleep(Duration::from_millis(5));
        }
    };

    wait_for(&|state| matches!(state, ProtocolState::CheckedIn(_)));

    let trace_id = QrCodePayload::from_base32(&payload).unwrap().trace_id;
    stack.network.close_trace(&trace_id);
    wait_for(&|state| *state == ProtocolState::NotCheckedIn);

    handle.stop();
}

#[test]
fn prune_removes_key_pairs_after_retention() {
    let (stack, payload) = checked_in_stack(0, 0.0);
    let trace_id = QrCodePayload::from_base32(&payload).unwrap().trace_id;
    let alias = key_pair_alias(&trace_id);
    assert!(stack.keystore.has_key_pair(&alias).unwrap());

    stack.manager.check_out(CheckOutOptions::default()).unwrap();

    // Innerhalb der Aufbewahrungsfrist bleibt das Schlüsselpaar referenziert.
    stack.manager.prune_unused_trace_data().unwrap();
    assert!(stack.keystore.has_key_pair(&alias).unwrap());

    stack.clock.advance(29 * 24 * 60 * 60 * 1000);
    stack.manager.prune_unused_trace_data().unwrap();
    assert!(!stack.keystore.has_key_pair(&alias).unwrap());
    assert!(stack.trace_ids.recent_trace_ids(u64::MAX).unwrap().is_empty());
}
