//! Gemeinsame Test-Infrastruktur: deterministische Uhr, Mock-Backend und
//! Builder für signierte Dokumente und Schlüsselbündel.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::SecretKey;
use serde_cbor::Value;
use serde_json::json;

use trace_lib::models::check_in::{GeoPosition, Location, TraceId};
use trace_lib::models::key_bundle::DocumentKeyBundle;
use trace_lib::network::{
    AdditionalDataRequest, CheckInRequest, DailyPublicKey, NetworkClient, NetworkError,
    ScannerInfo,
};
use trace_lib::services::cose::{sig_structure_bytes, ALG_ES256, HEADER_ALG};
use trace_lib::services::crypto_utils::encode_compressed_point;
use trace_lib::services::utils::to_canonical_json;
use trace_lib::Clock;

/// Eine von Hand gestellte Uhr.
pub struct ManualClock {
    now_ms: Mutex<u64>,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: Mutex::new(now_ms),
        }
    }

    pub fn advance(&self, delta_ms: u64) {
        *self.now_ms.lock().unwrap() += delta_ms;
    }

    pub fn set(&self, now_ms: u64) {
        *self.now_ms.lock().unwrap() = now_ms;
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        *self.now_ms.lock().unwrap()
    }
}

/// Ein deterministischer P-256-Signierschlüssel aus einem Seed-Byte.
pub fn signing_key(seed: u8) -> SigningKey {
    let mut bytes = [seed; 32];
    // Letztes Byte variieren, damit auch seed=0 einen gültigen Skalar ergibt.
    bytes[31] = seed.wrapping_add(1);
    SigningKey::from_slice(&bytes).expect("seed yields a valid scalar")
}

/// Ein deterministischer P-256-Geheimschlüssel aus einem Seed-Byte.
pub fn secret_key(seed: u8) -> SecretKey {
    let mut bytes = [seed; 32];
    bytes[31] = seed.wrapping_add(1);
    SecretKey::from_slice(&bytes).expect("seed yields a valid scalar")
}

/// Ein steuerbares In-Memory-Backend.
#[derive(Default)]
pub struct MockNetwork {
    pub daily_key: Mutex<Option<DailyPublicKey>>,
    pub scanners: Mutex<HashMap<String, ScannerInfo>>,
    pub open_traces: Mutex<Vec<TraceId>>,
    pub check_ins: Mutex<Vec<CheckInRequest>>,
    pub check_outs: Mutex<Vec<TraceId>>,
    pub additional_data: Mutex<Vec<AdditionalDataRequest>>,
    pub key_bundle_bytes: Mutex<Option<Vec<u8>>>,
    pub redeemed: Mutex<Vec<([u8; 32], Vec<u8>)>>,
    pub unredeemed: Mutex<Vec<[u8; 32]>>,
    /// Simuliert einen Transport-Ausfall für alle Anfragen.
    pub offline: Mutex<bool>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn check_online(&self) -> Result<(), NetworkError> {
        if *self.offline.lock().unwrap() {
            Err(NetworkError::Unavailable("simulated outage".to_string()))
        } else {
            Ok(())
        }
    }

    /// Markiert alle eingereichten Check-ins als beim Backend offen.
    pub fn confirm_submitted_check_ins(&self) {
        let mut open = self.open_traces.lock().unwrap();
        for request in self.check_ins.lock().unwrap().iter() {
            if !open.contains(&request.trace_id) {
                open.push(request.trace_id);
            }
        }
    }

    /// Schließt einen Trace backend-seitig (remote Check-out).
    pub fn close_trace(&self, trace_id: &TraceId) {
        self.open_traces.lock().unwrap().retain(|t| t != trace_id);
    }
}

impl NetworkClient for MockNetwork {
    fn fetch_daily_key(&self) -> Result<DailyPublicKey, NetworkError> {
        self.check_online()?;
        self.daily_key
            .lock()
            .unwrap()
            .clone()
            .ok_or(NetworkError::NotFound)
    }

    fn fetch_scanner(&self, scanner_id: &str) -> Result<ScannerInfo, NetworkError> {
        self.check_online()?;
        self.scanners
            .lock()
            .unwrap()
            .get(scanner_id)
            .cloned()
            .ok_or(NetworkError::NotFound)
    }

    fn submit_check_in(&self, request: &CheckInRequest) -> Result<(), NetworkError> {
        self.check_online()?;
        self.check_ins.lock().unwrap().push(request.clone());
        Ok(())
    }

    fn submit_check_out(&self, trace_id: &TraceId) -> Result<(), NetworkError> {
        self.check_online()?;
        let mut open = self.open_traces.lock().unwrap();
        if !open.contains(trace_id) {
            return Err(NetworkError::NotFound);
        }
        open.retain(|t| t != trace_id);
        self.check_outs.lock().unwrap().push(*trace_id);
        Ok(())
    }

    fn fetch_open_traces(&self, trace_ids: &[TraceId]) -> Result<Vec<TraceId>, NetworkError> {
        self.check_online()?;
        let open = self.open_traces.lock().unwrap();
        Ok(trace_ids
            .iter()
            .filter(|t| open.contains(t))
            .copied()
            .collect())
    }

    fn post_additional_data(&self, request: &AdditionalDataRequest) -> Result<(), NetworkError> {
        self.check_online()?;
        self.additional_data.lock().unwrap().push(request.clone());
        Ok(())
    }

    fn fetch_key_bundle(&self) -> Result<Vec<u8>, NetworkError> {
        self.check_online()?;
        self.key_bundle_bytes
            .lock()
            .unwrap()
            .clone()
            .ok_or(NetworkError::NotFound)
    }

    fn redeem_document(&self, hash: &[u8; 32], tag: &[u8]) -> Result<(), NetworkError> {
        self.check_online()?;
        self.redeemed.lock().unwrap().push((*hash, tag.to_vec()));
        Ok(())
    }

    fn unredeem_document(&self, hash: &[u8; 32]) -> Result<(), NetworkError> {
        self.check_online()?;
        self.unredeemed.lock().unwrap().push(*hash);
        Ok(())
    }
}

/// Ein Standort mit frei wählbaren Check-out-Regeln.
pub fn location(minimum_duration_ms: u64, radius_meters: f64, owner_secret: &SecretKey) -> Location {
    Location {
        location_id: "loc-1".to_string(),
        name: "Testhalle".to_string(),
        position: GeoPosition {
            latitude: 52.5200,
            longitude: 13.4050,
        },
        radius_meters,
        minimum_duration_ms,
        average_check_in_duration_ms: 90 * 60 * 1000,
        is_private_meeting: false,
        is_contact_data_mandatory: true,
        owner_public_key: encode_compressed_point(&owner_secret.public_key()).to_vec(),
    }
}

/// Baut eine signierte `COSE_Sign1`-Nachricht über den Payload.
pub fn cose_sign1(signing_key: &SigningKey, payload: &[u8]) -> Vec<u8> {
    let protected = serde_cbor::to_vec(&Value::Map(
        [(Value::Integer(HEADER_ALG), Value::Integer(ALG_ES256))]
            .into_iter()
            .collect(),
    ))
    .unwrap();
    let message = sig_structure_bytes(&protected, payload).unwrap();
    let signature: Signature = signing_key.sign(&message);

    serde_cbor::to_vec(&Value::Array(vec![
        Value::Bytes(protected),
        Value::Map(Default::default()),
        Value::Bytes(payload.to_vec()),
        Value::Bytes(signature.to_bytes().to_vec()),
    ]))
    .unwrap()
}

/// Baut ein signiertes Schlüsselbündel, wie es `fetch_key_bundle` liefert.
pub fn signed_key_bundle(signer: &SigningKey, bundle: &DocumentKeyBundle) -> Vec<u8> {
    cose_sign1(signer, &serde_cbor::to_vec(bundle).unwrap())
}

/// Baut einen signierten Laborbefund (Base64-JSON mit Signatur-Feld).
pub fn signed_lab_result(
    issuer: &SigningKey,
    result_type: &str,
    outcome: &str,
    testing_timestamp_ms: u64,
    result_timestamp_ms: u64,
    first_name: &str,
    last_name: &str,
) -> String {
    let mut record = json!({
        "type": result_type,
        "outcome": outcome,
        "testingTimestamp": testing_timestamp_ms,
        "resultTimestamp": result_timestamp_ms,
        "firstName": first_name,
        "lastName": last_name,
    });
    let canonical = to_canonical_json(&record).unwrap();
    let signature: Signature = issuer.sign(canonical.as_bytes());
    record["signature"] = json!(BASE64.encode(signature.to_bytes()));
    BASE64.encode(serde_json::to_vec(&record).unwrap())
}

fn cbor_text_map(entries: Vec<(&str, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(key, value)| (Value::Text(key.to_string()), value))
            .collect(),
    )
}

fn cbor_int_map(entries: Vec<(i128, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(key, value)| (Value::Integer(key), value))
            .collect(),
    )
}

/// Baut ein signiertes Impfzertifikat (`DGC1:` + Base64-COSE).
///
/// `doses` sind `(dose_number, total_doses, timestamp_seconds)`-Tripel.
pub fn vaccination_certificate(
    signer: &SigningKey,
    issued_at_seconds: u64,
    first_name: &str,
    last_name: &str,
    doses: &[(u64, u64, u64)],
) -> String {
    let entries: Vec<Value> = doses
        .iter()
        .map(|(dn, sd, ts)| {
            cbor_text_map(vec![
                ("dn", Value::Integer(*dn as i128)),
                ("sd", Value::Integer(*sd as i128)),
                ("ts", Value::Integer(*ts as i128)),
            ])
        })
        .collect();
    let hcert = cbor_text_map(vec![
        (
            "nam",
            cbor_text_map(vec![
                ("gn", Value::Text(first_name.to_string())),
                ("fn", Value::Text(last_name.to_string())),
            ]),
        ),
        ("v", Value::Array(entries)),
    ]);
    let claims = cbor_int_map(vec![
        (1, Value::Text("DE".to_string())),
        (6, Value::Integer(issued_at_seconds as i128)),
        (-260, cbor_int_map(vec![(1, hcert)])),
    ]);
    let payload = serde_cbor::to_vec(&claims).unwrap();
    format!("DGC1:{}", BASE64.encode(cose_sign1(signer, &payload)))
}
