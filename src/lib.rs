//! # trace-core
//!
//! Der kryptographische Kern eines Check-in- und Nachweis-Clients für
//! Veranstaltungsorte: rotierende, unverknüpfbare Trace-IDs, ECIES-
//! verschlüsselte Check-in-Payloads, eine Provider-Kette zur Verifikation
//! signierter Gesundheitsnachweise sowie die Gültigkeits-Engine für
//! Tests, Impfungen und Genesungen.
//!
//! Die Bibliothek ist bewusst frei von Transport und UI: Netzwerk,
//! Schlüsselspeicher, opaker Key/Value-Speicher und Uhrzeit sind Traits,
//! die der einbettende Client implementiert.

pub mod error;
pub mod keystore;
pub mod models;
pub mod network;
pub mod services;
pub mod storage;

pub use error::TraceCoreError;
pub use keystore::{Keystore, KeystoreError, SoftwareKeystore, StoredKeyPair};
pub use models::check_in::{
    CheckInData, CheckOutOptions, DevicePosition, GeoPosition, Location, TraceId, TraceIdWrapper,
};
pub use models::document::{
    Document, DocumentHistoryAction, DocumentHistoryEntry, DocumentOutcome, DocumentStore,
    DocumentType, Procedure, ProcedureType,
};
pub use models::key_bundle::{DocumentKeyBundle, KeyBundleEntry};
pub use network::{
    AdditionalDataRequest, CheckInRequest, DailyPublicKey, NetworkClient, NetworkError,
    ScannerInfo,
};
pub use services::check_in_manager::{
    CheckInError, CheckInManager, CheckOutError, PollingHandle, ProtocolState,
};
pub use services::document_manager::{DocumentManager, DocumentManagerConfig};
pub use services::document_providers::{
    DocumentError, DocumentProvider, ProviderContext, RegisteredName, VerificationFailureReason,
};
pub use services::qr_codec::QrCodePayload;
pub use services::secret_store::TracingSecretStore;
pub use services::trace_id::TraceIdGenerator;
pub use services::utils::{Clock, SystemClock};
pub use storage::{MemoryStorage, Storage, StorageError};
