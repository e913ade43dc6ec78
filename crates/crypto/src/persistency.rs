//! Node-side persistency: per-key state plus the per-transaction scratch.
//!
//! Everything here is process-local and in-memory; a restart forfeits
//! in-flight signings. Durable key custody is the wallet server's concern.

use crate::error::{CryptoError, CryptoResult};
use crate::provider::{
    Commitment, EddsaCommitment, EddsaR, MtaDelta, MtaRequest, MtaResponse, PartialSignature,
};
use mpc_types::{Algorithm, DEFAULT_TENANT_ID};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Metadata recorded alongside a stored share at the end of key generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMetadata {
    pub public_key: Vec<u8>,
    pub algorithm: Algorithm,
    pub player_ids: Vec<u64>,
    pub threshold: u32,
}

/// Auxiliary key material (Paillier modulus, ring-Pedersen parameters);
/// opaque to the control-plane.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuxiliaryKeys {
    pub paillier: Vec<u8>,
    pub ring_pedersen: Vec<u8>,
}

/// Per-key setup scratch, opaque bytes owned by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupData(pub Vec<u8>);

/// Contract the crypto provider consumes for per-key state.
pub trait KeyPersistency: Send + Sync {
    fn key_exist(&self, key_id: &str) -> bool;

    /// Fails `BadKey` if the key is absent.
    fn load_key(&self, key_id: &str) -> CryptoResult<(Algorithm, [u8; 32])>;

    /// Fails `BadKey` if absent or metadata was never set.
    fn load_key_metadata(&self, key_id: &str) -> CryptoResult<KeyMetadata>;

    /// Fails `BadKey` if absent or auxiliary keys were never set.
    fn load_auxiliary_keys(&self, key_id: &str) -> CryptoResult<AuxiliaryKeys>;

    /// `ttl` of 0 means no expiry; nonzero values are accepted and ignored
    /// by the in-memory store.
    fn store_key(
        &self,
        key_id: &str,
        algorithm: Algorithm,
        private_share: [u8; 32],
        ttl: u64,
    ) -> CryptoResult<()>;

    /// Fails `Internal` when metadata is already set and `allow_override`
    /// is false.
    fn store_key_metadata(
        &self,
        key_id: &str,
        metadata: KeyMetadata,
        allow_override: bool,
    ) -> CryptoResult<()>;

    fn store_auxiliary_keys(&self, key_id: &str, aux: AuxiliaryKeys) -> CryptoResult<()>;

    fn store_keyid_tenant_id(&self, key_id: &str, tenant_id: &str) -> CryptoResult<()>;

    /// Reverse lookup; `"default-tenant"` when the key was never bound.
    fn get_tenantid_from_keyid(&self, key_id: &str) -> String;

    fn store_setup_data(&self, key_id: &str, data: SetupData) -> CryptoResult<()>;

    /// Fails `BadKey` when no setup data exists.
    fn load_setup_data(&self, key_id: &str) -> CryptoResult<SetupData>;

    /// One-shot: fails `Internal` if commitments were already stored.
    fn store_setup_commitments(
        &self,
        key_id: &str,
        commitments: BTreeMap<u64, Commitment>,
    ) -> CryptoResult<()>;

    /// Fails `BadKey` when no commitments exist.
    fn load_setup_commitments(&self, key_id: &str) -> CryptoResult<BTreeMap<u64, Commitment>>;

    /// Erase setup scratch and commitments; with `delete_key` also the
    /// stored share, metadata, and auxiliary keys.
    fn delete_temporary_key_data(&self, key_id: &str, delete_key: bool) -> CryptoResult<()>;
}

#[derive(Debug, Clone)]
struct KeyEntry {
    algorithm: Algorithm,
    private_share: [u8; 32],
    metadata: Option<KeyMetadata>,
    aux_keys: Option<AuxiliaryKeys>,
}

/// In-memory [`KeyPersistency`] implementation.
#[derive(Default)]
pub struct InMemoryPersistency {
    keys: Mutex<HashMap<String, KeyEntry>>,
    setup_data: Mutex<HashMap<String, SetupData>>,
    setup_commitments: Mutex<HashMap<String, BTreeMap<u64, Commitment>>>,
    tenants: Mutex<HashMap<String, String>>,
}

impl InMemoryPersistency {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyPersistency for InMemoryPersistency {
    fn key_exist(&self, key_id: &str) -> bool {
        self.keys.lock().unwrap_or_else(std::sync::PoisonError::into_inner).contains_key(key_id)
    }

    fn load_key(&self, key_id: &str) -> CryptoResult<(Algorithm, [u8; 32])> {
        let keys = self.keys.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = keys
            .get(key_id)
            .ok_or_else(|| CryptoError::BadKey(format!("unknown key: {key_id}")))?;
        Ok((entry.algorithm, entry.private_share))
    }

    fn load_key_metadata(&self, key_id: &str) -> CryptoResult<KeyMetadata> {
        let keys = self.keys.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        keys.get(key_id)
            .and_then(|entry| entry.metadata.clone())
            .ok_or_else(|| CryptoError::BadKey(format!("no metadata for key: {key_id}")))
    }

    fn load_auxiliary_keys(&self, key_id: &str) -> CryptoResult<AuxiliaryKeys> {
        let keys = self.keys.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        keys.get(key_id)
            .and_then(|entry| entry.aux_keys.clone())
            .ok_or_else(|| CryptoError::BadKey(format!("no auxiliary keys for key: {key_id}")))
    }

    fn store_key(
        &self,
        key_id: &str,
        algorithm: Algorithm,
        private_share: [u8; 32],
        _ttl: u64,
    ) -> CryptoResult<()> {
        let mut keys = self.keys.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = keys.entry(key_id.to_string()).or_insert(KeyEntry {
            algorithm,
            private_share,
            metadata: None,
            aux_keys: None,
        });
        entry.algorithm = algorithm;
        entry.private_share = private_share;
        Ok(())
    }

    fn store_key_metadata(
        &self,
        key_id: &str,
        metadata: KeyMetadata,
        allow_override: bool,
    ) -> CryptoResult<()> {
        let mut keys = self.keys.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = keys
            .get_mut(key_id)
            .ok_or_else(|| CryptoError::BadKey(format!("unknown key: {key_id}")))?;
        if entry.metadata.is_some() && !allow_override {
            return Err(CryptoError::Internal(format!(
                "metadata already set for key: {key_id}"
            )));
        }
        entry.metadata = Some(metadata);
        Ok(())
    }

    fn store_auxiliary_keys(&self, key_id: &str, aux: AuxiliaryKeys) -> CryptoResult<()> {
        let mut keys = self.keys.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = keys
            .get_mut(key_id)
            .ok_or_else(|| CryptoError::BadKey(format!("unknown key: {key_id}")))?;
        entry.aux_keys = Some(aux);
        Ok(())
    }

    fn store_keyid_tenant_id(&self, key_id: &str, tenant_id: &str) -> CryptoResult<()> {
        self.tenants
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key_id.to_string(), tenant_id.to_string());
        Ok(())
    }

    fn get_tenantid_from_keyid(&self, key_id: &str) -> String {
        self.tenants
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key_id)
            .cloned()
            .unwrap_or_else(|| DEFAULT_TENANT_ID.to_string())
    }

    fn store_setup_data(&self, key_id: &str, data: SetupData) -> CryptoResult<()> {
        self.setup_data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key_id.to_string(), data);
        Ok(())
    }

    fn load_setup_data(&self, key_id: &str) -> CryptoResult<SetupData> {
        self.setup_data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key_id)
            .cloned()
            .ok_or_else(|| CryptoError::BadKey(format!("no setup data for key: {key_id}")))
    }

    fn store_setup_commitments(
        &self,
        key_id: &str,
        commitments: BTreeMap<u64, Commitment>,
    ) -> CryptoResult<()> {
        let mut map = self.setup_commitments.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if map.contains_key(key_id) {
            return Err(CryptoError::Internal(format!(
                "setup commitments already stored for key: {key_id}"
            )));
        }
        map.insert(key_id.to_string(), commitments);
        Ok(())
    }

    fn load_setup_commitments(&self, key_id: &str) -> CryptoResult<BTreeMap<u64, Commitment>> {
        self.setup_commitments
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key_id)
            .cloned()
            .ok_or_else(|| CryptoError::BadKey(format!("no setup commitments for key: {key_id}")))
    }

    fn delete_temporary_key_data(&self, key_id: &str, delete_key: bool) -> CryptoResult<()> {
        self.setup_data.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(key_id);
        self.setup_commitments
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key_id);
        if delete_key {
            self.keys.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(key_id);
            self.tenants.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(key_id);
        }
        Ok(())
    }
}

/// Transient artifacts of one signing attempt, accumulated phase by phase.
#[derive(Debug, Clone, Default)]
pub struct TxScratch {
    pub algorithm: Option<Algorithm>,
    pub message: Vec<u8>,
    pub player_ids: Vec<u64>,

    // ECDSA
    pub mta_requests: Option<BTreeMap<u64, MtaRequest>>,
    pub mta_responses: Option<BTreeMap<u64, MtaResponse>>,
    pub mta_deltas: Option<BTreeMap<u64, MtaDelta>>,
    pub partial_signatures: Option<BTreeMap<u64, PartialSignature>>,

    // EdDSA
    pub eddsa_commitments: Option<BTreeMap<u64, EddsaCommitment>>,
    pub eddsa_rs: Option<BTreeMap<u64, EddsaR>>,
    pub eddsa_rs_verified: bool,
}

/// In-memory map of per-`(key_id, tx_id)` scratch. Two concurrent phases
/// for the same pair are a caller error; the store does not serialize them.
#[derive(Default)]
pub struct TxScratchStore {
    entries: Mutex<HashMap<(String, String), TxScratch>>,
}

impl TxScratchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(&self, key_id: &str, tx_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(&(key_id.to_string(), tx_id.to_string()))
    }

    /// Create (or replace) the scratch for a new signing attempt.
    pub fn init(&self, key_id: &str, tx_id: &str, scratch: TxScratch) {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert((key_id.to_string(), tx_id.to_string()), scratch);
    }

    /// Read a snapshot; fails `MissingPhaseState` when phase 1 never ran.
    pub fn load(&self, key_id: &str, tx_id: &str) -> CryptoResult<TxScratch> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&(key_id.to_string(), tx_id.to_string()))
            .cloned()
            .ok_or_else(|| {
                CryptoError::MissingPhaseState(format!(
                    "no signing state for key {key_id} tx {tx_id}"
                ))
            })
    }

    /// Mutate the scratch in place; fails `MissingPhaseState` when absent.
    pub fn update<F>(&self, key_id: &str, tx_id: &str, mutate: F) -> CryptoResult<()>
    where
        F: FnOnce(&mut TxScratch),
    {
        let mut entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let scratch = entries
            .get_mut(&(key_id.to_string(), tx_id.to_string()))
            .ok_or_else(|| {
                CryptoError::MissingPhaseState(format!(
                    "no signing state for key {key_id} tx {tx_id}"
                ))
            })?;
        mutate(scratch);
        Ok(())
    }

    /// Drop the scratch at end of transaction.
    pub fn remove(&self, key_id: &str, tx_id: &str) {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&(key_id.to_string(), tx_id.to_string()));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
