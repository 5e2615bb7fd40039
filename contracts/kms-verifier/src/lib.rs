#![no_std]

//! # KMS Decryption Verifier
//!
//! On-chain oracle that checks a threshold-KMS attestation over a public
//! decryption. The off-chain KMS nodes decrypt a set of publicly decryptable
//! handles, ABI-encode the cleartexts in handle order, and each signer signs
//! the same digest with its ed25519 key.
//!
//! ## Digest
//!
//! ```text
//! digest = keccak256("KMSD" || n (u32 BE) || h_0 || ... || h_{n-1} || keccak256(cleartexts))
//! ```
//!
//! The handle list is hashed in order, so the attestation binds the tuple
//! `(handles, order, values)`. Presenting the right values in a different
//! order changes `cleartexts` and therefore the digest.
//!
//! ## Proof layout
//!
//! ```text
//! [0]           count          : u8, number of signatures that follow
//! [1 + 65*i]    signer_index   : u8, index into the configured signer set
//! [2 + 65*i..)  signature      : 64-byte ed25519 signature over `digest`
//! ```
//!
//! Signer indices must be strictly increasing (no signer counted twice) and
//! `count` must reach the configured threshold. Signature checks run on the
//! host; a forged signature aborts the invocation.

use soroban_sdk::{
    contract, contracterror, contractevent, contractimpl, contracttype, panic_with_error, Address,
    Bytes, BytesN, Env, Vec,
};

// ═══════════════════════════════════════════════════════════════════════════════
//  Error codes
// ═══════════════════════════════════════════════════════════════════════════════

#[contracterror]
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u32)]
pub enum KmsError {
    MalformedProof = 1,
    ThresholdNotMet = 2,
    DuplicateSigner = 3,
    InvalidSigner = 4,
    InvalidThreshold = 5,
    EmptyHandleSet = 6,
    AdminNotSet = 7,
    SignersNotSet = 8,
    InvalidSignerSet = 9,
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Events
// ═══════════════════════════════════════════════════════════════════════════════

#[contractevent]
pub struct EvDecryptionVerified {
    pub digest: BytesN<32>,
    pub signatures: u32,
}

#[contractevent]
pub struct EvSignersRotated {
    pub signer_count: u32,
    pub threshold: u32,
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Storage & constants
// ═══════════════════════════════════════════════════════════════════════════════

#[contracttype]
#[derive(Clone)]
enum StorageKey {
    Admin,
    Signers,
    Threshold,
}

/// Domain separator for the decryption digest: ASCII "KMSD" = 0x4B4D5344
const DIGEST_TAG: [u8; 4] = [0x4B, 0x4D, 0x53, 0x44];

const SIGNATURE_LEN: u32 = 64;
const ENTRY_LEN: u32 = 1 + SIGNATURE_LEN;

/// The signer index is a single byte.
const MAX_SIGNERS: u32 = 255;

const LEDGER_RATE_SECS: u32 = 5;
const TTL_SECONDS: u32 = 120 * 24 * 60 * 60;
const TTL_LEDGERS: u32 = TTL_SECONDS / LEDGER_RATE_SECS;

// ═══════════════════════════════════════════════════════════════════════════════
//  Contract
// ═══════════════════════════════════════════════════════════════════════════════

#[contract]
pub struct KmsVerifier;

#[contractimpl]
impl KmsVerifier {
    pub fn __constructor(env: Env, admin: Address, signers: Vec<BytesN<32>>, threshold: u32) {
        if let Err(err) = Self::check_signer_set(&signers, threshold) {
            panic_with_error!(&env, err);
        }
        env.storage().instance().set(&StorageKey::Admin, &admin);
        env.storage().instance().set(&StorageKey::Signers, &signers);
        env.storage().instance().set(&StorageKey::Threshold, &threshold);
    }

    /// Verify a KMS attestation that `cleartexts` is the ordered public
    /// decryption of `handles`.
    ///
    /// Structural problems come back as [`KmsError`]; a signature that does
    /// not verify under its claimed signer key aborts the call.
    pub fn verify_decryption(
        env: Env,
        handles: Vec<BytesN<32>>,
        cleartexts: Bytes,
        proof: Bytes,
    ) -> Result<(), KmsError> {
        if handles.is_empty() {
            return Err(KmsError::EmptyHandleSet);
        }
        let signers = Self::load_signers(&env)?;
        let threshold = Self::load_threshold(&env)?;

        // ── Layout ──────────────────────────────────────────────────────────
        let count = proof.get(0).ok_or(KmsError::MalformedProof)? as u32;
        if proof.len() != 1 + count * ENTRY_LEN {
            return Err(KmsError::MalformedProof);
        }
        if count < threshold {
            return Err(KmsError::ThresholdNotMet);
        }

        // ── Signer set membership (all before any crypto) ───────────────────
        let mut previous: Option<u32> = None;
        let mut i = 0u32;
        while i < count {
            let index = proof.get(1 + i * ENTRY_LEN).unwrap_or(0) as u32;
            if let Some(prev) = previous {
                if index <= prev {
                    return Err(KmsError::DuplicateSigner);
                }
            }
            if index >= signers.len() {
                return Err(KmsError::InvalidSigner);
            }
            previous = Some(index);
            i += 1;
        }

        // ── Signatures ──────────────────────────────────────────────────────
        let digest = Self::compute_digest(&env, &handles, &cleartexts);
        let message = Bytes::from_array(&env, &digest.to_array());
        i = 0;
        while i < count {
            let offset = 1 + i * ENTRY_LEN;
            let index = proof.get(offset).unwrap_or(0) as u32;
            let public_key = signers.get(index).ok_or(KmsError::InvalidSigner)?;
            let signature = Self::extract_signature(&env, &proof, offset + 1);
            env.crypto().ed25519_verify(&public_key, &message, &signature);
            i += 1;
        }

        EvDecryptionVerified {
            digest,
            signatures: count,
        }
        .publish(&env);
        Ok(())
    }

    /// The 32-byte message every KMS signer signs for this decryption.
    pub fn decryption_digest(env: Env, handles: Vec<BytesN<32>>, cleartexts: Bytes) -> BytesN<32> {
        Self::compute_digest(&env, &handles, &cleartexts)
    }

    // ───────────────────────────────────────────────────────────────────────────
    //  Admin & configuration
    // ───────────────────────────────────────────────────────────────────────────

    pub fn get_signers(env: Env) -> Result<Vec<BytesN<32>>, KmsError> {
        Self::load_signers(&env)
    }

    pub fn get_threshold(env: Env) -> Result<u32, KmsError> {
        Self::load_threshold(&env)
    }

    /// Replace the KMS signer set. Existing proofs signed by rotated-out keys
    /// stop verifying immediately.
    pub fn set_signers(env: Env, signers: Vec<BytesN<32>>, threshold: u32) -> Result<(), KmsError> {
        let admin = Self::load_admin(&env)?;
        admin.require_auth();
        Self::check_signer_set(&signers, threshold)?;

        env.storage().instance().set(&StorageKey::Signers, &signers);
        env.storage().instance().set(&StorageKey::Threshold, &threshold);
        env.storage().instance().extend_ttl(TTL_LEDGERS, TTL_LEDGERS);

        EvSignersRotated {
            signer_count: signers.len(),
            threshold,
        }
        .publish(&env);
        Ok(())
    }

    pub fn get_admin(env: Env) -> Result<Address, KmsError> {
        Self::load_admin(&env)
    }

    pub fn set_admin(env: Env, new_admin: Address) -> Result<(), KmsError> {
        let admin = Self::load_admin(&env)?;
        admin.require_auth();
        env.storage().instance().set(&StorageKey::Admin, &new_admin);
        Ok(())
    }

    pub fn upgrade(env: Env, new_wasm_hash: BytesN<32>) -> Result<(), KmsError> {
        let admin = Self::load_admin(&env)?;
        admin.require_auth();
        env.deployer().update_current_contract_wasm(new_wasm_hash);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    //  Internal
    // ═══════════════════════════════════════════════════════════════════════════

    fn check_signer_set(signers: &Vec<BytesN<32>>, threshold: u32) -> Result<(), KmsError> {
        if signers.is_empty() || signers.len() > MAX_SIGNERS {
            return Err(KmsError::InvalidSignerSet);
        }
        if threshold == 0 || threshold > signers.len() {
            return Err(KmsError::InvalidThreshold);
        }
        Ok(())
    }

    fn compute_digest(env: &Env, handles: &Vec<BytesN<32>>, cleartexts: &Bytes) -> BytesN<32> {
        let mut preimage = Bytes::from_array(env, &DIGEST_TAG);
        preimage.append(&Bytes::from_array(env, &handles.len().to_be_bytes()));
        for handle in handles.iter() {
            preimage.append(&Bytes::from_array(env, &handle.to_array()));
        }
        let cleartext_hash: BytesN<32> = env.crypto().keccak256(cleartexts).into();
        preimage.append(&Bytes::from_array(env, &cleartext_hash.to_array()));
        env.crypto().keccak256(&preimage).into()
    }

    fn extract_signature(env: &Env, proof: &Bytes, offset: u32) -> BytesN<64> {
        let mut arr = [0u8; 64];
        let mut i = 0usize;
        while i < 64 {
            arr[i] = proof.get(offset + i as u32).unwrap_or(0);
            i += 1;
        }
        BytesN::<64>::from_array(env, &arr)
    }

    fn load_admin(env: &Env) -> Result<Address, KmsError> {
        env.storage()
            .instance()
            .get(&StorageKey::Admin)
            .ok_or(KmsError::AdminNotSet)
    }

    fn load_signers(env: &Env) -> Result<Vec<BytesN<32>>, KmsError> {
        env.storage()
            .instance()
            .get(&StorageKey::Signers)
            .ok_or(KmsError::SignersNotSet)
    }

    fn load_threshold(env: &Env) -> Result<u32, KmsError> {
        env.storage()
            .instance()
            .get(&StorageKey::Threshold)
            .ok_or(KmsError::SignersNotSet)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use soroban_sdk::{testutils::Address as _, vec, Address, Env};

    // ════════════════════════════════════════════════════════════════════════
    //  Helpers
    // ════════════════════════════════════════════════════════════════════════

    fn signing_keys() -> [SigningKey; 3] {
        [
            SigningKey::from_bytes(&[0x11; 32]),
            SigningKey::from_bytes(&[0x22; 32]),
            SigningKey::from_bytes(&[0x33; 32]),
        ]
    }

    fn signer_set(env: &Env, keys: &[SigningKey]) -> Vec<BytesN<32>> {
        let mut signers = Vec::new(env);
        for key in keys {
            signers.push_back(BytesN::from_array(env, &key.verifying_key().to_bytes()));
        }
        signers
    }

    fn setup(threshold: u32) -> (Env, KmsVerifierClient<'static>, [SigningKey; 3]) {
        let env = Env::default();
        env.mock_all_auths();
        let keys = signing_keys();
        let admin = Address::generate(&env);
        let signers = signer_set(&env, &keys);
        let id = env.register(KmsVerifier, (&admin, &signers, &threshold));
        let client = KmsVerifierClient::new(&env, &id);
        (env, client, keys)
    }

    fn handles(env: &Env) -> Vec<BytesN<32>> {
        vec![
            env,
            BytesN::from_array(env, &[0xA1; 32]),
            BytesN::from_array(env, &[0xB2; 32]),
        ]
    }

    fn cleartexts(env: &Env, values: &[u64]) -> Bytes {
        let mut buf = Bytes::new(env);
        for v in values {
            let mut word = [0u8; 32];
            word[24..].copy_from_slice(&v.to_be_bytes());
            buf.append(&Bytes::from_array(env, &word));
        }
        buf
    }

    /// Sign `digest` with the keys at `indices` (in the given order).
    fn build_proof(env: &Env, keys: &[SigningKey], indices: &[u8], digest: &BytesN<32>) -> Bytes {
        let msg = digest.to_array();
        let mut proof = Bytes::from_array(env, &[indices.len() as u8]);
        for &i in indices {
            let sig = keys[i as usize].sign(&msg).to_bytes();
            proof.push_back(i);
            proof.append(&Bytes::from_array(env, &sig));
        }
        proof
    }

    // ════════════════════════════════════════════════════════════════════════
    //  Tests
    // ════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_threshold_signatures_verify() {
        let (env, client, keys) = setup(2);
        let hs = handles(&env);
        let clear = cleartexts(&env, &[5, 9]);
        let digest = client.decryption_digest(&hs, &clear);

        let proof = build_proof(&env, &keys, &[0, 2], &digest);
        client.verify_decryption(&hs, &clear, &proof);
    }

    #[test]
    fn test_swapped_cleartexts_rejected() {
        let (env, client, keys) = setup(2);
        let hs = handles(&env);
        let clear = cleartexts(&env, &[5, 9]);
        let digest = client.decryption_digest(&hs, &clear);
        let proof = build_proof(&env, &keys, &[0, 1], &digest);

        let swapped = cleartexts(&env, &[9, 5]);
        assert!(client.try_verify_decryption(&hs, &swapped, &proof).is_err());
    }

    #[test]
    fn test_digest_depends_on_handle_order() {
        let (env, client, _keys) = setup(1);
        let hs = handles(&env);
        let reversed = vec![&env, hs.get(1).unwrap(), hs.get(0).unwrap()];
        let clear = cleartexts(&env, &[5, 9]);
        assert_ne!(
            client.decryption_digest(&hs, &clear),
            client.decryption_digest(&reversed, &clear)
        );
    }

    #[test]
    fn test_below_threshold_rejected() {
        let (env, client, keys) = setup(2);
        let hs = handles(&env);
        let clear = cleartexts(&env, &[1, 2]);
        let digest = client.decryption_digest(&hs, &clear);

        let proof = build_proof(&env, &keys, &[1], &digest);
        let result = client.try_verify_decryption(&hs, &clear, &proof);
        assert!(matches!(result, Err(Ok(KmsError::ThresholdNotMet))));
    }

    #[test]
    fn test_duplicate_signer_rejected() {
        let (env, client, keys) = setup(2);
        let hs = handles(&env);
        let clear = cleartexts(&env, &[1, 2]);
        let digest = client.decryption_digest(&hs, &clear);

        let proof = build_proof(&env, &keys, &[1, 1], &digest);
        let result = client.try_verify_decryption(&hs, &clear, &proof);
        assert!(matches!(result, Err(Ok(KmsError::DuplicateSigner))));
    }

    #[test]
    fn test_unknown_signer_index_rejected() {
        let (env, client, keys) = setup(1);
        let hs = handles(&env);
        let clear = cleartexts(&env, &[1, 2]);
        let digest = client.decryption_digest(&hs, &clear);

        let mut proof = build_proof(&env, &keys, &[0], &digest);
        proof.set(1, 7);
        let result = client.try_verify_decryption(&hs, &clear, &proof);
        assert!(matches!(result, Err(Ok(KmsError::InvalidSigner))));
    }

    #[test]
    fn test_signature_from_foreign_key_rejected() {
        let (env, client, _keys) = setup(1);
        let hs = handles(&env);
        let clear = cleartexts(&env, &[1, 2]);
        let digest = client.decryption_digest(&hs, &clear);

        let outsider = [SigningKey::from_bytes(&[0x99; 32])];
        let proof = build_proof(&env, &outsider, &[0], &digest);
        assert!(client.try_verify_decryption(&hs, &clear, &proof).is_err());
    }

    #[test]
    fn test_truncated_proof_rejected() {
        let (env, client, keys) = setup(1);
        let hs = handles(&env);
        let clear = cleartexts(&env, &[1, 2]);
        let digest = client.decryption_digest(&hs, &clear);

        let proof = build_proof(&env, &keys, &[0], &digest);
        let truncated = proof.slice(0..proof.len() - 1);
        let result = client.try_verify_decryption(&hs, &clear, &truncated);
        assert!(matches!(result, Err(Ok(KmsError::MalformedProof))));

        let empty = Bytes::new(&env);
        let result = client.try_verify_decryption(&hs, &clear, &empty);
        assert!(matches!(result, Err(Ok(KmsError::MalformedProof))));
    }

    #[test]
    fn test_rotated_signers_invalidate_old_proofs() {
        let (env, client, keys) = setup(1);
        let hs = handles(&env);
        let clear = cleartexts(&env, &[3, 4]);
        let digest = client.decryption_digest(&hs, &clear);
        let proof = build_proof(&env, &keys, &[0], &digest);
        client.verify_decryption(&hs, &clear, &proof);

        let fresh = [SigningKey::from_bytes(&[0x44; 32])];
        client.set_signers(&signer_set(&env, &fresh), &1);
        assert_eq!(client.get_threshold(), 1);
        assert_eq!(client.get_signers().len(), 1);
        assert!(client.try_verify_decryption(&hs, &clear, &proof).is_err());

        let reissued = build_proof(&env, &fresh, &[0], &digest);
        client.verify_decryption(&hs, &clear, &reissued);
    }

    #[test]
    fn test_invalid_threshold_rejected_on_rotation() {
        let (env, client, keys) = setup(1);
        let signers = signer_set(&env, &keys);
        let result = client.try_set_signers(&signers, &4);
        assert!(matches!(result, Err(Ok(KmsError::InvalidThreshold))));
        let result = client.try_set_signers(&signers, &0);
        assert!(matches!(result, Err(Ok(KmsError::InvalidThreshold))));
    }

    #[test]
    fn test_empty_signer_set_rejected_on_rotation() {
        let (env, client, _keys) = setup(1);
        let result = client.try_set_signers(&Vec::new(&env), &1);
        assert!(matches!(result, Err(Ok(KmsError::InvalidSignerSet))));
        assert_eq!(client.get_signers().len(), 3);
    }

    #[test]
    fn test_empty_handle_set_rejected() {
        let (env, client, _keys) = setup(1);
        let result = client.try_verify_decryption(&Vec::new(&env), &Bytes::new(&env), &Bytes::new(&env));
        assert!(matches!(result, Err(Ok(KmsError::EmptyHandleSet))));
    }
}
