#![no_std]

//! # Mock FHE Engine
//!
//! Stand-in for the FHE coprocessor that the reveal protocol talks to.
//! It does no homomorphic arithmetic: `encrypt` mints an opaque 32-byte
//! handle and remembers the plaintext next to it.
//!
//! What it does model faithfully is the part the protocol depends on:
//! - `allow` / `allow_transient` record ACL grants pushed by callers.
//! - `make_publicly_decryptable` is irreversible and idempotent.
//! - `public_decrypt` plays the off-chain relayer and refuses to reveal a
//!   handle that was never made publicly decryptable.

use soroban_sdk::{
    contract, contracterror, contractevent, contractimpl, contracttype, Address, Bytes, BytesN,
    Env,
};

// ═══════════════════════════════════════════════════════════════════════════════
//  Errors & Events
// ═══════════════════════════════════════════════════════════════════════════════

#[contracterror]
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u32)]
pub enum MockFheError {
    UnknownHandle = 1,
    NotPubliclyDecryptable = 2,
}

#[contractevent]
pub struct EvPubliclyDecryptable {
    pub handle: BytesN<32>,
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Storage
// ═══════════════════════════════════════════════════════════════════════════════

#[contracttype]
#[derive(Clone)]
enum MockKey {
    Nonce,
    PublicCount,
    AllowCount,
    TransientAllowCount,
    Plaintext(BytesN<32>),
    Public(BytesN<32>),
    Allowed(BytesN<32>, Address),
    TransientAllowed(BytesN<32>, Address),
}

/// ASCII "MFHE", mixed into every minted handle.
const HANDLE_TAG: [u8; 4] = [0x4D, 0x46, 0x48, 0x45];

const LEDGER_RATE_SECS: u32 = 5;
const TTL_LEDGERS: u32 = 30 * 24 * 60 * 60 / LEDGER_RATE_SECS;
// Transient grants only need to outlive the current transaction.
const TRANSIENT_TTL_LEDGERS: u32 = 60 / LEDGER_RATE_SECS;

// ═══════════════════════════════════════════════════════════════════════════════
//  Contract
// ═══════════════════════════════════════════════════════════════════════════════

#[contract]
pub struct MockFheEngine;

#[contractimpl]
impl MockFheEngine {
    /// Mint a fresh handle for `value`.
    pub fn encrypt(env: Env, value: u64) -> BytesN<32> {
        let nonce: u32 = env.storage().instance().get(&MockKey::Nonce).unwrap_or(0);
        env.storage().instance().set(&MockKey::Nonce, &(nonce + 1));

        let mut preimage = Bytes::from_array(&env, &HANDLE_TAG);
        preimage.append(&Bytes::from_array(&env, &nonce.to_be_bytes()));
        preimage.append(&Bytes::from_array(&env, &value.to_be_bytes()));
        let handle: BytesN<32> = env.crypto().keccak256(&preimage).into();

        let key = MockKey::Plaintext(handle.clone());
        env.storage().persistent().set(&key, &value);
        env.storage().persistent().extend_ttl(&key, TTL_LEDGERS, TTL_LEDGERS);
        handle
    }

    pub fn make_publicly_decryptable(env: Env, handle: BytesN<32>) {
        let key = MockKey::Public(handle.clone());
        if env.storage().persistent().has(&key) {
            return;
        }
        env.storage().persistent().set(&key, &true);
        env.storage().persistent().extend_ttl(&key, TTL_LEDGERS, TTL_LEDGERS);
        Self::bump(&env, MockKey::PublicCount);

        EvPubliclyDecryptable { handle }.publish(&env);
    }

    pub fn is_publicly_decryptable(env: Env, handle: BytesN<32>) -> bool {
        env.storage().persistent().has(&MockKey::Public(handle))
    }

    pub fn allow(env: Env, handle: BytesN<32>, account: Address) {
        let key = MockKey::Allowed(handle, account);
        env.storage().persistent().set(&key, &true);
        env.storage().persistent().extend_ttl(&key, TTL_LEDGERS, TTL_LEDGERS);
        Self::bump(&env, MockKey::AllowCount);
    }

    pub fn allow_transient(env: Env, handle: BytesN<32>, account: Address) {
        let key = MockKey::TransientAllowed(handle, account);
        env.storage().temporary().set(&key, &true);
        env.storage()
            .temporary()
            .extend_ttl(&key, TRANSIENT_TTL_LEDGERS, TRANSIENT_TTL_LEDGERS);
        Self::bump(&env, MockKey::TransientAllowCount);
    }

    pub fn is_allowed(env: Env, handle: BytesN<32>, account: Address) -> bool {
        env.storage()
            .persistent()
            .has(&MockKey::Allowed(handle.clone(), account.clone()))
            || env
                .storage()
                .temporary()
                .has(&MockKey::TransientAllowed(handle, account))
    }

    /// Relayer stand-in: reveal the plaintext behind a public handle.
    pub fn public_decrypt(env: Env, handle: BytesN<32>) -> Result<u64, MockFheError> {
        let value: u64 = env
            .storage()
            .persistent()
            .get(&MockKey::Plaintext(handle.clone()))
            .ok_or(MockFheError::UnknownHandle)?;
        if !env.storage().persistent().has(&MockKey::Public(handle)) {
            return Err(MockFheError::NotPubliclyDecryptable);
        }
        Ok(value)
    }

    pub fn get_public_count(env: Env) -> u32 {
        env.storage().instance().get(&MockKey::PublicCount).unwrap_or(0)
    }

    pub fn get_allow_count(env: Env) -> u32 {
        env.storage().instance().get(&MockKey::AllowCount).unwrap_or(0)
    }

    pub fn get_transient_allow_count(env: Env) -> u32 {
        env.storage()
            .instance()
            .get(&MockKey::TransientAllowCount)
            .unwrap_or(0)
    }

    fn bump(env: &Env, key: MockKey) {
        let count: u32 = env.storage().instance().get(&key).unwrap_or(0);
        env.storage().instance().set(&key, &(count + 1));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use soroban_sdk::testutils::Address as _;

    #[test]
    fn test_encrypt_mints_distinct_handles() {
        let env = Env::default();
        let id = env.register(MockFheEngine, ());
        let client = MockFheEngineClient::new(&env, &id);

        let h1 = client.encrypt(&7);
        let h2 = client.encrypt(&7);
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_public_decrypt_requires_public_flag() {
        let env = Env::default();
        let id = env.register(MockFheEngine, ());
        let client = MockFheEngineClient::new(&env, &id);

        let handle = client.encrypt(&37);
        let result = client.try_public_decrypt(&handle);
        assert!(matches!(result, Err(Ok(MockFheError::NotPubliclyDecryptable))));

        client.make_publicly_decryptable(&handle);
        assert_eq!(client.public_decrypt(&handle), 37);
    }

    #[test]
    fn test_make_public_is_idempotent() {
        let env = Env::default();
        let id = env.register(MockFheEngine, ());
        let client = MockFheEngineClient::new(&env, &id);

        let handle = client.encrypt(&1);
        client.make_publicly_decryptable(&handle);
        client.make_publicly_decryptable(&handle);
        assert!(client.is_publicly_decryptable(&handle));
        assert_eq!(client.get_public_count(), 1);
    }

    #[test]
    fn test_unknown_handle_rejected() {
        let env = Env::default();
        let id = env.register(MockFheEngine, ());
        let client = MockFheEngineClient::new(&env, &id);

        let bogus = BytesN::<32>::from_array(&env, &[9u8; 32]);
        client.make_publicly_decryptable(&bogus);
        let result = client.try_public_decrypt(&bogus);
        assert!(matches!(result, Err(Ok(MockFheError::UnknownHandle))));
    }

    #[test]
    fn test_allow_tracks_accounts() {
        let env = Env::default();
        let id = env.register(MockFheEngine, ());
        let client = MockFheEngineClient::new(&env, &id);

        let handle = client.encrypt(&3);
        let alice = Address::generate(&env);
        let bob = Address::generate(&env);

        client.allow(&handle, &alice);
        client.allow_transient(&handle, &bob);

        assert!(client.is_allowed(&handle, &alice));
        assert!(client.is_allowed(&handle, &bob));
        assert_eq!(client.get_allow_count(), 1);
        assert_eq!(client.get_transient_allow_count(), 1);
    }
}
