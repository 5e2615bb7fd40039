#![no_std]

//! # Confidential Reveal
//!
//! Commit → make-revealable → off-chain decrypt → verify proof → finalize,
//! for encrypted values produced by an external FHE engine.
//!
//! ## Session flow
//! 1. A host opens a session with its participants and a reveal rule
//!    (dice, highest-wins, rock-paper-scissors, lottery, or raw values).
//! 2. The host registers ciphertext handles in order. Each handle is owned by
//!    exactly one session and the contract grants itself persistent access.
//! 3. Sealing marks every handle publicly decryptable with the engine in one
//!    invocation and freezes the handle order.
//! 4. An off-chain threshold KMS decrypts the handles and signs the
//!    ABI-encoded cleartexts.
//! 5. Anyone submits the cleartexts plus the KMS proof. The contract
//!    re-encodes the values in handle order, has the KMS verifier check the
//!    signatures, applies the rule and finalizes the session exactly once.
//!
//! ## Ordering
//! The proof binds `(handles, order, values)`. Submitting the right values in
//! the wrong order yields a different encoding and is rejected as
//! `InvalidProof`, indistinguishable from wrong values.
//!
//! ## Access control
//! Persistent grants live forever. Transient grants are tagged with an
//! explicit transaction id and stop counting once that transaction is closed
//! for the principal via `revoke_transient`, which only the issuing host or
//! the admin may call.

use soroban_sdk::{
    contract, contractclient, contracterror, contractevent, contractimpl, contracttype, Address,
    Bytes, BytesN, Env, Vec,
};

// ═══════════════════════════════════════════════════════════════════════════════
//  Contract Events
// ═══════════════════════════════════════════════════════════════════════════════

#[contractevent]
pub struct EvSessionOpened {
    pub session_id: u32,
    pub host: Address,
    pub participants: u32,
}

#[contractevent]
pub struct EvHandleRegistered {
    pub session_id: u32,
    pub handle: BytesN<32>,
    pub index: u32,
}

#[contractevent]
pub struct EvAclGranted {
    pub handle: BytesN<32>,
    pub principal: Address,
    pub persistent: bool,
    pub tx: u64,
}

#[contractevent]
pub struct EvTransientRevoked {
    pub principal: Address,
    pub tx: u64,
}

/// Emitted once every handle of the session is publicly decryptable.
#[contractevent]
pub struct EvSessionSealed {
    pub session_id: u32,
    pub handles: u32,
}

#[contractevent]
pub struct EvRevealVerified {
    pub session_id: u32,
}

#[contractevent]
pub struct EvSessionFinalized {
    pub session_id: u32,
    pub outcome: RevealOutcome,
}

// ═══════════════════════════════════════════════════════════════════════════════
//  External trait interfaces
// ═══════════════════════════════════════════════════════════════════════════════

/// FHE coprocessor. Only the calls the reveal lifecycle needs.
#[contractclient(name = "FheEngineClient")]
pub trait FheEngine {
    /// Irreversible and idempotent at the engine level.
    fn make_publicly_decryptable(env: Env, handle: BytesN<32>);

    fn allow(env: Env, handle: BytesN<32>, account: Address);

    fn allow_transient(env: Env, handle: BytesN<32>, account: Address);
}

/// Threshold KMS signature oracle.
///
/// Fails (error or abort) unless `proof` carries enough valid KMS signatures
/// over `(handles, cleartexts)`.
#[contractclient(name = "KmsOracleClient")]
pub trait KmsOracle {
    fn verify_decryption(env: Env, handles: Vec<BytesN<32>>, cleartexts: Bytes, proof: Bytes);
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════════════════════

#[contracterror]
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u32)]
pub enum RevealError {
    SessionNotFound = 1,
    SessionSealed = 2,
    AlreadySealed = 3,
    HandleAlreadyOwned = 4,
    AlreadyFinalized = 5,
    InvalidProof = 6,
    LengthMismatch = 7,
    SessionNotSealed = 8,
    NotFinalized = 9,
    HandleNotRegistered = 10,
    EmptySession = 11,
    ShapeMismatch = 12,
    InvalidRule = 13,
    DuplicateParticipant = 14,
    TransactionClosed = 15,
    InvalidClearValue = 16,
    MalformedCleartexts = 17,
    AdminNotSet = 18,
    FheEngineNotSet = 19,
    KmsVerifierNotSet = 20,
    SessionIdsExhausted = 21,
    NotGrantIssuer = 22,
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Lifecycle states (compact u32 encoding for storage efficiency)
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) type LifecycleState = u32;

pub const STATE_OPEN: LifecycleState = 1;
pub const STATE_SEALED: LifecycleState = 2;
pub const STATE_FINALIZED: LifecycleState = 3;

// Outcome codes, from one participant's perspective
pub(crate) type Outcome = u32;

pub const OUTCOME_NONE: Outcome = 0;
pub const OUTCOME_WIN: Outcome = 1;
pub const OUTCOME_LOSS: Outcome = 2;
pub const OUTCOME_DRAW: Outcome = 3;

// ═══════════════════════════════════════════════════════════════════════════════
//  Types & storage keys
// ═══════════════════════════════════════════════════════════════════════════════

#[contracttype]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AclScope {
    Persistent,
    Transient,
}

#[contracttype]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClearKind {
    U8,
    U16,
    U32,
    U64,
    Bool,
    EvmAddress,
}

/// A decrypted value. Narrow integer kinds carry a `u32` and are range
/// checked when encoded.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClearValue {
    U8(u32),
    U16(u32),
    U32(u32),
    U64(u64),
    Bool(bool),
    EvmAddress(BytesN<20>),
}

/// How verified cleartexts turn into a result.
///
/// Handle layouts:
/// - `Values`: any number of handles.
/// - `Dice(sides)`: one handle per die.
/// - `HighestWins`: handle `i` belongs to `participants[i]`.
/// - `RockPaperScissors`: two handles, move = value % 3 (rock, paper, scissors).
/// - `Lottery(range)`: handle 0 is the draw, handle `i + 1` is `participants[i]`'s ticket.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RevealRule {
    Values,
    Dice(u32),
    HighestWins,
    RockPaperScissors,
    Lottery(u32),
}

#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RevealOutcome {
    Values(Vec<ClearValue>),
    Rolls(Vec<u32>),
    Winner(Address),
    Draw,
    Winners(Vec<Address>),
}

/// Produced by the off-chain relayer.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RevealProof {
    pub abi_encoded_clear_values: Bytes,
    pub signature: Bytes,
}

#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RevealSession {
    pub session_id: u32,
    pub host: Address,
    pub participants: Vec<Address>,
    pub rule: RevealRule,
    // Order is the order the proof must match
    pub handles: Vec<BytesN<32>>,
    pub lifecycle_state: u32,
    pub result: Option<RevealOutcome>,
    pub opened_ledger: u32,
    pub sealed_ledger: Option<u32>,
    pub finalized_ledger: Option<u32>,
}

/// Compact summary of a finalized session, stored per participant.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RevealSummary {
    pub session_id: u32,
    pub host: Address,
    pub outcome: u32, // 0=none, 1=win, 2=loss, 3=draw
    pub ledger: u32,
}

#[contracttype]
#[derive(Clone)]
enum StorageKey {
    Admin,
    FheEngineAddress,
    KmsVerifierAddress,
    NextSessionId,
    Session(u32),
    HandleOwner(BytesN<32>),
    AclPersistent(BytesN<32>, Address),
    AclTransient(BytesN<32>, Address, u64),
    /// Transaction `tx` has ended for this principal.
    TxClosed(Address, u64),
    /// `issuer` handed `principal` a transient grant in `tx`.
    TxIssuer(Address, u64, Address),
    ParticipantHistory(Address),
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Constants
// ═══════════════════════════════════════════════════════════════════════════════

/// One ABI word per cleartext.
const WORD_LEN: u32 = 32;

// Ledger rate is approximately 5 seconds per ledger on Stellar
const LEDGER_RATE_SECS: u32 = 5;

// Sessions may sit sealed for a long time waiting on the KMS: 30 days
const SESSION_TTL_SECONDS: u32 = 30 * 24 * 60 * 60;
const SESSION_TTL_LEDGERS: u32 = SESSION_TTL_SECONDS / LEDGER_RATE_SECS;

// Ownership, persistent grants and history: 120 days
const LONG_TTL_SECONDS: u32 = 120 * 24 * 60 * 60;
const LONG_TTL_LEDGERS: u32 = LONG_TTL_SECONDS / LEDGER_RATE_SECS;

// Transient grants: ~10 minutes. Correctness comes from the tx tag, the TTL
// only reclaims storage.
const TRANSIENT_TTL_LEDGERS: u32 = 10 * 60 / LEDGER_RATE_SECS;

/// Max summaries stored per participant (ring buffer)
const MAX_HISTORY_PER_PARTICIPANT: u32 = 50;

// ═══════════════════════════════════════════════════════════════════════════════
//  Contract
// ═══════════════════════════════════════════════════════════════════════════════

#[contract]
pub struct ConfidentialReveal;

#[contractimpl]
impl ConfidentialReveal {
    // ───────────────────────────────────────────────────────────────────────────
    //  Public: Constructor
    // ───────────────────────────────────────────────────────────────────────────

    pub fn __constructor(env: Env, admin: Address, fhe_engine: Address, kms_verifier: Address) {
        env.storage().instance().set(&StorageKey::Admin, &admin);
        env.storage()
            .instance()
            .set(&StorageKey::FheEngineAddress, &fhe_engine);
        env.storage()
            .instance()
            .set(&StorageKey::KmsVerifierAddress, &kms_verifier);
    }

    // ───────────────────────────────────────────────────────────────────────────
    //  Public: Commitment Session
    // ───────────────────────────────────────────────────────────────────────────

    /// Open a new session in the `Open` state. Returns its id.
    pub fn open_session(
        env: Env,
        host: Address,
        participants: Vec<Address>,
        rule: RevealRule,
    ) -> Result<u32, RevealError> {
        host.require_auth();

        Self::check_participants(&participants)?;
        Self::check_rule(&rule, participants.len())?;

        let session_id = Self::next_session_id(&env)?;
        let session = RevealSession {
            session_id,
            host: host.clone(),
            participants,
            rule,
            handles: Vec::new(&env),
            lifecycle_state: STATE_OPEN,
            result: None,
            opened_ledger: env.ledger().sequence(),
            sealed_ledger: None,
            finalized_ledger: None,
        };

        EvSessionOpened {
            session_id,
            host,
            participants: session.participants.len(),
        }
        .publish(&env);

        Self::write_session(&env, &session);
        Ok(session_id)
    }

    /// Append `handle` to the session's ordered handle list. Returns its index.
    pub fn add_handle(env: Env, session_id: u32, handle: BytesN<32>) -> Result<u32, RevealError> {
        let mut session = Self::read_session(&env, session_id)?;
        session.host.require_auth();

        if session.lifecycle_state != STATE_OPEN {
            return Err(RevealError::SessionSealed);
        }

        let owner_key = StorageKey::HandleOwner(handle.clone());
        if env.storage().persistent().has(&owner_key) {
            return Err(RevealError::HandleAlreadyOwned);
        }
        env.storage().persistent().set(&owner_key, &session_id);
        env.storage()
            .persistent()
            .extend_ttl(&owner_key, LONG_TTL_LEDGERS, LONG_TTL_LEDGERS);

        let index = session.handles.len();
        session.handles.push_back(handle.clone());

        // The reveal gate operates on the handle later, so this contract
        // needs its own grant before anything else happens to it.
        let this = env.current_contract_address();
        Self::record_grant(&env, &handle, &this, AclScope::Persistent, 0)?;

        EvHandleRegistered {
            session_id,
            handle,
            index,
        }
        .publish(&env);

        Self::write_session(&env, &session);
        Ok(index)
    }

    // ───────────────────────────────────────────────────────────────────────────
    //  Public: Reveal Gate
    // ───────────────────────────────────────────────────────────────────────────

    /// Make every handle publicly decryptable and move to `Sealed`.
    ///
    /// Runs in a single invocation: if any engine call fails the whole
    /// transaction is rolled back, so no handle is left public on its own.
    pub fn seal_session(env: Env, session_id: u32) -> Result<(), RevealError> {
        let mut session = Self::read_session(&env, session_id)?;
        session.host.require_auth();

        if session.lifecycle_state != STATE_OPEN {
            return Err(RevealError::AlreadySealed);
        }
        if session.handles.is_empty() {
            return Err(RevealError::EmptySession);
        }
        Self::check_shape(&session)?;

        let engine = FheEngineClient::new(&env, &Self::load_fhe_engine(&env)?);
        for handle in session.handles.iter() {
            engine.make_publicly_decryptable(&handle);
        }

        session.lifecycle_state = STATE_SEALED;
        session.sealed_ledger = Some(env.ledger().sequence());

        EvSessionSealed {
            session_id,
            handles: session.handles.len(),
        }
        .publish(&env);

        Self::write_session(&env, &session);
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────────
    //  Public: Proof Verifier & Outcome Finalizer
    // ───────────────────────────────────────────────────────────────────────────

    /// Check `clear_values` + `proof` against a sealed session without
    /// changing it. Returns the validated values.
    pub fn verify_reveal(
        env: Env,
        session_id: u32,
        clear_values: Vec<ClearValue>,
        proof: RevealProof,
    ) -> Result<Vec<ClearValue>, RevealError> {
        let session = Self::read_session(&env, session_id)?;
        Self::verify_against(&env, &session, &clear_values, &proof)?;
        Ok(clear_values)
    }

    /// Verify the KMS proof and finalize the session with the rule's result.
    ///
    /// Verification always runs again here, in the same invocation as the
    /// state change. Verification failures leave the session `Sealed`, so a
    /// corrected proof can be submitted; once finalized, every further call
    /// fails with `AlreadyFinalized`.
    pub fn reveal_and_finalize(
        env: Env,
        session_id: u32,
        clear_values: Vec<ClearValue>,
        proof: RevealProof,
    ) -> Result<RevealOutcome, RevealError> {
        let mut session = Self::read_session(&env, session_id)?;
        Self::verify_against(&env, &session, &clear_values, &proof)?;

        EvRevealVerified { session_id }.publish(&env);

        Self::finalize_session(&env, &mut session, &clear_values)
    }

    // ───────────────────────────────────────────────────────────────────────────
    //  Public: Access Control Ledger
    // ───────────────────────────────────────────────────────────────────────────

    /// Grant `principal` access to a registered handle. Only the host of the
    /// owning session may grant. Repeating an existing grant is a no-op.
    ///
    /// `tx` identifies the current transaction and only matters for
    /// `AclScope::Transient`.
    pub fn grant(
        env: Env,
        handle: BytesN<32>,
        principal: Address,
        scope: AclScope,
        tx: u64,
    ) -> Result<(), RevealError> {
        let session_id = Self::load_handle_owner(&env, &handle)?;
        let session = Self::read_session(&env, session_id)?;
        session.host.require_auth();

        Self::record_grant(&env, &handle, &principal, scope, tx)?;

        if scope == AclScope::Transient {
            let key = StorageKey::TxIssuer(principal, tx, session.host);
            env.storage().temporary().set(&key, &true);
            env.storage()
                .temporary()
                .extend_ttl(&key, TRANSIENT_TTL_LEDGERS, TRANSIENT_TTL_LEDGERS);
        }
        Ok(())
    }

    /// Close transaction `tx` for `principal`: its transient grants stop
    /// counting from now on. Nothing is deleted.
    ///
    /// `closer` must be the admin or a host that issued `principal` a
    /// transient grant in `tx`. The beneficiary cannot keep its own
    /// transaction open by withholding a signature.
    pub fn revoke_transient(
        env: Env,
        closer: Address,
        principal: Address,
        tx: u64,
    ) -> Result<(), RevealError> {
        closer.require_auth();

        let admin = Self::load_admin(&env)?;
        let issuer_key = StorageKey::TxIssuer(principal.clone(), tx, closer.clone());
        if closer != admin && !env.storage().temporary().has(&issuer_key) {
            return Err(RevealError::NotGrantIssuer);
        }

        let key = StorageKey::TxClosed(principal.clone(), tx);
        env.storage().temporary().set(&key, &true);
        env.storage()
            .temporary()
            .extend_ttl(&key, SESSION_TTL_LEDGERS, SESSION_TTL_LEDGERS);

        EvTransientRevoked { principal, tx }.publish(&env);
        Ok(())
    }

    /// True iff `principal` holds a persistent grant, or a transient grant
    /// issued in `tx` while `tx` is still open. Never fails.
    pub fn is_authorized(env: Env, handle: BytesN<32>, principal: Address, tx: u64) -> bool {
        if env
            .storage()
            .persistent()
            .has(&StorageKey::AclPersistent(handle.clone(), principal.clone()))
        {
            return true;
        }
        env.storage()
            .temporary()
            .has(&StorageKey::AclTransient(handle, principal.clone(), tx))
            && !env
                .storage()
                .temporary()
                .has(&StorageKey::TxClosed(principal, tx))
    }

    // ───────────────────────────────────────────────────────────────────────────
    //  Public: Cleartext codec
    // ───────────────────────────────────────────────────────────────────────────

    /// ABI-encode values, one 32-byte word each, in the given order.
    pub fn encode_clear_values(env: Env, values: Vec<ClearValue>) -> Result<Bytes, RevealError> {
        Self::encode_values(&env, &values)
    }

    /// Decode relayer output given the expected kind of each word.
    pub fn decode_clear_values(
        env: Env,
        kinds: Vec<ClearKind>,
        data: Bytes,
    ) -> Result<Vec<ClearValue>, RevealError> {
        if data.len() != kinds.len() * WORD_LEN {
            return Err(RevealError::MalformedCleartexts);
        }
        let mut values = Vec::new(&env);
        let mut i = 0u32;
        for kind in kinds.iter() {
            let word = Self::read_word(&data, i * WORD_LEN);
            values.push_back(Self::decode_word(&env, kind, &word)?);
            i += 1;
        }
        Ok(values)
    }

    // ───────────────────────────────────────────────────────────────────────────
    //  Public: Queries
    // ───────────────────────────────────────────────────────────────────────────

    pub fn get_session(env: Env, session_id: u32) -> Result<RevealSession, RevealError> {
        Self::read_session(&env, session_id)
    }

    pub fn get_session_state(env: Env, session_id: u32) -> Result<u32, RevealError> {
        Ok(Self::read_session(&env, session_id)?.lifecycle_state)
    }

    pub fn get_result(env: Env, session_id: u32) -> Result<RevealOutcome, RevealError> {
        let session = Self::read_session(&env, session_id)?;
        if session.lifecycle_state != STATE_FINALIZED {
            return Err(RevealError::NotFinalized);
        }
        session.result.ok_or(RevealError::NotFinalized)
    }

    pub fn get_handle_owner(env: Env, handle: BytesN<32>) -> Option<u32> {
        env.storage()
            .persistent()
            .get(&StorageKey::HandleOwner(handle))
    }

    /// Up to 50 most recent finalized sessions the participant took part in.
    pub fn get_participant_history(env: Env, participant: Address) -> Vec<RevealSummary> {
        env.storage()
            .persistent()
            .get(&StorageKey::ParticipantHistory(participant))
            .unwrap_or_else(|| Vec::new(&env))
    }

    // ───────────────────────────────────────────────────────────────────────────
    //  Public: Admin
    // ───────────────────────────────────────────────────────────────────────────

    pub fn get_admin(env: Env) -> Result<Address, RevealError> {
        Self::load_admin(&env)
    }

    pub fn set_admin(env: Env, new_admin: Address) -> Result<(), RevealError> {
        let admin = Self::load_admin(&env)?;
        admin.require_auth();
        env.storage().instance().set(&StorageKey::Admin, &new_admin);
        Ok(())
    }

    pub fn get_fhe_engine(env: Env) -> Result<Address, RevealError> {
        Self::load_fhe_engine(&env)
    }

    pub fn set_fhe_engine(env: Env, new_engine: Address) -> Result<(), RevealError> {
        let admin = Self::load_admin(&env)?;
        admin.require_auth();
        env.storage()
            .instance()
            .set(&StorageKey::FheEngineAddress, &new_engine);
        Ok(())
    }

    pub fn get_kms_verifier(env: Env) -> Result<Address, RevealError> {
        Self::load_kms_verifier(&env)
    }

    pub fn set_kms_verifier(env: Env, new_verifier: Address) -> Result<(), RevealError> {
        let admin = Self::load_admin(&env)?;
        admin.require_auth();
        env.storage()
            .instance()
            .set(&StorageKey::KmsVerifierAddress, &new_verifier);
        Ok(())
    }

    pub fn upgrade(env: Env, new_wasm_hash: BytesN<32>) -> Result<(), RevealError> {
        let admin = Self::load_admin(&env)?;
        admin.require_auth();
        env.deployer().update_current_contract_wasm(new_wasm_hash);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    //  Internal: Proof verification
    // ═══════════════════════════════════════════════════════════════════════════

    fn verify_against(
        env: &Env,
        session: &RevealSession,
        clear_values: &Vec<ClearValue>,
        proof: &RevealProof,
    ) -> Result<(), RevealError> {
        match session.lifecycle_state {
            STATE_SEALED => {}
            STATE_FINALIZED => return Err(RevealError::AlreadyFinalized),
            _ => return Err(RevealError::SessionNotSealed),
        }

        // Cheap guard before any crypto
        if clear_values.len() != session.handles.len() {
            return Err(RevealError::LengthMismatch);
        }

        let encoded = Self::encode_values(env, clear_values)?;
        if encoded != proof.abi_encoded_clear_values {
            return Err(RevealError::InvalidProof);
        }

        let oracle = KmsOracleClient::new(env, &Self::load_kms_verifier(env)?);
        match oracle.try_verify_decryption(&session.handles, &encoded, &proof.signature) {
            Ok(Ok(())) => Ok(()),
            _ => Err(RevealError::InvalidProof),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    //  Internal: Finalization (single terminal transition)
    // ═══════════════════════════════════════════════════════════════════════════

    fn finalize_session(
        env: &Env,
        session: &mut RevealSession,
        clear_values: &Vec<ClearValue>,
    ) -> Result<RevealOutcome, RevealError> {
        if session.lifecycle_state == STATE_FINALIZED {
            return Err(RevealError::AlreadyFinalized);
        }

        let outcome = Self::apply_rule(env, session, clear_values)?;

        session.result = Some(outcome.clone());
        session.lifecycle_state = STATE_FINALIZED;
        session.finalized_ledger = Some(env.ledger().sequence());

        EvSessionFinalized {
            session_id: session.session_id,
            outcome: outcome.clone(),
        }
        .publish(env);

        for participant in session.participants.iter() {
            let code = Self::outcome_for(&outcome, &participant);
            Self::save_participant_history(env, session, &participant, code);
        }

        Self::write_session(env, session);
        Ok(outcome)
    }

    fn apply_rule(
        env: &Env,
        session: &RevealSession,
        values: &Vec<ClearValue>,
    ) -> Result<RevealOutcome, RevealError> {
        match session.rule {
            RevealRule::Values => Ok(RevealOutcome::Values(values.clone())),
            RevealRule::Dice(sides) => {
                let mut rolls = Vec::new(env);
                for value in values.iter() {
                    let n = Self::numeric(&value)?;
                    rolls.push_back((n % sides as u64) as u32 + 1);
                }
                Ok(RevealOutcome::Rolls(rolls))
            }
            RevealRule::HighestWins => {
                let mut best = 0u64;
                let mut best_index = 0u32;
                let mut tied = false;
                let mut i = 0u32;
                for value in values.iter() {
                    let n = Self::numeric(&value)?;
                    if i == 0 || n > best {
                        best = n;
                        best_index = i;
                        tied = false;
                    } else if n == best {
                        tied = true;
                    }
                    i += 1;
                }
                if tied {
                    return Ok(RevealOutcome::Draw);
                }
                Self::participant_at(session, best_index).map(RevealOutcome::Winner)
            }
            RevealRule::RockPaperScissors => {
                let a = Self::numeric_at(values, 0)? % 3;
                let b = Self::numeric_at(values, 1)? % 3;
                if a == b {
                    Ok(RevealOutcome::Draw)
                } else if b == (a + 1) % 3 {
                    // paper beats rock, scissors beat paper, rock beats scissors
                    Self::participant_at(session, 1).map(RevealOutcome::Winner)
                } else {
                    Self::participant_at(session, 0).map(RevealOutcome::Winner)
                }
            }
            RevealRule::Lottery(range) => {
                let range = range as u64;
                let draw = Self::numeric_at(values, 0)? % range;
                let mut winners = Vec::new(env);
                let mut i = 0u32;
                for participant in session.participants.iter() {
                    if Self::numeric_at(values, i + 1)? % range == draw {
                        winners.push_back(participant);
                    }
                    i += 1;
                }
                Ok(RevealOutcome::Winners(winners))
            }
        }
    }

    fn outcome_for(outcome: &RevealOutcome, participant: &Address) -> Outcome {
        match outcome {
            RevealOutcome::Winner(winner) if winner == participant => OUTCOME_WIN,
            RevealOutcome::Winner(_) => OUTCOME_LOSS,
            RevealOutcome::Draw => OUTCOME_DRAW,
            RevealOutcome::Winners(winners) if winners.contains(participant) => OUTCOME_WIN,
            RevealOutcome::Winners(_) => OUTCOME_LOSS,
            _ => OUTCOME_NONE,
        }
    }

    /// Append a summary to a participant's persistent history (ring buffer, max 50).
    fn save_participant_history(
        env: &Env,
        session: &RevealSession,
        participant: &Address,
        outcome: Outcome,
    ) {
        let key = StorageKey::ParticipantHistory(participant.clone());
        let mut history: Vec<RevealSummary> = env
            .storage()
            .persistent()
            .get(&key)
            .unwrap_or_else(|| Vec::new(env));

        while history.len() >= MAX_HISTORY_PER_PARTICIPANT {
            history.remove(0);
        }

        history.push_back(RevealSummary {
            session_id: session.session_id,
            host: session.host.clone(),
            outcome,
            ledger: env.ledger().sequence(),
        });

        env.storage().persistent().set(&key, &history);
        env.storage()
            .persistent()
            .extend_ttl(&key, LONG_TTL_LEDGERS, LONG_TTL_LEDGERS);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    //  Internal: Shape guards
    // ═══════════════════════════════════════════════════════════════════════════

    fn check_participants(participants: &Vec<Address>) -> Result<(), RevealError> {
        let mut i = 0u32;
        while i < participants.len() {
            let current = participants.get(i).ok_or(RevealError::DuplicateParticipant)?;
            if participants.first_index_of(&current) != Some(i) {
                return Err(RevealError::DuplicateParticipant);
            }
            i += 1;
        }
        Ok(())
    }

    /// Reject rules no handle layout could ever satisfy.
    fn check_rule(rule: &RevealRule, participants: u32) -> Result<(), RevealError> {
        let ok = match rule {
            RevealRule::Values => true,
            RevealRule::Dice(sides) => *sides >= 2,
            RevealRule::HighestWins => participants >= 2,
            RevealRule::RockPaperScissors => participants == 2,
            RevealRule::Lottery(range) => *range >= 1 && participants >= 1,
        };
        if !ok {
            return Err(RevealError::InvalidRule);
        }
        Ok(())
    }

    /// The handle count must fit the rule before anything is made public.
    fn check_shape(session: &RevealSession) -> Result<(), RevealError> {
        let handles = session.handles.len();
        let participants = session.participants.len();
        let ok = match session.rule {
            RevealRule::Values | RevealRule::Dice(_) => handles >= 1,
            RevealRule::HighestWins => handles == participants,
            RevealRule::RockPaperScissors => handles == 2,
            RevealRule::Lottery(_) => handles == participants + 1,
        };
        if !ok {
            return Err(RevealError::ShapeMismatch);
        }
        Ok(())
    }

    fn participant_at(session: &RevealSession, index: u32) -> Result<Address, RevealError> {
        session
            .participants
            .get(index)
            .ok_or(RevealError::ShapeMismatch)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    //  Internal: ACL
    // ═══════════════════════════════════════════════════════════════════════════

    fn record_grant(
        env: &Env,
        handle: &BytesN<32>,
        principal: &Address,
        scope: AclScope,
        tx: u64,
    ) -> Result<(), RevealError> {
        let engine = FheEngineClient::new(env, &Self::load_fhe_engine(env)?);

        match scope {
            AclScope::Persistent => {
                let key = StorageKey::AclPersistent(handle.clone(), principal.clone());
                if env.storage().persistent().has(&key) {
                    return Ok(());
                }
                env.storage().persistent().set(&key, &true);
                env.storage()
                    .persistent()
                    .extend_ttl(&key, LONG_TTL_LEDGERS, LONG_TTL_LEDGERS);
                engine.allow(handle, principal);
            }
            AclScope::Transient => {
                if env
                    .storage()
                    .temporary()
                    .has(&StorageKey::TxClosed(principal.clone(), tx))
                {
                    return Err(RevealError::TransactionClosed);
                }
                let key = StorageKey::AclTransient(handle.clone(), principal.clone(), tx);
                if env.storage().temporary().has(&key) {
                    return Ok(());
                }
                env.storage().temporary().set(&key, &true);
                env.storage()
                    .temporary()
                    .extend_ttl(&key, TRANSIENT_TTL_LEDGERS, TRANSIENT_TTL_LEDGERS);
                engine.allow_transient(handle, principal);
            }
        }

        EvAclGranted {
            handle: handle.clone(),
            principal: principal.clone(),
            persistent: scope == AclScope::Persistent,
            tx,
        }
        .publish(env);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    //  Internal: Cleartext codec
    // ═══════════════════════════════════════════════════════════════════════════

    fn encode_values(env: &Env, values: &Vec<ClearValue>) -> Result<Bytes, RevealError> {
        let mut out = Bytes::new(env);
        for value in values.iter() {
            out.append(&Bytes::from_array(env, &Self::encode_word(&value)?));
        }
        Ok(out)
    }

    /// Left-padded big-endian word, as Solidity's `abi.encode` lays out
    /// static types.
    fn encode_word(value: &ClearValue) -> Result<[u8; 32], RevealError> {
        let mut word = [0u8; 32];
        match value {
            ClearValue::U8(v) => {
                if *v > u8::MAX as u32 {
                    return Err(RevealError::InvalidClearValue);
                }
                word[31] = *v as u8;
            }
            ClearValue::U16(v) => {
                if *v > u16::MAX as u32 {
                    return Err(RevealError::InvalidClearValue);
                }
                word[30..].copy_from_slice(&(*v as u16).to_be_bytes());
            }
            ClearValue::U32(v) => word[28..].copy_from_slice(&v.to_be_bytes()),
            ClearValue::U64(v) => word[24..].copy_from_slice(&v.to_be_bytes()),
            ClearValue::Bool(b) => word[31] = *b as u8,
            ClearValue::EvmAddress(addr) => word[12..].copy_from_slice(&addr.to_array()),
        }
        Ok(word)
    }

    fn decode_word(env: &Env, kind: ClearKind, word: &[u8; 32]) -> Result<ClearValue, RevealError> {
        let padding = match kind {
            ClearKind::U8 | ClearKind::Bool => 31,
            ClearKind::U16 => 30,
            ClearKind::U32 => 28,
            ClearKind::U64 => 24,
            ClearKind::EvmAddress => 12,
        };
        if word[..padding].iter().any(|b| *b != 0) {
            return Err(RevealError::MalformedCleartexts);
        }

        let value = match kind {
            ClearKind::U8 => ClearValue::U8(word[31] as u32),
            ClearKind::U16 => ClearValue::U16(u16::from_be_bytes([word[30], word[31]]) as u32),
            ClearKind::U32 => {
                ClearValue::U32(u32::from_be_bytes([word[28], word[29], word[30], word[31]]))
            }
            ClearKind::U64 => {
                let mut be = [0u8; 8];
                be.copy_from_slice(&word[24..]);
                ClearValue::U64(u64::from_be_bytes(be))
            }
            ClearKind::Bool => match word[31] {
                0 => ClearValue::Bool(false),
                1 => ClearValue::Bool(true),
                _ => return Err(RevealError::MalformedCleartexts),
            },
            ClearKind::EvmAddress => {
                let mut addr = [0u8; 20];
                addr.copy_from_slice(&word[12..]);
                ClearValue::EvmAddress(BytesN::from_array(env, &addr))
            }
        };
        Ok(value)
    }

    fn read_word(data: &Bytes, offset: u32) -> [u8; 32] {
        let mut word = [0u8; 32];
        let mut i = 0usize;
        while i < 32 {
            word[i] = data.get(offset + i as u32).unwrap_or(0);
            i += 1;
        }
        word
    }

    fn numeric(value: &ClearValue) -> Result<u64, RevealError> {
        match value {
            ClearValue::U8(v) | ClearValue::U16(v) | ClearValue::U32(v) => Ok(*v as u64),
            ClearValue::U64(v) => Ok(*v),
            ClearValue::Bool(_) | ClearValue::EvmAddress(_) => Err(RevealError::InvalidClearValue),
        }
    }

    fn numeric_at(values: &Vec<ClearValue>, index: u32) -> Result<u64, RevealError> {
        let value = values.get(index).ok_or(RevealError::LengthMismatch)?;
        Self::numeric(&value)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    //  Internal: Storage
    // ═══════════════════════════════════════════════════════════════════════════

    fn next_session_id(env: &Env) -> Result<u32, RevealError> {
        let id: u32 = env
            .storage()
            .instance()
            .get(&StorageKey::NextSessionId)
            .unwrap_or(1);
        let next = id
            .checked_add(1)
            .ok_or(RevealError::SessionIdsExhausted)?;
        env.storage()
            .instance()
            .set(&StorageKey::NextSessionId, &next);
        Ok(id)
    }

    fn read_session(env: &Env, session_id: u32) -> Result<RevealSession, RevealError> {
        env.storage()
            .persistent()
            .get(&StorageKey::Session(session_id))
            .ok_or(RevealError::SessionNotFound)
    }

    fn write_session(env: &Env, session: &RevealSession) {
        let key = StorageKey::Session(session.session_id);
        env.storage().persistent().set(&key, session);
        env.storage()
            .persistent()
            .extend_ttl(&key, SESSION_TTL_LEDGERS, SESSION_TTL_LEDGERS);
        // Keep instance storage (admin, engine, verifier, id counter) alive
        env.storage()
            .instance()
            .extend_ttl(SESSION_TTL_LEDGERS, SESSION_TTL_LEDGERS);
    }

    fn load_handle_owner(env: &Env, handle: &BytesN<32>) -> Result<u32, RevealError> {
        env.storage()
            .persistent()
            .get(&StorageKey::HandleOwner(handle.clone()))
            .ok_or(RevealError::HandleNotRegistered)
    }

    fn load_admin(env: &Env) -> Result<Address, RevealError> {
        env.storage()
            .instance()
            .get(&StorageKey::Admin)
            .ok_or(RevealError::AdminNotSet)
    }

    fn load_fhe_engine(env: &Env) -> Result<Address, RevealError> {
        env.storage()
            .instance()
            .get(&StorageKey::FheEngineAddress)
            .ok_or(RevealError::FheEngineNotSet)
    }

    fn load_kms_verifier(env: &Env) -> Result<Address, RevealError> {
        env.storage()
            .instance()
            .get(&StorageKey::KmsVerifierAddress)
            .ok_or(RevealError::KmsVerifierNotSet)
    }
}
