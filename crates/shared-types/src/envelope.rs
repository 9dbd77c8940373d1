//! # Intent Envelope
//!
//! The signed unit of work from Cortex to Motor.
//!
//! ## Security Properties
//!
//! - **Envelope Authority**: `brain_instance_id` in the envelope header is the
//!   sole source of issuer identity; the payload carries none.
//! - **Replay Prevention**: per-issuer monotonic `nonce`, bounded by the
//!   receiver's replay guard.
//! - **Fencing**: `leader_term` invalidates intents from superseded leaders.
//! - **Policy Parity**: `policy_hash` must equal the hash the Motor loaded.
//!
//! The MAC covers `issued_at:nonce:canonical_json(payload)` so that neither
//! the timing fields nor the order request can be altered independently.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::entities::IntentPayload;
use crate::policy::PolicyHash;

/// Envelope construction/verification failures.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Envelope not serializable: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Signature is not valid hex")]
    SignatureNotHex,

    #[error("MAC verification failed")]
    MacInvalid,
}

/// Serialize any value as canonical JSON: recursively sorted keys, compact
/// separators. MACs and policy hashes are computed over this form only, so
/// encode-decode round trips cannot perturb them.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    // serde_json::Value maps are BTreeMap-backed, so converting through Value
    // sorts keys at every level.
    let value = serde_json::to_value(value)?;
    serde_json::to_string(&value)
}

/// The signed intent wire contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentEnvelope {
    // =========================================================================
    // PAYLOAD
    // =========================================================================
    /// The order request. Money fields are decimal strings on the wire.
    pub payload: IntentPayload,

    // =========================================================================
    // HEADER
    // =========================================================================
    /// Digest of the canonical policy the issuer compiled against.
    pub policy_hash: PolicyHash,

    /// Issuer identity. The sole source of truth for who sent this.
    pub brain_instance_id: String,

    /// Fencing token from the issuer's election. Monotonic per issuer.
    pub leader_term: u64,

    /// Milliseconds since epoch at issue time.
    pub issued_at: i64,

    /// Per-issuer monotonic counter.
    pub nonce: u64,

    // =========================================================================
    // SECURITY
    // =========================================================================
    /// HMAC-SHA256 over the signing preimage, lowercase hex.
    pub signature: String,
}

impl IntentEnvelope {
    /// The exact byte string the MAC covers.
    pub fn signing_preimage(
        issued_at: i64,
        nonce: u64,
        payload: &IntentPayload,
    ) -> Result<String, EnvelopeError> {
        let payload_json = canonical_json(payload)?;
        Ok(format!("{issued_at}:{nonce}:{payload_json}"))
    }

    /// Construct and sign an envelope with the issuer's shared secret.
    pub fn signed(
        payload: IntentPayload,
        policy_hash: PolicyHash,
        brain_instance_id: String,
        leader_term: u64,
        issued_at: i64,
        nonce: u64,
        secret: &[u8],
    ) -> Result<Self, EnvelopeError> {
        let preimage = Self::signing_preimage(issued_at, nonce, &payload)?;
        let mac = crate::security::sign_bytes(preimage.as_bytes(), secret);
        Ok(Self {
            payload,
            policy_hash,
            brain_instance_id,
            leader_term,
            issued_at,
            nonce,
            signature: hex::encode(mac),
        })
    }

    /// Verify the MAC in constant time.
    ///
    /// # Errors
    ///
    /// `EnvelopeError::SignatureNotHex` for a malformed signature field,
    /// `EnvelopeError::MacInvalid` for a failing MAC.
    pub fn verify(&self, secret: &[u8]) -> Result<(), EnvelopeError> {
        let preimage = Self::signing_preimage(self.issued_at, self.nonce, &self.payload)?;
        let sig = hex::decode(&self.signature).map_err(|_| EnvelopeError::SignatureNotHex)?;
        if crate::security::verify_bytes(preimage.as_bytes(), &sig, secret) {
            Ok(())
        } else {
            Err(EnvelopeError::MacInvalid)
        }
    }

    /// Extract the intent id from raw envelope bytes without full parsing.
    ///
    /// The disarmed interlock and the malformed path both want an id for
    /// audit correlation even when the rest of the envelope is hostile
    /// garbage, so this tolerates any shape around `payload.intent_id`.
    #[must_use]
    pub fn extract_intent_id(raw: &[u8]) -> Option<Uuid> {
        let value: serde_json::Value = serde_json::from_slice(raw).ok()?;
        let id = value.get("payload")?.get("intent_id")?.as_str()?;
        Uuid::parse_str(id).ok()
    }
}
