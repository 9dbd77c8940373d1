//! Wire-format parity: the properties two independent processes must agree
//! on without ever talking directly.

#[cfg(test)]
use rust_decimal_macros::dec;
#[cfg(test)]
use uuid::Uuid;

#[cfg(test)]
use shared_types::{
    canonical_json, BreakerThresholds, CanonicalPolicy, IntentEnvelope, IntentPayload, OrderType,
    Side, SymbolPolicy,
};

#[cfg(test)]
fn sample_policy() -> CanonicalPolicy {
    let mut symbols = std::collections::BTreeMap::new();
    symbols.insert(
        "BTCUSDT".to_string(),
        SymbolPolicy {
            max_notional: dec!(50000),
            max_leverage: 5,
            recon_tolerance: dec!(0.0001),
        },
    );
    symbols.insert(
        "ETHUSDT".to_string(),
        SymbolPolicy {
            max_notional: dec!(25000),
            max_leverage: 4,
            recon_tolerance: dec!(0.001),
        },
    );
    CanonicalPolicy {
        version: 3,
        symbols,
        max_account_leverage: 10,
        strategy_daily_loss_cap: dec!(1000),
        breaker: BreakerThresholds::default(),
        orders_per_second: 10,
        default_recon_tolerance: dec!(0.001),
    }
}

#[cfg(test)]
fn sample_payload() -> IntentPayload {
    IntentPayload {
        intent_id: Uuid::parse_str("0192a1b2-3c4d-4e5f-8091-a2b3c4d5e6f7").unwrap(),
        symbol: "BTCUSDT".to_string(),
        side: Side::Sell,
        order_type: OrderType::PostOnly,
        quantity: dec!(0.125),
        limit_price: Some(dec!(64250.50)),
        stop_loss: Some(dec!(66000)),
        take_profit: Some(dec!(60000)),
        leverage: 3,
        client_order_tag: "sig-77".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two processes loading the same policy document compute the same
    /// hash; that equality is the entire handshake.
    #[test]
    fn test_policy_hash_parity_across_processes() {
        // "Process A" serializes its policy to a file; "process B" loads it.
        let policy_a = sample_policy();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(&path, serde_json::to_vec_pretty(&policy_a).unwrap()).unwrap();

        let policy_b = CanonicalPolicy::load(&path).unwrap();
        assert_eq!(policy_a.hash(), policy_b.hash());
    }

    /// Hash differs for any semantic change.
    #[test]
    fn test_policy_hash_detects_tamper() {
        let policy_a = sample_policy();
        let mut policy_b = sample_policy();
        policy_b
            .symbols
            .get_mut("BTCUSDT")
            .unwrap()
            .max_notional = dec!(50001);
        assert_ne!(policy_a.hash(), policy_b.hash());
    }

    /// Envelope encode -> decode returns an equal envelope with a valid MAC.
    #[test]
    fn test_envelope_wire_round_trip() {
        let envelope = IntentEnvelope::signed(
            sample_payload(),
            sample_policy().hash(),
            "brain-a".to_string(),
            12,
            1_700_000_000_000,
            7,
            b"secret",
        )
        .unwrap();

        let wire = serde_json::to_string(&envelope).unwrap();
        let decoded: IntentEnvelope = serde_json::from_str(&wire).unwrap();
        assert_eq!(envelope, decoded);
        assert!(decoded.verify(b"secret").is_ok());
    }

    /// Canonical JSON of a decoded value equals the canonical JSON of the
    /// original: the signing preimage survives transport.
    #[test]
    fn test_canonical_json_stable_through_wire() {
        let payload = sample_payload();
        let canonical_before = canonical_json(&payload).unwrap();

        let wire = serde_json::to_string(&payload).unwrap();
        let decoded: IntentPayload = serde_json::from_str(&wire).unwrap();
        let canonical_after = canonical_json(&decoded).unwrap();

        assert_eq!(canonical_before, canonical_after);
    }

    /// Money fields travel as decimal strings, never floats.
    #[test]
    fn test_decimal_fields_are_strings_on_wire() {
        let wire = serde_json::to_value(sample_payload()).unwrap();
        assert!(wire["quantity"].is_string());
        assert!(wire["limit_price"].is_string());
        assert_eq!(wire["quantity"], "0.125");
    }

    /// The MAC binds the envelope to the exact decimal rendering.
    #[test]
    fn test_mac_sensitive_to_decimal_rendering() {
        let secret = b"secret";
        let envelope = IntentEnvelope::signed(
            sample_payload(),
            sample_policy().hash(),
            "brain-a".to_string(),
            1,
            1_700_000_000_000,
            1,
            secret,
        )
        .unwrap();

        let mut tampered = envelope.clone();
        tampered.payload.quantity = dec!(0.1250); // same value, more scale
        // rust_decimal keeps scale, so the canonical string differs and the
        // MAC must fail.
        assert!(tampered.verify(secret).is_err());
    }
}
