//! Content-addressing properties across the model

use common::canonical::{canonical_hash, canonical_json};
use common::ids::client_order_id;
use common::model::intent::order_intent_id;
use common::model::snapshot::fixtures::trend_snapshot;
use proptest::prelude::*;
use serde_json::{Map, Value};

fn shuffled(map: &Map<String, Value>, seed: u64) -> Map<String, Value> {
    let mut entries: Vec<(String, Value)> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    let n = entries.len();
    if n > 1 {
        for i in 0..n {
            let j = (seed.wrapping_mul(6364136223846793005).wrapping_add(i as u64) % n as u64) as usize;
            entries.swap(i, j);
        }
    }
    entries.into_iter().collect()
}

proptest! {
    #[test]
    fn prop_key_order_never_changes_hash(
        keys in proptest::collection::btree_set("[a-zA-Z0-9_\u{e9}\u{20ac}]{1,8}", 1..12),
        ints in proptest::collection::vec(-1_000_000i64..1_000_000, 12),
        seed in any::<u64>(),
    ) {
        let mut map = Map::new();
        for (i, k) in keys.iter().enumerate() {
            map.insert(k.clone(), Value::from(ints[i % ints.len()]));
        }
        let reordered = shuffled(&map, seed);
        let a = Value::Object(map);
        let b = Value::Object(reordered);
        prop_assert_eq!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
        prop_assert_eq!(canonical_hash(&a).unwrap(), canonical_hash(&b).unwrap());
    }

    #[test]
    fn prop_canonical_is_fixed_point(
        values in proptest::collection::vec((-4_000_000i64..4_000_000).prop_map(|n| n as f64 / 4.0), 1..8),
    ) {
        let v = serde_json::json!({"xs": values, "nested": {"b": 1, "a": [true, null]}});
        let once = canonical_json(&v).unwrap();
        let reparsed: Value = serde_json::from_str(&once).unwrap();
        prop_assert_eq!(canonical_json(&reparsed).unwrap(), once);
    }
}

#[test]
fn snapshot_hash_matches_payload() {
    let s = trend_snapshot();
    assert_eq!(canonical_hash(&s.hash_payload().unwrap()).unwrap(), s.meta.snapshot_hash);
}

#[test]
fn client_order_id_derivation_is_stable() {
    let id = "oi_0123";
    assert_eq!(client_order_id(id), client_order_id(id));
    assert_eq!(client_order_id(id).len(), 36);
}

#[test]
fn intent_id_is_reproducible_from_decision_content() {
    use common::model::decision::{Decision, DecisionIntent, Side};
    use common::model::market::{DecisionConstraints, QuantizationPolicy};
    use common::{ReasonCode, Stage};

    let constraints = DecisionConstraints {
        tick_size: "0.01".into(),
        step_size: "0.001".into(),
        min_price: "0.01".into(),
        max_price: "0".into(),
        min_qty: "0.001".into(),
        max_qty: "100".into(),
        min_notional: "10".into(),
        max_notional: None,
        price_precision: 2,
        qty_precision: 3,
        max_num_orders: 200,
        max_num_algo_orders: 5,
        trailing_delta: None,
        quantization: QuantizationPolicy::Enforced,
    };
    let d = Decision {
        mode: "LIVE".into(),
        ts_ms: 1,
        symbol: "ETHUSDT".into(),
        side: Side::Buy,
        intent: DecisionIntent::Manage,
        entry: None,
        exit: None,
        edge_score_x10000: 0,
        expected_edge_bps: 0,
        reasons: vec![ReasonCode::StageOk],
        snapshot_id: "snap_1".into(),
        snapshot_hash: "c".repeat(64),
        decision_id: String::new(),
        cycle_id: "cyc_1".into(),
        stage: Stage::PositionManage,
        constraints,
        aigate: None,
        risk: None,
    };
    let mut later = d.clone();
    later.ts_ms = 99;
    later.cycle_id = "cyc_2".into();
    assert_eq!(order_intent_id(&d).unwrap(), order_intent_id(&later).unwrap());
    assert!(order_intent_id(&d).unwrap().starts_with("oi_"));
}
