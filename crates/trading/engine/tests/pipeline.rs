//! Snapshot build through selection to an entry proposal

use common::AgentConfig;
use common::config::StrategyConfig;
use common::model::market::fixtures::btc_filters;
use common::model::{BookSample, Snapshot, SymbolFilters};
use common::ReasonCode;
use engine::snapshot::fixtures::{NOW, fees, healthy, sample, ticker, trending_series};
use engine::{
    CandleSeries, Proposal, SnapshotBuilder, SnapshotInputs, TopKCandidate, deep_scan, propose_entry,
    rank_top_n, select_top_k, universe_scan,
};

fn filters(symbol: &str) -> SymbolFilters {
    SymbolFilters {
        symbol: symbol.into(),
        ..btc_filters()
    }
}

fn book() -> Vec<BookSample> {
    (0..30)
        .map(|i| sample(NOW - 58_000 + i * 2_000, "112.00", "112.02", "6", "4"))
        .collect()
}

fn build(builder: &SnapshotBuilder, symbol: &str, quote_volume: &str, series: &CandleSeries) -> Snapshot {
    let mut t = ticker(symbol);
    t.quote_volume = quote_volume.into();
    let f = filters(symbol);
    let book = book();
    builder
        .build(
            &SnapshotInputs {
                ticker: &t,
                book: &book,
                candles: series,
                filters: &f,
                costs: fees(),
                health: healthy(),
                ooo_drops: 0,
            },
            NOW,
        )
        .unwrap()
}

#[test]
fn test_cycle_selects_one_of_correlated_twins_and_proposes() {
    let cfg = AgentConfig::default();
    let builder = SnapshotBuilder::new(&cfg, 1).unwrap();
    let series = trending_series();
    let snapshots = vec![
        build(&builder, "BBBUSDT", "50000000.00", &series),
        build(&builder, "AAAUSDT", "50000000.00", &series),
        build(&builder, "THINUSDT", "1000.00", &series),
    ];

    let universe = universe_scan(&cfg.universe, &snapshots);
    assert_eq!(universe[2].reasons, vec![ReasonCode::UniverseLowVolume]);
    let eligible: Vec<&Snapshot> = snapshots
        .iter()
        .zip(&universe)
        .filter(|(_, v)| v.eligible)
        .map(|(s, _)| s)
        .collect();
    assert_eq!(eligible.len(), 2);

    let ranked = rank_top_n(&cfg.rank, &eligible);
    assert_eq!(ranked[0].symbol, "AAAUSDT");
    assert!(ranked.iter().all(|r| r.selected));

    let deep = deep_scan(&cfg.deep, &eligible);
    assert!(deep.iter().all(|d| d.passed));

    let candidates: Vec<TopKCandidate<'_>> = deep
        .iter()
        .filter_map(|d| {
            let s = eligible.iter().find(|s| s.symbol == d.symbol)?;
            Some(TopKCandidate {
                symbol: &s.symbol,
                score_x10000: d.score_x10000,
                returns: &s.returns,
            })
        })
        .collect();
    let topk = select_top_k(&cfg.topk, &candidates, None);
    assert_eq!(topk.selected(), ["AAAUSDT"]);
    assert_eq!(topk.pairs_over_limit.len(), 1);
    assert_eq!(topk.pairs_over_limit[0].candidate, "BBBUSDT");

    let strategy = StrategyConfig {
        pullback_max_bps: 300,
        ..StrategyConfig::default()
    };
    let constraints = filters("AAAUSDT").to_constraints().unwrap();
    let chosen = eligible.iter().find(|s| s.symbol == "AAAUSDT").unwrap();
    let first = propose_entry(&strategy, chosen, &constraints, "cyc_a", NOW).unwrap();
    let second = propose_entry(&strategy, chosen, &constraints, "cyc_b", NOW).unwrap();
    let (Proposal::Entry(first), Proposal::Entry(second)) = (first, second) else {
        panic!("expected entries");
    };
    assert_eq!(first.snapshot_hash, chosen.meta.snapshot_hash);
    assert_ne!(first.decision_id, second.decision_id, "cycle id is part of the decision payload");
    assert_eq!(
        first.entry.as_ref().unwrap().client_order_id,
        second.entry.as_ref().unwrap().client_order_id,
        "cycle id is not part of the intent key"
    );
}
