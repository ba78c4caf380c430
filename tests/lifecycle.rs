//! End-to-end lifecycle tests against the in-process gateway

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use proptest::prelude::*;

use chart_signal_trader::execution::{
    load_rows, ExitReason, FillMode, HistoricalBar, LedgerAction, LedgerSummary, LifecycleManager, PriceCache,
    SignalDecision, SimulatedGateway, TradeLedger, TradingConfig, COLUMNS,
};
use chart_signal_trader::session::{FixedClock, MarketSession};
use chart_signal_trader::vision::{Direction, Signal, SignalSet};

struct Rig {
    manager: LifecycleManager,
    gateway: Arc<SimulatedGateway>,
    ledger_path: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

fn rig_at(hour: u32, minute: u32) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let ledger_path = dir.path().join("records").join("trading_records.csv");
    let gateway = Arc::new(SimulatedGateway::new(PriceCache::new()));
    let config = TradingConfig {
        fill_timeout: Duration::from_millis(50),
        ledger_path: ledger_path.clone(),
        ..Default::default()
    };
    let ledger = TradeLedger::open(&ledger_path).unwrap();
    let date = NaiveDate::from_ymd_opt(2025, 3, 12).unwrap();
    let clock = Arc::new(FixedClock::eastern(date, hour, minute).unwrap());
    let manager = LifecycleManager::new(
        config,
        gateway.clone(),
        ledger,
        MarketSession::default(),
        clock,
        vec!["AAPL".to_string(), "NVDA".to_string()],
    );
    Rig {
        manager,
        gateway,
        ledger_path,
        _dir: dir,
    }
}

fn rig() -> Rig {
    rig_at(10, 0)
}

fn all(signal: Signal) -> SignalSet {
    SignalSet::new(signal, signal, signal)
}

#[tokio::test]
async fn test_timed_out_fill_records_estimate() {
    let rig = rig();
    rig.gateway.set_price("AAPL", 100.0);
    rig.gateway.set_fill_mode(FillMode::Never);

    let position = rig
        .manager
        .place_order("AAPL", Direction::Buy, 100.0, all(Signal::Buy), Some(1.0))
        .await
        .unwrap();
    assert_eq!(position.entry_price, 100.0);
    assert!(position.estimated_fill);

    let rows = load_rows(&rig.ledger_path).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].notes, "Trade entry; estimated fill");
    assert_eq!(rows[0].entry_price, 100.0);
}

#[tokio::test]
async fn test_rejected_entry_stays_flat() {
    let rig = rig();
    rig.gateway.set_price("AAPL", 100.0);
    rig.gateway.set_fill_mode(FillMode::Reject);

    let result = rig
        .manager
        .place_order("AAPL", Direction::Buy, 100.0, all(Signal::Buy), None)
        .await;
    assert!(result.is_err());
    assert!(rig.manager.is_flat("AAPL").await);
    assert!(load_rows(&rig.ledger_path).unwrap().is_empty());

    // the symbol is not left claimed
    rig.gateway.set_fill_mode(FillMode::Immediate);
    assert!(rig
        .manager
        .place_order("AAPL", Direction::Buy, 100.0, all(Signal::Buy), None)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_submission_failure_stays_flat() {
    let rig = rig();
    rig.gateway.set_fail_submissions(true);
    assert!(rig
        .manager
        .place_order("NVDA", Direction::Sell, 120.0, all(Signal::Sell), None)
        .await
        .is_err());
    assert!(rig.manager.is_flat("NVDA").await);
    assert!(load_rows(&rig.ledger_path).unwrap().is_empty());
}

#[tokio::test]
async fn test_exit_without_price_keeps_position() {
    let rig = rig();
    rig.gateway.set_price("AAPL", 100.0);
    rig.manager
        .place_order("AAPL", Direction::Buy, 100.0, all(Signal::Buy), None)
        .await
        .unwrap();

    rig.gateway.price_cache().remove("AAPL");
    let closed = rig.manager.close_position("AAPL", ExitReason::StopLoss).await.unwrap();
    assert!(closed.is_none());
    assert!(!rig.manager.is_flat("AAPL").await);
    assert_eq!(load_rows(&rig.ledger_path).unwrap().len(), 1);
    assert!(rig.manager.check_exit_conditions().await.is_empty());
}

#[tokio::test]
async fn test_close_when_flat_is_noop() {
    let rig = rig();
    rig.gateway.set_price("AAPL", 100.0);
    let closed = rig.manager.close_position("AAPL", ExitReason::TakeProfit).await.unwrap();
    assert!(closed.is_none());
    assert!(rig.gateway.submitted().is_empty());
    assert!(load_rows(&rig.ledger_path).unwrap().is_empty());
}

#[tokio::test]
async fn test_opposite_signal_flips_position() {
    let rig = rig();
    rig.gateway.set_price("AAPL", 100.0);
    let first = rig.manager.on_signal("AAPL", all(Signal::Buy)).await.unwrap();
    assert!(matches!(first, SignalDecision::Entered(ref p) if p.direction == Direction::Buy));

    rig.gateway.set_price("AAPL", 100.4);
    let sell = SignalSet::new(Signal::Sell, Signal::None, Signal::Sell);
    let second = rig.manager.on_signal("AAPL", sell).await.unwrap();
    assert!(matches!(second, SignalDecision::Entered(ref p) if p.direction == Direction::Sell));

    let rows = load_rows(&rig.ledger_path).unwrap();
    let actions: Vec<LedgerAction> = rows.iter().map(|r| r.action).collect();
    assert_eq!(actions, vec![LedgerAction::Entry, LedgerAction::Exit, LedgerAction::Entry]);
    assert_eq!(rows[1].exit_reason.as_deref(), Some("OPPOSITE SIGNAL (SELL)"));
    assert_eq!(rows[1].trade_id, rows[0].trade_id);
    assert_eq!(rows[2].signal_type, "SELL");
    assert_eq!(rows[2].td_signal, Some(Signal::None));

    let position = rig.manager.position("AAPL").await.unwrap();
    assert_eq!(position.direction, Direction::Sell);
}

#[tokio::test]
async fn test_fibonacci_levels_from_history() {
    let rig = rig();
    let bars: Vec<HistoricalBar> = [(96.0, 104.0), (95.0, 110.0), (98.0, 102.0)]
        .iter()
        .map(|&(low, high)| HistoricalBar {
            timestamp: Utc::now(),
            open: low,
            high,
            low,
            close: high,
            volume: 1000.0,
        })
        .collect();
    rig.gateway.set_bars("AAPL", bars);
    rig.gateway.set_price("AAPL", 100.0);

    let decision = rig.manager.on_signal("AAPL", all(Signal::Buy)).await.unwrap();
    let SignalDecision::Entered(position) = decision else {
        panic!("expected an entry, got {:?}", decision);
    };
    assert!((position.stop_loss - 96.18).abs() < 1e-9);
    assert!((position.take_profit - 108.09).abs() < 1e-9);
}

#[tokio::test]
async fn test_ledger_columns_and_summary() {
    let rig = rig_at(8, 15);
    rig.gateway.set_price("NVDA", 120.0);
    rig.manager
        .place_order("NVDA", Direction::Sell, 120.0, all(Signal::Sell), None)
        .await
        .unwrap();
    rig.gateway.set_price("NVDA", 114.0);
    let closed = rig.manager.check_exit_conditions().await;
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].reason, ExitReason::TakeProfit);

    let text = std::fs::read_to_string(&rig.ledger_path).unwrap();
    let header = text.lines().next().unwrap();
    assert_eq!(header, COLUMNS.join(","));

    let rows = load_rows(&rig.ledger_path).unwrap();
    assert_eq!(rows.len(), 2);
    let entry = &rows[0];
    assert_eq!(entry.entry_time, "2025-03-12 08:15:00");
    assert_eq!(entry.market_hours, "No");
    assert_eq!(entry.order_type, "Limit @ $119.40");
    assert_eq!(entry.exit_time, None);
    assert_eq!(entry.pnl_dollar, None);

    let exit = &rows[1];
    assert_eq!(exit.action, LedgerAction::Exit);
    assert_eq!(exit.exit_reason.as_deref(), Some("TAKE PROFIT"));
    assert_eq!(exit.order_type, "Limit @ $114.57");
    assert_eq!(exit.duration_minutes, Some(0.0));

    let summary = LedgerSummary::from_rows(&rows);
    assert_eq!(summary.entries, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.open, 0);
    assert_eq!(summary.wins, 1);
}

#[derive(Debug, Clone)]
enum Step {
    Enter(bool),
    Close,
    Price(f64),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        any::<bool>().prop_map(Step::Enter),
        Just(Step::Close),
        (90.0f64..110.0).prop_map(Step::Price),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_ledger_alternates_entry_exit(steps in proptest::collection::vec(step(), 1..12)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let rig = rig();
            rig.gateway.set_price("AAPL", 100.0);
            for step in &steps {
                match step {
                    Step::Enter(buy) => {
                        let direction = if *buy { Direction::Buy } else { Direction::Sell };
                        let was_flat = rig.manager.is_flat("AAPL").await;
                        let price = rig.gateway.price_cache().get("AAPL").unwrap_or(100.0);
                        let result = rig
                            .manager
                            .place_order("AAPL", direction, price, all(direction.as_signal()), None)
                            .await;
                        assert_eq!(result.is_ok(), was_flat);
                    }
                    Step::Close => {
                        rig.manager.close_position("AAPL", ExitReason::Manual("test".into())).await.unwrap();
                        assert!(rig.manager.is_flat("AAPL").await);
                    }
                    Step::Price(p) => {
                        rig.gateway.set_price("AAPL", *p);
                        rig.manager.check_exit_conditions().await;
                    }
                }
            }

            let rows = load_rows(&rig.ledger_path).unwrap();
            for (i, row) in rows.iter().enumerate() {
                let expected = if i % 2 == 0 { LedgerAction::Entry } else { LedgerAction::Exit };
                assert_eq!(row.action, expected, "row {} of {:?}", i, rows);
                if row.action == LedgerAction::Exit {
                    assert_eq!(row.trade_id, rows[i - 1].trade_id);
                }
            }
            assert_eq!(rig.manager.is_flat("AAPL").await, rows.len() % 2 == 0);
        });
    }
}
