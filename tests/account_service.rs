mod common;

use chrono::{DateTime, TimeZone, Utc};
use common::eventually;
use futures::future::join_all;
use spotdesk::account::{AccountService, AccountServiceConfig, BalanceCallback, SYNC_REASON};
use spotdesk::core::clock::{Clock, ManualClock};
use spotdesk::core::deadline::Deadline;
use spotdesk::store::StaticPositions;
use spotdesk::utils::{InMemoryRest, InMemoryUserStream};
use spotdesk::{AssetBalance, ExchangeError, RiskLevel, StreamState, Wallet, WsUserData};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const NOW_MS: i64 = 1_700_000_000_000;

fn at(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).unwrap()
}

fn deadline() -> Deadline {
    Deadline::after(Duration::from_secs(5))
}

struct Fixture {
    clock: Arc<ManualClock>,
    rest: Arc<InMemoryRest>,
    stream: Arc<InMemoryUserStream>,
    service: AccountService,
}

fn fixture() -> Fixture {
    let clock = Arc::new(ManualClock::new(NOW_MS));
    let rest = Arc::new(InMemoryRest::new(clock.clone()));
    rest.set_balances(vec![
        AssetBalance::new("USDT", 100.0, 0.0),
        AssetBalance::new("BTC", 0.5, 0.0),
    ]);
    let stream = Arc::new(InMemoryUserStream::new());
    let service = AccountService::builder(rest.clone(), clock.clone())
        .with_user_stream(stream.clone())
        .build();
    Fixture {
        clock,
        rest,
        stream,
        service,
    }
}

/// Callback that records every wallet it is handed
fn recorder() -> (Arc<Mutex<Vec<Wallet>>>, BalanceCallback) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: BalanceCallback = Arc::new(move |wallet: Wallet| sink.lock().unwrap().push(wallet));
    (seen, callback)
}

#[tokio::test]
async fn test_concurrent_misses_share_one_snapshot() {
    let f = fixture();
    f.rest.set_latency(Duration::from_millis(100));

    let results = join_all((0..100).map(|_| f.service.get_wallet(deadline()))).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(InMemoryRest::count(&f.rest.calls.wallet), 1);

    let first = results[0].as_ref().unwrap();
    assert!(results.iter().all(|r| r.as_ref().unwrap() == first));

    f.service.get_wallet(deadline()).await.unwrap();
    f.service.get_account_balance(deadline()).await.unwrap();
    assert_eq!(InMemoryRest::count(&f.rest.calls.wallet), 1);
}

#[tokio::test]
async fn test_failed_snapshot_is_not_cached() {
    let f = fixture();
    f.rest.fail_next_wallet(ExchangeError::RequestError("connection reset".to_string()));

    assert!(f.service.get_wallet(deadline()).await.is_err());
    let wallet = f.service.get_wallet(deadline()).await.unwrap();
    assert!((wallet.total_of("USDT") - 100.0).abs() < f64::EPSILON);
    assert_eq!(InMemoryRest::count(&f.rest.calls.wallet), 2);
}

#[tokio::test]
async fn test_expired_cache_refetches() {
    let clock = Arc::new(ManualClock::new(NOW_MS));
    let rest = Arc::new(InMemoryRest::new(clock.clone()));
    let config = AccountServiceConfig {
        cache_ttl: Duration::from_millis(50),
        ..AccountServiceConfig::default()
    };
    let service = AccountService::builder(rest.clone(), clock)
        .with_config(config)
        .build();

    service.get_wallet(deadline()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    service.get_wallet(deadline()).await.unwrap();
    assert_eq!(InMemoryRest::count(&rest.calls.wallet), 2);
}

#[tokio::test]
async fn test_deltas_reach_every_subscriber() {
    let f = fixture();
    let (first, first_cb) = recorder();
    let (second, second_cb) = recorder();

    f.service.subscribe_to_balance_updates(first_cb).await.unwrap();
    f.service.subscribe_to_balance_updates(second_cb).await.unwrap();
    assert_eq!(f.stream.connect_count(), 1);
    assert_eq!(f.stream.state(), StreamState::Subscribed);
    assert_eq!(f.service.subscriber_count().await, 2);

    assert!(f
        .stream
        .push_delta(AssetBalance::new("BTC", 1.25, 0.25), at(NOW_MS + 1_000)));

    eventually("both subscribers notified", || {
        !first.lock().unwrap().is_empty() && !second.lock().unwrap().is_empty()
    })
    .await;

    for seen in [&first, &second] {
        let wallet = seen.lock().unwrap()[0].clone();
        assert!((wallet.total_of("BTC") - 1.5).abs() < 1e-9);
        assert!((wallet.total_of("USDT") - 100.0).abs() < 1e-9);
    }

    // the merged wallet is now what the cache serves
    let cached = f.service.get_wallet(deadline()).await.unwrap();
    assert!((cached.total_of("BTC") - 1.5).abs() < 1e-9);
    assert_eq!(InMemoryRest::count(&f.rest.calls.wallet), 1);
}

#[tokio::test]
async fn test_updated_at_never_moves_backwards() {
    let f = fixture();
    let (seen, callback) = recorder();
    f.service.subscribe_to_balance_updates(callback).await.unwrap();

    f.stream.push_delta(AssetBalance::new("BTC", 1.0, 0.0), at(NOW_MS + 3_000));
    f.stream.push_delta(AssetBalance::new("BTC", 2.0, 0.0), at(NOW_MS + 1_000));
    f.stream.push_delta(AssetBalance::new("ETH", 4.0, 0.0), at(NOW_MS + 2_000));

    eventually("three updates", || seen.lock().unwrap().len() == 3).await;

    let seen = seen.lock().unwrap();
    assert!(seen
        .windows(2)
        .all(|pair| pair[0].updated_at <= pair[1].updated_at));
    // deltas are applied in arrival order
    assert!((seen[2].total_of("BTC") - 2.0).abs() < f64::EPSILON);
    assert!((seen[2].total_of("ETH") - 4.0).abs() < f64::EPSILON);
    assert_eq!(seen[2].updated_at, at(NOW_MS + 3_000));
}

#[tokio::test]
async fn test_reconnect_invalidates_cached_wallet() {
    let f = fixture();
    let (_seen, callback) = recorder();
    f.service.subscribe_to_balance_updates(callback).await.unwrap();

    f.service.get_wallet(deadline()).await.unwrap();
    assert_eq!(InMemoryRest::count(&f.rest.calls.wallet), 1);

    f.rest.set_balances(vec![AssetBalance::new("USDT", 75.0, 0.0)]);
    f.stream.simulate_reconnect();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let wallet = f.service.get_wallet(deadline()).await.unwrap();
    assert_eq!(InMemoryRest::count(&f.rest.calls.wallet), 2);
    assert!((wallet.total_of("USDT") - 75.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_rejected_stream_rolls_back_subscription() {
    let f = fixture();
    f.stream.reject_authentication(true);
    let (_seen, callback) = recorder();

    let err = f.service.subscribe_to_balance_updates(callback).await.unwrap_err();
    assert!(matches!(err, ExchangeError::AuthError(_)), "got {err:?}");
    assert_eq!(f.service.subscriber_count().await, 0);
}

#[tokio::test]
async fn test_unsubscribed_callback_stops_receiving() {
    let f = fixture();
    let (kept, kept_cb) = recorder();
    let (dropped, dropped_cb) = recorder();
    f.service.subscribe_to_balance_updates(kept_cb).await.unwrap();
    let id = f.service.subscribe_to_balance_updates(dropped_cb).await.unwrap();

    assert!(f.service.unsubscribe(id).await);
    f.stream.push_delta(AssetBalance::new("BTC", 3.0, 0.0), at(NOW_MS));

    eventually("remaining subscriber notified", || !kept.lock().unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(dropped.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_update_balance_records_transactions() {
    let f = fixture();
    let (seen, callback) = recorder();
    f.service.subscribe_to_balance_updates(callback).await.unwrap();

    let deposit = f
        .service
        .update_balance(deadline(), 50.0, "Deposit from bank")
        .await
        .unwrap();
    assert!((deposit.balance_after - 150.0).abs() < f64::EPSILON);

    let sale = f
        .service
        .update_balance(deadline(), -30.0, "Sell BTC position")
        .await
        .unwrap();
    assert!((sale.balance_after - 120.0).abs() < f64::EPSILON);

    let err = f
        .service
        .update_balance(deadline(), -1_000.0, "Withdrawal")
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::InvalidParameters(_)));

    let err = f
        .service
        .update_balance(deadline(), f64::NAN, "Deposit")
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::InvalidParameters(_)));

    eventually("two balance notifications", || seen.lock().unwrap().len() == 2).await;

    let summary = f.service.get_balance_summary(deadline(), 7).await.unwrap();
    assert!((summary.current_balance - 120.0).abs() < f64::EPSILON);
    assert!((summary.deposits - 50.0).abs() < f64::EPSILON);
    assert!((summary.withdrawals - 30.0).abs() < f64::EPSILON);
    assert!((summary.net_change - 20.0).abs() < f64::EPSILON);
    assert_eq!(summary.transaction_count, 2);
    assert_eq!(summary.period_days, 7);

    let end = f.clock.now();
    let start = end - chrono::Duration::days(1);
    let analysis = f.service.analyze_transactions(start, end).await.unwrap();
    assert_eq!(analysis.total_count, 2);
    assert_eq!(analysis.buy_count, 1);
    assert_eq!(analysis.sell_count, 1);
    assert!((analysis.buy_volume - 50.0).abs() < f64::EPSILON);
    assert!((analysis.sell_volume - 30.0).abs() < f64::EPSILON);
    assert!((analysis.total_volume - 80.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_inverted_time_range_is_rejected() {
    let f = fixture();
    let end = f.clock.now();
    let start = end + chrono::Duration::seconds(1);

    let err = f.service.get_transaction_history(start, end).await.unwrap_err();
    assert!(matches!(err, ExchangeError::InvalidParameters(ref m) if m == "invalid time range"));
    assert!(f.service.analyze_transactions(start, end).await.is_err());
}

#[tokio::test]
async fn test_sync_records_only_real_differences() {
    let f = fixture();
    f.rest.set_balances(vec![AssetBalance::new("USDT", 200.0, 50.0)]);

    let wallet = f.service.sync_with_exchange(deadline()).await.unwrap();
    assert!((wallet.total_of("USDT") - 250.0).abs() < f64::EPSILON);

    f.service.sync_with_exchange(deadline()).await.unwrap();

    let end = f.clock.now();
    let history = f
        .service
        .get_transaction_history(end - chrono::Duration::days(1), end)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].reason, SYNC_REASON);
    assert!((history[0].amount - 250.0).abs() < f64::EPSILON);
    assert!((history[0].balance_after - 250.0).abs() < f64::EPSILON);
}

#[tokio::test(start_paused = true)]
async fn test_sync_backs_off_while_throttled() {
    let f = fixture();
    for _ in 0..2 {
        f.rest.fail_next_wallet(ExchangeError::ApiError {
            code: -1003,
            message: "Too many requests".to_string(),
        });
    }

    let wallet = f
        .service
        .sync_with_exchange(Deadline::after(Duration::from_secs(30)))
        .await
        .unwrap();
    assert!((wallet.total_of("USDT") - 100.0).abs() < f64::EPSILON);
    assert_eq!(InMemoryRest::count(&f.rest.calls.wallet), 3);
}

#[tokio::test]
async fn test_position_risk_against_threshold() {
    let clock = Arc::new(ManualClock::new(NOW_MS));
    let rest = Arc::new(InMemoryRest::new(clock.clone()));
    rest.set_balances(vec![AssetBalance::new("USDT", 500.0, 0.0)]);
    let positions = Arc::new(StaticPositions::new(HashMap::from([
        ("BTCUSDT".to_string(), 1_500.0),
        ("ETHUSDT".to_string(), 200.0),
    ])));
    let service = AccountService::builder(rest, clock)
        .with_position_valuer(positions.clone())
        .build();

    let btc = service.get_position_risk("BTCUSDT").await.unwrap();
    assert_eq!(btc.risk_level, RiskLevel::High);
    let eth = service.get_position_risk("ETHUSDT").await.unwrap();
    assert_eq!(eth.risk_level, RiskLevel::Low);

    let err = service.get_position_risk("SOLUSDT").await.unwrap_err();
    assert!(matches!(err, ExchangeError::InvalidParameters(_)));

    assert_eq!(service.get_all_position_risks().await.unwrap().len(), 2);
    assert!((service.get_current_exposure().await.unwrap() - 1_700.0).abs() < f64::EPSILON);
    assert!((service.get_portfolio_value(deadline()).await.unwrap() - 2_200.0).abs() < f64::EPSILON);

    positions.remove("BTCUSDT").await;
    assert!((service.get_current_exposure().await.unwrap() - 200.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_validate_api_keys_reports_rejection() {
    let f = fixture();
    assert!(f.service.validate_api_keys(deadline()).await.unwrap());
    f.rest.set_keys_valid(false);
    assert!(!f.service.validate_api_keys(deadline()).await.unwrap());
}

#[tokio::test]
async fn test_close_stops_stream_and_subscribers() {
    let f = fixture();
    let (_seen, callback) = recorder();
    f.service.subscribe_to_balance_updates(callback).await.unwrap();

    f.service.close().await.unwrap();
    assert_eq!(f.stream.state(), StreamState::Closed);
    assert_eq!(f.service.subscriber_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_sync_during_slow_read_keeps_synced_wallet() {
    let f = fixture();
    f.rest.set_latency(Duration::from_millis(200));
    let reader = {
        let service = f.service.clone();
        tokio::spawn(async move { service.get_wallet(deadline()).await })
    };
    // the reader's snapshot still shows USDT=100
    tokio::time::sleep(Duration::from_millis(10)).await;

    f.rest.set_latency(Duration::ZERO);
    f.rest.set_balances(vec![AssetBalance::new("USDT", 50.0, 0.0)]);
    f.clock.advance_millis(1_000);
    let synced = f.service.sync_with_exchange(deadline()).await.unwrap();
    assert!((synced.total_of("USDT") - 50.0).abs() < f64::EPSILON);

    let read = reader.await.unwrap().unwrap();
    assert!((read.total_of("USDT") - 50.0).abs() < f64::EPSILON);
    let cached = f.service.get_wallet(deadline()).await.unwrap();
    assert!((cached.total_of("USDT") - 50.0).abs() < f64::EPSILON);
    assert_eq!(cached.updated_at, synced.updated_at);
    assert_eq!(InMemoryRest::count(&f.rest.calls.wallet), 2);

    // the stale snapshot never reached the store, so a second sync finds nothing to record
    f.service.sync_with_exchange(deadline()).await.unwrap();
    let end = f.clock.now();
    let history = f
        .service
        .get_transaction_history(end - chrono::Duration::days(1), end)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert!((history[0].amount - 50.0).abs() < f64::EPSILON);
}
