use spotdesk::core::clock::ManualClock;
use spotdesk::core::shutdown;
use spotdesk::exchanges::mexc::{KeyExpiry, ListenKeyRenewer, ListenKeySlot};
use spotdesk::utils::InMemoryRest;
use spotdesk::ListenKey;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

const RENEW_EVERY: Duration = Duration::from_secs(30 * 60);

fn setup() -> (Arc<InMemoryRest>, ListenKeySlot) {
    let rest = Arc::new(InMemoryRest::new(Arc::new(ManualClock::new(1_700_000_000_000))));
    let slot: ListenKeySlot = Arc::new(Mutex::new(Some(ListenKey::issue("key-1", Instant::now()))));
    (rest, slot)
}

fn expiry() -> (Arc<KeyExpiry>, watch::Receiver<Option<String>>) {
    let (tx, rx) = watch::channel(None);
    (Arc::new(tx), rx)
}

async fn remaining(slot: &ListenKeySlot) -> Duration {
    slot.lock().await.as_ref().unwrap().remaining(Instant::now())
}

#[tokio::test(start_paused = true)]
async fn test_renews_on_schedule_and_stops_on_shutdown() {
    let (rest, slot) = setup();
    let (trigger, signal) = shutdown::channel();
    let (expired, _expired_rx) = expiry();
    let renewer = ListenKeyRenewer::new(rest.clone(), slot.clone(), RENEW_EVERY, expired).spawn(signal);

    tokio::time::sleep(RENEW_EVERY - Duration::from_secs(1)).await;
    assert_eq!(InMemoryRest::count(&rest.calls.listen_key_renew), 0);
    assert!(remaining(&slot).await >= Duration::from_secs(29 * 60));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(InMemoryRest::count(&rest.calls.listen_key_renew), 1);
    assert!(remaining(&slot).await >= Duration::from_secs(59 * 60));

    tokio::time::sleep(RENEW_EVERY).await;
    assert_eq!(InMemoryRest::count(&rest.calls.listen_key_renew), 2);
    assert!(remaining(&slot).await >= Duration::from_secs(59 * 60));

    trigger.trigger();
    renewer.await.unwrap();

    tokio::time::sleep(RENEW_EVERY * 4).await;
    assert_eq!(InMemoryRest::count(&rest.calls.listen_key_renew), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_renewal_retries_after_grace() {
    let (rest, slot) = setup();
    rest.fail_renewals(1);
    let (expired, _expired_rx) = expiry();
    let (_trigger, signal) = shutdown::channel();
    let _renewer = ListenKeyRenewer::new(rest.clone(), slot.clone(), RENEW_EVERY, expired)
        .with_grace(Duration::from_secs(60))
        .spawn(signal);

    tokio::time::sleep(RENEW_EVERY + Duration::from_secs(1)).await;
    assert_eq!(InMemoryRest::count(&rest.calls.listen_key_renew), 1);
    // the failed attempt did not extend the key
    assert!(remaining(&slot).await < Duration::from_secs(31 * 60));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(InMemoryRest::count(&rest.calls.listen_key_renew), 2);
    assert!(remaining(&slot).await >= Duration::from_secs(59 * 60));
}

#[tokio::test(start_paused = true)]
async fn test_two_failures_force_reconnect() {
    let (rest, slot) = setup();
    rest.fail_renewals(2);
    let (expired, mut expired_rx) = expiry();
    let (_trigger, signal) = shutdown::channel();
    let _renewer = ListenKeyRenewer::new(rest.clone(), slot, RENEW_EVERY, expired)
        .with_grace(Duration::from_secs(60))
        .spawn(signal);

    let started = Instant::now();
    tokio::time::timeout(RENEW_EVERY * 2, expired_rx.changed())
        .await
        .expect("renewer never forced a reconnect")
        .unwrap();
    assert_eq!(expired_rx.borrow().as_deref(), Some("key-1"));

    assert_eq!(InMemoryRest::count(&rest.calls.listen_key_renew), 2);
    assert_eq!(
        Instant::now().duration_since(started),
        RENEW_EVERY + Duration::from_secs(60)
    );
}

#[tokio::test(start_paused = true)]
async fn test_renew_once_skips_empty_slot() {
    let (rest, _) = setup();
    let empty: ListenKeySlot = Arc::new(Mutex::new(None));
    let (expired, _expired_rx) = expiry();
    let renewer = ListenKeyRenewer::new(rest.clone(), empty, RENEW_EVERY, expired);

    assert!(!renewer.renew_once().await.unwrap());
    assert_eq!(InMemoryRest::count(&rest.calls.listen_key_renew), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failures_on_replaced_key_do_not_add_up() {
    let (rest, slot) = setup();
    rest.fail_renewals(2);
    let (expired, expired_rx) = expiry();
    let (_trigger, signal) = shutdown::channel();
    let _renewer = ListenKeyRenewer::new(rest.clone(), slot.clone(), RENEW_EVERY, expired)
        .with_grace(Duration::from_secs(60))
        .spawn(signal);

    tokio::time::sleep(RENEW_EVERY + Duration::from_secs(1)).await;
    assert_eq!(InMemoryRest::count(&rest.calls.listen_key_renew), 1);
    *slot.lock().await = Some(ListenKey::issue("key-2", Instant::now()));

    // second failure lands on key-2, a fresh count
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(InMemoryRest::count(&rest.calls.listen_key_renew), 2);
    assert!(!expired_rx.has_changed().unwrap());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(InMemoryRest::count(&rest.calls.listen_key_renew), 3);
    assert!(!expired_rx.has_changed().unwrap());
}
