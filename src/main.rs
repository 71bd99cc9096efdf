use anyhow::Context;
use spotdesk::account::{AccountService, AccountServiceConfig};
use spotdesk::core::clock::{Clock, SystemClock};
use spotdesk::core::config::ExchangeConfig;
use spotdesk::core::deadline::Deadline;
use spotdesk::core::shutdown;
use spotdesk::core::types::{Balance, Wallet};
use spotdesk::exchanges::mexc::{build_rest_with_clock, build_user_stream};
use spotdesk::hub::{self, Envelope, MessageType, SessionConfig};
use spotdesk::market::{MarketPoller, NewCoinWatcher};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

fn load_config() -> anyhow::Result<ExchangeConfig> {
    #[cfg(feature = "env-file")]
    let config = ExchangeConfig::from_env_auto("MEXC");
    #[cfg(not(feature = "env-file"))]
    let config = ExchangeConfig::from_env("MEXC");
    config.context("loading MEXC configuration")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = load_config()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let rest = Arc::new(build_rest_with_clock(&config, clock.clone())?);

    let (trigger, signal) = shutdown::channel();
    let (hub, hub_handle) = hub::new_hub(clock.clone());
    let mut tasks = vec![tokio::spawn(hub.run(signal.clone()))];

    let poller = Arc::new(MarketPoller::new(
        rest.clone(),
        hub_handle.clone(),
        clock.clone(),
        config.poll_interval(),
    ));
    let symbols = env::var("SPOTDESK_SYMBOLS").unwrap_or_else(|_| "BTCUSDT,ETHUSDT".to_string());
    for symbol in symbols.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        poller
            .add_symbol(symbol)
            .await
            .with_context(|| format!("invalid symbol {}", symbol))?;
    }
    tasks.push(poller.start(signal.clone()));

    let watcher = Arc::new(NewCoinWatcher::new(
        rest.clone(),
        hub_handle.clone(),
        clock.clone(),
        Duration::from_secs(60),
    ));
    tasks.push(watcher.start(signal.clone()));

    let account = if config.has_credentials() {
        let stream = build_user_stream(&config, rest.clone(), clock.clone())?;
        let account = AccountService::builder(rest.clone(), clock.clone())
            .with_config(AccountServiceConfig::from_exchange_config(&config))
            .with_user_stream(Arc::new(stream))
            .build();

        if let Err(e) = account
            .sync_with_exchange(Deadline::after(config.request_timeout()))
            .await
        {
            warn!(error = %e, "initial wallet sync failed");
        }

        let relay = hub_handle.clone();
        let quote = config.quote_asset.clone();
        account
            .subscribe_to_balance_updates(Arc::new(move |wallet: Wallet| {
                let balance = Balance::from_wallet(&wallet, &quote, None);
                match Envelope::with_payload(MessageType::AccountUpdate, relay.now_unix(), &balance) {
                    Ok(envelope) => {
                        relay.try_broadcast(envelope);
                    }
                    Err(e) => warn!(error = %e, "cannot encode account update"),
                }
            }))
            .await
            .context("subscribing to balance updates")?;
        Some(account)
    } else {
        info!("no API credentials, running market data only");
        None
    };

    let addr = env::var("SPOTDESK_UI_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding UI listener on {}", addr))?;
    let server = tokio::spawn(hub::serve(
        listener,
        hub_handle,
        SessionConfig::default(),
        signal,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("shutting down");
    trigger.trigger();

    if let Some(account) = account {
        if let Err(e) = account.close().await {
            warn!(error = %e, "account service did not close cleanly");
        }
    }
    server.await??;
    for task in tasks {
        task.await?;
    }
    Ok(())
}
