use crate::core::errors::ExchangeError;
use crate::core::shutdown::ShutdownSignal;
use crate::hub::broker::HubHandle;
use crate::hub::session::{run_session, SessionConfig};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};

/// Accept UI connections on `listener` until shutdown
pub async fn serve(
    listener: TcpListener,
    hub: HubHandle,
    config: SessionConfig,
    mut shutdown: ShutdownSignal,
) -> Result<(), ExchangeError> {
    let addr = listener
        .local_addr()
        .map_err(|e| ExchangeError::Other(format!("listener has no address: {}", e)))?;
    info!(%addr, "UI websocket server listening");

    loop {
        let (tcp, peer) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        let hub = hub.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let ws_config = limits(config.max_message_size);
            match tokio_tungstenite::accept_async_with_config(tcp, Some(ws_config)).await {
                Ok(ws) => run_session(ws, hub, config).await,
                Err(e) => debug!(%peer, error = %e, "websocket handshake failed"),
            }
        });
    }

    info!("UI websocket server stopped");
    Ok(())
}

fn limits(max_message_size: usize) -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(max_message_size),
        max_frame_size: Some(max_message_size),
        ..WebSocketConfig::default()
    }
}
