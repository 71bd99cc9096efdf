use crate::core::errors::ExchangeError;
use crate::core::kernel::codec::WsCodec;
use crate::exchanges::mexc::types::{MexcAccountPush, MexcWsAck, MexcWsRequest};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

/// Private channel carrying per-asset balance changes
pub const ACCOUNT_CHANNEL: &str = "spot@private.account.v3.api";

#[derive(Debug, Clone)]
pub enum MexcMessage {
    /// Reply to a subscription request; `code == 0` means accepted
    Ack(MexcWsAck),
    Account(MexcAccountPush),
    /// Application-level `PONG` reply
    Pong,
}

/// Codec for the MEXC spot user-data stream
#[derive(Debug, Clone, Copy, Default)]
pub struct MexcCodec;

impl WsCodec for MexcCodec {
    type Message = MexcMessage;

    fn encode_subscription(&self, channels: &[String]) -> Result<Message, ExchangeError> {
        let request = MexcWsRequest {
            method: "SUBSCRIPTION",
            params: Some(channels),
        };
        serde_json::to_string(&request)
            .map(Message::Text)
            .map_err(|e| ExchangeError::Other(format!("Failed to encode subscription: {}", e)))
    }

    fn decode_message(&self, message: Message) -> Result<Option<Self::Message>, ExchangeError> {
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => String::from_utf8(bytes).map_err(|e| {
                ExchangeError::unmarshal(format!("non-UTF-8 frame: {}", e), String::new())
            })?,
            _ => return Ok(None),
        };

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| ExchangeError::unmarshal(format!("invalid JSON frame: {}", e), &*text))?;

        if value.get("msg").and_then(Value::as_str) == Some("PONG") {
            return Ok(Some(MexcMessage::Pong));
        }

        if value.get("code").is_some() && value.get("msg").is_some() {
            let ack = serde_json::from_value(value)
                .map_err(|e| ExchangeError::unmarshal(format!("bad ack: {}", e), &*text))?;
            return Ok(Some(MexcMessage::Ack(ack)));
        }

        match value.get("c").and_then(Value::as_str) {
            Some(ACCOUNT_CHANNEL) => {
                let push = serde_json::from_value(value)
                    .map_err(|e| ExchangeError::unmarshal(format!("bad account push: {}", e), &*text))?;
                Ok(Some(MexcMessage::Account(push)))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_frame() {
        let msg = MexcCodec
            .encode_subscription(&[ACCOUNT_CHANNEL.to_string()])
            .unwrap();
        assert_eq!(
            msg,
            Message::Text(
                r#"{"method":"SUBSCRIPTION","params":["spot@private.account.v3.api"]}"#.to_string()
            )
        );
    }

    #[test]
    fn test_decode_ack_and_account_push() {
        let ack = MexcCodec
            .decode_message(Message::Text(
                r#"{"id":0,"code":0,"msg":"spot@private.account.v3.api"}"#.to_string(),
            ))
            .unwrap();
        assert!(matches!(ack, Some(MexcMessage::Ack(a)) if a.code == 0));

        let push = MexcCodec
            .decode_message(Message::Text(
                r#"{"c":"spot@private.account.v3.api","d":{"a":"USDT","c":1700000000000,"f":"99.5","l":"0.5"},"t":1700000000001}"#
                    .to_string(),
            ))
            .unwrap();
        match push {
            Some(MexcMessage::Account(p)) => {
                assert_eq!(p.data.asset, "USDT");
                assert_eq!(p.data.free, "99.5");
                assert_eq!(p.timestamp, Some(1_700_000_000_001));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_channel_is_ignored() {
        let decoded = MexcCodec
            .decode_message(Message::Text(r#"{"c":"spot@public.deals.v3.api@BTCUSDT","d":{}}"#.to_string()))
            .unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn test_garbage_is_unmarshal_error() {
        let err = MexcCodec
            .decode_message(Message::Text("not json".to_string()))
            .unwrap_err();
        assert!(matches!(err, ExchangeError::UnmarshalError { .. }));
    }
}
