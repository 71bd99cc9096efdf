use super::types as mexc_types;
use crate::core::errors::ExchangeError;
use crate::core::types::{
    conversion, AssetBalance, Kline, KlineInterval, NewCoin, Order, OrderBook, OrderBookLevel,
    OrderSide, OrderStatus, OrderType, Ticker, Wallet,
};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

/// Interval string the exchange expects on the wire
pub fn interval_to_mexc(interval: KlineInterval) -> &'static str {
    match interval {
        KlineInterval::Minutes1 => "1m",
        KlineInterval::Minutes5 => "5m",
        KlineInterval::Minutes15 => "15m",
        KlineInterval::Hours1 => "60m",
        KlineInterval::Hours4 => "4h",
        KlineInterval::Days1 => "1d",
    }
}

pub fn millis_to_utc(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

pub fn convert_ticker(
    ticker: mexc_types::MexcTicker24h,
    observed_at: DateTime<Utc>,
) -> Result<Ticker, ExchangeError> {
    Ok(Ticker {
        last_price: conversion::parse_f64("lastPrice", &ticker.last_price)?,
        volume_24h: conversion::parse_f64("volume", &ticker.volume)?,
        high_24h: conversion::parse_f64("highPrice", &ticker.high_price)?,
        low_24h: conversion::parse_f64("lowPrice", &ticker.low_price)?,
        price_change_pct: conversion::parse_f64(
            "priceChangePercent",
            &ticker.price_change_percent,
        )?,
        symbol: ticker.symbol,
        observed_at,
    })
}

/// Candle fields may be strings or bare numbers
fn kline_field(row: &[Value], index: usize, field: &str) -> Result<f64, ExchangeError> {
    match row.get(index) {
        Some(Value::String(raw)) => conversion::parse_f64(field, raw),
        Some(Value::Number(n)) => conversion::parse_f64(field, &n.to_string()),
        other => Err(ExchangeError::unmarshal(
            format!("kline field `{}` missing or malformed", field),
            format!("{:?}", other),
        )),
    }
}

fn kline_time(row: &[Value], index: usize, field: &str) -> Result<i64, ExchangeError> {
    row.get(index).and_then(Value::as_i64).ok_or_else(|| {
        ExchangeError::unmarshal(
            format!("kline field `{}` missing or malformed", field),
            Value::Array(row.to_vec()).to_string(),
        )
    })
}

pub fn convert_kline(
    symbol: &str,
    interval: KlineInterval,
    row: &[Value],
) -> Result<Kline, ExchangeError> {
    Ok(Kline {
        symbol: symbol.to_string(),
        interval,
        open_time: kline_time(row, 0, "openTime")?,
        open: kline_field(row, 1, "open")?,
        high: kline_field(row, 2, "high")?,
        low: kline_field(row, 3, "low")?,
        close: kline_field(row, 4, "close")?,
        volume: kline_field(row, 5, "volume")?,
        close_time: kline_time(row, 6, "closeTime")?,
    })
}

fn convert_levels(levels: &[[String; 2]]) -> Result<Vec<OrderBookLevel>, ExchangeError> {
    levels
        .iter()
        .map(|[price, qty]| {
            Ok(OrderBookLevel {
                price: conversion::parse_f64("price", price)?,
                quantity: conversion::parse_f64("quantity", qty)?,
            })
        })
        .collect()
}

pub fn convert_order_book(
    symbol: &str,
    depth: mexc_types::MexcDepth,
) -> Result<OrderBook, ExchangeError> {
    Ok(OrderBook {
        symbol: symbol.to_string(),
        last_update_id: depth.last_update_id,
        bids: convert_levels(&depth.bids)?,
        asks: convert_levels(&depth.asks)?,
    })
}

pub fn convert_balance(balance: &mexc_types::MexcBalance) -> Result<AssetBalance, ExchangeError> {
    Ok(AssetBalance::new(
        balance.asset.clone(),
        conversion::parse_f64("free", &balance.free)?,
        conversion::parse_f64("locked", &balance.locked)?,
    ))
}

pub fn convert_account(
    account: &mexc_types::MexcAccountInfo,
    fetched_at: DateTime<Utc>,
) -> Result<Wallet, ExchangeError> {
    let balances = account
        .balances
        .iter()
        .map(convert_balance)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Wallet::from_balances(balances, fetched_at))
}

pub fn convert_account_delta(
    delta: &mexc_types::MexcAccountDelta,
) -> Result<AssetBalance, ExchangeError> {
    Ok(AssetBalance::new(
        delta.asset.clone(),
        conversion::parse_f64("f", &delta.free)?,
        conversion::parse_f64("l", &delta.locked)?,
    ))
}

fn parse_side(side: &str) -> Result<OrderSide, ExchangeError> {
    match side {
        "BUY" => Ok(OrderSide::Buy),
        "SELL" => Ok(OrderSide::Sell),
        other => Err(ExchangeError::unmarshal("unknown order side", other)),
    }
}

fn parse_order_type(order_type: &str) -> Result<OrderType, ExchangeError> {
    match order_type {
        "LIMIT" | "LIMIT_ORDER" => Ok(OrderType::Limit),
        "MARKET" | "MARKET_ORDER" => Ok(OrderType::Market),
        other => Err(ExchangeError::unmarshal("unknown order type", other)),
    }
}

/// Price is absent or zero for market orders
fn parse_price(price: Option<&String>) -> Result<Option<f64>, ExchangeError> {
    match price {
        Some(raw) if !raw.is_empty() => {
            let value = conversion::parse_f64("price", raw)?;
            Ok((value > 0.0).then_some(value))
        }
        _ => Ok(None),
    }
}

pub fn convert_order_ack(
    ack: mexc_types::MexcOrderAck,
    client_id: &str,
    now: DateTime<Utc>,
) -> Result<Order, ExchangeError> {
    let created_at = ack.transact_time.and_then(millis_to_utc).unwrap_or(now);
    Ok(Order {
        client_id: ack
            .client_order_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| client_id.to_string()),
        exchange_id: Some(ack.order_id),
        side: parse_side(&ack.side)?,
        order_type: parse_order_type(&ack.order_type)?,
        quantity: conversion::parse_f64("origQty", &ack.orig_qty)?,
        price: parse_price(ack.price.as_ref())?,
        status: OrderStatus::New,
        symbol: ack.symbol,
        created_at,
        updated_at: created_at,
        filled_qty: 0.0,
    })
}

pub fn convert_order(
    order: mexc_types::MexcOrder,
    now: DateTime<Utc>,
) -> Result<Order, ExchangeError> {
    let status = OrderStatus::from_exchange(&order.status)
        .ok_or_else(|| ExchangeError::unmarshal("unknown order status", order.status.clone()))?;
    let quantity = conversion::parse_f64("origQty", &order.orig_qty)?;
    let filled_qty = match order.executed_qty.as_deref() {
        Some(raw) if !raw.is_empty() => conversion::parse_f64("executedQty", raw)?,
        _ => 0.0,
    };
    let created_at = order.time.and_then(millis_to_utc).unwrap_or(now);
    let updated_at = order
        .update_time
        .and_then(millis_to_utc)
        .unwrap_or(created_at)
        .max(created_at);

    Ok(Order {
        client_id: order
            .client_order_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| order.order_id.clone()),
        exchange_id: Some(order.order_id),
        side: parse_side(&order.side)?,
        order_type: parse_order_type(&order.order_type)?,
        quantity,
        price: parse_price(order.price.as_ref())?,
        status,
        symbol: order.symbol,
        created_at,
        updated_at,
        filled_qty: filled_qty.min(quantity),
    })
}

pub fn convert_new_coin(info: mexc_types::MexcSymbolInfo) -> NewCoin {
    NewCoin {
        symbol: info.symbol,
        base_asset: info.base_asset,
        quote_asset: info.quote_asset,
        status: info.status,
    }
}
