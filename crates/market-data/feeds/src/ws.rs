//! Book-ticker WebSocket ingest
//!
//! One combined-stream connection carries `<symbol>@bookTicker` for every
//! tracked symbol. Frames are parsed into [`BookSample`]s and pushed into the
//! shared [`BookTickerStore`]; the connection is re-established with capped
//! exponential backoff until the cancellation token fires.

use crate::book::BookTickerStore;
use crate::error::{ExchangeError, ExchangeResult};
use common::Clock;
use common::model::BookSample;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const BACKOFF_INITIAL_MS: u64 = 500;
const BACKOFF_MAX_MS: u64 = 30_000;

/// Combined stream envelope
#[derive(Debug, Deserialize)]
struct StreamMessage {
    stream: String,
    data: Value,
}

#[derive(Debug, Deserialize)]
struct BookTickerEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b")]
    bid_price: String,
    #[serde(rename = "B")]
    bid_qty: String,
    #[serde(rename = "a")]
    ask_price: String,
    #[serde(rename = "A")]
    ask_qty: String,
    #[serde(rename = "E", default)]
    event_time: Option<i64>,
    #[serde(rename = "T", default)]
    transaction_time: Option<i64>,
}

/// Combined-stream URL for the book tickers of `symbols`
#[must_use]
pub fn stream_url(ws_base_url: &str, symbols: &[String]) -> String {
    let streams: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@bookTicker", s.to_lowercase()))
        .collect();
    format!("{}/stream?streams={}", ws_base_url.trim_end_matches('/'), streams.join("/"))
}

/// Parse one text frame; `None` for frames that are not book tickers
///
/// Spot book tickers carry no event time, in which case the local receive
/// time stands in for the exchange time.
#[must_use]
pub fn parse_frame(text: &str, local_ms: i64) -> Option<(String, BookSample)> {
    let msg: StreamMessage = serde_json::from_str(text).ok()?;
    if !msg.stream.ends_with("@bookTicker") {
        return None;
    }
    let ev: BookTickerEvent = serde_json::from_value(msg.data).ok()?;
    let exchange_ts_ms = ev.event_time.or(ev.transaction_time).unwrap_or(local_ms);
    Some((
        ev.symbol,
        BookSample {
            exchange_ts_ms,
            local_ts_ms: local_ms,
            bid_price: ev.bid_price,
            bid_qty: ev.bid_qty,
            ask_price: ev.ask_price,
            ask_qty: ev.ask_qty,
        },
    ))
}

/// Keep the book-ticker stream flowing into `store` until cancelled
pub async fn run_book_ticker(
    url: String,
    store: Arc<BookTickerStore>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) {
    let mut backoff_ms = BACKOFF_INITIAL_MS;
    loop {
        let result = tokio::select! {
            () = cancel.cancelled() => return,
            r = stream_once(&url, &store, clock.as_ref(), &cancel) => r,
        };
        match result {
            Ok(received) => {
                if received > 0 {
                    backoff_ms = BACKOFF_INITIAL_MS;
                }
                info!(received, "book ticker stream ended, reconnecting");
            }
            Err(e) => warn!(error = %e, backoff_ms, "book ticker stream failed"),
        }
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
        }
        backoff_ms = (backoff_ms * 2).min(BACKOFF_MAX_MS);
    }
}

async fn stream_once(
    url: &str,
    store: &BookTickerStore,
    clock: &dyn Clock,
    cancel: &CancellationToken,
) -> ExchangeResult<u64> {
    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|e| ExchangeError::WebSocket(e.to_string()))?;
    let (mut write, mut read) = ws_stream.split();
    info!(url, "book ticker stream connected");

    let mut received = 0_u64;
    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(received);
            }
            msg = read.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                if let Some((symbol, sample)) = parse_frame(&text, clock.now_ms()) {
                    received += 1;
                    store.push(&symbol, sample);
                } else {
                    debug!("ignoring non book-ticker frame");
                }
            }
            Some(Ok(Message::Ping(data))) => {
                write
                    .send(Message::Pong(data))
                    .await
                    .map_err(|e| ExchangeError::WebSocket(e.to_string()))?;
            }
            Some(Ok(Message::Close(_))) | None => {
                info!("book ticker stream closed by server");
                return Ok(received);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(error = %e, "book ticker stream error");
                return Err(ExchangeError::WebSocket(e.to_string()));
            }
        }
    }
}
