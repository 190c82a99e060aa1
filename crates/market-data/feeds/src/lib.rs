//! Exchange access for the spot agent
//!
//! - [`rest`]: the REST contract every other crate programs against
//! - [`binance`]: signed live client with clock-offset tracking
//! - [`ratelimit`]: request-weight and order-count windows
//! - [`book`] and [`ws`]: book-ticker ingest into a shared per-symbol store
//! - `mock`: scripted in-memory exchange (feature `test-fixtures`)

#![forbid(unsafe_code)]

pub mod binance;
pub mod book;
pub mod error;
pub mod ratelimit;
pub mod rest;
pub mod signing;
pub mod types;
pub mod ws;

#[cfg(any(test, feature = "test-fixtures"))]
pub mod mock;

pub use binance::BinanceRest;
pub use book::{BookTickerStore, OUT_OF_ORDER_TOLERANCE_MS};
pub use error::{ExchangeError, ExchangeResult};
#[cfg(any(test, feature = "test-fixtures"))]
pub use mock::{MockExchange, MockFault, MockOp};
pub use ratelimit::RateLimiter;
pub use rest::ExchangeRest;
pub use types::{
    Balance, CancelReplaceRequest, OcoAck, OcoRequest, OrderAck, OrderLookup, OrderRequest, OrderType, RemoteOrder,
};
pub use ws::{parse_frame, run_book_ticker, stream_url};
