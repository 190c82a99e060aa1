//! Signed REST client against a local HTTP double

use common::ManualClock;
use common::config::ExchangeConfig;
use common::model::Side;
use feeds::signing::sign;
use feeds::{BinanceRest, ExchangeError, ExchangeRest, OrderLookup, OrderRequest, OrderType};
use serde_json::json;
use std::sync::Arc;
use tokio_test::assert_ok;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

const T0: i64 = 1_700_000_000_000;
const SECRET: &str = "test-secret";

/// Matches requests whose `signature` is the HMAC of the preceding query
struct ValidSignature;

impl Match for ValidSignature {
    fn matches(&self, request: &Request) -> bool {
        let Some(query) = request.url.query() else {
            return false;
        };
        let Some((payload, signature)) = query.rsplit_once("&signature=") else {
            return false;
        };
        payload.contains("timestamp=") && payload.contains("recvWindow=5000") && sign(SECRET, payload).is_ok_and(|s| s == signature)
    }
}

fn client(server: &MockServer) -> BinanceRest {
    let cfg = ExchangeConfig {
        rest_base_url: server.uri(),
        api_key: "test-key".into(),
        api_secret: SECRET.into(),
        ..ExchangeConfig::default()
    };
    BinanceRest::new(&cfg, Arc::new(ManualClock::new(T0))).unwrap()
}

fn order_body(cid: &str) -> serde_json::Value {
    json!({
        "symbol": "BTCUSDT", "orderId": 12345, "orderListId": -1, "clientOrderId": cid,
        "price": "100.00", "origQty": "0.123", "executedQty": "0", "status": "NEW",
        "side": "BUY", "time": T0
    })
}

fn error_body(code: i64, msg: &str) -> serde_json::Value {
    json!({ "code": code, "msg": msg })
}

#[tokio::test]
async fn test_signed_lookup_carries_key_and_valid_signature() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/order"))
        .and(query_param("origClientOrderId", "X_abc"))
        .and(header("X-MBX-APIKEY", "test-key"))
        .and(ValidSignature)
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(order_body("X_abc"))
                .insert_header("x-mbx-used-weight-1m", "5990"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let rest = client(&server);
    let OrderLookup::Found(order) = rest.get_order("BTCUSDT", "X_abc").await.unwrap() else {
        panic!("expected a found order");
    };
    assert_eq!(order.order_id, "12345");
    assert_eq!(order.side, Side::Buy);
    assert!(order.is_open());
    assert_eq!(rest.limiter().usage(T0).0, 5_990);
    assert_eq!(rest.last_success_ms(), Some(T0));
}

#[tokio::test]
async fn test_unknown_order_lookup_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/order"))
        .respond_with(ResponseTemplate::new(400).set_body_json(error_body(-2013, "Order does not exist.")))
        .mount(&server)
        .await;

    assert_eq!(assert_ok!(client(&server).get_order("BTCUSDT", "X_x").await), OrderLookup::NotFound);
}

#[tokio::test]
async fn test_timestamp_rejection_on_read_resyncs_and_retries_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/order"))
        .respond_with(ResponseTemplate::new(400).set_body_json(error_body(-1021, "Timestamp outside recvWindow")))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v3/order"))
        .respond_with(ResponseTemplate::new(200).set_body_json(order_body("X_r")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v3/time"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "serverTime": T0 + 1_500 })))
        .expect(1)
        .mount(&server)
        .await;

    let rest = client(&server);
    assert!(matches!(assert_ok!(rest.get_order("BTCUSDT", "X_r").await), OrderLookup::Found(_)));
    assert_eq!(rest.clock_offset_ms(), 1_500);
}

#[tokio::test]
async fn test_timestamp_rejection_on_order_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v3/order"))
        .and(query_param("newClientOrderId", "X_n"))
        .and(ValidSignature)
        .respond_with(ResponseTemplate::new(400).set_body_json(error_body(-1021, "Timestamp outside recvWindow")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v3/time"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "serverTime": T0 - 800 })))
        .expect(1)
        .mount(&server)
        .await;

    let req = OrderRequest {
        symbol: "BTCUSDT".into(),
        side: Side::Buy,
        order_type: OrderType::LimitMaker,
        time_in_force: None,
        price: Some("100.00".into()),
        quantity: "0.123".into(),
        client_order_id: "X_n".into(),
    };
    let rest = client(&server);
    let err = rest.new_order(&req).await.unwrap_err();
    assert!(err.is_timestamp_outside_window());
    assert!(err.is_outcome_unknown());
    assert_eq!(rest.clock_offset_ms(), -800);
}

#[tokio::test]
async fn test_server_error_without_json_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/ticker/24hr"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .mount(&server)
        .await;

    let err = client(&server).ticker_24h().await.unwrap_err();
    match &err {
        ExchangeError::Api { status, code, msg } => {
            assert_eq!(*status, 503);
            assert_eq!(*code, 0);
            assert_eq!(msg, "upstream unavailable");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(err.is_outcome_unknown());
}

#[tokio::test]
async fn test_exchange_info_and_klines_parse() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/exchangeInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "symbols": [
                {"symbol": "BTCUSDT", "status": "TRADING", "baseAsset": "BTC", "quoteAsset": "USDT",
                 "ocoAllowed": true, "filters": [
                    {"filterType": "PRICE_FILTER", "minPrice": "0.01", "maxPrice": "1000000.00", "tickSize": "0.01"},
                    {"filterType": "LOT_SIZE", "minQty": "0.001", "maxQty": "9000.000", "stepSize": "0.001"},
                    {"filterType": "NOTIONAL", "minNotional": "10.00"}
                 ]},
                {"symbol": "BROKEN", "status": "BREAK", "baseAsset": "B", "quoteAsset": "USDT", "filters": []}
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v3/klines"))
        .and(query_param("interval", "5m"))
        .and(query_param("limit", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            [T0, "100.0", "101.0", "99.5", "100.5", "12.5", T0 + 299_999, "0", 10, "0", "0", "0"],
            [T0 + 300_000, "100.5", "102.0", "100.0", "101.5", "8.0", T0 + 599_999, "0", 7, "0", "0", "0"]
        ])))
        .mount(&server)
        .await;

    let rest = client(&server);
    let filters = assert_ok!(rest.exchange_info().await);
    assert_eq!(filters.len(), 1);
    assert_eq!(filters[0].to_constraints().unwrap().price_precision, 2);

    let candles = assert_ok!(rest.klines("BTCUSDT", "5m", 2).await);
    assert_eq!(candles.len(), 2);
    assert_eq!(candles[1].open_time_ms, T0 + 300_000);
    assert!(candles.iter().all(|c| c.validate().is_ok()));
}
