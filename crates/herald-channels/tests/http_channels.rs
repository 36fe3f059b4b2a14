//! HTTP channels against a local axum server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use herald_channels::{
    slack::SlackChannel, telegram::TelegramChannel, webhook::sign_body, webhook::WebhookChannel,
    ChannelRegistry, DeliveryChannel, DeliveryManager, DeliveryRequest, ErrorCode,
    RenderedMessage, SendOutcome, SendParams,
};
use herald_core::{ChannelConfig, DeliveryConfig, DeliveryStatus, Recipient};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
struct Captured {
    method: Method,
    path: String,
    headers: HeaderMap,
    body: Bytes,
}

impl Captured {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

type Log = Arc<Mutex<Vec<Captured>>>;

/// Records every request. `/busy` answers 429 with `Retry-After: 7`,
/// `/missing` 404, `/flaky` 503 on its first hit; everything else 200.
async fn record(
    State(log): State<Log>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let previous_hits = {
        let mut log = log.lock().unwrap();
        let hits = log.iter().filter(|c| c.path == path).count();
        log.push(Captured {
            method,
            path: path.clone(),
            headers,
            body,
        });
        hits
    };
    match path.as_str() {
        "/busy" => (StatusCode::TOO_MANY_REQUESTS, [("retry-after", "7")], "slow down").into_response(),
        "/missing" => (StatusCode::NOT_FOUND, "no such hook").into_response(),
        "/flaky" if previous_hits == 0 => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        _ => (StatusCode::OK, "ok").into_response(),
    }
}

async fn serve() -> (String, Log) {
    let log: Log = Arc::default();
    let app = Router::new().fallback(record).with_state(log.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), log)
}

fn captured(log: &Log) -> Vec<Captured> {
    log.lock().unwrap().clone()
}

fn message() -> RenderedMessage {
    RenderedMessage::new("Weekly digest", "<p>Three new posts</p>", "Three new posts")
}

async fn send(
    channel: &dyn DeliveryChannel,
    recipient: &Recipient,
    config: &ChannelConfig,
) -> SendOutcome {
    let msg = message();
    let cancel = CancellationToken::new();
    channel
        .send(SendParams {
            delivery_id: "d-1",
            recipient,
            message: &msg,
            config: Some(config),
            cancel: &cancel,
        })
        .await
}

fn webhook_config(url: String) -> ChannelConfig {
    ChannelConfig {
        webhook_url: Some(url),
        ..Default::default()
    }
}

#[tokio::test]
async fn webhook_posts_signed_json() {
    let (base, log) = serve().await;
    let mut config = webhook_config(format!("{base}/hook"));
    config.webhook_secret = Some("s3cret".into());
    config.webhook_auth = Some("Bearer token-1".into());
    config.webhook_headers = HashMap::from([("X-Team".to_string(), "ops".to_string())]);

    let channel = WebhookChannel::new(reqwest::Client::new());
    let outcome = send(&channel, &Recipient::user("u-1"), &config).await;
    assert!(outcome.success, "{:?}", outcome.error_message);

    let requests = captured(&log);
    assert_eq!(requests.len(), 1);
    let req = &requests[0];
    assert_eq!(req.method, Method::POST);
    assert_eq!(req.path, "/hook");
    assert_eq!(req.header("x-herald-delivery"), Some("d-1"));
    assert_eq!(req.header("x-team"), Some("ops"));
    assert_eq!(req.header("authorization"), Some("Bearer token-1"));
    let expected = format!("sha256={}", sign_body("s3cret", &req.body).unwrap());
    assert_eq!(req.header("x-herald-signature"), Some(expected.as_str()));

    let body = req.json();
    assert_eq!(body["delivery_id"], "d-1");
    assert_eq!(body["subject"], "Weekly digest");
    assert_eq!(body["html"], "<p>Three new posts</p>");
    assert_eq!(body["recipient"]["target"], "u-1");
}

#[tokio::test]
async fn webhook_honours_put_and_recipient_url() {
    let (base, log) = serve().await;
    let config = ChannelConfig {
        webhook_method: Some("put".into()),
        ..Default::default()
    };
    let channel = WebhookChannel::new(reqwest::Client::new());
    let outcome = send(&channel, &Recipient::webhook(format!("{base}/target")), &config).await;
    assert!(outcome.success);

    let req = &captured(&log)[0];
    assert_eq!(req.method, Method::PUT);
    assert_eq!(req.path, "/target");
    assert!(req.header("x-herald-signature").is_none());
}

#[tokio::test]
async fn rate_limit_is_transient_and_carries_retry_after() {
    let (base, _log) = serve().await;
    let channel = WebhookChannel::new(reqwest::Client::new());
    let outcome = send(&channel, &Recipient::user("u-1"), &webhook_config(format!("{base}/busy"))).await;

    assert!(!outcome.success);
    assert_eq!(outcome.error_code, Some(ErrorCode::RateLimited));
    assert!(outcome.transient);
    assert_eq!(outcome.retry_after, Some(Duration::from_secs(7)));
    assert_eq!(outcome.error_message.as_deref(), Some("HTTP 429: slow down"));
}

#[tokio::test]
async fn not_found_is_permanent() {
    let (base, _log) = serve().await;
    let channel = WebhookChannel::new(reqwest::Client::new());
    let outcome = send(&channel, &Recipient::user("u-1"), &webhook_config(format!("{base}/missing"))).await;

    assert_eq!(outcome.error_code, Some(ErrorCode::RecipientNotFound));
    assert!(!outcome.transient);
}

#[tokio::test]
async fn refused_connection_is_transient() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let channel = WebhookChannel::new(reqwest::Client::new());
    let outcome = send(&channel, &Recipient::user("u-1"), &webhook_config(format!("http://{addr}/hook"))).await;

    assert_eq!(outcome.error_code, Some(ErrorCode::ConnectionFailed));
    assert!(outcome.transient);
}

#[tokio::test]
async fn slack_posts_text_payload() {
    let (base, log) = serve().await;
    let config = ChannelConfig {
        slack_webhook_url: Some(format!("{base}/slack")),
        slack_channel: Some("#news".into()),
        ..Default::default()
    };
    let channel = SlackChannel::new(reqwest::Client::new());
    let outcome = send(&channel, &Recipient::user("u-1"), &config).await;
    assert!(outcome.success);

    let body = captured(&log)[0].json();
    assert_eq!(body["text"], "*Weekly digest*\n\nThree new posts");
    assert_eq!(body["channel"], "#news");
}

#[tokio::test]
async fn telegram_calls_send_message_for_the_bot() {
    let (base, log) = serve().await;
    let config = ChannelConfig {
        telegram_bot_token: Some("abc".into()),
        telegram_chat_id: Some("42".into()),
        telegram_parse_mode: Some("HTML".into()),
        ..Default::default()
    };
    let channel = TelegramChannel::with_api_base(reqwest::Client::new(), base);
    let outcome = send(&channel, &Recipient::user("u-1"), &config).await;
    assert!(outcome.success);

    let req = &captured(&log)[0];
    assert_eq!(req.path, "/botabc/sendMessage");
    let body = req.json();
    assert_eq!(body["chat_id"], "42");
    assert_eq!(body["parse_mode"], "HTML");
}

#[tokio::test]
async fn manager_retries_a_server_error_until_accepted() {
    let (base, log) = serve().await;
    let mut registry = ChannelRegistry::new();
    registry.register(Arc::new(WebhookChannel::new(reqwest::Client::new())));
    let manager = DeliveryManager::new(
        Arc::new(registry),
        &DeliveryConfig {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 5,
            parallelism: 4,
        },
    );

    let request = DeliveryRequest {
        delivery_id: "d-1".into(),
        schedule_id: None,
        recipients: vec![Recipient::user("u-1")],
        channels: vec!["webhook".into()],
        channel_configs: HashMap::from([("webhook".to_string(), webhook_config(format!("{base}/flaky")))]),
        message: message(),
    };
    let report = manager.deliver(&CancellationToken::new(), request).await.unwrap();

    assert_eq!(report.status, DeliveryStatus::Delivered);
    assert_eq!(report.results[0].attempts, 2);
    assert_eq!(captured(&log).len(), 2);
}
