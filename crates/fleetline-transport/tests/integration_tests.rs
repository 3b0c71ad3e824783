//! HTTP adapter against a mock device listener

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fleetline_transport::prelude::*;
use fleetline_transport::{HttpEndpoint, HttpTransport, HttpTransportConfig};
use wiremock::matchers::{header, method, path, path_regex};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn transport_for(server: &MockServer) -> Result<HttpTransport> {
    let transport = HttpTransport::new(
        HttpTransportConfig::default()
            .with_request_timeout(Duration::from_secs(5))
            .with_polling_interval(Duration::from_millis(20)),
    )?;
    transport.register_device("meter-7", HttpEndpoint::new(server.uri()));
    Ok(transport)
}

fn ack_responder(ack: DeviceAck) -> impl Fn(&Request) -> ResponseTemplate + Send + Sync + 'static {
    move |request: &Request| {
        let token = request
            .url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .and_then(|raw| serde_json::from_value(serde_json::Value::String(raw.to_string())).ok());
        match token {
            Some(token) => ResponseTemplate::new(200).set_body_json(AckEnvelope {
                token,
                ack: ack.clone(),
            }),
            None => ResponseTemplate::new(400),
        }
    }
}

#[tokio::test]
async fn test_post_command_and_poll_ack() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ota/commands"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/ota/acks/[0-9a-f-]+$"))
        .respond_with(ack_responder(DeviceAck::Applied))
        .mount(&server)
        .await;

    let transport = transport_for(&server)?;
    let receipt = transport
        .send("meter-7", &CommandEnvelope::new("s-1", DeviceCommand::Apply))
        .await?;
    let ack = transport.await_ack(&receipt, Duration::from_secs(2)).await?;

    assert_eq!(ack, DeviceAck::Applied);
    assert_eq!(receipt.transport, TransportKind::Http);
    Ok(())
}

#[tokio::test]
async fn test_pending_ack_polls_until_timeout() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ota/commands"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/ota/acks/.+$"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let transport = transport_for(&server)?;
    let receipt = transport
        .send("meter-7", &CommandEnvelope::new("s-1", DeviceCommand::Restart))
        .await?;
    let result = transport
        .await_ack(&receipt, Duration::from_millis(150))
        .await;

    assert_eq!(result, Err(TransportError::Timeout { timeout_ms: 150 }));
    let polls = server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == "GET")
        .count();
    assert!(polls >= 2, "expected repeated polling, saw {polls}");
    Ok(())
}

#[tokio::test]
async fn test_conflict_is_rejection() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ota/commands"))
        .respond_with(ResponseTemplate::new(409).set_body_string("update already staged"))
        .mount(&server)
        .await;

    let transport = transport_for(&server)?;
    let result = transport
        .send("meter-7", &CommandEnvelope::new("s-1", DeviceCommand::Apply))
        .await;

    match result {
        Err(TransportError::Rejected(reason)) => assert!(reason.contains("already staged")),
        other => anyhow::bail!("expected rejection, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_server_error_is_unreachable() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let transport = transport_for(&server)?;
    let err = transport
        .send("meter-7", &CommandEnvelope::new("s-1", DeviceCommand::Apply))
        .await
        .err();
    assert!(matches!(err, Some(TransportError::Unreachable { .. })));
    assert!(err.is_some_and(|e| e.is_retryable()));
    Ok(())
}

#[tokio::test]
async fn test_device_checksum_mismatch() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ota/commands"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/ota/acks/.+$"))
        .respond_with(ack_responder(DeviceAck::TransferComplete {
            checksum: "0000".to_string(),
        }))
        .mount(&server)
        .await;

    let transport = transport_for(&server)?;
    let receipt = transport
        .send(
            "meter-7",
            &CommandEnvelope::new(
                "s-1",
                DeviceCommand::Finalize {
                    checksum: "ffff".to_string(),
                },
            ),
        )
        .await?;
    let result = transport.await_ack(&receipt, Duration::from_secs(2)).await;
    assert_eq!(
        result,
        Err(TransportError::ChecksumMismatch {
            expected: "ffff".to_string(),
            actual: "0000".to_string(),
        })
    );
    Ok(())
}

#[tokio::test]
async fn test_bearer_token_and_ping() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ota/ping"))
        .and(header("authorization", "Bearer s3cret"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(HttpTransportConfig::default())?;
    transport.register_device("meter-7", HttpEndpoint::new(server.uri()).with_auth_token("s3cret"));
    transport.register_device("meter-8", HttpEndpoint::new(server.uri()));

    assert!(transport.is_reachable("meter-7").await);
    assert!(!transport.is_reachable("meter-8").await);
    Ok(())
}

#[tokio::test]
async fn test_registry_dispatches_by_kind() -> Result<()> {
    let server = MockServer::start().await;
    let http: Arc<dyn TransportAdapter> = Arc::new(transport_for(&server)?);
    let registry = TransportRegistry::new().with(http);

    assert_eq!(registry.kinds(), vec![TransportKind::Http]);
    let adapter = registry
        .get(TransportKind::Http)
        .ok_or_else(|| anyhow::anyhow!("http adapter missing"))?;
    assert_eq!(adapter.kind(), TransportKind::Http);
    Ok(())
}
