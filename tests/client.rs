use std::time::Duration;

use reader_sync::client::{
    ClientError, ClientSettings, ReaderClient, SavePayload, UpdatePayload,
};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn settings(base_url: &str) -> ClientSettings {
    ClientSettings {
        base_url: base_url.to_string(),
        ..ClientSettings::default()
    }
}

fn payload(url: &str) -> SavePayload {
    SavePayload {
        url: url.to_string(),
        html: "<html><title>T</title></html>".to_string(),
        should_clean_html: true,
        category: Some("article".to_string()),
        title: Some("T".to_string()),
    }
}

#[tokio::test]
async fn auth_check_sends_token_and_expects_204() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/auth/"))
        .and(header("authorization", "Token secret"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = ReaderClient::with_base_url(&server.uri(), "secret").unwrap();
    assert!(client.auth_check().await.unwrap());
}

#[tokio::test]
async fn auth_check_is_false_on_other_statuses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/auth/"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let client = ReaderClient::with_base_url(&server.uri(), "wrong").unwrap();
    assert!(!client.auth_check().await.unwrap());
}

#[tokio::test]
async fn save_posts_payload_and_parses_reply() {
    let server = MockServer::start().await;
    let sent = payload("https://example.com/a");
    Mock::given(method("POST"))
        .and(path("/api/v3/save/"))
        .and(header("authorization", "Token secret"))
        .and(body_json(json!({
            "url": "https://example.com/a",
            "html": "<html><title>T</title></html>",
            "should_clean_html": true,
            "category": "article",
            "title": "T"
        })))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(json!({"id": "doc-1", "title": "Saved"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = ReaderClient::new("secret", &settings(&server.uri())).unwrap();
    let result = client.save(&sent).await.unwrap();
    assert_eq!(result.status.as_u16(), 201);
    let body = result.body.unwrap();
    assert_eq!(body.remote_id().as_deref(), Some("doc-1"));
    assert_eq!(body.title().as_deref(), Some("Saved"));
}

#[tokio::test]
async fn non_json_body_is_kept_as_status_only() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v3/save/"))
        .respond_with(ResponseTemplate::new(500).set_body_string("<h1>oops</h1>"))
        .mount(&server)
        .await;

    let client = ReaderClient::new("secret", &settings(&server.uri())).unwrap();
    let result = client.save(&payload("https://example.com/a")).await.unwrap();
    assert_eq!(result.status.as_u16(), 500);
    assert!(result.body.is_none());
}

#[tokio::test]
async fn rate_limited_save_waits_retry_after_without_retrying() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v3/save/"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "5"))
        .expect(1)
        .mount(&server)
        .await;

    let client = ReaderClient::new("secret", &settings(&server.uri())).unwrap();
    let result = client.save(&payload("https://example.com/a")).await.unwrap();
    assert_eq!(result.status.as_u16(), 429);
    assert!(result.elapsed >= Duration::from_secs(5));
}

#[tokio::test]
async fn rate_limited_without_header_waits_one_second() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/api/v3/update/doc-1/"))
        .respond_with(ResponseTemplate::new(429))
        .expect(1)
        .mount(&server)
        .await;

    let client = ReaderClient::new("secret", &settings(&server.uri())).unwrap();
    let started = std::time::Instant::now();
    let result = client
        .update(
            "doc-1",
            &UpdatePayload {
                title: Some("New".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(result.status.as_u16(), 429);
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn update_patches_only_changed_fields() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/api/v3/update/doc-7/"))
        .and(body_json(json!({"title": "Fresh"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"title": "Fresh"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = ReaderClient::new("secret", &settings(&server.uri())).unwrap();
    let result = client
        .update(
            "doc-7",
            &UpdatePayload {
                title: Some("Fresh".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(result.status.as_u16(), 200);
    assert_eq!(result.body.unwrap().title().as_deref(), Some("Fresh"));
}

#[tokio::test]
async fn save_and_update_budgets_are_independent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v3/save/"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "d"})))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/api/v3/update/d/"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let client = ReaderClient::new(
        "secret",
        &ClientSettings {
            rpm_save: 1,
            rpm_update: 1,
            ..settings(&server.uri())
        },
    )
    .unwrap();

    client.save(&payload("https://example.com/a")).await.unwrap();

    // The save budget is spent for the next minute
    let blocked = tokio::time::timeout(
        Duration::from_millis(300),
        client.save(&payload("https://example.com/b")),
    )
    .await;
    assert!(blocked.is_err());

    // The update budget is untouched
    let update = tokio::time::timeout(
        Duration::from_secs(5),
        client.update("d", &UpdatePayload { title: Some("x".into()) }),
    )
    .await
    .expect("update should not wait on the save budget")
    .unwrap();
    assert_eq!(update.status.as_u16(), 204);
    assert!(update.body.is_none());
}

#[tokio::test]
async fn unreachable_service_is_a_transport_error() {
    let client = ReaderClient::new(
        "secret",
        &ClientSettings {
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(1),
            ..settings("http://127.0.0.1:1")
        },
    )
    .unwrap();
    let err = client
        .save(&payload("https://example.com/a"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Transport(_)));
}

#[test]
fn missing_token_is_rejected_up_front() {
    assert!(matches!(
        ReaderClient::new("", &settings("https://readwise.io")),
        Err(ClientError::MissingToken)
    ));
}
