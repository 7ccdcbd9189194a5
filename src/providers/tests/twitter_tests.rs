// src/providers/tests/twitter_tests.rs

use futures::StreamExt;
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::super::twitter::{parse_stream_message, Credentials, TwitterClient};
use super::super::{ApiError, SocialApi, StreamEvent};

fn credentials() -> Credentials {
    Credentials {
        consumer_key: "ck".to_string(),
        consumer_secret: "cs".to_string(),
        access_token: "at".to_string(),
        access_token_secret: "ats".to_string(),
    }
}

async fn client_for(server: &MockServer) -> TwitterClient {
    TwitterClient::with_endpoints(credentials(), &server.uri(), &server.uri())
}

#[tokio::test]
async fn test_timeline_sends_cursor_and_signs_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/statuses/user_timeline.json"))
        .and(query_param("screen_name", "alice"))
        .and(query_param("max_id", "99"))
        .and(query_param("count", "200"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id_str": "99", "user": {"id_str": "1"}},
            {"id_str": "98", "user": {"id_str": "1"}}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let page = client.user_timeline("alice", Some(99), 200).await.unwrap();
    assert_eq!(page.len(), 2);

    let requests = server.received_requests().await.unwrap();
    let auth = requests[0].headers.get("authorization").unwrap().to_str().unwrap();
    assert!(auth.starts_with("OAuth "), "Request should carry an OAuth header");
}

#[tokio::test]
async fn test_first_timeline_page_has_no_max_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/statuses/user_timeline.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    client.user_timeline("alice", None, 200).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert!(!requests[0].url.query_pairs().any(|(k, _)| k == "max_id"));
}

#[tokio::test]
async fn test_get_post_surfaces_not_found_code() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/statuses/show.json"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "errors": [{"code": 144, "message": "No status found with that ID."}]
        })))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let err = client.get_post("5").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_rate_limited_request_is_resent() {
    let server = MockServer::start().await;
    let reset = chrono::Utc::now().timestamp().to_string();
    Mock::given(method("GET"))
        .and(path("/followers/ids.json"))
        .respond_with(ResponseTemplate::new(429).insert_header("x-rate-limit-reset", reset.as_str()))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/followers/ids.json"))
        .and(query_param("cursor", "-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ids": [10, 11],
            "next_cursor": 0
        })))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let page = client.follower_ids(7, -1).await.unwrap();
    assert_eq!(page.ids, vec![10, 11]);
    assert_eq!(page.next_cursor, 0);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_stream_yields_posts_then_disconnect() {
    let server = MockServer::start().await;
    let body = concat!(
        "{\"id_str\":\"1\",\"user\":{\"id_str\":\"5\"}}\r\n",
        "\r\n",
        "{\"delete\":{\"status\":{\"id_str\":\"0\"}}}\r\n",
        "{\"id_str\":\"2\",\"user\":{\"id_str\":\"6\"},\"retweeted_status\":{}}\r\n",
    );
    Mock::given(method("POST"))
        .and(path("/statuses/filter.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let events: Vec<_> = client.open_stream(&[5, 6]).await.unwrap().collect().await;

    assert_eq!(events.len(), 4);
    assert!(matches!(events[0], Ok(StreamEvent::Post(_))));
    assert!(matches!(events[1], Ok(StreamEvent::Notice(_))));
    assert!(matches!(events[2], Ok(StreamEvent::Post(_))));
    assert!(matches!(events[3], Err(ApiError::Disconnected(_))));
}

#[tokio::test]
async fn test_malformed_stream_line_keeps_connection() {
    let server = MockServer::start().await;
    let body = concat!(
        "{\"id_str\":\"1\",\"user\":{\"id_str\":\"5\"}}\r\n",
        "{\"id_str\":\"2\",\"us\r\n",
        "{\"id_str\":\"3\",\"user\":{\"id_str\":\"5\"}}\r\n",
    );
    Mock::given(method("POST"))
        .and(path("/statuses/filter.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let events: Vec<_> = client.open_stream(&[5]).await.unwrap().collect().await;

    assert_eq!(events.len(), 4);
    assert!(matches!(&events[0], Ok(StreamEvent::Post(p)) if p["id_str"] == "1"));
    assert!(matches!(&events[1], Ok(StreamEvent::Notice(n)) if n.get("unparsed").is_some()));
    assert!(matches!(&events[2], Ok(StreamEvent::Post(p)) if p["id_str"] == "3"));
    assert!(matches!(events[3], Err(ApiError::Disconnected(_))));
}

#[test]
fn test_non_json_line_is_a_notice() {
    match parse_stream_message(b"<html>Service Unavailable</html>") {
        Ok(StreamEvent::Notice(notice)) => {
            assert_eq!(notice["unparsed"], "<html>Service Unavailable</html>")
        }
        other => panic!("expected notice, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stream_rejection_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/statuses/filter.json"))
        .respond_with(ResponseTemplate::new(420).set_body_string("Enhance Your Calm"))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let result = client.open_stream(&[5]).await;
    assert!(matches!(result, Err(ApiError::Api { status: 420, .. })));
}

#[test]
fn test_disconnect_notice_is_an_error() {
    let result = parse_stream_message(br#"{"disconnect":{"code":7,"reason":"admin logout"}}"#);
    match result {
        Err(ApiError::Disconnected(reason)) => assert_eq!(reason, "admin logout"),
        other => panic!("expected disconnect, got {:?}", other),
    }
}
