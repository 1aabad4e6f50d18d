use std::time::Duration;

use tokio::net::TcpListener;

use super::*;
use crate::utils::test_utils::{channel_body, serve_once, sse_delta, sse_done, ScriptedBackend};

const TIMEOUT: Duration = Duration::from_secs(5);

fn request_for(base_url: &str, cancel_token: CancellationToken) -> StreamRequest {
    StreamRequest {
        base_url: base_url.to_string(),
        api_key: "test-key".to_string(),
        auth_mode: AuthMode::Bearer,
        model: "m1".to_string(),
        messages: vec![ChatMessage {
            role: "user".to_string(),
            content: "Hi".to_string(),
        }],
        cancel_token,
    }
}

async fn collect_events(handle: &mut StreamHandle) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(TIMEOUT, handle.next_event())
            .await
            .expect("stream should progress");
        let terminal = !matches!(event, StreamEvent::Delta(_));
        events.push(event);
        if terminal {
            return events;
        }
    }
}

fn handle_from_chunks(chunks: Vec<Vec<u8>>) -> StreamHandle {
    let body = stream::iter(chunks.into_iter().map(Ok)).boxed();
    StreamHandle::new(body, CancellationToken::new())
}

#[test]
fn decode_sse_line_handles_spacing_variants() {
    assert_eq!(
        decode_sse_line(r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#),
        SseLine::Delta("Hello".to_string())
    );
    assert_eq!(
        decode_sse_line(r#"data:{"choices":[{"delta":{"content":"World"}}]}"#),
        SseLine::Delta("World".to_string())
    );
    assert_eq!(decode_sse_line("data: [DONE]"), SseLine::Done);
    assert_eq!(decode_sse_line("data:[DONE]\r"), SseLine::Done);
}

#[test]
fn decode_sse_line_skips_keepalives_and_empty_deltas() {
    for line in [
        "",
        ": keepalive",
        "event: message",
        "id: 7",
        "data:",
        r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#,
        r#"data: {"choices":[{"delta":{"content":""}}]}"#,
        r#"data: {"choices":[]}"#,
        r#"data: {"type":"ping"}"#,
    ] {
        assert_eq!(decode_sse_line(line), SseLine::Skip, "line: {line:?}");
    }
}

#[test]
fn decode_sse_line_routes_stream_errors() {
    let line = r#"data: {"error":{"message":"internal server error"}}"#;
    let expected = r#"API Error: internal server error
```json
{
  "error": {
    "message": "internal server error"
  }
}
```"#;
    assert_eq!(decode_sse_line(line), SseLine::Error(expected.to_string()));

    assert_eq!(
        decode_sse_line("data: not json"),
        SseLine::Error("API Error:\n```\nnot json\n```".to_string())
    );
}

#[test]
fn format_api_error_prettifies_json_with_summary() {
    let raw = r#"{"error":{"message":"model   overloaded","type":"invalid_request_error"}}"#;
    let expected = r#"API Error: model overloaded
```json
{
  "error": {
    "message": "model   overloaded",
    "type": "invalid_request_error"
  }
}
```"#;
    assert_eq!(format_api_error(raw), expected);
}

#[test]
fn format_api_error_handles_other_shapes() {
    assert_eq!(
        format_api_error(r#"{"status":"failed"}"#),
        "API Error:\n```json\n{\n  \"status\": \"failed\"\n}\n```"
    );
    assert_eq!(
        format_api_error("<error>bad</error>"),
        "API Error:\n```xml\n<error>bad</error>\n```"
    );
    assert_eq!(format_api_error("  "), "API Error:\n```\n<empty>\n```");
}

#[test]
fn connection_error_display_distinguishes_status() {
    assert_eq!(
        ConnectionError::status(401, "bad key").to_string(),
        "Request failed with status 401: bad key"
    );
    assert_eq!(
        ConnectionError::unreachable("refused").to_string(),
        "Could not reach service: refused"
    );
}

#[tokio::test]
async fn handle_concatenates_deltas_until_done() {
    let mut chunks = vec![sse_delta("He"), sse_delta("llo"), sse_delta("!")];
    chunks.push(sse_done());
    chunks.push(sse_delta("ignored after done"));
    let mut handle = handle_from_chunks(chunks);

    let events = collect_events(&mut handle).await;
    assert_eq!(
        events,
        vec![
            StreamEvent::Delta("He".into()),
            StreamEvent::Delta("llo".into()),
            StreamEvent::Delta("!".into()),
            StreamEvent::Closed,
        ]
    );
    assert_eq!(handle.state(), HandleState::Closed);
    assert_eq!(handle.next_event().await, StreamEvent::Closed);
}

#[tokio::test]
async fn handle_reassembles_lines_split_across_chunks() {
    let mut bytes = sse_delta("héllo");
    bytes.extend(sse_delta("wörld"));
    bytes.extend(sse_done());
    // Split inside the multi-byte 'é' and mid-line elsewhere.
    let split_at = bytes
        .iter()
        .position(|b| *b == 0xC3)
        .expect("multibyte char present")
        + 1;
    let (first, rest) = bytes.split_at(split_at);
    let (second, third) = rest.split_at(rest.len() / 2);
    let mut handle = handle_from_chunks(vec![first.to_vec(), second.to_vec(), third.to_vec()]);

    let events = collect_events(&mut handle).await;
    assert_eq!(
        events,
        vec![
            StreamEvent::Delta("héllo".into()),
            StreamEvent::Delta("wörld".into()),
            StreamEvent::Closed,
        ]
    );
}

#[tokio::test]
async fn handle_treats_connection_close_as_end_of_stream() {
    let unterminated = br#"data: {"choices":[{"delta":{"content":"tail"}}]}"#.to_vec();
    let mut handle =
        handle_from_chunks(vec![sse_delta("head"), b": ping\n\n".to_vec(), unterminated]);

    let events = collect_events(&mut handle).await;
    assert_eq!(
        events,
        vec![
            StreamEvent::Delta("head".into()),
            StreamEvent::Delta("tail".into()),
            StreamEvent::Closed,
        ]
    );
}

#[tokio::test]
async fn handle_reports_in_band_errors_after_preceding_deltas() {
    let mut chunk = sse_delta("partial");
    chunk.extend_from_slice(b"data: {\"error\":{\"message\":\"overloaded\"}}\n\n");
    let mut handle = handle_from_chunks(vec![chunk]);

    let events = collect_events(&mut handle).await;
    assert_eq!(events[0], StreamEvent::Delta("partial".into()));
    match &events[1] {
        StreamEvent::Failed(message) => assert!(message.starts_with("API Error: overloaded")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(handle.state(), HandleState::Failed);
}

#[tokio::test]
async fn handle_reports_transport_failures() {
    let body = stream::iter(vec![Ok(sse_delta("He")), Err("connection reset".to_string())]).boxed();
    let mut handle = StreamHandle::new(body, CancellationToken::new());

    let events = collect_events(&mut handle).await;
    assert_eq!(
        events,
        vec![
            StreamEvent::Delta("He".into()),
            StreamEvent::Failed("Stream interrupted: connection reset".into()),
        ]
    );
}

#[tokio::test]
async fn cancel_resolves_a_pending_read() {
    let (tx, body) = channel_body();
    let token = CancellationToken::new();
    let mut handle = StreamHandle::new(body, token.clone());
    tx.send(Ok(sse_delta("He"))).unwrap();

    assert_eq!(handle.next_event().await, StreamEvent::Delta("He".into()));

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });
    let event = tokio::time::timeout(TIMEOUT, handle.next_event())
        .await
        .expect("cancel should wake the stalled read");
    assert_eq!(event, StreamEvent::Cancelled);
    canceller.await.unwrap();

    // Late chunks are discarded.
    let _ = tx.send(Ok(sse_delta("llo")));
    assert_eq!(handle.next_event().await, StreamEvent::Cancelled);
    assert_eq!(handle.state(), HandleState::Cancelled);
}

#[tokio::test]
async fn explicit_cancel_is_idempotent() {
    let (_tx, body) = channel_body();
    let mut handle = StreamHandle::new(body, CancellationToken::new());
    handle.cancel();
    handle.cancel();
    assert!(handle.cancel_token().is_cancelled());
    assert_eq!(handle.next_event().await, StreamEvent::Cancelled);
}

#[tokio::test]
async fn service_forwards_messages_tagged_with_stream_id() {
    let backend = ScriptedBackend::new();
    let chunks = backend.push_stream();
    let (service, mut rx) = ChatStreamService::new(Arc::new(backend.clone()));

    service.spawn_stream(request_for("https://api.test.com", CancellationToken::new()), 7);
    chunks.send(Ok(sse_delta("Hi"))).unwrap();
    chunks.send(Ok(sse_done())).unwrap();

    let mut received = Vec::new();
    while let Ok(Some(item)) = tokio::time::timeout(TIMEOUT, rx.recv()).await {
        let done = item.0 == StreamMessage::End;
        received.push(item);
        if done {
            break;
        }
    }
    assert_eq!(
        received,
        vec![
            (StreamMessage::Opened, 7),
            (StreamMessage::Chunk("Hi".into()), 7),
            (StreamMessage::End, 7),
        ]
    );
    assert_eq!(backend.requests()[0].model, "m1");
}

#[tokio::test]
async fn service_reports_dispatch_failures() {
    let backend = ScriptedBackend::new();
    backend.push_refusal(ConnectionError::status(401, "bad key"));
    let (service, mut rx) = ChatStreamService::new(Arc::new(backend));

    service.spawn_stream(request_for("https://api.test.com", CancellationToken::new()), 3);
    let (message, stream_id) = tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stream_id, 3);
    assert_eq!(
        message,
        StreamMessage::DispatchFailed(ConnectionError::status(401, "bad key"))
    );
}

#[tokio::test]
async fn service_goes_quiet_after_cancel() {
    let backend = ScriptedBackend::new();
    let chunks = backend.push_stream();
    let (service, mut rx) = ChatStreamService::new(Arc::new(backend));
    let token = CancellationToken::new();

    service.spawn_stream(request_for("https://api.test.com", token.clone()), 1);
    chunks.send(Ok(sse_delta("He"))).unwrap();
    assert_eq!(rx.recv().await.unwrap().0, StreamMessage::Opened);
    assert_eq!(rx.recv().await.unwrap().0, StreamMessage::Chunk("He".into()));

    token.cancel();
    let _ = chunks.send(Ok(sse_delta("llo")));
    let next = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(matches!(next, Ok(None) | Err(_)), "unexpected message: {next:?}");
}

#[tokio::test]
async fn http_backend_streams_completion_deltas() {
    let mut body = sse_delta("He");
    body.extend(sse_delta("llo"));
    body.extend(sse_delta("!"));
    body.extend(sse_done());
    let (base_url, server) = serve_once("200 OK", "text/event-stream", body).await;

    let backend = HttpBackend::default();
    let mut handle = backend
        .send(request_for(&base_url, CancellationToken::new()))
        .await
        .expect("stream should open");
    let events = collect_events(&mut handle).await;

    let text: String = events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Delta(delta) => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "Hello!");
    assert_eq!(events.last(), Some(&StreamEvent::Closed));

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /v1/chat/completions HTTP/1.1"));
    assert!(request
        .to_ascii_lowercase()
        .contains("authorization: bearer test-key"));
    let body_start = request.find("\r\n\r\n").unwrap() + 4;
    let sent: ChatRequest = serde_json::from_str(&request[body_start..]).expect("json body");
    assert_eq!(sent.model, "m1");
    assert!(sent.stream);
    assert_eq!(sent.messages[0].content, "Hi");
}

#[tokio::test]
async fn http_backend_rejects_non_success_status() {
    let (base_url, server) = serve_once(
        "401 Unauthorized",
        "application/json",
        br#"{"error":{"message":"invalid api key"}}"#.to_vec(),
    )
    .await;

    let result = HttpBackend::default()
        .send(request_for(&base_url, CancellationToken::new()))
        .await;
    let err = match result {
        Err(err) => err,
        Ok(_) => panic!("expected connection error"),
    };
    assert_eq!(err.status, Some(401));
    assert!(err.message.starts_with("API Error: invalid api key"));
    server.await.unwrap();
}

#[tokio::test]
async fn http_backend_reports_unreachable_endpoint() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = HttpBackend::default()
        .send(request_for(&format!("http://{addr}"), CancellationToken::new()))
        .await;
    match result {
        Err(err) => assert_eq!(err.status, None),
        Ok(_) => panic!("expected connection error"),
    }
}
