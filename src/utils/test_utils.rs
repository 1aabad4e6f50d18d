use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream;
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::core::chat_stream::{
    ByteStream, ChatBackend, ConnectionError, StreamHandle, StreamRequest,
};
use crate::core::session::{Selection, ServiceEndpoint, Session};
use crate::utils::auth::AuthMode;

pub type ChunkSender = mpsc::UnboundedSender<Result<Vec<u8>, String>>;

/// Encode one streamed delta as a server-sent event.
pub fn sse_delta(content: &str) -> Vec<u8> {
    let payload = serde_json::json!({
        "choices": [{ "delta": { "content": content }, "finish_reason": null }]
    });
    format!("data: {payload}\n\n").into_bytes()
}

pub fn sse_done() -> Vec<u8> {
    b"data: [DONE]\n\n".to_vec()
}

/// A body stream fed by the returned sender; dropping the sender closes it.
pub fn channel_body() -> (ChunkSender, ByteStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let body = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    })
    .boxed();
    (tx, body)
}

pub fn test_endpoint() -> ServiceEndpoint {
    ServiceEndpoint {
        id: "test".to_string(),
        display_name: "Test".to_string(),
        base_url: "https://api.test.com/v1".to_string(),
        api_key: Some("test-key".to_string()),
        auth_mode: AuthMode::Bearer,
    }
}

/// A session with service and model `m1` selected and the given system prompt.
pub fn create_test_session(system_prompt: &str) -> Session {
    Session::new(
        Selection {
            service: Some(test_endpoint()),
            model: Some("m1".to_string()),
        },
        system_prompt,
    )
}

enum Script {
    Stream(ByteStream),
    Refuse(ConnectionError),
}

/// Backend that answers each `send` with the next queued script.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    scripts: Arc<Mutex<VecDeque<Script>>>,
    requests: Arc<Mutex<Vec<StreamRequest>>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a stream whose chunks are pushed through the returned sender.
    pub fn push_stream(&self) -> ChunkSender {
        let (tx, body) = channel_body();
        self.scripts.lock().unwrap().push_back(Script::Stream(body));
        tx
    }

    pub fn push_refusal(&self, error: ConnectionError) {
        self.scripts.lock().unwrap().push_back(Script::Refuse(error));
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn send(&self, request: StreamRequest) -> Result<StreamHandle, ConnectionError> {
        let cancel_token = request.cancel_token.clone();
        self.requests.lock().unwrap().push(request);
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            Some(Script::Stream(body)) => Ok(StreamHandle::new(body, cancel_token)),
            Some(Script::Refuse(error)) => Err(error),
            None => Err(ConnectionError::unreachable("no scripted response")),
        }
    }
}

async fn read_http_request(stream: &mut TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let read = stream.read(&mut buf).await.expect("read request");
        if read == 0 {
            break;
        }
        data.extend_from_slice(&buf[..read]);
        let text = String::from_utf8_lossy(&data).to_string();
        if let Some(header_end) = text.find("\r\n\r\n") {
            let content_length = text[..header_end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if data.len() >= header_end + 4 + content_length {
                return text;
            }
        }
    }
    String::from_utf8_lossy(&data).to_string()
}

/// Answer a single HTTP request with a fixed response. Yields the base URL
/// to request against and a task resolving to the raw request text.
pub async fn serve_once(
    status_line: &'static str,
    content_type: &'static str,
    body: Vec<u8>,
) -> (String, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("local addr should resolve");
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let request = read_http_request(&mut stream).await;
        let head = format!(
            "HTTP/1.1 {status_line}\r\nContent-Type: {content_type}\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes()).await.expect("write head");
        stream.write_all(&body).await.expect("write body");
        stream.shutdown().await.ok();
        request
    });
    (format!("http://{addr}/v1/"), server)
}
