use std::{fmt, str::FromStr, time::Duration};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Collected, Full};
use hyper::{header, Method, Request, Uri};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::debug;

use super::{LogSink, SinkError, SinkFuture};
use crate::decoder::LogEntry;

/// Log index flavour that an [`HttpLogSink`] pushes to.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum LogSinkKind {
    /// Grafana Loki push API: one JSON document holding a stream per line.
    #[default]
    Loki,
    /// Quickwit ingest API: newline-delimited JSON documents.
    Quickwit,
}

impl LogSinkKind {
    /// Gets the name of this flavour.
    pub const fn as_str(&self) -> &'static str {
        match self {
            LogSinkKind::Loki => "loki",
            LogSinkKind::Quickwit => "quickwit",
        }
    }

    /// Gets the endpoint of a local instance of this flavour.
    pub const fn default_endpoint(&self) -> &'static str {
        match self {
            LogSinkKind::Loki => "http://localhost:3100/loki/api/v1/push",
            LogSinkKind::Quickwit => "http://localhost:7280/api/v1/ingest",
        }
    }

    const fn content_type(&self) -> &'static str {
        match self {
            LogSinkKind::Loki => "application/json",
            LogSinkKind::Quickwit => "application/x-ndjson",
        }
    }
}

impl fmt::Display for LogSinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogSinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "loki" => Ok(LogSinkKind::Loki),
            "quickwit" => Ok(LogSinkKind::Quickwit),
            _ => Err(format!("invalid log sink '{}' (expected 'loki' or 'quickwit')", s)),
        }
    }
}

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Log sink pushing batches of log lines to a log index over HTTP.
pub struct HttpLogSink {
    kind: LogSinkKind,
    endpoint: Uri,
    client: Client<HttpConnector, Full<Bytes>>,
    request_timeout: Duration,
}

impl HttpLogSink {
    /// Creates a new `HttpLogSink` pushing to the given endpoint.
    ///
    /// # Errors
    ///
    /// If the endpoint is not a valid `http` URI, an error variant will be returned.
    pub fn new(kind: LogSinkKind, endpoint: &str) -> Result<Self, SinkError> {
        let invalid =
            |reason: String| SinkError::InvalidEndpoint { endpoint: endpoint.to_string(), reason };

        let uri = endpoint.parse::<Uri>().map_err(|e| invalid(e.to_string()))?;
        if uri.scheme_str() != Some("http") {
            return Err(invalid(String::from("only http endpoints are supported")));
        }

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build_http();

        Ok(HttpLogSink { kind, endpoint: uri, client, request_timeout: DEFAULT_REQUEST_TIMEOUT })
    }

    /// Sets how long a push may take, from sending the request to reading the response.
    ///
    /// A push that takes longer fails with [`SinkError::Unavailable`].
    ///
    /// Defaults to 30 seconds.
    #[must_use]
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Gets the flavour of this sink.
    pub fn kind(&self) -> LogSinkKind {
        self.kind
    }
}

impl LogSink for HttpLogSink {
    fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    fn write_logs<'a>(&'a self, entries: &'a [LogEntry]) -> SinkFuture<'a> {
        Box::pin(async move {
            if entries.is_empty() {
                return Ok(0);
            }

            let payload = render_payload(self.kind, entries)?;
            let req = Request::builder()
                .method(Method::POST)
                .uri(self.endpoint.clone())
                .header(header::CONTENT_TYPE, self.kind.content_type())
                .body(Full::new(Bytes::from(payload)))?;

            let exchange = async {
                let response = self.client.request(req).await?;
                let status = response.status();
                if !status.is_success() {
                    let body = response
                        .into_body()
                        .collect()
                        .await
                        .map(Collected::to_bytes)
                        .map(|b| String::from_utf8_lossy(&b).into_owned())
                        .unwrap_or_else(|_| String::from("<failed to read response body>"));
                    return Err(SinkError::UnexpectedStatus { status: status.as_u16(), body });
                }
                Ok::<_, SinkError>(())
            };

            match timeout(self.request_timeout, exchange).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(SinkError::Unavailable(format!(
                        "no response from {} within {:?}",
                        self.endpoint, self.request_timeout
                    )))
                }
            }

            debug!(lines = entries.len(), endpoint = %self.endpoint, "Pushed log lines.");
            Ok(entries.len())
        })
    }
}

/// Renders a log line with every field spelled out, as stored in Loki.
fn structured_line(entry: &LogEntry) -> String {
    format!(
        "message={:?}, level={:?}, timestamp={}, hostname={:?}, service={:?}, file={:?}, line={}, function={:?}",
        entry.message,
        entry.level,
        entry.timestamp_nanos(),
        entry.hostname,
        entry.service,
        entry.file,
        entry.line,
        entry.function,
    )
}

fn render_payload(kind: LogSinkKind, entries: &[LogEntry]) -> Result<Vec<u8>, SinkError> {
    match kind {
        LogSinkKind::Loki => {
            let streams: Vec<Value> = entries
                .iter()
                .map(|entry| {
                    json!({
                        "stream": {
                            "level": entry.level,
                            "service": entry.service,
                            "hostname": entry.hostname,
                        },
                        "values": [[entry.timestamp_nanos().to_string(), structured_line(entry)]],
                    })
                })
                .collect();
            Ok(serde_json::to_vec(&json!({ "streams": streams }))?)
        }
        LogSinkKind::Quickwit => {
            let mut payload = Vec::new();
            for entry in entries {
                let document = json!({
                    "timestamp": entry.timestamp_nanos(),
                    "level": entry.level,
                    "message": entry.message,
                    "hostname": entry.hostname,
                    "service": entry.service,
                    "file": entry.file,
                    "line": entry.line,
                    "function": entry.function,
                });
                serde_json::to_writer(&mut payload, &document)?;
                payload.push(b'\n');
            }
            Ok(payload)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::DateTime;
    use serde_json::{json, Value};
    use tokio::{
        io::{AsyncReadExt as _, AsyncWriteExt as _},
        net::TcpListener,
        task::JoinHandle,
    };

    use super::{render_payload, HttpLogSink, LogSinkKind};
    use crate::{
        decoder::LogEntry,
        sink::{LogSink, SinkError},
    };

    fn entry(message: &str) -> LogEntry {
        LogEntry {
            message: message.to_string(),
            level: "error".into(),
            timestamp: DateTime::from_timestamp(1_700_000_000, 5),
            hostname: "web-1".into(),
            service: "auth".into(),
            file: "login.go".into(),
            line: 42,
            function: "handleLogin".into(),
        }
    }

    // Accepts a single HTTP/1.1 request, answers it with the given status line and body, and
    // returns the request body.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}/ingest", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0; 4096];

            let header_end = loop {
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed before sending headers");
                request.extend_from_slice(&buf[..n]);
                if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };

            let headers = String::from_utf8_lossy(&request[..header_end]).to_ascii_lowercase();
            let content_length: usize = headers
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .map(|value| value.trim().parse().unwrap())
                .unwrap_or(0);
            while request.len() < header_end + content_length {
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed before sending body");
                request.extend_from_slice(&buf[..n]);
            }

            let response = format!(
                "HTTP/1.1 {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            request.split_off(header_end)
        });

        (endpoint, handle)
    }

    #[test]
    fn loki_payload() {
        let payload = render_payload(LogSinkKind::Loki, &[entry("denied \"root\"")]).unwrap();
        let payload: Value = serde_json::from_slice(&payload).unwrap();

        assert_eq!(
            payload,
            json!({
                "streams": [{
                    "stream": { "level": "error", "service": "auth", "hostname": "web-1" },
                    "values": [[
                        "1700000000000000005",
                        "message=\"denied \\\"root\\\"\", level=\"error\", timestamp=1700000000000000005, \
                         hostname=\"web-1\", service=\"auth\", file=\"login.go\", line=42, \
                         function=\"handleLogin\"",
                    ]],
                }],
            })
        );
    }

    #[test]
    fn quickwit_payload() {
        let payload = render_payload(LogSinkKind::Quickwit, &[entry("a"), entry("b")]).unwrap();
        let payload = String::from_utf8(payload).unwrap();

        let documents: Vec<Value> =
            payload.lines().map(|line| serde_json::from_str(line).unwrap()).collect();
        assert_eq!(documents.len(), 2);
        assert!(payload.ends_with('\n'));
        assert_eq!(documents[0]["message"], "a");
        assert_eq!(documents[1]["message"], "b");
        assert_eq!(documents[0]["line"], 42);
        assert_eq!(documents[0]["timestamp"], 1_700_000_000_000_000_005_i64);
    }

    #[test]
    fn parse_log_sink_kind() {
        assert_eq!("loki".parse::<LogSinkKind>(), Ok(LogSinkKind::Loki));
        assert_eq!("quickwit".parse::<LogSinkKind>(), Ok(LogSinkKind::Quickwit));
        assert!("elastic".parse::<LogSinkKind>().is_err());
    }

    #[tokio::test]
    async fn rejects_invalid_endpoints() {
        for endpoint in ["not a uri", "https://localhost:3100/loki/api/v1/push", "/relative"] {
            let result = HttpLogSink::new(LogSinkKind::Loki, endpoint);
            assert!(matches!(result, Err(SinkError::InvalidEndpoint { .. })), "{endpoint}");
        }
    }

    #[tokio::test]
    async fn pushes_log_lines() {
        let (endpoint, server) = serve_once("204 No Content", "").await;
        let sink = HttpLogSink::new(LogSinkKind::Loki, &endpoint).unwrap();

        let written = sink.write_logs(&[entry("hello")]).await.unwrap();
        assert_eq!(written, 1);

        let body: Value = serde_json::from_slice(&server.await.unwrap()).unwrap();
        assert_eq!(body["streams"][0]["stream"]["service"], "auth");
    }

    #[tokio::test]
    async fn surfaces_unexpected_status() {
        let (endpoint, server) =
            serve_once("500 Internal Server Error", "ingester unavailable").await;
        let sink = HttpLogSink::new(LogSinkKind::Quickwit, &endpoint).unwrap();

        let result = sink.write_logs(&[entry("hello")]).await;
        match result {
            Err(SinkError::UnexpectedStatus { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "ingester unavailable");
            }
            other => panic!("expected an unexpected status error, got {:?}", other),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unresponsive_endpoints_time_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}/loki/api/v1/push", listener.local_addr().unwrap());

        // Accept the connection and read the request, but never answer it.
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0; 4096];
            while stream.read(&mut buf).await.unwrap() > 0 {}
        });

        let sink = HttpLogSink::new(LogSinkKind::Loki, &endpoint)
            .unwrap()
            .with_request_timeout(Duration::from_millis(100));

        let result = tokio::time::timeout(Duration::from_secs(5), sink.write_logs(&[entry("x")]))
            .await
            .expect("push should give up on its own");
        assert!(matches!(result, Err(SinkError::Unavailable(_))), "{:?}", result);

        drop(sink);
        server.abort();
    }

    #[tokio::test]
    async fn empty_batches_are_not_sent() {
        let sink = HttpLogSink::new(LogSinkKind::Loki, "http://127.0.0.1:9/unused").unwrap();
        assert_eq!(sink.write_logs(&[]).await.unwrap(), 0);
    }
}
