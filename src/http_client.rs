use crate::error::{HttpError, HttpResult};
use crate::sse::{SseFrame, SseParser};
use futures_util::StreamExt;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Default ceiling for buffered response bodies.
const DEFAULT_MAX_BODY: usize = 10 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Head,
}

/// One HTTP exchange. Headers keep insertion order, case and duplicates.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub content_type: Option<String>,
    pub bearer_token: Option<String>,
    pub basic_auth: Option<(String, String)>,
    pub connect_timeout_ms: u64,
    pub total_timeout_ms: u64,
    pub verify_tls: bool,
    pub ca_pem: Option<String>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: &str) -> Self {
        Self {
            method,
            url: url.to_string(),
            headers: Vec::new(),
            body: None,
            content_type: None,
            bearer_token: None,
            basic_auth: None,
            connect_timeout_ms: 10_000,
            total_timeout_ms: 30_000,
            verify_tls: false,
            ca_pem: None,
        }
    }

    pub fn get(url: &str) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: &str) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.push((key.to_string(), value.to_string()));
        self
    }

    pub fn json_body(mut self, body: &str) -> Self {
        self.body = Some(body.as_bytes().to_vec());
        self.content_type = Some("application/json".to_string());
        self
    }

    pub fn bearer_token(mut self, token: &str) -> Self {
        self.bearer_token = Some(token.to_string());
        self
    }

    pub fn timeouts(mut self, connect_ms: u64, total_ms: u64) -> Self {
        self.connect_timeout_ms = connect_ms;
        self.total_timeout_ms = total_ms;
        self
    }

    /// Whether the exchange runs over TLS: explicit `https://` scheme or
    /// a TLS port.
    pub fn uses_tls(&self) -> bool {
        if self.url.starts_with("https://") {
            return true;
        }
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.port())
            .map(|p| p == 443 || p == 8883)
            .unwrap_or(false)
    }

    /// Value of the first `Range: bytes=<start>-` header, if set.
    pub fn range_start(&self) -> Option<u64> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("range"))
            .and_then(|(_, v)| v.trim().strip_prefix("bytes=").map(str::to_string))
            .and_then(|spec| spec.split('-').next().and_then(|s| s.parse().ok()))
    }
}

/// Terminal state of an exchange. `error_code` is `0` for a 2xx
/// exchange and the HTTP status otherwise; `inner_error_code` carries a
/// transport-level code distinct from the HTTP layer.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub error_code: i32,
    pub inner_error_code: i32,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        self.error_code == 0
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn from_parts(status: u16, headers: Vec<(String, String)>) -> Self {
        Self {
            status,
            headers,
            body: Vec::new(),
            error_code: if (200..300).contains(&status) { 0 } else { status as i32 },
            inner_error_code: 0,
        }
    }
}

/// HTTP engine: one state machine drives buffered requests, chunked
/// streaming, SSE streams and verified downloads.
pub struct HttpClient {
    max_body: usize,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    pub fn new() -> Self {
        Self {
            max_body: DEFAULT_MAX_BODY,
        }
    }

    pub fn with_max_body(max_body: usize) -> Self {
        Self { max_body }
    }

    fn build_client(&self, req: &HttpRequest) -> HttpResult<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(req.connect_timeout_ms))
            .timeout(Duration::from_millis(req.total_timeout_ms));
        if !req.verify_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(pem) = &req.ca_pem {
            let cert = reqwest::Certificate::from_pem(pem.as_bytes())
                .map_err(|e| HttpError::Tls(format!("bad trust anchor: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        builder
            .build()
            .map_err(|e| HttpError::Connection(format!("client build failed: {e}")))
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        req: &HttpRequest,
    ) -> HttpResult<reqwest::RequestBuilder> {
        let method = match req.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
        };
        let mut builder = client.request(method, &req.url);
        if let Some(ct) = &req.content_type {
            builder = builder.header("Content-Type", ct);
        }
        for (key, value) in &req.headers {
            builder = builder.header(key, value);
        }
        if let Some(token) = &req.bearer_token {
            builder = builder.bearer_auth(token.trim_start_matches("Bearer ").trim());
        }
        if let Some((user, pass)) = &req.basic_auth {
            builder = builder.basic_auth(user, Some(pass));
        }
        if let Some(body) = &req.body {
            builder = builder.body(body.clone());
        }
        Ok(builder)
    }

    async fn execute(&self, req: &HttpRequest) -> HttpResult<reqwest::Response> {
        let client = self.build_client(req)?;
        let builder = self.build_request(&client, req)?;
        builder.send().await.map_err(map_reqwest_error)
    }

    /// Run the exchange to completion and buffer the body (bounded).
    pub async fn send(&self, req: &HttpRequest) -> HttpResult<HttpResponse> {
        let resp = self.execute(req).await?;
        let mut out = response_head(&resp);
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest_error)?;
            if out.body.len() + chunk.len() > self.max_body {
                return Err(HttpError::BodyTooLarge(self.max_body));
            }
            out.body.extend_from_slice(&chunk);
        }
        debug!(status = out.status, bytes = out.body.len(), url = %req.url, "http exchange done");
        Ok(out)
    }

    /// Stream the response body; the callback sees each decoded chunk
    /// with `is_last=false`, then an empty terminal chunk with
    /// `is_last=true`.
    pub async fn send_streaming<F>(&self, req: &HttpRequest, mut on_chunk: F) -> HttpResult<HttpResponse>
    where
        F: FnMut(&[u8], bool),
    {
        let resp = self.execute(req).await?;
        let out = response_head(&resp);
        if out.error_code != 0 {
            let body = resp.text().await.unwrap_or_default();
            return Err(HttpError::Status(out.status, body));
        }
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest_error)?;
            on_chunk(&chunk, false);
        }
        on_chunk(&[], true);
        Ok(out)
    }

    /// Consume a `text/event-stream` response, delivering each complete
    /// SSE frame in arrival order. Frame data is borrowed by the
    /// callback for the duration of the call only.
    pub async fn send_sse<F>(&self, req: &HttpRequest, mut on_frame: F) -> HttpResult<HttpResponse>
    where
        F: FnMut(&SseFrame),
    {
        let resp = self.execute(req).await?;
        let out = response_head(&resp);
        if out.error_code != 0 {
            let body = resp.text().await.unwrap_or_default();
            return Err(HttpError::Status(out.status, body));
        }
        let content_type = out.header("content-type").unwrap_or("");
        if !content_type.starts_with("text/event-stream") {
            return Err(HttpError::Parse(format!(
                "expected text/event-stream, got {content_type}"
            )));
        }
        let mut parser = SseParser::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest_error)?;
            parser.push(&chunk, |frame| on_frame(&frame));
        }
        Ok(out)
    }

    /// Stream the response body into `path`, honouring a `Range` resume
    /// offset, then verify size and MD5. The partial file is deleted on
    /// any failure.
    pub async fn download<F>(
        &self,
        req: &HttpRequest,
        path: &Path,
        expected_size: Option<u64>,
        md5_sign: Option<&str>,
        mut on_progress: F,
    ) -> HttpResult<u64>
    where
        F: FnMut(&[u8], u64, u64),
    {
        let result = self
            .download_inner(req, path, expected_size, md5_sign, &mut on_progress)
            .await;
        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), "failed to delete partial download: {e}");
                }
            }
        }
        result
    }

    async fn download_inner<F>(
        &self,
        req: &HttpRequest,
        path: &Path,
        expected_size: Option<u64>,
        md5_sign: Option<&str>,
        on_progress: &mut F,
    ) -> HttpResult<u64>
    where
        F: FnMut(&[u8], u64, u64),
    {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let resume_from = req.range_start().unwrap_or(0);
        let resp = self.execute(req).await?;
        let head = response_head(&resp);
        if head.error_code != 0 {
            let body = resp.text().await.unwrap_or_default();
            return Err(HttpError::Status(head.status, body));
        }
        let total = expected_size
            .or(resp.content_length().map(|l| l + resume_from))
            .unwrap_or(0);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .await?;
        file.set_len(resume_from).await?;
        file.seek(std::io::SeekFrom::Start(resume_from)).await?;

        let mut downloaded = resume_from;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest_error)?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            on_progress(&chunk, downloaded, total);
        }
        file.flush().await?;
        drop(file);

        verify_download(path, expected_size, md5_sign)?;
        Ok(downloaded)
    }
}

/// Size and MD5 gate applied after a download reaches end of stream.
pub fn verify_download(
    path: &Path,
    expected_size: Option<u64>,
    md5_sign: Option<&str>,
) -> HttpResult<()> {
    if let Some(expected) = expected_size {
        let actual = std::fs::metadata(path)?.len();
        if actual != expected {
            return Err(HttpError::SizeMismatch { expected, actual });
        }
    }
    if let Some(expected) = md5_sign.filter(|s| !s.is_empty()) {
        let actual = crate::crypto::md5_file_hex(path)?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(HttpError::SignatureMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
    }
    Ok(())
}

fn response_head(resp: &reqwest::Response) -> HttpResponse {
    let headers = resp
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
        .collect();
    HttpResponse::from_parts(resp.status().as_u16(), headers)
}

fn map_reqwest_error(e: reqwest::Error) -> HttpError {
    if e.is_timeout() {
        if e.is_connect() {
            HttpError::ConnectTimeout
        } else {
            HttpError::ReadTimeout
        }
    } else if e.is_connect() {
        HttpError::Connection(e.to_string())
    } else {
        let text = e.to_string();
        if text.contains("certificate") || text.contains("tls") || text.contains("ssl") {
            HttpError::Tls(text)
        } else {
            HttpError::Connection(text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_inference() {
        assert!(HttpRequest::get("https://host/path").uses_tls());
        assert!(HttpRequest::get("http://host:443/path").uses_tls());
        assert!(!HttpRequest::get("http://host:8080/path").uses_tls());
    }

    #[test]
    fn test_range_header_parsing() {
        let req = HttpRequest::get("http://host/f").header("Range", "bytes=1024-");
        assert_eq!(req.range_start(), Some(1024));
        let req = HttpRequest::get("http://host/f").header("Range", "bytes=0-499");
        assert_eq!(req.range_start(), Some(0));
        assert_eq!(HttpRequest::get("http://host/f").range_start(), None);
    }

    #[test]
    fn test_headers_preserve_order_and_duplicates() {
        let req = HttpRequest::post("http://h/x")
            .header("X-A", "1")
            .header("X-B", "2")
            .header("X-A", "3");
        assert_eq!(
            req.headers,
            vec![
                ("X-A".to_string(), "1".to_string()),
                ("X-B".to_string(), "2".to_string()),
                ("X-A".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn test_response_error_code_mapping() {
        assert_eq!(HttpResponse::from_parts(200, vec![]).error_code, 0);
        assert_eq!(HttpResponse::from_parts(204, vec![]).error_code, 0);
        assert_eq!(HttpResponse::from_parts(404, vec![]).error_code, 404);
        assert!(!HttpResponse::from_parts(500, vec![]).is_success());
    }

    /// One-shot HTTP stub: answers any request with the given head+body.
    async fn serve_once(head: &'static str, body: Vec<u8>) -> u16 {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            }
        });
        port
    }

    #[tokio::test]
    async fn test_send_buffers_body() {
        let port = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\n",
            b"hello".to_vec(),
        )
        .await;
        let client = HttpClient::new();
        let req = HttpRequest::get(&format!("http://127.0.0.1:{port}/x"));
        let response = client.send(&req).await.unwrap();
        assert_eq!(response.status, 200);
        assert!(response.is_success());
        assert_eq!(response.body_string(), "hello");
    }

    #[tokio::test]
    async fn test_send_enforces_body_ceiling() {
        let body = vec![b'a'; 64];
        let port = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 64\r\nConnection: close\r\n\r\n",
            body,
        )
        .await;
        let client = HttpClient::with_max_body(16);
        let req = HttpRequest::get(&format!("http://127.0.0.1:{port}/x"));
        assert!(matches!(
            client.send(&req).await,
            Err(HttpError::BodyTooLarge(16))
        ));
    }

    #[tokio::test]
    async fn test_send_streaming_terminal_chunk() {
        let port = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 8\r\nConnection: close\r\n\r\n",
            b"chunked!".to_vec(),
        )
        .await;
        let client = HttpClient::new();
        let req = HttpRequest::get(&format!("http://127.0.0.1:{port}/x"));
        let mut collected = Vec::new();
        let mut saw_last = false;
        client
            .send_streaming(&req, |chunk, is_last| {
                collected.extend_from_slice(chunk);
                if is_last {
                    assert!(chunk.is_empty());
                    saw_last = true;
                }
            })
            .await
            .unwrap();
        assert_eq!(collected, b"chunked!");
        assert!(saw_last);
    }

    #[tokio::test]
    async fn test_send_sse_delivers_frames_in_order() {
        let body = b"data: one\n\nevent: tick\ndata: two\n\n".to_vec();
        let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n";
        let port = serve_once(head, body).await;
        let client = HttpClient::new();
        let req = HttpRequest::get(&format!("http://127.0.0.1:{port}/events"));
        let mut frames = Vec::new();
        client
            .send_sse(&req, |frame| frames.push(frame.clone()))
            .await
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "one");
        assert_eq!(frames[1].event.as_deref(), Some("tick"));
        assert_eq!(frames[1].data, "two");
    }

    #[tokio::test]
    async fn test_send_sse_rejects_wrong_content_type() {
        let port = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 2\r\nConnection: close\r\n\r\n",
            b"{}".to_vec(),
        )
        .await;
        let client = HttpClient::new();
        let req = HttpRequest::get(&format!("http://127.0.0.1:{port}/x"));
        assert!(matches!(
            client.send_sse(&req, |_| {}).await,
            Err(HttpError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_streaming_error_status_carries_body() {
        let port = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 9\r\nConnection: close\r\n\r\n",
            b"try later".to_vec(),
        )
        .await;
        let client = HttpClient::new();
        let req = HttpRequest::get(&format!("http://127.0.0.1:{port}/x"));
        match client.send_streaming(&req, |_, _| {}).await {
            Err(HttpError::Status(503, body)) => assert_eq!(body, "try later"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_verify_download_size_gate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.bin");
        std::fs::write(&path, vec![0u8; 100]).unwrap();

        assert!(verify_download(&path, Some(100), None).is_ok());
        match verify_download(&path, Some(200), None) {
            Err(HttpError::SizeMismatch { expected, actual }) => {
                assert_eq!(expected, 200);
                assert_eq!(actual, 100);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_verify_download_md5_gate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.bin");
        std::fs::write(&path, b"firmware-image").unwrap();
        let good = crate::crypto::md5_hex(b"firmware-image");

        assert!(verify_download(&path, None, Some(&good)).is_ok());
        assert!(verify_download(&path, None, Some(&good.to_uppercase())).is_ok());
        assert!(matches!(
            verify_download(&path, None, Some("00000000000000000000000000000000")),
            Err(HttpError::SignatureMismatch { .. })
        ));
    }
}
