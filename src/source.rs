use std::path::PathBuf;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument};

use crate::errors::{BoxError, MapSegError, Result};

/// Progress callback receiving a fraction in [0, 1].
pub type ProgressFn<'a> = &'a (dyn Fn(f32) + Send + Sync);

/// Minimum change, in percentage points, between two intermediate reports.
const PROGRESS_STEP_PERCENT: u64 = 5;

/// Acquires model binaries.
///
/// Implementations stream the body and report progress through the callback;
/// they own no model semantics and mutate no shared state.
#[async_trait]
pub trait ModelSource: Send + Sync {
    async fn fetch(&self, url: &str, on_progress: ProgressFn<'_>) -> Result<Vec<u8>>;
}

/// Throttles intermediate progress to one report per step.
struct ProgressThrottle<'a> {
    callback: ProgressFn<'a>,
    last_percent: u64,
}

impl<'a> ProgressThrottle<'a> {
    fn begin(callback: ProgressFn<'a>) -> Self {
        callback(0.0);
        Self {
            callback,
            last_percent: 0,
        }
    }

    fn advance(&mut self, received: u64, total: u64) {
        if total == 0 {
            return;
        }
        let percent = (received.saturating_mul(100) / total).min(100);
        // 100 is reserved for `finish`, after the length check.
        if percent < 100 && percent >= self.last_percent + PROGRESS_STEP_PERCENT {
            self.last_percent = percent;
            (self.callback)(percent as f32 / 100.0);
        }
    }

    fn finish(self) {
        (self.callback)(1.0);
    }
}

/// Drains a chunk stream into one buffer, reporting progress on the way.
///
/// With a declared length the assembled size must match it exactly.
pub async fn collect_body<S, B, E>(
    url: &str,
    stream: S,
    declared_len: Option<u64>,
    on_progress: ProgressFn<'_>,
) -> Result<Vec<u8>>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<BoxError>,
{
    let mut stream = std::pin::pin!(stream);
    let mut throttle = ProgressThrottle::begin(on_progress);
    let mut body = Vec::with_capacity(declared_len.unwrap_or(0).min(1 << 30) as usize);

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| MapSegError::Network {
            url: url.to_string(),
            source: e.into(),
        })?;
        body.extend_from_slice(chunk.as_ref());
        if let Some(total) = declared_len {
            throttle.advance(body.len() as u64, total);
        }
    }

    if let Some(expected) = declared_len {
        if body.len() as u64 != expected {
            return Err(MapSegError::Decode {
                url: url.to_string(),
                expected,
                actual: body.len() as u64,
            });
        }
    }

    throttle.finish();
    Ok(body)
}

/// Downloads over HTTP(S) with a streamed body.
#[derive(Debug, Clone, Default)]
pub struct HttpModelSource {
    client: reqwest::Client,
}

impl HttpModelSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ModelSource for HttpModelSource {
    #[instrument(skip(self, on_progress))]
    async fn fetch(&self, url: &str, on_progress: ProgressFn<'_>) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| MapSegError::Network {
                url: url.to_string(),
                source: Box::new(e),
            })?;

        if !response.status().is_success() {
            return Err(MapSegError::Fetch {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let declared_len = response.content_length();
        debug!(?declared_len, "streaming model body");
        collect_body(url, response.bytes_stream(), declared_len, on_progress).await
    }
}

/// Reads a model from the local filesystem (`file://` URLs or bare paths).
#[derive(Debug, Clone, Copy, Default)]
pub struct FileModelSource;

pub(crate) fn local_path(url: &str) -> PathBuf {
    PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
}

#[async_trait]
impl ModelSource for FileModelSource {
    #[instrument(skip(self, on_progress))]
    async fn fetch(&self, url: &str, on_progress: ProgressFn<'_>) -> Result<Vec<u8>> {
        let path = local_path(url);
        let network = |e: std::io::Error| MapSegError::Network {
            url: url.to_string(),
            source: Box::new(e),
        };

        let file = tokio::fs::File::open(&path).await.map_err(network)?;
        let declared_len = file.metadata().await.map_err(network)?.len();
        collect_body(url, ReaderStream::new(file), Some(declared_len), on_progress).await
    }
}

pub(crate) fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Routes `http(s)://` to [`HttpModelSource`] and everything else to [`FileModelSource`].
#[derive(Debug, Clone, Default)]
pub struct DefaultModelSource {
    http: HttpModelSource,
    file: FileModelSource,
}

#[async_trait]
impl ModelSource for DefaultModelSource {
    async fn fetch(&self, url: &str, on_progress: ProgressFn<'_>) -> Result<Vec<u8>> {
        if is_http_url(url) {
            self.http.fetch(url, on_progress).await
        } else {
            self.file.fetch(url, on_progress).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn recorder() -> (Arc<Mutex<Vec<f32>>>, impl Fn(f32) + Send + Sync) {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        (reports, move |p| sink.lock().push(p))
    }

    async fn serve_once(response: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 2048];
            let _ = socket.read(&mut request).await;
            socket.write_all(&response).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/decoder.onnx")
    }

    fn chunks(total: usize, size: usize) -> Vec<std::result::Result<Vec<u8>, std::io::Error>> {
        (0..total)
            .step_by(size)
            .map(|start| Ok(vec![7u8; size.min(total - start)]))
            .collect()
    }

    #[tokio::test]
    async fn test_progress_is_throttled_and_bounded() -> Result<()> {
        let (reports, on_progress) = recorder();
        let body = collect_body("mem://model", stream::iter(chunks(1000, 1)), Some(1000), &on_progress)
            .await?;
        assert_eq!(body.len(), 1000);

        let reports = reports.lock();
        assert_eq!(reports.first(), Some(&0.0));
        assert_eq!(reports.last(), Some(&1.0));
        // 0, 5, 10, ... 95, then 1.0
        assert_eq!(reports.len(), 21);
        for pair in reports.windows(2) {
            assert!(pair[1] >= pair[0]);
            assert!(pair[1] - pair[0] >= 0.05 - 1e-6);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_length_reports_begin_and_end() -> Result<()> {
        let (reports, on_progress) = recorder();
        let body = collect_body("mem://model", stream::iter(chunks(300, 64)), None, &on_progress).await?;
        assert_eq!(body.len(), 300);
        assert_eq!(*reports.lock(), vec![0.0, 1.0]);
        Ok(())
    }

    #[tokio::test]
    async fn test_length_mismatch_is_decode_error() {
        let (reports, on_progress) = recorder();
        let result = collect_body("mem://model", stream::iter(chunks(7, 7)), Some(10), &on_progress).await;
        assert!(matches!(
            result,
            Err(MapSegError::Decode {
                expected: 10,
                actual: 7,
                ..
            })
        ));
        assert!(!reports.lock().contains(&1.0));
    }

    #[tokio::test]
    async fn test_stream_failure_is_network_error() {
        let (_, on_progress) = recorder();
        let items: Vec<std::result::Result<Vec<u8>, std::io::Error>> = vec![
            Ok(vec![1, 2, 3]),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];
        let result = collect_body("mem://model", stream::iter(items), Some(6), &on_progress).await;
        assert!(matches!(result, Err(MapSegError::Network { .. })));
    }

    #[tokio::test]
    async fn test_file_source_reads_local_model() -> Result<()> {
        let temp_dir = tempfile::TempDir::new()?;
        let path = temp_dir.path().join("encoder.onnx");
        std::fs::write(&path, vec![3u8; 64 * 1024])?;

        let (reports, on_progress) = recorder();
        let url = format!("file://{}", path.display());
        let bytes = DefaultModelSource::default().fetch(&url, &on_progress).await?;

        assert_eq!(bytes.len(), 64 * 1024);
        let reports = reports.lock();
        assert_eq!(reports.first(), Some(&0.0));
        assert_eq!(reports.last(), Some(&1.0));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_file_is_network_error() {
        let (_, on_progress) = recorder();
        let result = FileModelSource
            .fetch("/definitely/not/here/decoder.onnx", &on_progress)
            .await;
        assert!(matches!(result, Err(MapSegError::Network { .. })));
    }

    #[tokio::test]
    async fn test_http_error_status_is_fetch_error() {
        let url = serve_once(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec())
            .await;
        let (_, on_progress) = recorder();
        let result = HttpModelSource::default().fetch(&url, &on_progress).await;
        assert!(matches!(result, Err(MapSegError::Fetch { status: 404, .. })));
    }

    #[tokio::test]
    async fn test_http_body_is_collected() -> Result<()> {
        let mut response =
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\n".to_vec();
        response.extend_from_slice(b"onnx!");
        let url = serve_once(response).await;

        let (reports, on_progress) = recorder();
        let bytes = HttpModelSource::default().fetch(&url, &on_progress).await?;
        assert_eq!(bytes, b"onnx!");
        assert_eq!(reports.lock().last(), Some(&1.0));
        Ok(())
    }
}
