//! Storage transport over `reqwest`.

use futures_util::{Stream, StreamExt, stream};
use mule_uploader::{
    HttpRequest, HttpResponse, Method, ProgressSender, SendFuture, Transport, TransportError,
};
use tracing::debug;

/// Body bytes handed to the connection per progress report.
const PIECE_SIZE: usize = 64 * 1024;

/// Sends storage requests with `reqwest`.
///
/// Request bodies are streamed in pieces so upload progress can be
/// reported; dropping the future returned by `send` drops the connection.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, crate::Error> {
        Ok(Self::with_client(crate::client()?))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn execute(
        &self,
        request: HttpRequest,
        progress: Option<ProgressSender>,
    ) -> Result<HttpResponse, TransportError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Put => reqwest::Method::PUT,
            Method::Post => reqwest::Method::POST,
            Method::Head => reqwest::Method::HEAD,
        };
        let mut builder = self
            .client
            .request(method, request.url.as_str())
            .query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder
                .header(reqwest::header::CONTENT_LENGTH, body.len())
                .body(reqwest::Body::wrap_stream(progress_stream(body, progress)));
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                Some((name.as_str().to_string(), value.to_str().ok()?.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(transport_error)?.to_vec();
        debug!(url = %request.url, status, bytes = body.len(), "storage request finished");

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: HttpRequest, progress: Option<ProgressSender>) -> SendFuture<'_> {
        Box::pin(self.execute(request, progress))
    }
}

/// Splits `body` into pieces, reporting the cumulative byte count as each
/// piece is taken by the connection.
fn progress_stream(
    body: Vec<u8>,
    progress: Option<ProgressSender>,
) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> + Send + 'static {
    let pieces: Vec<Vec<u8>> = body.chunks(PIECE_SIZE).map(<[u8]>::to_vec).collect();
    let mut sent = 0u64;
    stream::iter(pieces).map(move |piece| {
        sent += piece.len() as u64;
        if let Some(tx) = &progress {
            let _ = tx.send(sent);
        }
        Ok(piece)
    })
}

fn transport_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn body_is_streamed_with_cumulative_progress() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let body = vec![7u8; PIECE_SIZE * 2 + 10];

        let pieces: Vec<Vec<u8>> = progress_stream(body, Some(tx))
            .map(|piece| piece.unwrap())
            .collect()
            .await;

        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[2].len(), 10);
        let mut reports = Vec::new();
        while let Ok(sent) = rx.try_recv() {
            reports.push(sent);
        }
        assert_eq!(
            reports,
            vec![
                PIECE_SIZE as u64,
                2 * PIECE_SIZE as u64,
                2 * PIECE_SIZE as u64 + 10
            ]
        );
    }

    #[tokio::test]
    async fn empty_body_reports_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pieces: Vec<_> = progress_stream(Vec::new(), Some(tx)).collect().await;
        assert!(pieces.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unreachable_host_is_a_transport_error() {
        let transport = ReqwestTransport::new().unwrap();
        let request = HttpRequest::new(Method::Head, "http://127.0.0.1:9/missing");
        let err = transport.send(request, None).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Connect(_) | TransportError::Io(_)
        ));
    }
}
