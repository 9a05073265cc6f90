//! Request execution and normalization of streamed replies into deltas.

mod decode;
mod extract;
mod sse;

pub use decode::{FrameDecoder, Framing};
pub use extract::Extractor;

use crate::cancel::CancelHandle;
use crate::error::{truncate, TransportError};
use crate::request::{BoundBody, BoundPart, BoundRequest};
use futures_core::Stream;
use reqwest::header::CONTENT_TYPE;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

const ERROR_BODY_LIMIT: usize = 2048;

/// One incremental fragment of the assistant's reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDelta {
    pub text: String,
}

/// Lazy, finite sequence of deltas for one request. Not restartable.
///
/// Ends without an error once its cancel handle fires, even if decoded
/// deltas are still buffered.
pub struct DeltaStream {
    inner: ReceiverStream<Result<StreamDelta, TransportError>>,
    cancel: CancelHandle,
}

impl DeltaStream {
    pub fn channel(cancel: CancelHandle) -> (mpsc::Sender<Result<StreamDelta, TransportError>>, Self) {
        let (tx, rx) = mpsc::channel(64);
        (
            tx,
            Self {
                inner: ReceiverStream::new(rx),
                cancel,
            },
        )
    }
}

impl Stream for DeltaStream {
    type Item = Result<StreamDelta, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Executes bound requests.
pub trait Transport: Send + Sync {
    fn stream(&self, request: BoundRequest, cancel: CancelHandle) -> DeltaStream;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Send `request` and collect the whole reply.
    pub async fn complete(&self, request: BoundRequest) -> Result<String, TransportError> {
        let mut stream = self.stream(request, CancelHandle::new());
        let mut text = String::new();
        while let Some(item) = stream.next().await {
            text.push_str(&item?.text);
        }
        Ok(text)
    }
}

impl Transport for HttpTransport {
    fn stream(&self, request: BoundRequest, cancel: CancelHandle) -> DeltaStream {
        let (tx, out) = DeltaStream::channel(cancel.clone());
        let http = self.http.clone();

        tokio::spawn(async move {
            // Dropping the pump future drops the response and aborts the read.
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("request cancelled");
                }
                res = pump(&http, request, &tx) => {
                    if let Err(e) = res {
                        tracing::debug!(error = %e, "stream ended with error");
                        let _ = tx.send(Err(e)).await;
                    }
                }
            }
        });

        out
    }
}

async fn pump(
    http: &reqwest::Client,
    request: BoundRequest,
    tx: &mpsc::Sender<Result<StreamDelta, TransportError>>,
) -> Result<(), TransportError> {
    let extractor = Extractor::new(request.content_path.as_deref());
    let url = request.url.clone();
    let resp = into_reqwest(http, request)?
        .send()
        .await
        .map_err(TransportError::from)?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(TransportError::Status {
            status: status.as_u16(),
            body: truncate(&body, ERROR_BODY_LIMIT),
        });
    }

    let framing = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(Framing::from_content_type);
    tracing::debug!(%url, %status, ?framing, "response headers received");

    let mut decoder: Option<Box<dyn FrameDecoder>> = framing.map(|f| f.decoder(extractor.clone()));
    let mut body = resp.bytes_stream();

    while let Some(chunk) = body.next().await {
        let bytes = chunk.map_err(TransportError::from)?;
        if bytes.is_empty() {
            continue;
        }
        let decoder = decoder.get_or_insert_with(|| Framing::sniff(&bytes).decoder(extractor.clone()));
        for delta in decoder.push(&bytes)? {
            if tx.send(Ok(delta)).await.is_err() {
                return Ok(());
            }
        }
        if decoder.is_done() {
            return Ok(());
        }
    }

    if let Some(decoder) = decoder.as_mut() {
        for delta in decoder.finish()? {
            if tx.send(Ok(delta)).await.is_err() {
                return Ok(());
            }
        }
    }
    Ok(())
}

fn into_reqwest(http: &reqwest::Client, request: BoundRequest) -> Result<reqwest::RequestBuilder, TransportError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|e| TransportError::Request(format!("invalid method {}: {e}", request.method)))?;

    let multipart = matches!(request.body, BoundBody::Multipart(_));
    let mut builder = http.request(method, &request.url);
    for (name, value) in &request.headers {
        // reqwest sets the multipart boundary itself.
        if multipart && name.eq_ignore_ascii_case("content-type") {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }

    Ok(match request.body {
        BoundBody::Empty => builder,
        BoundBody::Text(text) => builder.body(text),
        BoundBody::Multipart(parts) => {
            let mut form = reqwest::multipart::Form::new();
            for part in parts {
                form = match part {
                    BoundPart::Text { name, value } => form.text(name, value),
                    BoundPart::File {
                        name,
                        file_name,
                        mime_type,
                        bytes,
                    } => {
                        let mut p = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
                        if let Some(m) = mime_type {
                            p = p.mime_str(&m).map_err(TransportError::from)?;
                        }
                        form.part(name, p)
                    }
                };
            }
            builder.multipart(form)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(url: String, body: &str) -> BoundRequest {
        BoundRequest {
            method: "POST".to_string(),
            url,
            headers: vec![("Authorization".to_string(), "Bearer k".to_string())],
            body: BoundBody::Text(body.to_string()),
            content_path: None,
            warnings: Vec::new(),
        }
    }

    async fn collect(mut s: DeltaStream) -> (Vec<String>, Option<TransportError>) {
        let mut out = Vec::new();
        while let Some(item) = s.next().await {
            match item {
                Ok(d) => out.push(d.text),
                Err(e) => return (out, Some(e)),
            }
        }
        (out, None)
    }

    #[tokio::test]
    async fn streams_event_stream_deltas_in_order() {
        let server = MockServer::start().await;
        let sse = "data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n\n\
                   data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\n\
                   data: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n\
                   data: [DONE]\n\n";
        Mock::given(method("POST"))
            .and(path("/v1/chat"))
            .and(header("Authorization", "Bearer k"))
            .and(body_string("{\"q\":1}"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let t = HttpTransport::new(reqwest::Client::new());
        let s = t.stream(request(format!("{}/v1/chat", server.uri()), "{\"q\":1}"), CancelHandle::new());
        let (deltas, err) = collect(s).await;
        assert!(err.is_none());
        assert_eq!(deltas, vec!["He", "llo", " world"]);
    }

    #[tokio::test]
    async fn json_lines_and_single_json_bodies() {
        let server = MockServer::start().await;
        Mock::given(path("/ndjson"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("{\"response\":\"a\"}\n{\"response\":\"b\",\"done\":true}\n", "application/x-ndjson"),
            )
            .mount(&server)
            .await;
        Mock::given(path("/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "whole"}}]
            })))
            .mount(&server)
            .await;

        let t = HttpTransport::new(reqwest::Client::new());
        let (a, _) = collect(t.stream(request(format!("{}/ndjson", server.uri()), ""), CancelHandle::new())).await;
        assert_eq!(a, vec!["a", "b"]);
        let text = t.complete(request(format!("{}/json", server.uri()), "")).await.unwrap();
        assert_eq!(text, "whole");
    }

    #[tokio::test]
    async fn non_success_status_carries_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("{\"error\":\"invalid api key\"}"))
            .mount(&server)
            .await;

        let t = HttpTransport::new(reqwest::Client::new());
        let (deltas, err) = collect(t.stream(request(server.uri(), "{}"), CancelHandle::new())).await;
        assert!(deltas.is_empty());
        match err {
            Some(TransportError::Status { status, body }) => {
                assert_eq!(status, 401);
                assert!(body.contains("invalid api key"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_stream_ends_without_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("data: {\"text\":\"late\"}\n\n", "text/event-stream")
                    .set_delay(std::time::Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let cancel = CancelHandle::new();
        let t = HttpTransport::new(reqwest::Client::new());
        let s = t.stream(request(server.uri(), "{}"), cancel.clone());
        cancel.cancel();
        let (deltas, err) = tokio::time::timeout(std::time::Duration::from_secs(5), collect(s))
            .await
            .expect("cancelled stream should end promptly");
        assert!(deltas.is_empty());
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn connection_failure_is_a_request_error() {
        // Nothing listens on port 9 of localhost in test environments.
        let t = HttpTransport::new(reqwest::Client::new());
        let (_, err) = collect(t.stream(request("http://127.0.0.1:9/".to_string(), "{}"), CancelHandle::new())).await;
        assert!(matches!(err, Some(TransportError::Request(_))));
    }
}
