use crate::error::LlmError;
use bytes::Bytes;
use futures::Stream;
use http::{Request, Response};
use once_cell::sync::Lazy;
use reqwest::Client;

/// A single, global client, built once — mirrors the teacher's outbound
/// transport, but never calls `.error_for_status()`: the Error Model needs
/// the body of a non-2xx response to classify it (§4.2), so a bad status is
/// surfaced as an ordinary `Response` rather than short-circuited here.
pub static CLIENT: Lazy<Client> = Lazy::new(Client::new);

/// Buffered request/response path: reads the whole body into memory. Used
/// by every non-streaming adapter call.
pub async fn call_outbound(req: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, LlmError> {
    let client = &*CLIENT;

    let method = req
        .method()
        .as_str()
        .parse::<reqwest::Method>()
        .map_err(|e| LlmError::new(crate::error::ErrorKind::RequestFailed, e.to_string()))?;

    let mut builder = client.request(method, req.uri().to_string());
    for (name, value) in req.headers().iter() {
        let val_str = value
            .to_str()
            .map_err(|e| LlmError::new(crate::error::ErrorKind::RequestFailed, e.to_string()))?;
        builder = builder.header(name.as_str(), val_str);
    }

    let resp = builder.body(req.into_body()).send().await?;

    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = resp.bytes().await?.to_vec();

    let mut response_builder = Response::builder().status(status.as_u16());
    for (name, value) in headers.iter() {
        response_builder = response_builder.header(name.as_str(), value.as_bytes());
    }
    response_builder
        .body(bytes)
        .map_err(|e| LlmError::new(crate::error::ErrorKind::RequestFailed, e.to_string()))
}

/// Streaming path: opens the HTTP response and exposes its body as a
/// `futures::Stream` of `Bytes`, for the SSE/NDJSON decoders to consume.
/// Non-2xx statuses are surfaced by reading the (typically short) error
/// body eagerly rather than handing the caller a stream of error bytes.
pub async fn call_outbound_stream(
    req: Request<Vec<u8>>,
) -> Result<impl Stream<Item = Result<Bytes, LlmError>>, LlmError> {
    let client = &*CLIENT;

    let method = req
        .method()
        .as_str()
        .parse::<reqwest::Method>()
        .map_err(|e| LlmError::new(crate::error::ErrorKind::RequestFailed, e.to_string()))?;

    let mut builder = client.request(method, req.uri().to_string());
    for (name, value) in req.headers().iter() {
        let val_str = value
            .to_str()
            .map_err(|e| LlmError::new(crate::error::ErrorKind::RequestFailed, e.to_string()))?;
        builder = builder.header(name.as_str(), val_str);
    }

    let resp = builder.body(req.into_body()).send().await?;
    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        return Err(LlmError::from_http_status(status, &body, ""));
    }

    use futures::TryStreamExt;
    Ok(resp.bytes_stream().map_err(LlmError::from))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_is_constructed_lazily_without_panicking() {
        let _ = &*CLIENT;
    }
}
