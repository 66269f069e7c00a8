//! Storage request shapes of the S3 multipart-upload API.

use mule_protocol::Signature;

use crate::config::UploaderConfig;
use crate::error::UploadError;
use crate::events::Operation;
use crate::signing::SigningParams;
use crate::transport::{HttpRequest, HttpResponse, Method};

fn object_url(config: &UploaderConfig, key: &str) -> String {
    format!("{}/{}", config.host(), key.trim_start_matches('/'))
}

fn signed(
    request: HttpRequest,
    config: &UploaderConfig,
    params: &SigningParams,
    signature: &Signature,
) -> HttpRequest {
    request
        .header(
            "Authorization",
            format!("AWS {}:{}", config.access_key, signature.signature),
        )
        .header("x-amz-date", signature.date.clone())
        .header("Content-Type", params.content_type.clone())
}

fn with_disposition(request: HttpRequest, params: &SigningParams) -> HttpRequest {
    request.header(
        "Content-Disposition",
        format!("attachment; filename={}", params.file.name),
    )
}

/// `POST /{key}?uploads`
pub(crate) fn initiate(
    config: &UploaderConfig,
    params: &SigningParams,
    signature: &Signature,
) -> HttpRequest {
    let request = HttpRequest::new(Method::Post, object_url(config, &params.key))
        .query("uploads", "")
        .header("x-amz-acl", config.acl.as_str());
    with_disposition(signed(request, config, params, signature), params)
}

/// `PUT /{key}?partNumber=N&uploadId=U`
pub(crate) fn upload_part(
    config: &UploaderConfig,
    params: &SigningParams,
    upload_id: &str,
    part_number: u32,
    signature: &Signature,
    body: Vec<u8>,
) -> HttpRequest {
    let request = HttpRequest::new(Method::Put, object_url(config, &params.key))
        .query("partNumber", part_number.to_string())
        .query("uploadId", upload_id)
        .body(body);
    with_disposition(signed(request, config, params, signature), params)
}

/// `GET /{key}?uploadId=U[&part-number-marker=M]`
pub(crate) fn list_parts(
    config: &UploaderConfig,
    params: &SigningParams,
    upload_id: &str,
    marker: Option<&str>,
    signature: &Signature,
) -> HttpRequest {
    let mut request =
        HttpRequest::new(Method::Get, object_url(config, &params.key)).query("uploadId", upload_id);
    if let Some(marker) = marker {
        request = request.query("part-number-marker", marker);
    }
    signed(request, config, params, signature)
}

/// `POST /{key}?uploadId=U` with a `<CompleteMultipartUpload>` body.
pub(crate) fn complete(
    config: &UploaderConfig,
    params: &SigningParams,
    upload_id: &str,
    signature: &Signature,
    manifest: String,
) -> HttpRequest {
    let request = HttpRequest::new(Method::Post, object_url(config, &params.key))
        .query("uploadId", upload_id)
        .body(manifest.into_bytes());
    with_disposition(signed(request, config, params, signature), params)
}

/// `HEAD /{key}`, unsigned.
pub(crate) fn head(config: &UploaderConfig, key: &str) -> HttpRequest {
    HttpRequest::new(Method::Head, object_url(config, key))
}

/// Turns a non-2xx response into [`UploadError::Status`].
pub(crate) fn expect_success(
    operation: Operation,
    response: HttpResponse,
) -> Result<HttpResponse, UploadError> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(UploadError::Status {
            operation,
            status: response.status,
            body: response.text().into_owned(),
        })
    }
}
