//! HTTP collaborators for `mule-uploader`.
//!
//! [`ReqwestTransport`] carries the storage requests with streamed bodies
//! and byte-level progress; [`HttpSigningService`] talks to the signing
//! backend that authorizes them. [`build_uploader`] wires both to an
//! [`Uploader`].

pub mod signing;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use mule_uploader::{UploadError, Uploader, UploaderConfig};

pub use signing::HttpSigningService;
pub use transport::ReqwestTransport;

/// Connection establishment limit for every request.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors produced while wiring the HTTP collaborators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("signing base URL must be absolute: {0}")]
    RelativeBaseUrl(String),

    #[error(transparent)]
    Upload(#[from] UploadError),
}

/// An HTTP client suitable for both collaborators.
pub fn client() -> Result<reqwest::Client, Error> {
    Ok(reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()?)
}

/// Builds an [`Uploader`] that talks to S3 and the signing service over HTTP.
pub fn build_uploader(config: UploaderConfig) -> Result<Uploader, Error> {
    let base = config.signing_base_url.as_str();
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        return Err(Error::RelativeBaseUrl(base.to_string()));
    }

    let client = client()?;
    let transport = Arc::new(ReqwestTransport::with_client(client.clone()));
    let signer = Arc::new(HttpSigningService::from_config(client, &config));
    Ok(Uploader::new(config, transport, signer)?)
}
