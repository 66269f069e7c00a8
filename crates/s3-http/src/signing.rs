//! Signing service over HTTP.
//!
//! Every endpoint lives under the configured base URL and is queried with
//! `GET`, carrying the file identity and any configured extra parameters.

use std::collections::BTreeMap;
use std::time::Duration;

use mule_protocol::messages::{AllSignaturesResponse, InitSignatureResponse, WireSignature};
use mule_protocol::{InitGrant, Signature, SignatureBundle, SignatureKind};
use mule_uploader::{SignFuture, SigningError, SigningParams, SigningService, UploaderConfig};
use serde::de::DeserializeOwned;
use tracing::debug;

const SIGNING_TIMEOUT: Duration = Duration::from_secs(30);

const INIT: &str = "get_init_signature";
const CHUNK: &str = "get_chunk_signature";
const LIST: &str = "get_list_signature";
const FINISH: &str = "get_end_signature";
const ALL: &str = "get_all_signatures";
const CHUNK_LOADED: &str = "chunk_loaded";
const UPLOAD_FINISHED: &str = "upload_finished";

/// Talks to the application's signing backend.
#[derive(Debug, Clone)]
pub struct HttpSigningService {
    client: reqwest::Client,
    base_url: String,
    extra_params: BTreeMap<String, String>,
}

impl HttpSigningService {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        extra_params: BTreeMap<String, String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            extra_params,
        }
    }

    pub fn from_config(client: reqwest::Client, config: &UploaderConfig) -> Self {
        Self::new(
            client,
            config.signing_base_url.clone(),
            config.extra_params.clone(),
        )
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/{name}/", self.base_url.trim_end_matches('/'))
    }

    async fn fetch(
        &self,
        name: &str,
        query: Vec<(String, String)>,
    ) -> Result<Vec<u8>, SigningError> {
        let url = self.endpoint(name);
        let response = self
            .client
            .get(&url)
            .query(&query)
            .timeout(SIGNING_TIMEOUT)
            .send()
            .await
            .map_err(|e| SigningError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| SigningError::Transport(e.to_string()))?;
        debug!(endpoint = name, status = status.as_u16(), "signing request finished");

        if !status.is_success() {
            return Err(SigningError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body.to_vec())
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        name: &str,
        query: Vec<(String, String)>,
    ) -> Result<T, SigningError> {
        let body = self.fetch(name, query).await?;
        decode(&body)
    }

    async fn initiate_grant(
        &self,
        params: SigningParams,
        force: bool,
    ) -> Result<InitGrant, SigningError> {
        let mut extra = Vec::new();
        if force {
            extra.push(("force", "true".to_string()));
        }
        let query = signing_query(&params, &self.extra_params, &extra);
        let response: InitSignatureResponse = self.fetch_json(INIT, query).await?;
        Ok(response.into_grant(&params.key))
    }

    async fn signature(
        &self,
        kind: SignatureKind,
        params: SigningParams,
    ) -> Result<Signature, SigningError> {
        let (name, extra) = match kind {
            SignatureKind::Init => {
                let query = signing_query(&params, &self.extra_params, &[]);
                let response: InitSignatureResponse = self.fetch_json(INIT, query).await?;
                return Ok(Signature {
                    signature: response.signature,
                    date: response.date,
                });
            }
            SignatureKind::Chunk(part) => (CHUNK, vec![("chunk", part.to_string())]),
            SignatureKind::List => (LIST, Vec::new()),
            SignatureKind::Finish => (FINISH, Vec::new()),
        };
        let query = signing_query(&params, &self.extra_params, &extra);
        let wire: WireSignature = self.fetch_json(name, query).await?;
        Ok(wire.into())
    }

    async fn bundle(&self, params: SigningParams) -> Result<SignatureBundle, SigningError> {
        let query = signing_query(&params, &self.extra_params, &[]);
        let response: AllSignaturesResponse = self.fetch_json(ALL, query).await?;
        SignatureBundle::try_from(response).map_err(|e| SigningError::Decode(e.to_string()))
    }

    async fn notify(
        &self,
        name: &str,
        params: SigningParams,
        extra: &[(&str, String)],
    ) -> Result<(), SigningError> {
        let query = signing_query(&params, &self.extra_params, extra);
        self.fetch(name, query).await.map(|_| ())
    }
}

impl SigningService for HttpSigningService {
    fn initiate(&self, params: SigningParams, force: bool) -> SignFuture<'_, InitGrant> {
        Box::pin(self.initiate_grant(params, force))
    }

    fn sign(&self, kind: SignatureKind, params: SigningParams) -> SignFuture<'_, Signature> {
        Box::pin(self.signature(kind, params))
    }

    fn sign_all(&self, params: SigningParams) -> SignFuture<'_, SignatureBundle> {
        Box::pin(self.bundle(params))
    }

    fn notify_chunk_uploaded(&self, params: SigningParams, part_number: u32) -> SignFuture<'_, ()> {
        Box::pin(async move {
            self.notify(CHUNK_LOADED, params, &[("chunk", part_number.to_string())])
                .await
        })
    }

    fn notify_upload_finished(&self, params: SigningParams) -> SignFuture<'_, ()> {
        Box::pin(async move { self.notify(UPLOAD_FINISHED, params, &[]).await })
    }
}

/// Query parameters identifying the file and upload, followed by
/// endpoint-specific ones and then the configured extras.
fn signing_query(
    params: &SigningParams,
    extra_params: &BTreeMap<String, String>,
    extra: &[(&str, String)],
) -> Vec<(String, String)> {
    let mut query = vec![
        ("key".to_string(), params.key.clone()),
        ("mime_type".to_string(), params.content_type.clone()),
        ("filename".to_string(), params.file.name.clone()),
        ("filesize".to_string(), params.file.size.to_string()),
        (
            "last_modified".to_string(),
            params.file.last_modified_millis().to_string(),
        ),
        ("num_chunks".to_string(), params.num_chunks.to_string()),
    ];
    if let Some(upload_id) = &params.upload_id {
        query.push(("upload_id".to_string(), upload_id.clone()));
    }
    query.extend(extra.iter().map(|(k, v)| (k.to_string(), v.clone())));
    query.extend(extra_params.iter().map(|(k, v)| (k.clone(), v.clone())));
    query
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, SigningError> {
    serde_json::from_slice(body).map_err(|e| SigningError::Decode(e.to_string()))
}
