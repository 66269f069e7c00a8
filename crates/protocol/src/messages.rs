//! JSON payloads returned by the signing service.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;
use crate::types::{InitGrant, ResumeHint, Signature, SignatureBundle};

/// A signature as it appears on the wire: either a `[signature, date]` pair
/// or an object with named fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireSignature {
    Pair(String, String),
    Object { signature: String, date: String },
}

impl From<WireSignature> for Signature {
    fn from(wire: WireSignature) -> Self {
        match wire {
            WireSignature::Pair(signature, date) | WireSignature::Object { signature, date } => {
                Signature { signature, date }
            }
        }
    }
}

/// Response of `get_init_signature/`.
///
/// When the service knows an unfinished upload of the same file it also
/// reports that upload's id, key and recorded part numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitSignatureResponse {
    pub signature: String,
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl InitSignatureResponse {
    /// Converts to an [`InitGrant`], keeping `current_key` when the service
    /// reports a resumable upload without a key.
    pub fn into_grant(self, current_key: &str) -> InitGrant {
        let resume = match (self.chunks, self.upload_id) {
            (Some(parts), Some(upload_id)) => Some(ResumeHint {
                upload_id,
                key: self.key.unwrap_or_else(|| current_key.to_string()),
                parts,
            }),
            _ => None,
        };
        InitGrant {
            signature: Signature {
                signature: self.signature,
                date: self.date,
            },
            resume,
        }
    }
}

/// Response of `get_all_signatures/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllSignaturesResponse {
    /// Keyed by 1-indexed part number, as a decimal string.
    #[serde(default)]
    pub chunk_signatures: HashMap<String, WireSignature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_signature: Option<WireSignature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_signature: Option<WireSignature>,
}

impl TryFrom<AllSignaturesResponse> for SignatureBundle {
    type Error = ProtocolError;

    fn try_from(resp: AllSignaturesResponse) -> Result<Self, Self::Error> {
        let mut chunks = HashMap::with_capacity(resp.chunk_signatures.len());
        for (part, sig) in resp.chunk_signatures {
            let number: u32 = part.parse().map_err(|_| ProtocolError::InvalidValue {
                tag: "chunk_signatures",
                value: part.clone(),
            })?;
            chunks.insert(number, sig.into());
        }
        Ok(SignatureBundle {
            chunks,
            list: resp.list_signature.map(Into::into),
            finish: resp.end_signature.map(Into::into),
        })
    }
}
