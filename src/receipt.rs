//! Signed completion receipts.
//!
//! A receipt is `base64url(json summary) "." base64url(hmac)`, where the MAC
//! key is derived from the server secret and a salt unique to the resource.
//! A receipt issued for one resource never verifies against another.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::models::{Attempt, CompletionStatus, Resource};
use crate::store::{Store, StoreError};

type HmacSha256 = Hmac<Sha256>;

const MAX_RECEIPT_LEN: usize = 4096;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReceiptSummary {
    pub pk: i64,
    pub completion_status: CompletionStatus,
    pub scaled_score: f64,
    pub raw_score: f64,
    pub max_score: f64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub receipt_time: Option<DateTime<Utc>>,
}

impl ReceiptSummary {
    pub fn for_attempt(attempt: &Attempt, receipt_time: DateTime<Utc>) -> Self {
        ReceiptSummary {
            pk: attempt.id,
            completion_status: attempt.completion_status,
            scaled_score: attempt.scaled_score,
            raw_score: attempt.raw_score,
            max_score: attempt.max_score,
            start_time: Some(attempt.start_time),
            end_time: attempt.end_time,
            receipt_time: Some(receipt_time),
        }
    }
}

#[derive(Error, Debug)]
pub enum ReceiptError {
    #[error("this receipt is not valid")]
    InvalidSignature,
    #[error("no matching attempt for receipt (attempt {pk})")]
    AttemptNotFound { pk: i64, summary: Box<ReceiptSummary> },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct VerifiedReceipt {
    pub summary: ReceiptSummary,
    pub attempt: Attempt,
}

pub fn receipt_salt(resource: &Resource) -> String {
    format!("lti-exam-runtime:resource:{}:receipt", resource.id)
}

#[derive(Clone)]
pub struct ReceiptSigner {
    secret: Vec<u8>,
}

impl ReceiptSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self, salt: &str) -> HmacSha256 {
        // derive a per-salt key first so the same payload signs differently per resource
        let mut kdf = HmacSha256::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
        kdf.update(salt.as_bytes());
        let key = kdf.finalize().into_bytes();
        HmacSha256::new_from_slice(&key).unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"))
    }

    pub fn sign(&self, summary: &ReceiptSummary, resource: &Resource) -> String {
        // plain struct of numbers, strings and timestamps; serialization cannot fail
        let payload = serde_json::to_vec(summary).unwrap_or_default();
        let payload_part = URL_SAFE_NO_PAD.encode(payload);
        let mut mac = self.mac(&receipt_salt(resource));
        mac.update(payload_part.as_bytes());
        let sig_part = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{payload_part}.{sig_part}")
    }

    /// Checks the signature and decodes the summary, without touching the store.
    pub fn unsign(&self, code: &str, resource: &Resource) -> Result<ReceiptSummary, ReceiptError> {
        let code = code.trim();
        if code.len() > MAX_RECEIPT_LEN {
            return Err(ReceiptError::InvalidSignature);
        }
        let (payload_part, sig_part) = code.split_once('.').ok_or(ReceiptError::InvalidSignature)?;
        let sig = URL_SAFE_NO_PAD
            .decode(sig_part)
            .map_err(|_| ReceiptError::InvalidSignature)?;
        let mut mac = self.mac(&receipt_salt(resource));
        mac.update(payload_part.as_bytes());
        mac.verify_slice(&sig)
            .map_err(|_| ReceiptError::InvalidSignature)?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload_part)
            .map_err(|_| ReceiptError::InvalidSignature)?;
        serde_json::from_slice(&payload).map_err(|e| {
            tracing::warn!(error=%e, resource=resource.id, "signed receipt with unreadable payload");
            ReceiptError::InvalidSignature
        })
    }

    pub fn issue(&self, attempt: &Attempt, resource: &Resource) -> String {
        self.sign(&ReceiptSummary::for_attempt(attempt, Utc::now()), resource)
    }

    /// Verifies a receipt and re-fetches the attempt it names, scoped to `resource`.
    pub async fn verify(
        &self,
        store: &dyn Store,
        code: &str,
        resource: &Resource,
    ) -> Result<VerifiedReceipt, ReceiptError> {
        let summary = self.unsign(code, resource)?;
        let attempt = store
            .attempt(summary.pk)
            .await?
            .filter(|a| a.resource_id == resource.id);
        match attempt {
            Some(attempt) => Ok(VerifiedReceipt { summary, attempt }),
            None => Err(ReceiptError::AttemptNotFound {
                pk: summary.pk,
                summary: Box::new(summary),
            }),
        }
    }
}
