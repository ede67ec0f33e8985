use std::pin::Pin;
use std::task::{Context, Poll};

use actix_web::http::HeaderValue;
use actix_web::web::{self, Bytes};
use chrono::NaiveDateTime;
use futures::{ready, Stream};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cipher::{AuthTag, Iv};
use crate::error::ShareError;
use crate::identity::Caller;
use crate::models::{ActivityAction, ShareRecord};
use crate::notify::ShareNotice;
use crate::shares;
use crate::state::AppState;
use crate::store::{self, StoreError};
use crate::tokens::{self, log_prefix};

const FILE_NAME_MAX_LEN: usize = 255;
const DEFAULT_MIME_TYPE: &str = "application/octet-stream";
const TOKEN_ATTEMPTS: usize = 3;

/// JSON header of an upload request, sent ahead of the raw file bytes.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadMetadata {
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub recipient_email: String,
    pub data_len: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub share_id: String,
    pub download_url: String,
    pub expires_at: NaiveDateTime,
}

struct ValidatedUpload {
    file_name: String,
    mime_type: String,
    recipient_email: String,
    size: u64,
}

/// Passes bytes through while holding the sender to the length it declared.
/// Overrun fails as soon as it is seen; a short body fails at end of stream.
pub struct ExactLength<S> {
    inner: S,
    expected: u64,
    seen: u64,
    done: bool,
}

impl<S> ExactLength<S> {
    pub fn new(inner: S, expected: u64) -> Self {
        ExactLength {
            inner,
            expected,
            seen: 0,
            done: false,
        }
    }
}

impl<S> Stream for ExactLength<S>
where
    S: Stream<Item = Result<Bytes, ShareError>> + Unpin,
{
    type Item = Result<Bytes, ShareError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
            Some(Ok(chunk)) => {
                this.seen += chunk.len() as u64;
                if this.seen > this.expected {
                    this.done = true;
                    return Poll::Ready(Some(Err(ShareError::Validation(
                        "Size of data exceeds expected size.".to_string(),
                    ))));
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(e)) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            None => {
                this.done = true;
                if this.seen != this.expected {
                    return Poll::Ready(Some(Err(ShareError::Validation(
                        "File length does not match expected length.".to_string(),
                    ))));
                }
                Poll::Ready(None)
            }
        }
    }
}

async fn validate(state: &AppState, metadata: UploadMetadata) -> Result<ValidatedUpload, ShareError> {
    let recipient_email = metadata.recipient_email.trim().to_string();
    if recipient_email.is_empty() {
        return Err(ShareError::Validation(
            "Recipient email is required.".to_string(),
        ));
    }

    if metadata.data_len > state.max_upload_bytes {
        return Err(ShareError::PayloadTooLarge {
            limit: state.max_upload_bytes,
        });
    }

    let file_name = match metadata.file_name.trim() {
        "" => format!("file_{}", tokens::now().timestamp_millis()),
        name => name.to_string(),
    };
    if file_name.chars().count() > FILE_NAME_MAX_LEN {
        return Err(ShareError::Validation(format!(
            "File name must not exceed {} characters.",
            FILE_NAME_MAX_LEN
        )));
    }

    let mime_type = match metadata.mime_type.as_deref().map(str::trim) {
        None | Some("") => DEFAULT_MIME_TYPE.to_string(),
        Some(mime) if HeaderValue::from_str(mime).is_ok() => mime.to_string(),
        Some(_) => return Err(ShareError::Validation("Invalid MIME type.".to_string())),
    };

    let store = state.store.clone();
    let lookup = recipient_email.clone();
    if !store::run(move || store.is_registered_user(&lookup)).await? {
        return Err(ShareError::UnknownRecipient);
    }

    Ok(ValidatedUpload {
        file_name,
        mime_type,
        recipient_email,
        size: metadata.data_len,
    })
}

/// Inserts the share record together with a fresh token. A token collision
/// at the store gets a new token rather than failing the upload.
async fn persist(
    state: &AppState,
    uploader: &Caller,
    upload: &ValidatedUpload,
    blob_location: &str,
    iv: Iv,
    tag: AuthTag,
) -> Result<ShareRecord, ShareError> {
    let share_id = Uuid::new_v4().to_string();
    let mut attempt = 1;
    loop {
        let issued_at = tokens::now();
        let issued = state.issuer.issue_at(issued_at);
        let record = ShareRecord {
            id: share_id.clone(),
            file_name: upload.file_name.clone(),
            blob_location: blob_location.to_string(),
            mime_type: upload.mime_type.clone(),
            size_bytes: upload.size as i64,
            recipient_email: upload.recipient_email.clone(),
            uploader_id: uploader.id.clone(),
            iv: iv.to_hex(),
            auth_tag: tag.to_hex(),
            download_token: Some(issued.token),
            revoked_token: None,
            token_expires_at: Some(issued.expires_at),
            created_at: issued_at,
        };

        let store = state.store.clone();
        let candidate = record.clone();
        match store::run(move || store.insert_share(&candidate)).await {
            Ok(()) => return Ok(record),
            Err(StoreError::TokenConflict) if attempt < TOKEN_ATTEMPTS => {
                warn!(
                    "download token collision for share {}, reissuing (attempt {})",
                    share_id, attempt
                );
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn notify_recipient(state: &AppState, uploader: &Caller, record: &ShareRecord, url: String) {
    let notice = ShareNotice {
        recipient_email: record.recipient_email.clone(),
        sender_email: uploader.email.clone(),
        file_name: record.file_name.clone(),
        download_url: url,
        expiry_hours: state.issuer.lifetime_hours(),
    };
    let notifier = state.notifier.clone();
    match web::block(move || notifier.notify(&notice)).await {
        Ok(()) => debug!("notified {} of share {}", record.recipient_email, record.id),
        Err(e) => warn!(
            "could not notify {} of share {}: {}",
            record.recipient_email, record.id, e
        ),
    }
}

/// Encrypts `body` into a new blob and publishes it to the recipient.
///
/// Nothing is written before validation passes. Once the blob exists, any
/// failure to persist its record deletes it again before the error is
/// returned. Notification happens last and cannot fail the upload.
pub async fn upload<S>(
    state: &AppState,
    uploader: &Caller,
    metadata: UploadMetadata,
    body: S,
    ip: &str,
) -> Result<UploadReceipt, ShareError>
where
    S: Stream<Item = Result<Bytes, ShareError>> + Unpin,
{
    let upload = validate(state, metadata).await?;

    let mut sealed = state.cipher.encrypt(ExactLength::new(body, upload.size))?;
    // Removed on drop until the record is stored.
    let blob = state.blobs.write(&mut sealed).await?;

    let tag = match sealed.tag() {
        Some(tag) => tag,
        None => {
            error!("cipher produced no tag for blob {}", blob.location());
            return Err(ShareError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "encryption did not complete",
            )));
        }
    };

    let persisted = persist(state, uploader, &upload, blob.location(), sealed.iv(), tag).await;
    let record = match persisted {
        Ok(record) => {
            blob.keep();
            record
        }
        Err(e) => {
            warn!(
                "could not record share for blob {}, removing it: {}",
                blob.location(),
                e
            );
            return Err(e);
        }
    };

    let token = record.download_token.clone().unwrap_or_default();
    let download_url = state.download_url(&token);
    info!(
        "share {} created by {} for {} (token {})",
        record.id,
        uploader.email,
        record.recipient_email,
        log_prefix(&token)
    );

    shares::record_activity(
        state,
        &uploader.email,
        ActivityAction::FileUpload,
        format!(
            "Uploaded file: {} for recipient: {}",
            record.file_name, record.recipient_email
        ),
        ip,
    )
    .await;

    notify_recipient(state, uploader, &record, download_url.clone()).await;

    Ok(UploadReceipt {
        expires_at: record.token_expires_at.unwrap_or(record.created_at),
        share_id: record.id,
        download_url,
    })
}


#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::testing::*;
    use super::*;
    use crate::notify::testing::FailingNotifier;
    use crate::state::testing::{harness, harness_with_notifier, BASE_URL, MAX_UPLOAD};

    fn files_in(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[actix_rt::test]
    async fn test_upload_persists_share_and_notifies() {
        let dir = TempDir::new().unwrap();
        let h = harness(dir.path()).await;

        let (receipt, token) = share(&h.state, "bob@x.com", b"hello1234").await;

        assert!(receipt
            .download_url
            .starts_with(&format!("{}/download/", BASE_URL)));
        assert!(tokens::is_well_formed(&token));
        assert_eq!(files_in(dir.path()), 1);

        let shares = h.store.shares();
        assert_eq!(shares.len(), 1);
        let record = &shares[0];
        assert_eq!(record.id, receipt.share_id);
        assert_eq!(record.size_bytes, 9);
        assert_eq!(record.uploader_id, "alice");
        assert_eq!(record.download_token.as_deref(), Some(token.as_str()));
        assert_eq!(record.token_expires_at, Some(receipt.expires_at));
        assert_eq!(record.iv.len(), 24);
        assert_eq!(record.auth_tag.len(), 32);

        let sent = h.notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient_email, "bob@x.com");
        assert_eq!(sent[0].download_url, receipt.download_url);
        assert_eq!(sent[0].expiry_hours, 24);

        let activity = h.store.activity();
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].action, "FILE_UPLOAD");
        assert_eq!(activity[0].ip_address.as_deref(), Some("203.0.113.7"));
    }

    #[actix_rt::test]
    async fn test_blob_holds_ciphertext_only() {
        let dir = TempDir::new().unwrap();
        let h = harness(dir.path()).await;
        let plaintext = b"attack at dawn, attack at dawn";
        share(&h.state, "bob@x.com", plaintext).await;

        let record = &h.store.shares()[0];
        let stored = std::fs::read(dir.path().join(&record.blob_location)).unwrap();
        assert_eq!(stored.len(), plaintext.len());
        assert_ne!(&stored[..], &plaintext[..]);
    }

    #[actix_rt::test]
    async fn test_failed_persist_removes_blob() {
        let dir = TempDir::new().unwrap();
        let h = harness(dir.path()).await;
        h.store.fail_share_inserts();

        let err = upload(
            &h.state,
            &alice(),
            metadata("notes.txt", "bob@x.com", 9),
            body(b"hello1234"),
            "unknown",
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ShareError::Store(_)));
        assert_eq!(files_in(dir.path()), 0);
        assert!(h.store.shares().is_empty());
        assert!(h.notifier.sent.lock().unwrap().is_empty());
        assert!(h.store.activity().is_empty());
    }

    #[actix_rt::test]
    async fn test_abandoned_upload_removes_blob() {
        let dir = TempDir::new().unwrap();
        let h = harness(dir.path()).await;
        let release = h.store.hold_next_insert();
        let uploader = alice();

        let mut pending = Box::pin(upload(
            &h.state,
            &uploader,
            metadata("notes.txt", "bob@x.com", 9),
            body(b"hello1234"),
            "unknown",
        ));
        for _ in 0..1000 {
            assert!(futures::poll!(pending.as_mut()).is_pending());
            if h.store.insert_waiting() {
                break;
            }
            tokio::time::delay_for(std::time::Duration::from_millis(5)).await;
        }
        assert!(h.store.insert_waiting());
        assert_eq!(files_in(dir.path()), 1);

        drop(pending);
        drop(release);
        assert_eq!(files_in(dir.path()), 0);
        assert!(h.store.shares().is_empty());
    }

    #[actix_rt::test]
    async fn test_token_collision_is_retried() {
        let dir = TempDir::new().unwrap();
        let h = harness(dir.path()).await;
        h.store.conflict_next_inserts(2);

        share(&h.state, "bob@x.com", b"hello1234").await;
        assert_eq!(h.store.shares().len(), 1);
        assert_eq!(files_in(dir.path()), 1);
    }

    #[actix_rt::test]
    async fn test_persistent_token_collision_gives_up_cleanly() {
        let dir = TempDir::new().unwrap();
        let h = harness(dir.path()).await;
        h.store.conflict_next_inserts(TOKEN_ATTEMPTS);

        let err = upload(
            &h.state,
            &alice(),
            metadata("notes.txt", "bob@x.com", 9),
            body(b"hello1234"),
            "unknown",
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ShareError::Store(StoreError::TokenConflict)));
        assert_eq!(files_in(dir.path()), 0);
        assert!(h.store.shares().is_empty());
    }

    #[actix_rt::test]
    async fn test_rejections_have_no_side_effects() {
        let dir = TempDir::new().unwrap();
        let h = harness(dir.path()).await;

        let cases = vec![
            (metadata("a.txt", "  ", 3), "validation"),
            (metadata("a.txt", "bob@x.com", MAX_UPLOAD + 1), "too large"),
            (metadata("a.txt", "mallory@x.com", 3), "unknown recipient"),
            (metadata(&"n".repeat(300), "bob@x.com", 3), "long name"),
        ];
        for (meta, case) in cases {
            let err = upload(&h.state, &alice(), meta, body(b"abc"), "unknown")
                .await
                .unwrap_err();
            match case {
                "too large" => assert!(matches!(err, ShareError::PayloadTooLarge { .. })),
                "unknown recipient" => assert!(matches!(err, ShareError::UnknownRecipient)),
                _ => assert!(matches!(err, ShareError::Validation(_)), "{}", case),
            }
        }

        assert_eq!(files_in(dir.path()), 0);
        assert!(h.store.shares().is_empty());
        assert!(h.notifier.sent.lock().unwrap().is_empty());
    }

    #[actix_rt::test]
    async fn test_body_must_match_declared_length() {
        let dir = TempDir::new().unwrap();
        let h = harness(dir.path()).await;

        for declared in &[20u64, 4] {
            let err = upload(
                &h.state,
                &alice(),
                metadata("a.txt", "bob@x.com", *declared),
                body(b"hello1234"),
                "unknown",
            )
            .await
            .unwrap_err();
            assert!(matches!(err, ShareError::Validation(_)));
        }
        assert_eq!(files_in(dir.path()), 0);
        assert!(h.store.shares().is_empty());
    }

    #[actix_rt::test]
    async fn test_interrupted_body_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let h = harness(dir.path()).await;
        let interrupted = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"hello")),
            Err(ShareError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "client went away",
            ))),
        ]);

        let err = upload(
            &h.state,
            &alice(),
            metadata("a.txt", "bob@x.com", 9),
            interrupted,
            "unknown",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ShareError::Io(_)));
        assert_eq!(files_in(dir.path()), 0);
    }

    #[actix_rt::test]
    async fn test_notifier_failure_keeps_share() {
        let dir = TempDir::new().unwrap();
        let h = harness_with_notifier(dir.path(), Arc::new(FailingNotifier)).await;

        let (receipt, _) = share(&h.state, "bob@x.com", b"hello1234").await;
        assert_eq!(h.store.shares()[0].id, receipt.share_id);
        assert_eq!(files_in(dir.path()), 1);
    }

    #[actix_rt::test]
    async fn test_defaults_for_name_and_mime_type() {
        let dir = TempDir::new().unwrap();
        let h = harness(dir.path()).await;
        let mut meta = metadata("  ", "bob@x.com", 0);
        meta.mime_type = None;

        upload(&h.state, &alice(), meta, body(b""), "unknown")
            .await
            .unwrap();

        let record = &h.store.shares()[0];
        assert!(record.file_name.starts_with("file_"));
        assert_eq!(record.mime_type, "application/octet-stream");
        assert_eq!(record.size_bytes, 0);
    }

    #[test]
    fn test_metadata_wire_format() {
        let meta: UploadMetadata = serde_json::from_str(
            r#"{"file_name":"a.pdf","recipient_email":"bob@x.com","data_len":42}"#,
        )
        .unwrap();
        assert_eq!(meta.data_len, 42);
        assert_eq!(meta.mime_type, None);
    }
}
