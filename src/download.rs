use std::io;

use actix_web::web::Bytes;
use futures::stream::{LocalBoxStream, StreamExt, TryStreamExt};
use log::{debug, error, info};
use serde::Serialize;

use crate::cipher::{AuthTag, Iv};
use crate::error::ShareError;
use crate::identity::Caller;
use crate::models::{ActivityAction, ShareRecord};
use crate::shares;
use crate::state::AppState;
use crate::store;
use crate::tokens::{self, check_access, log_prefix, Access};

/// A share ready to be streamed to its recipient. Metadata comes from the
/// share record, never from the request.
pub struct Download {
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub body: LocalBoxStream<'static, Result<Bytes, ShareError>>,
}

/// What the download page shows before the transfer starts.
#[derive(Debug, Clone, Serialize)]
pub struct SharePreview {
    pub file_name: String,
    pub size_bytes: i64,
    pub mime_type: String,
}

/// Format, then caller, then lookup, then access. A malformed token never
/// reaches the store.
async fn authorize(
    state: &AppState,
    token: &str,
    caller: Option<&Caller>,
) -> Result<(ShareRecord, Caller), ShareError> {
    if !tokens::is_well_formed(token) {
        debug!("rejected malformed download token");
        return Err(ShareError::MalformedToken);
    }
    let caller = caller.cloned().ok_or(ShareError::Unauthenticated)?;

    let store = state.store.clone();
    let lookup = token.to_string();
    let record = match store::run(move || store.find_share_by_token(&lookup)).await? {
        Some(record) => record,
        None => {
            info!("no share for token {}", log_prefix(token));
            return Err(ShareError::NotFound);
        }
    };

    let access = check_access(&record, &caller.email, tokens::now());
    if access != Access::Authorized {
        info!(
            "access to share {} by {} denied: {:?}",
            record.id, caller.email, access
        );
    }
    access.into_result()?;
    Ok((record, caller))
}

fn cipher_params(record: &ShareRecord) -> Result<(Iv, AuthTag), ShareError> {
    match (Iv::from_hex(&record.iv), AuthTag::from_hex(&record.auth_tag)) {
        (Some(iv), Some(tag)) => Ok((iv, tag)),
        _ => {
            error!("share {} has corrupt cipher parameters", record.id);
            Err(ShareError::Integrity)
        }
    }
}

fn missing_blob(record: &ShareRecord) -> ShareError {
    error!(
        "share {} is active but blob {} is missing",
        record.id, record.blob_location
    );
    ShareError::StorageInconsistency(record.blob_location.clone())
}

/// Opens the share behind `token` for `caller`.
///
/// Integrity is only known once the whole ciphertext has been read, so a
/// tampered blob surfaces as a final `Err(ShareError::Integrity)` item on
/// `body` rather than as an error from this function.
pub async fn download(
    state: &AppState,
    token: &str,
    caller: Option<&Caller>,
    ip: &str,
) -> Result<Download, ShareError> {
    let (record, caller) = authorize(state, token, caller).await?;

    if !state.blobs.exists(&record.blob_location).await? {
        return Err(missing_blob(&record));
    }
    let (iv, tag) = cipher_params(&record)?;

    let ciphertext = match state.blobs.read(&record.blob_location).await {
        Ok(stream) => stream,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(missing_blob(&record)),
        Err(e) => return Err(e.into()),
    };

    let share_id = record.id.clone();
    let location = record.blob_location.clone();
    let body = state
        .cipher
        .decrypt(ciphertext.map_err(ShareError::from), &iv, &tag)?
        .inspect_err(move |e| {
            error!(
                "decryption of share {} (blob {}) failed: {}",
                share_id, location, e
            )
        })
        .boxed_local();

    info!("share {} downloaded by {}", record.id, caller.email);
    shares::record_activity(
        state,
        &caller.email,
        ActivityAction::FileDownload,
        format!("Downloaded file: {}", record.file_name),
        ip,
    )
    .await;

    Ok(Download {
        size_bytes: record.size_bytes.max(0) as u64,
        file_name: record.file_name,
        mime_type: record.mime_type,
        body,
    })
}

/// Same checks as [`download`], without touching the blob.
pub async fn preview(
    state: &AppState,
    token: &str,
    caller: Option<&Caller>,
) -> Result<SharePreview, ShareError> {
    let (record, _) = authorize(state, token, caller).await?;
    Ok(SharePreview {
        file_name: record.file_name,
        size_bytes: record.size_bytes,
        mime_type: record.mime_type,
    })
}
