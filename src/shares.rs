use log::{debug, info, warn};
use uuid::Uuid;

use crate::error::ShareError;
use crate::identity::Caller;
use crate::models::{ActivityAction, ActivityLog, ShareSummary};
use crate::state::AppState;
use crate::store;
use crate::tokens;

pub const RECENT_ACTIVITY_LIMIT: i64 = 100;

/// Appends to the activity log. A failed append is logged and otherwise ignored.
pub async fn record_activity(
    state: &AppState,
    actor_email: &str,
    action: ActivityAction,
    details: String,
    ip: &str,
) {
    let entry = ActivityLog {
        id: Uuid::new_v4().to_string(),
        actor_email: actor_email.to_string(),
        action: action.as_str().to_string(),
        details: Some(details),
        ip_address: Some(ip.to_string()),
        created_at: tokens::now(),
    };
    let store = state.store.clone();
    if let Err(e) = store::run(move || store.append_activity(&entry)).await {
        warn!(
            "could not record {} by {}: {}",
            action.as_str(),
            actor_email,
            e
        );
    }
}

/// Only the uploader may revoke. Revoking twice is not an error.
pub async fn revoke(
    state: &AppState,
    share_id: &str,
    caller: &Caller,
    ip: &str,
) -> Result<(), ShareError> {
    let store = state.store.clone();
    let id = share_id.to_string();
    let record = store::run(move || store.find_share(&id))
        .await?
        .ok_or(ShareError::UnknownShare)?;

    if record.uploader_id != caller.id {
        warn!("{} tried to revoke share {} they do not own", caller.email, record.id);
        return Err(ShareError::Forbidden);
    }
    if record.is_revoked() {
        debug!("share {} already revoked", record.id);
        return Ok(());
    }

    let store = state.store.clone();
    let id = record.id.clone();
    store::run(move || store.revoke_share(&id)).await?;
    info!("share {} revoked by {}", record.id, caller.email);

    record_activity(
        state,
        &caller.email,
        ActivityAction::FileRevoke,
        format!("Revoked access to file: {}", record.file_name),
        ip,
    )
    .await;
    Ok(())
}

pub async fn sent(state: &AppState, caller: &Caller) -> Result<Vec<ShareSummary>, ShareError> {
    let store = state.store.clone();
    let uploader_id = caller.id.clone();
    let records = store::run(move || store.shares_sent_by(&uploader_id)).await?;
    let now = tokens::now();
    Ok(records
        .into_iter()
        .map(|r| ShareSummary::from_record(r, caller.email.clone(), now))
        .collect())
}

pub async fn received(state: &AppState, caller: &Caller) -> Result<Vec<ShareSummary>, ShareError> {
    let store = state.store.clone();
    let email = caller.email.clone();
    let records = store::run(move || store.shares_received_by(&email)).await?;
    let now = tokens::now();
    Ok(records
        .into_iter()
        .map(|(r, sender)| ShareSummary::from_record(r, sender, now))
        .collect())
}

/// Deletes a user and every share they uploaded, then reclaims the blobs.
/// Returns the number of shares removed.
pub async fn delete_account(
    state: &AppState,
    admin: &Caller,
    user_id: &str,
    ip: &str,
) -> Result<usize, ShareError> {
    if !admin.is_admin() {
        return Err(ShareError::Forbidden);
    }
    if admin.id == user_id {
        return Err(ShareError::Validation(
            "You cannot delete your own account.".to_string(),
        ));
    }

    let store = state.store.clone();
    let id = user_id.to_string();
    let removed = store::run(move || store.delete_user(&id))
        .await?
        .ok_or(ShareError::UnknownUser)?;

    for share in &removed {
        state.blobs.delete(&share.blob_location).await;
    }
    info!(
        "user {} deleted by {} along with {} shares",
        user_id,
        admin.email,
        removed.len()
    );

    record_activity(
        state,
        &admin.email,
        ActivityAction::UserDelete,
        format!("Deleted user {} and {} shares", user_id, removed.len()),
        ip,
    )
    .await;
    Ok(removed.len())
}

pub async fn recent_activity(
    state: &AppState,
    admin: &Caller,
) -> Result<Vec<ActivityLog>, ShareError> {
    if !admin.is_admin() {
        return Err(ShareError::Forbidden);
    }
    let store = state.store.clone();
    Ok(store::run(move || store.recent_activity(RECENT_ACTIVITY_LIMIT)).await?)
}
