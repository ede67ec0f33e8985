use chrono::NaiveDateTime;
use serde::Serialize;

use crate::schema::{activity_logs, share_records};

#[derive(Debug, Clone, Queryable)]
pub struct User {
    pub id: String,
    pub email: String,
    pub role: String,
    pub created_at: NaiveDateTime,
}

/// One encrypted file share. `download_token` is the live capability;
/// once revoked it moves to `revoked_token` and never comes back.
#[derive(Debug, Clone, Queryable, Insertable)]
pub struct ShareRecord {
    pub id: String,
    pub file_name: String,
    pub blob_location: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub recipient_email: String,
    pub uploader_id: String,
    pub iv: String,
    pub auth_tag: String,
    pub download_token: Option<String>,
    pub revoked_token: Option<String>,
    pub token_expires_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareStatus {
    Active,
    Expired,
    Revoked,
}

impl ShareRecord {
    pub fn status(&self, now: NaiveDateTime) -> ShareStatus {
        if self.download_token.is_none() {
            ShareStatus::Revoked
        } else if matches!(self.token_expires_at, Some(expires_at) if expires_at < now) {
            ShareStatus::Expired
        } else {
            ShareStatus::Active
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.download_token.is_none()
    }
}

/// Listing view of a share. Never carries the blob location or cipher parameters.
#[derive(Debug, Clone, Serialize)]
pub struct ShareSummary {
    pub id: String,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub recipient_email: String,
    pub uploader_email: String,
    pub download_token: Option<String>,
    pub token_expires_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub status: ShareStatus,
}

impl ShareSummary {
    pub fn from_record(record: ShareRecord, uploader_email: String, now: NaiveDateTime) -> Self {
        let status = record.status(now);
        ShareSummary {
            id: record.id,
            file_name: record.file_name,
            mime_type: record.mime_type,
            size_bytes: record.size_bytes,
            recipient_email: record.recipient_email,
            uploader_email,
            download_token: record.download_token,
            token_expires_at: record.token_expires_at,
            created_at: record.created_at,
            status,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize)]
pub struct ActivityLog {
    pub id: String,
    pub actor_email: String,
    pub action: String,
    pub details: Option<String>,
    pub ip_address: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityAction {
    FileUpload,
    FileDownload,
    FileRevoke,
    UserDelete,
}

impl ActivityAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityAction::FileUpload => "FILE_UPLOAD",
            ActivityAction::FileDownload => "FILE_DOWNLOAD",
            ActivityAction::FileRevoke => "FILE_REVOKE",
            ActivityAction::UserDelete => "USER_DELETE",
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_record(
    token: Option<&str>,
    expires_at: Option<NaiveDateTime>,
) -> ShareRecord {
    ShareRecord {
        id: "share-1".to_string(),
        file_name: "report.pdf".to_string(),
        blob_location: "blob.enc".to_string(),
        mime_type: "application/pdf".to_string(),
        size_bytes: 10,
        recipient_email: "bob@x.com".to_string(),
        uploader_id: "alice".to_string(),
        iv: "00".repeat(12),
        auth_tag: "00".repeat(16),
        download_token: token.map(str::to_string),
        revoked_token: None,
        token_expires_at: expires_at,
        created_at: chrono::Utc::now().naive_utc(),
    }
}
