use log::info;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

#[derive(Debug, Clone)]
pub struct ShareNotice {
    pub recipient_email: String,
    pub sender_email: String,
    pub file_name: String,
    pub download_url: String,
    pub expiry_hours: i64,
}

/// Outbound delivery of share links. Called from the blocking pool; a
/// failure is logged by the caller and never undoes the share.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: &ShareNotice) -> Result<(), NotifyError>;
}

/// Records the dispatch in the service log. The link itself is left out.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: &ShareNotice) -> Result<(), NotifyError> {
        info!(
            "share notification for {} from {} ({:?}, link valid {}h)",
            notice.recipient_email, notice.sender_email, notice.file_name, notice.expiry_hours
        );
        Ok(())
    }
}
