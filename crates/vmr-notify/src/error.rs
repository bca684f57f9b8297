#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification sink is not configured: {sink}")]
    SinkNotConfigured { sink: String },
    #[error("notification sink failed: {message}")]
    SinkFailed { message: String },
}
