use thiserror::Error;

/// All errors produced by ptt-core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown mode target: {0}")]
    UnknownMode(String),

    #[error("mode.request(PROCESSING) without a session")]
    ProcessingWithoutSession,

    #[error("interrupt.request({kind}) without a session")]
    InterruptWithoutSession { kind: String },

    #[error("audio chunk dropped: {0}")]
    AudioChunkDropped(String),

    #[error("screenshot capture failed: {0}")]
    ScreenshotCapture(String),

    #[error("route reconcile aborted: {0}")]
    RouteReconcileAbort(String),

    #[error("player backend error: {0}")]
    Player(String),

    #[error("mic backend error: {0}")]
    Mic(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
