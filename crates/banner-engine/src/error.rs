/// Failure taxonomy for one banner run.
///
/// Only `Cancelled` and `Io` end a run early; every other variant is
/// absorbed by the stage, material or loop iteration that raised it.
#[derive(Debug, thiserror::Error)]
pub enum BannerError {
    #[error("model call failed: {0}")]
    Model(String),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("render failed: {0}")]
    Render(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<anyhow::Error> for BannerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Io(std::io::Error::other(format!("{err:#}")))
    }
}

pub type BannerResult<T> = std::result::Result<T, BannerError>;
