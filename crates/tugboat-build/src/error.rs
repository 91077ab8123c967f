use thiserror::Error;

/// パイプラインのどの段階で起きたか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Build,
    Push,
    Delete,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Build => f.write_str("build"),
            Step::Push => f.write_str("push"),
            Step::Delete => f.write_str("delete"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Invalid build parameters: {0}")]
    InvalidParameters(String),

    #[error("Cannot reach Docker engine at {address}: {source}")]
    EngineConnection {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("Repository snapshot not found: {url}")]
    SnapshotNotFound { url: String },

    #[error("Malformed archive: {0}")]
    Decode(String),

    #[error("Docker engine returned {status} for {step}: {body}")]
    EngineStatus { step: Step, status: u16, body: String },

    /// ストリーム中の終端エラー（`log` はそこまでのログ）
    #[error("Docker engine reported a {step} error: {message}")]
    EngineReported {
        step: Step,
        message: String,
        log: String,
    },

    #[error("Corrupt {step} response stream: {message}")]
    StreamCorrupt { step: Step, message: String },

    #[error("Timed out waiting for the {step} response stream")]
    Timeout { step: Step },

    #[error("Docker engine request failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// 失敗の種類ごとのプロセス終了コード
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::InvalidParameters(_) => 2,
            BuildError::EngineConnection { .. } => 3,
            BuildError::Fetch { .. } => 4,
            BuildError::SnapshotNotFound { .. } => 5,
            BuildError::Decode(_) => 6,
            BuildError::EngineStatus { .. } | BuildError::EngineReported { .. } => 7,
            BuildError::StreamCorrupt { .. } => 8,
            BuildError::Timeout { .. } => 9,
            BuildError::Http(_) | BuildError::Io(_) => 1,
        }
    }

    /// ユーザー向けの分かりやすいエラーメッセージ
    pub fn user_message(&self) -> String {
        match self {
            BuildError::InvalidParameters(msg) => {
                format!(
                    "Insufficient information: {}\n\
                     \n\
                     An image name and one of DOCKERFILE, DOCKERFILE_URL, TAR_FILE,\n\
                     TGZ_URL or GIT_USER/GIT_REPO/GIT_TAG must be provided.",
                    msg
                )
            }
            BuildError::EngineConnection { address, .. } => {
                format!(
                    "{}\n\
                     \n\
                     Check that the Docker engine listens on {} or set DOCKER_HOST.",
                    self, address
                )
            }
            BuildError::SnapshotNotFound { .. } => {
                format!(
                    "{}\n\
                     \n\
                     Make sure the repository owner, name and tag are correct.",
                    self
                )
            }
            _ => format!("{}", self),
        }
    }
}

pub type BuildResult<T> = std::result::Result<T, BuildError>;
