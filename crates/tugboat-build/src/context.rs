use crate::error::{BuildError, BuildResult};
use crate::request::ContextSource;
use crate::snapshot::{self, DEFAULT_SNAPSHOT_HOST};
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use tar::Builder;

/// コンテキスト内の Dockerfile のファイル名
pub const DOCKERFILE_NAME: &str = "Dockerfile";

/// Engine に送る正規化済みビルドコンテキスト（tar）
///
/// 1 回の実行ごとに作られ、リクエストボディとして一度だけ消費される。
pub enum CanonicalArchive {
    /// メモリ上に組み立てた tar
    Buffered(Bytes),
    /// リモートから受け取ったボディをそのまま流す
    Streamed(BoxStream<'static, std::io::Result<Bytes>>),
}

impl CanonicalArchive {
    /// メモリ上のバイト列（ストリームの場合は `None`）
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            CanonicalArchive::Buffered(bytes) => Some(bytes),
            CanonicalArchive::Streamed(_) => None,
        }
    }
}

impl std::fmt::Debug for CanonicalArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CanonicalArchive::Buffered(bytes) => f
                .debug_tuple("Buffered")
                .field(&format_args!("{} bytes", bytes.len()))
                .finish(),
            CanonicalArchive::Streamed(_) => f.write_str("Streamed(..)"),
        }
    }
}

pub struct ContextBuilder {
    client: reqwest::Client,
    snapshot_host: String,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            snapshot_host: DEFAULT_SNAPSHOT_HOST.to_string(),
        }
    }

    /// スナップショットの取得先ホストを変更（GitHub Enterprise など）
    pub fn with_snapshot_host(mut self, host: impl Into<String>) -> Self {
        self.snapshot_host = host.into();
        self
    }

    /// コンテキストソースを正規化済みアーカイブに変換
    pub async fn create_context(&self, source: &ContextSource) -> BuildResult<CanonicalArchive> {
        tracing::debug!("Creating build context from {}", source.kind());

        let archive = match source {
            ContextSource::Dockerfile(text) => {
                CanonicalArchive::Buffered(Self::dockerfile_archive(text.as_bytes())?.into())
            }
            ContextSource::DockerfileUrl(url) => {
                let body = self.fetch_dockerfile(url).await?;
                CanonicalArchive::Buffered(Self::dockerfile_archive(&body)?.into())
            }
            ContextSource::Archive(bytes) => CanonicalArchive::Buffered(bytes.clone()),
            ContextSource::ArchiveUrl(url) => self.fetch_archive(url).await?,
            ContextSource::Repository(repo) => CanonicalArchive::Buffered(
                snapshot::fetch_snapshot(&self.client, &self.snapshot_host, repo)
                    .await?
                    .into(),
            ),
        };

        if let Some(bytes) = archive.as_bytes() {
            tracing::debug!("Build context created: {} bytes", bytes.len());
            Self::check_context_size(bytes.len());
        }

        Ok(archive)
    }

    /// Dockerfile 1 ファイルだけを含む tar を作成
    ///
    /// ヘッダーは固定値（mtime 0, uid/gid 0, 0644）なので同じ入力から同じバイト列になる。
    pub fn dockerfile_archive(dockerfile: &[u8]) -> BuildResult<Vec<u8>> {
        let mut tar = Builder::new(Vec::new());

        let mut header = tar::Header::new_gnu();
        header.set_size(dockerfile.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);

        tar.append_data(&mut header, DOCKERFILE_NAME, dockerfile)
            .map_err(BuildError::Io)?;

        tar.into_inner().map_err(BuildError::Io)
    }

    /// Dockerfile を URL から取得
    ///
    /// ステータスコードは見ない。ボディのバイト列がそのまま Dockerfile になる。
    async fn fetch_dockerfile(&self, url: &str) -> BuildResult<Bytes> {
        let response = self.client.get(url).send().await.map_err(|e| BuildError::Fetch {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        tracing::debug!("Dockerfile URL responded with {}", response.status());

        response.bytes().await.map_err(|e| BuildError::Fetch {
            url: url.to_string(),
            message: e.to_string(),
        })
    }

    /// アーカイブ URL のボディを検証せずにストリームとして渡す
    async fn fetch_archive(&self, url: &str) -> BuildResult<CanonicalArchive> {
        let response = self.client.get(url).send().await.map_err(|e| BuildError::Fetch {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        tracing::info!("Fetched archive from {} ({})", url, response.status());

        let stream = response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed();

        Ok(CanonicalArchive::Streamed(stream))
    }

    /// コンテキストサイズのチェックと警告
    fn check_context_size(size: usize) {
        const MAX_CONTEXT_SIZE: usize = 500 * 1024 * 1024; // 500MB

        if size > MAX_CONTEXT_SIZE {
            tracing::warn!(
                "Build context is large ({}MB); consider trimming the archive",
                size / 1024 / 1024
            );
        }
    }
}
