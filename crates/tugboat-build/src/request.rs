//! ビルド要求
//!
//! 環境変数や CLI から集めた生のパラメータ（[`BuildParams`]）を、
//! コンテキストソースがちょうど 1 つに決まった [`BuildRequest`] に変換します。

use crate::auth::RegistryCredentials;
use crate::error::{BuildError, BuildResult};
use bytes::Bytes;

/// リポジトリスナップショットの指定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRef {
    pub owner: String,
    pub name: String,
    pub tag: String,
}

/// ビルドコンテキストの取得元
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextSource {
    /// Dockerfile の本文
    Dockerfile(String),
    /// Dockerfile を返す URL
    DockerfileUrl(String),
    /// メモリ上の tar アーカイブ
    Archive(Bytes),
    /// tar(.gz) アーカイブを返す URL
    ArchiveUrl(String),
    /// タグ付きリポジトリのスナップショット
    Repository(RepositoryRef),
}

impl ContextSource {
    pub fn kind(&self) -> &'static str {
        match self {
            ContextSource::Dockerfile(_) => "dockerfile",
            ContextSource::DockerfileUrl(_) => "dockerfile-url",
            ContextSource::Archive(_) => "tar-file",
            ContextSource::ArchiveUrl(_) => "tgz-url",
            ContextSource::Repository(_) => "git-repo",
        }
    }
}

/// 1 回の実行に必要な設定
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub image_name: String,
    pub credentials: RegistryCredentials,
    pub source: ContextSource,
}

impl BuildRequest {
    pub fn new(image_name: impl Into<String>, source: ContextSource) -> Self {
        Self {
            image_name: image_name.into(),
            credentials: RegistryCredentials::default(),
            source,
        }
    }

    pub fn with_credentials(mut self, credentials: RegistryCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// イメージ名とコンテキストソースの検証
    ///
    /// イメージ名はリクエストパスにそのまま埋め込むため、
    /// ASCII の英数字と `._-/:@` 以外を含むものは受け付けない。
    pub fn validate(&self) -> BuildResult<()> {
        validate_image_name(&self.image_name)?;

        let empty = match &self.source {
            ContextSource::Dockerfile(text) => text.is_empty(),
            ContextSource::DockerfileUrl(url) | ContextSource::ArchiveUrl(url) => url.is_empty(),
            ContextSource::Archive(bytes) => bytes.is_empty(),
            ContextSource::Repository(repo) => {
                repo.owner.is_empty() || repo.name.is_empty() || repo.tag.is_empty()
            }
        };
        if empty {
            return Err(BuildError::InvalidParameters(format!(
                "{} context source is empty",
                self.source.kind()
            )));
        }

        Ok(())
    }
}

/// イメージ参照に使える文字（`registry:port/ns/name:tag@sha256:digest`）
fn is_reference_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':' | '@')
}

fn validate_image_name(image_name: &str) -> BuildResult<()> {
    if image_name.is_empty() {
        return Err(BuildError::InvalidParameters(
            "image name is required".to_string(),
        ));
    }

    if let Some(c) = image_name.chars().find(|c| !is_reference_char(*c)) {
        return Err(BuildError::InvalidParameters(format!(
            "invalid character {:?} in image name: {}",
            c, image_name
        )));
    }

    Ok(())
}

/// 環境変数や CLI から受け取る生のパラメータ
///
/// 空文字列は未指定として扱う。
#[derive(Debug, Clone, Default)]
pub struct BuildParams {
    pub image_name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub email: Option<String>,
    pub dockerfile: Option<String>,
    pub dockerfile_url: Option<String>,
    pub tar_file: Option<Vec<u8>>,
    pub tgz_url: Option<String>,
    pub git_user: Option<String>,
    pub git_repo: Option<String>,
    pub git_tag: Option<String>,
}

impl BuildParams {
    /// パラメータを [`BuildRequest`] に変換
    ///
    /// 複数のソースが指定された場合の優先順位:
    /// 1. Dockerfile 本文
    /// 2. Dockerfile URL
    /// 3. メモリ上のアーカイブ
    /// 4. アーカイブ URL
    /// 5. リポジトリスナップショット
    pub fn into_request(self) -> BuildResult<BuildRequest> {
        let image_name = present(self.image_name).ok_or_else(|| {
            BuildError::InvalidParameters("image name is required".to_string())
        })?;

        let mut candidates: Vec<ContextSource> = Vec::new();
        if let Some(text) = present(self.dockerfile) {
            candidates.push(ContextSource::Dockerfile(text));
        }
        if let Some(url) = present(self.dockerfile_url) {
            candidates.push(ContextSource::DockerfileUrl(url));
        }
        if let Some(bytes) = self.tar_file.filter(|b| !b.is_empty()) {
            candidates.push(ContextSource::Archive(Bytes::from(bytes)));
        }
        if let Some(url) = present(self.tgz_url) {
            candidates.push(ContextSource::ArchiveUrl(url));
        }
        if let Some(name) = present(self.git_repo) {
            candidates.push(ContextSource::Repository(RepositoryRef {
                owner: present(self.git_user).unwrap_or_default(),
                name,
                tag: present(self.git_tag).unwrap_or_default(),
            }));
        }

        let mut candidates = candidates.into_iter();
        let source = candidates.next().ok_or_else(|| {
            BuildError::InvalidParameters("no build context source was given".to_string())
        })?;

        let ignored: Vec<&str> = candidates.map(|s| s.kind()).collect();
        if !ignored.is_empty() {
            tracing::warn!(
                "Multiple context sources given, using {} and ignoring {}",
                source.kind(),
                ignored.join(", ")
            );
        }

        let request = BuildRequest {
            image_name,
            credentials: RegistryCredentials {
                username: present(self.username).unwrap_or_default(),
                password: present(self.password).unwrap_or_default(),
                email: present(self.email).unwrap_or_default(),
            },
            source,
        };
        request.validate()?;

        Ok(request)
    }
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
