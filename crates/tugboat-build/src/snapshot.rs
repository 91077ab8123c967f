//! リポジトリスナップショットの再ルート化
//!
//! ホスティングサービスが生成する `<repo>-<version>/` ディレクトリを
//! すべてのエントリのパスから取り除き、コンテキストのルートに展開し直します。

use crate::error::{BuildError, BuildResult};
use crate::request::RepositoryRef;
use flate2::read::GzDecoder;
use std::io::Read;
use std::path::Path;
use tar::{Archive, Builder, Header};

pub const DEFAULT_SNAPSHOT_HOST: &str = "https://github.com";

/// スナップショットのダウンロード URL
///
/// `<host>/<owner>/<repo>/archive/<tag>.tar.gz`
pub fn snapshot_url(host: &str, repo: &RepositoryRef) -> String {
    format!(
        "{}/{}/{}/archive/{}.tar.gz",
        host.trim_end_matches('/'),
        repo.owner,
        repo.name,
        repo.tag
    )
}

/// スナップショット内のトップレベルディレクトリ名
///
/// タグ先頭の `v` は 1 文字だけ取り除かれる（`v2.3` -> `myrepo-2.3/`）。
pub fn snapshot_root(name: &str, tag: &str) -> String {
    let version = tag.strip_prefix('v').unwrap_or(tag);
    format!("{}-{}/", name, version)
}

/// スナップショットを取得して再ルート化した tar を返す
pub async fn fetch_snapshot(
    client: &reqwest::Client,
    host: &str,
    repo: &RepositoryRef,
) -> BuildResult<Vec<u8>> {
    let url = snapshot_url(host, repo);
    tracing::info!("Fetching repository snapshot: {}", url);

    let response = client.get(&url).send().await.map_err(|e| BuildError::Fetch {
        url: url.clone(),
        message: e.to_string(),
    })?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(BuildError::SnapshotNotFound { url });
    }
    if !response.status().is_success() {
        return Err(BuildError::Fetch {
            message: format!("unexpected status {}", response.status()),
            url,
        });
    }

    let compressed = response.bytes().await.map_err(|e| BuildError::Fetch {
        url: url.clone(),
        message: e.to_string(),
    })?;
    tracing::debug!("Snapshot downloaded: {} bytes", compressed.len());

    reroot_snapshot(&compressed, &snapshot_root(&repo.name, &repo.tag))
}

/// gzip 圧縮された tar から `root` 配下のエントリだけを取り出し、
/// `root` を取り除いたパスで新しい tar に書き出す
///
/// `root` 自体のエントリ（残りのパスが空になるもの）と `root` の外側のエントリは捨てる。
pub fn reroot_snapshot(compressed: &[u8], root: &str) -> BuildResult<Vec<u8>> {
    let mut tar_bytes = Vec::new();
    GzDecoder::new(compressed)
        .read_to_end(&mut tar_bytes)
        .map_err(|e| BuildError::Decode(format!("Failed to decompress snapshot: {}", e)))?;

    let root = Path::new(root.trim_end_matches('/'));
    let mut archive = Archive::new(tar_bytes.as_slice());
    let mut output = Builder::new(Vec::new());
    let mut kept = 0usize;

    let entries = archive
        .entries()
        .map_err(|e| BuildError::Decode(format!("Failed to read snapshot: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| BuildError::Decode(format!("Failed to read snapshot: {}", e)))?;

        let path = entry
            .path()
            .map_err(|e| BuildError::Decode(format!("Invalid entry path: {}", e)))?
            .into_owned();

        let stripped = match path.strip_prefix(root) {
            Ok(rest) if !rest.as_os_str().is_empty() => rest.to_path_buf(),
            _ => {
                tracing::trace!("Skipping snapshot entry: {}", path.display());
                continue;
            }
        };

        let entry_type = entry.header().entry_type();
        let mut header = rerooted_header(entry.header())?;

        if entry_type.is_hard_link() || entry_type.is_symlink() {
            let target = entry
                .link_name()
                .map_err(|e| BuildError::Decode(format!("Invalid link name: {}", e)))?
                .ok_or_else(|| {
                    BuildError::Decode(format!("Link without target: {}", path.display()))
                })?
                .into_owned();

            // リポジトリ内のハードリンクは同じ再ルート化を受ける
            let target = match target.strip_prefix(root) {
                Ok(rest) if entry_type.is_hard_link() => rest.to_path_buf(),
                _ => target,
            };

            output
                .append_link(&mut header, &stripped, &target)
                .map_err(|e| BuildError::Decode(format!("Failed to rewrite snapshot: {}", e)))?;
        } else {
            header.set_size(entry.size());
            output
                .append_data(&mut header, &stripped, &mut entry)
                .map_err(|e| BuildError::Decode(format!("Failed to rewrite snapshot: {}", e)))?;
        }
        kept += 1;
    }

    let rerooted = output.into_inner()?;
    tracing::debug!(
        "Snapshot re-rooted: {} entries, {} bytes",
        kept,
        rerooted.len()
    );

    Ok(rerooted)
}

/// 元のエントリの属性だけを引き継いだ新しい GNU ヘッダー
///
/// 元のヘッダーを複製すると ustar の `prefix` や切り詰められた `linkname` が残るため、
/// パスとリンク先は書き出し時に設定し直す。
fn rerooted_header(source: &Header) -> BuildResult<Header> {
    let invalid = |e: std::io::Error| BuildError::Decode(format!("Invalid entry header: {}", e));

    let mut header = Header::new_gnu();
    header.set_entry_type(source.entry_type());
    header.set_mode(source.mode().map_err(invalid)?);
    header.set_mtime(source.mtime().map_err(invalid)?);
    header.set_uid(source.uid().map_err(invalid)?);
    header.set_gid(source.gid().map_err(invalid)?);
    header.set_size(0);
    Ok(header)
}
