//! URL から取得するコンテキストソースのテスト

mod common;

use common::{Route, StubServer, gzipped_tar, tar_entries};
use futures_util::TryStreamExt;
use tugboat_build::{BuildError, CanonicalArchive, ContextBuilder, ContextSource, RepositoryRef};

#[tokio::test]
async fn test_dockerfile_url_is_wrapped() {
    let files = StubServer::start(vec![Route::new(
        "GET",
        "/Dockerfile",
        200,
        "FROM alpine\nRUN true\n",
    )])
    .await;

    let archive = ContextBuilder::new()
        .create_context(&ContextSource::DockerfileUrl(format!("{}/Dockerfile", files.url())))
        .await
        .unwrap();

    let bytes = archive.as_bytes().unwrap();
    assert_eq!(
        tar_entries(bytes),
        vec![("Dockerfile".to_string(), b"FROM alpine\nRUN true\n".to_vec())]
    );
}

/// UTF-8 でないバイト列も書き換えずに tar に入る
#[tokio::test]
async fn test_dockerfile_url_keeps_raw_bytes() {
    let raw: &'static [u8] = b"FROM alpine\n# caf\xe9 \xff\xfe\nRUN true\n";
    let files = StubServer::start(vec![Route::new("GET", "/Dockerfile.latin1", 200, raw)]).await;

    let archive = ContextBuilder::new()
        .create_context(&ContextSource::DockerfileUrl(format!(
            "{}/Dockerfile.latin1",
            files.url()
        )))
        .await
        .unwrap();

    assert_eq!(
        tar_entries(archive.as_bytes().unwrap()),
        vec![("Dockerfile".to_string(), raw.to_vec())]
    );
}

#[tokio::test]
async fn test_dockerfile_url_ignores_status() {
    // 取得結果のステータスは見ず、ボディがそのまま Dockerfile になる
    let files = StubServer::start(Vec::new()).await;

    let archive = ContextBuilder::new()
        .create_context(&ContextSource::DockerfileUrl(format!("{}/missing", files.url())))
        .await
        .unwrap();

    let entries = tar_entries(archive.as_bytes().unwrap());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1, b"{\"message\":\"not found\"}".to_vec());
}

#[tokio::test]
async fn test_archive_url_is_streamed_unchanged() {
    let payload = gzipped_tar(&[("Dockerfile", "FROM scratch")]);
    let files = StubServer::start(vec![Route::new("GET", "/ctx.tgz", 200, payload.clone())]).await;

    let archive = ContextBuilder::new()
        .create_context(&ContextSource::ArchiveUrl(format!("{}/ctx.tgz", files.url())))
        .await
        .unwrap();

    let CanonicalArchive::Streamed(stream) = archive else {
        panic!("archive URL should be streamed");
    };
    let chunks: Vec<bytes::Bytes> = stream.try_collect().await.unwrap();
    assert_eq!(chunks.concat(), payload);
}

#[tokio::test]
async fn test_snapshot_not_found() {
    let files = StubServer::start(Vec::new()).await;

    let result = ContextBuilder::new()
        .with_snapshot_host(files.url())
        .create_context(&ContextSource::Repository(RepositoryRef {
            owner: "acme".into(),
            name: "ghost".into(),
            tag: "v0.1".into(),
        }))
        .await;

    match result {
        Err(BuildError::SnapshotNotFound { url }) => {
            assert!(url.ends_with("/acme/ghost/archive/v0.1.tar.gz"));
        }
        other => panic!("expected SnapshotNotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn test_snapshot_server_error_is_fetch_error() {
    let files = StubServer::start(vec![Route::new(
        "GET",
        "/acme/myrepo/archive/v1.tar.gz",
        503,
        "unavailable",
    )])
    .await;

    let result = ContextBuilder::new()
        .with_snapshot_host(files.url())
        .create_context(&ContextSource::Repository(RepositoryRef {
            owner: "acme".into(),
            name: "myrepo".into(),
            tag: "v1".into(),
        }))
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, BuildError::Fetch { .. }));
    assert_eq!(err.exit_code(), 4);
}

#[tokio::test]
async fn test_snapshot_tag_without_v_prefix() {
    let snapshot = gzipped_tar(&[
        ("tool-1.0/", ""),
        ("tool-1.0/Dockerfile", "FROM busybox"),
        ("README", "outside the root"),
    ]);
    let files = StubServer::start(vec![Route::new(
        "GET",
        "/acme/tool/archive/1.0.tar.gz",
        200,
        snapshot,
    )])
    .await;

    let archive = ContextBuilder::new()
        .with_snapshot_host(files.url())
        .create_context(&ContextSource::Repository(RepositoryRef {
            owner: "acme".into(),
            name: "tool".into(),
            tag: "1.0".into(),
        }))
        .await
        .unwrap();

    assert_eq!(
        tar_entries(archive.as_bytes().unwrap()),
        vec![("Dockerfile".to_string(), b"FROM busybox".to_vec())]
    );
}
