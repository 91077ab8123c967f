//! Docker Engine API への接続
//!
//! build → push → delete の 3 リクエストを 1 本の HTTP/1.1 接続で順番に送ります。
//! パイプライン化や並行送信はしません。

use crate::context::CanonicalArchive;
use crate::error::{BuildError, BuildResult};
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::client::conn::http1::{self, SendRequest};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// Engine API のバージョン
pub const API_VERSION: &str = "v1.21";

/// `DOCKER_HOST` 未指定時の接続先
pub const DEFAULT_ENGINE_ADDRESS: &str = "tcp://localhost:2375";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// 送信リクエストのボディ
pub type EngineBody = UnsyncBoxBody<Bytes, BoxError>;

/// Engine の接続先
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineAddress {
    /// `host:port`
    Tcp(String),
    /// Unix ドメインソケットのパス
    Unix(PathBuf),
}

impl EngineAddress {
    /// `tcp://host:port`、`http://host:port`、`unix:///path` を解釈する
    ///
    /// スキームがなければ `host:port` とみなす。
    pub fn parse(value: &str) -> BuildResult<Self> {
        let address = match value.split_once("://") {
            Some(("tcp" | "http", rest)) => EngineAddress::Tcp(rest.trim_end_matches('/').to_string()),
            Some(("unix", path)) => EngineAddress::Unix(PathBuf::from(path)),
            Some((scheme, _)) => {
                return Err(BuildError::InvalidParameters(format!(
                    "unsupported Docker host scheme '{}' in {}",
                    scheme, value
                )));
            }
            None => EngineAddress::Tcp(value.to_string()),
        };

        match &address {
            EngineAddress::Tcp(host) if host.is_empty() => Err(BuildError::InvalidParameters(
                format!("missing host in Docker host {}", value),
            )),
            EngineAddress::Unix(path) if path.as_os_str().is_empty() => Err(
                BuildError::InvalidParameters(format!("missing socket path in {}", value)),
            ),
            _ => Ok(address),
        }
    }

    /// `Host` ヘッダーの値
    fn host_header(&self) -> &str {
        match self {
            EngineAddress::Tcp(host) => host,
            EngineAddress::Unix(_) => "docker",
        }
    }
}

impl Default for EngineAddress {
    fn default() -> Self {
        EngineAddress::Tcp("localhost:2375".to_string())
    }
}

impl std::fmt::Display for EngineAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineAddress::Tcp(host) => write!(f, "tcp://{}", host),
            EngineAddress::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Engine との 1 本の持続接続
///
/// 1 回の実行が排他的に所有し、リクエストは常に前のレスポンスを読み終えてから送る。
pub struct EngineConnection {
    address: EngineAddress,
    sender: SendRequest<EngineBody>,
    driver: JoinHandle<()>,
}

impl EngineConnection {
    /// 接続を確立して HTTP/1.1 のハンドシェイクを行う
    pub async fn connect(address: &EngineAddress) -> BuildResult<Self> {
        tracing::debug!("Connecting to Docker engine at {}", address);

        let connect_error = |source: std::io::Error| BuildError::EngineConnection {
            address: address.to_string(),
            source,
        };

        let (sender, driver) = match address {
            EngineAddress::Tcp(host) => {
                let stream = TcpStream::connect(host.as_str()).await.map_err(connect_error)?;
                handshake(stream, address).await?
            }
            #[cfg(unix)]
            EngineAddress::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(connect_error)?;
                handshake(stream, address).await?
            }
            #[cfg(not(unix))]
            EngineAddress::Unix(_) => {
                return Err(connect_error(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "unix sockets are not supported on this platform",
                )));
            }
        };

        tracing::info!("Connected to Docker engine at {}", address);
        Ok(Self {
            address: address.clone(),
            sender,
            driver,
        })
    }

    pub fn address(&self) -> &EngineAddress {
        &self.address
    }

    /// リクエストを送りレスポンスヘッダーを受け取る
    pub async fn send(&mut self, mut request: Request<EngineBody>) -> BuildResult<Response<Incoming>> {
        request.headers_mut().insert(
            HOST,
            self.address
                .host_header()
                .parse()
                .map_err(|_| BuildError::InvalidParameters(format!("invalid host {}", self.address)))?,
        );

        tracing::debug!("{} {}", request.method(), request.uri());
        self.sender.ready().await?;
        let response = self.sender.send_request(request).await?;
        tracing::debug!("Docker engine responded with {}", response.status());

        Ok(response)
    }

    /// 接続を閉じる
    pub async fn close(self) {
        drop(self.sender);
        if let Err(e) = self.driver.await {
            tracing::debug!("Connection task ended abnormally: {}", e);
        }
        tracing::debug!("Closed connection to {}", self.address);
    }
}

async fn handshake<S>(
    stream: S,
    address: &EngineAddress,
) -> BuildResult<(SendRequest<EngineBody>, JoinHandle<()>)>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sender, connection) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| BuildError::EngineConnection {
            address: address.to_string(),
            source: std::io::Error::other(e),
        })?;

    let driver = tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!("Docker engine connection error: {}", e);
        }
    });

    Ok((sender, driver))
}

/// `POST /{version}/build?nocache=true&t={image}`
pub fn build_request(image_name: &str, archive: CanonicalArchive) -> BuildResult<Request<EngineBody>> {
    let body: EngineBody = match archive {
        CanonicalArchive::Buffered(bytes) => {
            Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
        }
        CanonicalArchive::Streamed(stream) => StreamBody::new(
            stream
                .map_ok(Frame::data)
                .map_err(|e| Box::new(e) as BoxError),
        )
        .boxed_unsync(),
    };

    Request::builder()
        .method(Method::POST)
        .uri(format!("/{}/build?nocache=true&t={}", API_VERSION, image_name))
        .header(CONTENT_TYPE, "application/x-tar")
        .body(body)
        .map_err(|e| BuildError::InvalidParameters(format!("invalid build request: {}", e)))
}

/// `POST /images/{image}/push`（`X-Registry-Auth` 付き）
pub fn push_request(image_name: &str, registry_auth: &str) -> BuildResult<Request<EngineBody>> {
    Request::builder()
        .method(Method::POST)
        .uri(format!("/images/{}/push", image_name))
        .header("X-Registry-Auth", registry_auth)
        .body(empty_body())
        .map_err(|e| BuildError::InvalidParameters(format!("invalid push request: {}", e)))
}

/// `DELETE /{version}/images/{image}`
pub fn delete_request(image_name: &str) -> BuildResult<Request<EngineBody>> {
    Request::builder()
        .method(Method::DELETE)
        .uri(format!("/{}/images/{}", API_VERSION, image_name))
        .body(empty_body())
        .map_err(|e| BuildError::InvalidParameters(format!("invalid delete request: {}", e)))
}

fn empty_body() -> EngineBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

/// レスポンスボディをデータフレームのストリームに変換
pub fn body_stream(
    body: Incoming,
) -> impl futures_util::Stream<Item = std::io::Result<Bytes>> + Unpin {
    BodyStream::new(body)
        .try_filter_map(|frame| futures_util::future::ready(Ok(frame.into_data().ok())))
        .map_err(std::io::Error::other)
}

/// エラー応答のボディを文字列として読み切る
pub async fn read_body_text(body: Incoming) -> String {
    match body.collect().await {
        Ok(collected) => String::from_utf8_lossy(&collected.to_bytes()).trim().to_string(),
        Err(e) => format!("<failed to read response body: {}>", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        assert_eq!(
            EngineAddress::parse("tcp://192.168.59.103:2376").unwrap(),
            EngineAddress::Tcp("192.168.59.103:2376".into())
        );
        assert_eq!(
            EngineAddress::parse("http://localhost:2375/").unwrap(),
            EngineAddress::Tcp("localhost:2375".into())
        );
        assert_eq!(
            EngineAddress::parse("localhost:2375").unwrap(),
            EngineAddress::Tcp("localhost:2375".into())
        );
    }

    #[test]
    fn test_parse_unix() {
        assert_eq!(
            EngineAddress::parse("unix:///var/run/docker.sock").unwrap(),
            EngineAddress::Unix(PathBuf::from("/var/run/docker.sock"))
        );
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        assert!(EngineAddress::parse("ssh://host").is_err());
        assert!(EngineAddress::parse("tcp://").is_err());
    }

    #[test]
    fn test_default_address() {
        assert_eq!(
            EngineAddress::parse(DEFAULT_ENGINE_ADDRESS).unwrap(),
            EngineAddress::default()
        );
        assert_eq!(EngineAddress::default().to_string(), DEFAULT_ENGINE_ADDRESS);
    }

    #[test]
    fn test_request_shapes() {
        let archive = CanonicalArchive::Buffered(Bytes::from_static(b"tar"));
        let request = build_request("quay.io/ns/app", archive).unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(
            request.uri().to_string(),
            "/v1.21/build?nocache=true&t=quay.io/ns/app"
        );

        let request = push_request("quay.io/ns/app", "e30=").unwrap();
        assert_eq!(request.uri().path(), "/images/quay.io/ns/app/push");
        assert_eq!(request.headers()["X-Registry-Auth"], "e30=");

        let request = delete_request("demo").unwrap();
        assert_eq!(request.method(), Method::DELETE);
        assert_eq!(request.uri().path(), "/v1.21/images/demo");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let address = EngineAddress::Tcp("127.0.0.1:1".into());
        let err = EngineConnection::connect(&address).await.err().unwrap();
        assert!(matches!(err, BuildError::EngineConnection { .. }));
        assert_eq!(err.exit_code(), 3);
    }
}
