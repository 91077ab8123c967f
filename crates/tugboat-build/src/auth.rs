//! レジストリ認証処理
//!
//! イメージ名からプッシュ先レジストリのアドレスを決め、
//! Engine API が要求する `X-Registry-Auth` ヘッダー値を組み立てます。

use crate::error::{BuildError, BuildResult};
use base64::Engine;
use serde::Serialize;

/// Docker Hub のインデックス
pub const DEFAULT_REGISTRY: &str = "https://index.docker.io/v1/";

/// レジストリの認証情報（すべて省略可能、未指定は空文字列）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
    pub email: String,
}

/// `X-Registry-Auth` の JSON 本体
#[derive(Debug, Serialize)]
struct PushAuth<'a> {
    username: &'a str,
    password: &'a str,
    serveraddress: &'a str,
    email: &'a str,
}

/// イメージ名からレジストリのサーバーアドレスを導出
///
/// イメージ名に `.` が含まれる場合は最初の `/` より前をレジストリホストとみなす。
///
/// # Examples
/// - `myimg` -> `https://index.docker.io/v1/`
/// - `quay.io/ns/myimg` -> `https://quay.io/v1/`
pub fn registry_server_address(image_name: &str) -> String {
    if image_name.contains('.') {
        let host = image_name
            .split_once('/')
            .map_or(image_name, |(host, _)| host);
        if !host.is_empty() {
            return format!("https://{}/v1/", host);
        }
    }

    DEFAULT_REGISTRY.to_string()
}

/// 認証情報を base64(JSON) にエンコード
pub fn encode_auth_header(
    credentials: &RegistryCredentials,
    server_address: &str,
) -> BuildResult<String> {
    let auth = PushAuth {
        username: &credentials.username,
        password: &credentials.password,
        serveraddress: server_address,
        email: &credentials.email,
    };

    let json = serde_json::to_vec(&auth).map_err(|e| {
        BuildError::InvalidParameters(format!("Failed to encode registry auth: {}", e))
    })?;

    Ok(base64::engine::general_purpose::STANDARD.encode(json))
}
