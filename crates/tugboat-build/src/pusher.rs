//! イメージプッシュ処理
//!
//! ビルドしたイメージをコンテナレジストリにプッシュし、
//! ローカルのイメージを削除します。

use crate::auth::{self, RegistryCredentials};
use crate::engine::{self, EngineConnection};
use crate::error::{BuildError, BuildResult, Step};
use crate::progress::BuildProgress;
use crate::stream::{AggregatedOutcome, PushRecord, StreamAggregator};
use std::time::Duration;

/// イメージプッシュを実行するハンドラ
pub struct ImagePusher<'a> {
    connection: &'a mut EngineConnection,
    credentials: RegistryCredentials,
    read_timeout: Option<Duration>,
}

impl<'a> ImagePusher<'a> {
    /// 新しい ImagePusher を作成
    pub fn new(connection: &'a mut EngineConnection) -> Self {
        Self {
            connection,
            credentials: RegistryCredentials::default(),
            read_timeout: None,
        }
    }

    /// 認証情報を指定
    pub fn with_credentials(mut self, credentials: RegistryCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// イメージをレジストリにプッシュ
    ///
    /// # Arguments
    /// * `image_name` - イメージ名（レジストリ込み）
    ///
    /// # Returns
    /// プッシュのログ
    pub async fn push(&mut self, image_name: &str) -> BuildResult<AggregatedOutcome> {
        let server_address = auth::registry_server_address(image_name);
        tracing::info!("Pushing {} to {}", image_name, server_address);

        let registry_auth = auth::encode_auth_header(&self.credentials, &server_address)?;
        let request = engine::push_request(image_name, &registry_auth)?;
        let response = self.connection.send(request).await?;

        let status = response.status();
        if !status.is_success() {
            let body = engine::read_body_text(response.into_body()).await;
            tracing::error!("Push request failed with {}: {}", status, body);
            return Err(BuildError::EngineStatus {
                step: Step::Push,
                status: status.as_u16(),
                body,
            });
        }

        let outcome = StreamAggregator::new(Step::Push)
            .with_read_timeout(self.read_timeout)
            .with_progress(BuildProgress::new(Step::Push, image_name))
            .aggregate::<PushRecord, _>(engine::body_stream(response.into_body()))
            .await?;

        tracing::info!("Push log:\n{}", outcome.log);

        if let Some(message) = outcome.error {
            tracing::error!("Push error: Failed: {}", message);
            return Err(BuildError::EngineReported {
                step: Step::Push,
                message,
                log: outcome.log,
            });
        }

        tracing::info!("Pushed: {}", image_name);
        Ok(outcome)
    }

    /// ローカルのイメージを削除（結果は無視する）
    pub async fn delete(&mut self, image_name: &str) {
        tracing::info!("Removing local image: {}", image_name);

        let response = match engine::delete_request(image_name) {
            Ok(request) => self.connection.send(request).await,
            Err(e) => Err(e),
        };

        match response {
            Ok(response) if response.status().is_success() => {
                let body = engine::read_body_text(response.into_body()).await;
                tracing::debug!("Removed {}: {}", image_name, body);
            }
            Ok(response) => {
                let status = response.status();
                let body = engine::read_body_text(response.into_body()).await;
                tracing::warn!("Failed to remove {} ({}): {}", image_name, status, body);
            }
            Err(e) => tracing::warn!("Failed to remove {}: {}", image_name, e),
        }
    }
}
