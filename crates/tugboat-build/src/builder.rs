use crate::context::CanonicalArchive;
use crate::engine::{self, EngineConnection};
use crate::error::{BuildError, BuildResult, Step};
use crate::progress::BuildProgress;
use crate::stream::{AggregatedOutcome, BuildRecord, StreamAggregator};
use std::time::Duration;

pub struct ImageBuilder<'a> {
    connection: &'a mut EngineConnection,
    read_timeout: Option<Duration>,
}

impl<'a> ImageBuilder<'a> {
    pub fn new(connection: &'a mut EngineConnection) -> Self {
        Self {
            connection,
            read_timeout: None,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// イメージをビルド（キャッシュなし、`image_name` でタグ付け）
    ///
    /// HTTP ステータスが 200 以外、またはストリーム中の終端エラーはどちらも失敗。
    pub async fn build_image(
        &mut self,
        image_name: &str,
        context: CanonicalArchive,
    ) -> BuildResult<AggregatedOutcome> {
        tracing::info!("Building image: {}", image_name);

        let request = engine::build_request(image_name, context)?;
        let response = self.connection.send(request).await?;

        let status = response.status();
        if !status.is_success() {
            let body = engine::read_body_text(response.into_body()).await;
            tracing::error!("Build request failed with {}: {}", status, body);
            return Err(BuildError::EngineStatus {
                step: Step::Build,
                status: status.as_u16(),
                body,
            });
        }

        let outcome = StreamAggregator::new(Step::Build)
            .with_read_timeout(self.read_timeout)
            .with_progress(BuildProgress::new(Step::Build, image_name))
            .aggregate::<BuildRecord, _>(engine::body_stream(response.into_body()))
            .await?;

        tracing::info!("Build log:\n{}", outcome.log);

        if let Some(message) = outcome.error {
            tracing::error!("Build error: Failed: {}", message);
            return Err(BuildError::EngineReported {
                step: Step::Build,
                message,
                log: outcome.log,
            });
        }

        tracing::info!("Successfully built: {}", image_name);
        Ok(outcome)
    }
}
