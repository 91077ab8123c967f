//! ビルドパイプライン
//!
//! `Validating → Building → Pushing → Deleting → Done` を順に進めます。
//! 状態遷移は [`RunState::advance`] の純粋関数で決まり、
//! [`BuildPipeline`] は各状態の I/O だけを担当します。

use crate::builder::ImageBuilder;
use crate::context::ContextBuilder;
use crate::engine::{EngineAddress, EngineConnection};
use crate::error::{BuildError, BuildResult, Step};
use crate::pusher::ImagePusher;
use crate::request::{BuildParams, BuildRequest};
use crate::snapshot::DEFAULT_SNAPSHOT_HOST;
use std::str::FromStr;
use std::time::Duration;

/// パイプラインの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Validating,
    Building,
    Pushing,
    /// `push_failed` が真なら削除後に `Failed` へ進む
    Deleting { push_failed: bool },
    Done,
    Failed,
}

/// 1 ステップの結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    Failed,
}

impl<T> From<&BuildResult<T>> for StepOutcome {
    fn from(result: &BuildResult<T>) -> Self {
        if result.is_ok() {
            StepOutcome::Succeeded
        } else {
            StepOutcome::Failed
        }
    }
}

/// push 失敗後にローカルイメージを削除するか
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupPolicy {
    /// push の成否に関わらず削除する
    #[default]
    Always,
    /// push が成功した場合のみ削除する
    OnSuccess,
}

impl FromStr for CleanupPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(CleanupPolicy::Always),
            "on-success" => Ok(CleanupPolicy::OnSuccess),
            other => Err(format!(
                "unknown cleanup policy '{}' (expected 'always' or 'on-success')",
                other
            )),
        }
    }
}

impl RunState {
    /// 現在の状態とステップの結果から次の状態を決める
    pub fn advance(self, outcome: StepOutcome, policy: CleanupPolicy) -> RunState {
        use StepOutcome::{Failed, Succeeded};

        match (self, outcome) {
            (RunState::Validating, Succeeded) => RunState::Building,
            (RunState::Building, Succeeded) => RunState::Pushing,
            (RunState::Validating | RunState::Building, Failed) => RunState::Failed,
            (RunState::Pushing, Succeeded) => RunState::Deleting { push_failed: false },
            (RunState::Pushing, Failed) => match policy {
                CleanupPolicy::Always => RunState::Deleting { push_failed: true },
                CleanupPolicy::OnSuccess => RunState::Failed,
            },
            // 削除の結果は無視する
            (RunState::Deleting { push_failed }, _) => {
                if push_failed {
                    RunState::Failed
                } else {
                    RunState::Done
                }
            }
            (terminal @ (RunState::Done | RunState::Failed), _) => terminal,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Validating => f.write_str("Validating"),
            RunState::Building => f.write_str("Building"),
            RunState::Pushing => f.write_str("Pushing"),
            RunState::Deleting { .. } => f.write_str("Deleting"),
            RunState::Done => f.write_str("Finished"),
            RunState::Failed => f.write_str("Failed"),
        }
    }
}

/// パイプラインの設定
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub engine: EngineAddress,
    pub snapshot_host: String,
    /// ストリームの 1 回の読み取りの待ち時間の上限
    pub read_timeout: Option<Duration>,
    pub cleanup: CleanupPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            engine: EngineAddress::default(),
            snapshot_host: DEFAULT_SNAPSHOT_HOST.to_string(),
            read_timeout: None,
            cleanup: CleanupPolicy::default(),
        }
    }
}

/// 1 回の実行結果
#[derive(Debug)]
pub struct RunReport {
    pub state: RunState,
    /// Engine に送ったリクエスト（送った順）
    pub steps: Vec<Step>,
    pub build_log: Option<String>,
    pub push_log: Option<String>,
    /// 最初に起きたエラー
    pub error: Option<BuildError>,
}

impl RunReport {
    fn new() -> Self {
        Self {
            state: RunState::Validating,
            steps: Vec::new(),
            build_log: None,
            push_log: None,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == RunState::Done
    }

    pub fn exit_code(&self) -> i32 {
        match (&self.error, self.state) {
            (_, RunState::Done) => 0,
            (Some(e), _) => e.exit_code(),
            (None, _) => 1,
        }
    }

    fn record<T>(&mut self, state: RunState, result: BuildResult<T>) -> StepOutcome {
        let outcome = StepOutcome::from(&result);
        if let Err(e) = result {
            tracing::error!("{} failed: {}", state, e);
            if let BuildError::EngineReported { step, log, .. } = &e {
                match step {
                    Step::Build => self.build_log = Some(log.clone()),
                    Step::Push => self.push_log = Some(log.clone()),
                    Step::Delete => {}
                }
            }
            self.error.get_or_insert(e);
        }
        outcome
    }
}

/// validate → build → push → delete を 1 本の接続で実行する
pub struct BuildPipeline {
    options: PipelineOptions,
    context: ContextBuilder,
}

impl BuildPipeline {
    pub fn new(options: PipelineOptions) -> Self {
        let context = ContextBuilder::new().with_snapshot_host(options.snapshot_host.clone());
        Self { options, context }
    }

    /// 生のパラメータから実行（検証に失敗した場合は Engine に接続しない）
    pub async fn run_params(&self, params: BuildParams) -> RunReport {
        match params.into_request() {
            Ok(request) => self.run(&request).await,
            Err(e) => {
                let mut report = RunReport::new();
                let outcome = report.record(RunState::Validating, Err::<(), _>(e));
                report.state = RunState::Validating.advance(outcome, self.options.cleanup);
                report
            }
        }
    }

    pub async fn run(&self, request: &BuildRequest) -> RunReport {
        let mut report = RunReport::new();
        let mut connection: Option<EngineConnection> = None;
        let mut state = RunState::Validating;

        while !state.is_terminal() {
            tracing::info!("Status {}", state);

            let outcome = match state {
                RunState::Validating => report.record(state, request.validate()),
                RunState::Building => {
                    let result = self.build(request, &mut connection, &mut report).await;
                    report.record(state, result)
                }
                RunState::Pushing => {
                    let result = self.push(request, &mut connection, &mut report).await;
                    report.record(state, result)
                }
                RunState::Deleting { .. } => {
                    if let Some(connection) = connection.as_mut() {
                        report.steps.push(Step::Delete);
                        ImagePusher::new(connection)
                            .delete(&request.image_name)
                            .await;
                    }
                    StepOutcome::Succeeded
                }
                RunState::Done | RunState::Failed => break,
            };

            state = state.advance(outcome, self.options.cleanup);
        }

        if let Some(connection) = connection {
            connection.close().await;
        }

        tracing::info!("Status {}", state);
        report.state = state;
        report
    }

    async fn build(
        &self,
        request: &BuildRequest,
        connection: &mut Option<EngineConnection>,
        report: &mut RunReport,
    ) -> BuildResult<()> {
        let connection = connection.insert(EngineConnection::connect(&self.options.engine).await?);
        let context = self.context.create_context(&request.source).await?;

        report.steps.push(Step::Build);
        let outcome = ImageBuilder::new(connection)
            .with_read_timeout(self.options.read_timeout)
            .build_image(&request.image_name, context)
            .await?;

        report.build_log = Some(outcome.log);
        Ok(())
    }

    async fn push(
        &self,
        request: &BuildRequest,
        connection: &mut Option<EngineConnection>,
        report: &mut RunReport,
    ) -> BuildResult<()> {
        let connection = connection.as_mut().ok_or_else(|| {
            BuildError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no Docker engine connection",
            ))
        })?;

        report.steps.push(Step::Push);
        let outcome = ImagePusher::new(connection)
            .with_credentials(request.credentials.clone())
            .with_read_timeout(self.options.read_timeout)
            .push(&request.image_name)
            .await?;

        report.push_log = Some(outcome.log);
        Ok(())
    }
}
