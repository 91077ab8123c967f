use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use std::path::PathBuf;
use std::time::Duration;
use tugboat_build::engine::DEFAULT_ENGINE_ADDRESS;
use tugboat_build::snapshot::DEFAULT_SNAPSHOT_HOST;
use tugboat_build::{
    BuildError, BuildParams, BuildPipeline, CleanupPolicy, EngineAddress, PipelineOptions,
    RunReport,
};

/// 設定エラー（TAR_FILE が読めないなど）の終了コード
const SETUP_ERROR_EXIT_CODE: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "tugboat", version)]
#[command(
    about = "リモートの Docker Engine でイメージをビルドし、レジストリにプッシュして片付ける",
    long_about = None
)]
struct Cli {
    /// イメージ名（レジストリ・タグ込み）
    #[arg(long, env = "IMAGE_NAME")]
    image_name: Option<String>,

    /// レジストリのユーザー名
    #[arg(long, env = "USERNAME")]
    username: Option<String>,

    /// レジストリのパスワード
    #[arg(long, env = "PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// レジストリのメールアドレス
    #[arg(long, env = "EMAIL")]
    email: Option<String>,

    /// Dockerfile の本文
    #[arg(long, env = "DOCKERFILE")]
    dockerfile: Option<String>,

    /// Dockerfile の URL
    #[arg(long, env = "DOCKERFILE_URL")]
    dockerfile_url: Option<String>,

    /// ビルドコンテキストとして送る tar ファイル
    #[arg(long, env = "TAR_FILE")]
    tar_file: Option<PathBuf>,

    /// ビルドコンテキストとして送る tar.gz の URL
    #[arg(long, env = "TGZ_URL")]
    tgz_url: Option<String>,

    /// スナップショットを取得するリポジトリのオーナー
    #[arg(long, env = "GIT_USER")]
    git_user: Option<String>,

    /// スナップショットを取得するリポジトリ名
    #[arg(long, env = "GIT_REPO")]
    git_repo: Option<String>,

    /// スナップショットのタグ
    #[arg(long, env = "GIT_TAG")]
    git_tag: Option<String>,

    /// スナップショットの取得先
    #[arg(long, env = "GIT_HOST", default_value = DEFAULT_SNAPSHOT_HOST)]
    git_host: String,

    /// Docker Engine の接続先（tcp://host:port, http://host:port, unix:///path）
    #[arg(long, env = "DOCKER_HOST", default_value = DEFAULT_ENGINE_ADDRESS)]
    docker_host: String,

    /// ストリームの 1 回の読み取りの待ち時間の上限（秒）
    #[arg(long, env = "TUGBOAT_READ_TIMEOUT", value_name = "SECONDS")]
    read_timeout: Option<u64>,

    /// push 失敗時もローカルイメージを削除するか (always, on-success)
    #[arg(long, env = "TUGBOAT_CLEANUP", default_value = "always")]
    cleanup: CleanupPolicy,
}

impl Cli {
    fn params(&self) -> anyhow::Result<BuildParams> {
        let tar_file = match &self.tar_file {
            Some(path) if !path.as_os_str().is_empty() => Some(
                std::fs::read(path)
                    .with_context(|| format!("Failed to read TAR_FILE {}", path.display()))?,
            ),
            _ => None,
        };

        Ok(BuildParams {
            image_name: self.image_name.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            email: self.email.clone(),
            dockerfile: self.dockerfile.clone(),
            dockerfile_url: self.dockerfile_url.clone(),
            tar_file,
            tgz_url: self.tgz_url.clone(),
            git_user: self.git_user.clone(),
            git_repo: self.git_repo.clone(),
            git_tag: self.git_tag.clone(),
        })
    }

    fn options(&self) -> Result<PipelineOptions, BuildError> {
        Ok(PipelineOptions {
            engine: EngineAddress::parse(&self.docker_host)?,
            snapshot_host: self.git_host.clone(),
            read_timeout: self.read_timeout.map(Duration::from_secs),
            cleanup: self.cleanup,
        })
    }
}

fn init_logging() {
    // 標準出力は最終結果の表示に使うので、ログは stderr に出す
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

async fn run(cli: &Cli) -> i32 {
    let options = match cli.options() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{} {}", "✗".red().bold(), e.user_message());
            return e.exit_code();
        }
    };

    let params = match cli.params() {
        Ok(params) => params,
        Err(e) => {
            eprintln!("{} {:#}", "✗".red().bold(), e);
            return SETUP_ERROR_EXIT_CODE;
        }
    };

    tracing::debug!("Docker engine: {}", options.engine);
    let report = BuildPipeline::new(options).run_params(params).await;
    print_summary(cli.image_name.as_deref().unwrap_or_default(), &report);

    report.exit_code()
}

fn print_summary(image_name: &str, report: &RunReport) {
    if report.is_success() {
        println!(
            "{} {}",
            "✓".green().bold(),
            format!("{} をビルドしてプッシュしました", image_name).green()
        );
        return;
    }

    let message = report
        .error
        .as_ref()
        .map(BuildError::user_message)
        .unwrap_or_else(|| format!("{}", report.state));
    eprintln!("{} {}", "✗".red().bold(), message);

    let steps: Vec<String> = report.steps.iter().map(|s| s.to_string()).collect();
    if !steps.is_empty() {
        eprintln!("  {} {}", "実行したステップ:".dimmed(), steps.join(" → "));
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    let code = run(&cli).await;
    std::process::exit(code);
}
