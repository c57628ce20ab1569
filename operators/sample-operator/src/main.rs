//! sample-controller 入口

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use sample_operator::config::OperatorConfig;
use sample_operator::{signals, SampleOperator};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// 依据 Foo 自定义资源管理 Deployment 的控制器
#[derive(Parser, Debug)]
#[command(name = "sample-controller", version, about)]
struct Cli {
    /// kubeconfig 路径，集群外运行时需要
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// API server 地址，覆盖 kubeconfig 中的值
    #[arg(long)]
    master: Option<String>,

    /// 配置文件路径（YAML 或 JSON）
    #[arg(long, short = 'c', env = "SAMPLE_CONTROLLER_CONFIG")]
    config: Option<PathBuf>,

    /// 并发 worker 数量
    #[arg(long)]
    workers: Option<usize>,

    /// 日志级别
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = OperatorConfig::load(cli.config.as_deref()).context("加载配置失败")?;
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(log_level) = cli.log_level {
        config.log_level = log_level;
    }
    config.validate().context("配置无效")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let shutdown = signals::setup_signal_handler();

    let client = build_client(cli.kubeconfig.as_deref(), cli.master.as_deref())
        .await
        .context("构建 Kubernetes 客户端失败")?;
    let version = client
        .apiserver_version()
        .await
        .context("无法连接 Kubernetes API server")?;
    info!("已连接 Kubernetes {}", version.git_version);

    info!("{} 启动，worker 数量 {}", config.controller_name, config.workers);
    SampleOperator::new(client, config)
        .run(shutdown)
        .await
        .context("运行控制器失败")?;

    info!("控制器已退出");
    Ok(())
}

/// 按命令行参数构建客户端，未指定时依次尝试默认 kubeconfig 与集群内配置
async fn build_client(kubeconfig: Option<&Path>, master: Option<&str>) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("读取 kubeconfig {path:?} 失败"))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await?
        }
        None => kube::Config::infer().await?,
    };

    if let Some(master) = master {
        config.cluster_url = master
            .parse()
            .with_context(|| format!("无效的 API server 地址 {master:?}"))?;
    }

    Ok(Client::try_from(config)?)
}
