//! Sample Controller - 依据 Foo 自定义资源驱动 Deployment 收敛的 Kubernetes 控制器
//!
//! 该模块监听 Foo 与 Deployment，把变化转换为 Foo 键放入去重工作队列，
//! 由若干 worker 逐个协调：确保每个 Foo 都有一个名称、副本数符合声明且由它控制的
//! Deployment，并把可用副本数回写到 Foo 的 status。

pub mod cache;
pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod event_handler;
pub mod reconcile;
pub mod recorder;
pub mod scheme;
pub mod signals;

use std::sync::Arc;

use anyhow::Result;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{watch_stream, SharedInformer};
use crate::client::KubeClusterApi;
use crate::config::OperatorConfig;
use crate::crd::Foo;
use crate::recorder::KubeEventRecorder;
use crate::scheme::Scheme;

/// Operator 主结构体
pub struct SampleOperator {
    /// Kubernetes 客户端
    client: Client,
    /// 运行配置
    config: OperatorConfig,
}

impl SampleOperator {
    /// 创建新的 Operator 实例
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        Self { client, config }
    }

    /// 运行 Operator 直到关闭令牌被取消
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let scheme = Scheme::new();
        let mut foo_informer = SharedInformer::<Foo>::new(self.config.resync_period());
        let mut deployment_informer =
            SharedInformer::<Deployment>::new(self.config.resync_period());

        let api = Arc::new(KubeClusterApi::new(
            self.client.clone(),
            self.config.controller_name.clone(),
        ));
        let recorder = Arc::new(KubeEventRecorder::new(
            self.client.clone(),
            self.config.controller_name.clone(),
        ));

        let controller = controller::Controller::new(
            &mut foo_informer,
            &mut deployment_informer,
            api,
            recorder,
            &scheme,
            &self.config,
        )?;

        // 启动 informer
        info!("启动 informer");
        let informers = [
            tokio::spawn(foo_informer.run(
                watch_stream(Api::<Foo>::all(self.client.clone())),
                shutdown.clone(),
            )),
            tokio::spawn(deployment_informer.run(
                watch_stream(Api::<Deployment>::all(self.client.clone())),
                shutdown.clone(),
            )),
        ];

        let result = controller.run(self.config.workers, shutdown.clone()).await;

        // 控制器提前失败时也要停止 informer
        shutdown.cancel();
        for informer in informers {
            if let Err(e) = informer.await {
                warn!("informer 异常退出: {}", e);
            }
        }

        result
    }
}
