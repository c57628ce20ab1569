//! 信号处理模块
//!
//! 第一次收到 SIGINT/SIGTERM 时取消关闭令牌，开始优雅退出；
//! 再次收到时立即以退出码 1 结束进程。

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 注册信号处理，返回在收到第一次信号时被取消的令牌
pub fn setup_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let shutdown = token.clone();

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("收到关闭信号，开始优雅退出");
        shutdown.cancel();

        shutdown_signal().await;
        warn!("再次收到关闭信号，立即退出");
        std::process::exit(1);
    });

    token
}

/// 等待 Ctrl-C 或 SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("监听 Ctrl-C 失败: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("监听 SIGTERM 失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
