use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 优雅关闭管理器
///
/// 所有组件持有同一个令牌的克隆，触发一次即可通知全部组件。
#[derive(Debug, Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 组件使用的关闭令牌
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭，重复调用无副作用
    pub fn shutdown(&self) {
        if self.token.is_cancelled() {
            debug!("关闭管理器已经触发过关闭");
            return;
        }
        info!("触发系统关闭");
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 等待 Ctrl+C 或 SIGTERM 后触发关闭
    pub async fn shutdown_on_signal(&self) {
        tokio::select! {
            _ = wait_for_signal() => self.shutdown(),
            _ = self.token.cancelled() => {}
        }
    }
}

/// 等待关闭信号
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到Ctrl+C信号"),
        _ = terminate => info!("收到SIGTERM信号"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_notifies_all_tokens() {
        let manager = ShutdownManager::new();
        let first = manager.token();
        let second = manager.clone().token();

        assert!(!manager.is_shutdown());
        manager.shutdown();
        manager.shutdown();

        first.cancelled().await;
        second.cancelled().await;
        assert!(manager.is_shutdown());
    }

    #[tokio::test]
    async fn test_shutdown_on_signal_returns_after_manual_shutdown() {
        let manager = ShutdownManager::new();
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.shutdown_on_signal().await })
        };
        manager.shutdown();
        waiter.await.unwrap();
    }
}
