//! 后台任务作用域
//!
//! 续约、心跳、watch 分发、历史清理等后台任务都归属于某个 `TaskScope`：
//! 作用域关闭时取消全部任务并等待其退出，不存在脱离所有者的游离任务。

use std::future::Future;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

#[derive(Clone, Debug, Default)]
pub struct TaskScope {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl TaskScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// 派生子作用域：父作用域取消时子作用域一并取消，反之不影响父作用域
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 在作用域内启动后台任务
    ///
    /// 任务在作用域取消时被中断；任务本身也可以通过 `token()` 自行观察取消。
    pub fn spawn<F>(&self, task_name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(task_name, "Background task cancelled");
                }
                _ = fut => {
                    debug!(task_name, "Background task finished");
                }
            }
        });
    }

    /// 启动收尾任务：不随作用域取消而中断，但 `shutdown()` 会等待其完成
    ///
    /// 用于 `Drop` 中无法 await 的释放动作；当前线程没有运行时则放弃执行并返回 false。
    pub fn spawn_cleanup<F>(&self, task_name: &'static str, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if tokio::runtime::Handle::try_current().is_err() {
            debug!(task_name, "No runtime available, cleanup task skipped");
            return false;
        }
        self.tracker.spawn(async move {
            fut.await;
            debug!(task_name, "Cleanup task finished");
        });
        true
    }

    /// 取消全部任务并等待其退出
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
