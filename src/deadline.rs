use crate::error::{RecorderError, Result};
use std::future::Future;
use std::time::Duration;

/// 为外部调用加上截止时间
///
/// 操作先完成则原样返回其结果 (包括错误)；截止时间先到则返回 `Timeout`。
/// 超时后操作被丢弃，不会触发任何取消令牌，需要回收底层资源的调用方应自行传入关联令牌。
/// 计时器归属于返回的 future，两条路径上都会随之释放。
pub async fn bounded<F, T>(deadline: Duration, op: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, op).await {
        Ok(result) => result,
        Err(_) => Err(RecorderError::Timeout { after: deadline }),
    }
}

/// 无错误返回值的操作版本
pub async fn bounded_value<F, T>(deadline: Duration, op: F) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(deadline, op)
        .await
        .map_err(|_| RecorderError::Timeout { after: deadline })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    const DEADLINE: Duration = Duration::from_secs(10);
    const EPS: Duration = Duration::from_millis(1);

    #[tokio::test(start_paused = true)]
    async fn completes_just_before_deadline() {
        let result = bounded(DEADLINE, async {
            tokio::time::sleep(DEADLINE - EPS).await;
            Ok(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_just_after_deadline() {
        let result = bounded(DEADLINE, async {
            tokio::time::sleep(DEADLINE + EPS).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(RecorderError::Timeout { after }) if after == DEADLINE));
    }

    #[tokio::test(start_paused = true)]
    async fn propagates_operation_error_unchanged() {
        let result: Result<()> = bounded(DEADLINE, async { Err(RecorderError::capture("eof")) }).await;
        assert!(matches!(result, Err(RecorderError::Capture(msg)) if msg == "eof"));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_operation_is_dropped() {
        struct Flag(Arc<AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let guard = Flag(dropped.clone());
        let result = bounded_value(DEADLINE, async move {
            let _guard = guard;
            std::future::pending::<()>().await
        })
        .await;

        assert!(result.is_err());
        assert!(dropped.load(Ordering::SeqCst));
    }
}
