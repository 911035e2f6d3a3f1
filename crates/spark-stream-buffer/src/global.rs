use std::sync::OnceLock;

use crate::pool::BufferPool;

/// 默认池保证的最小缓冲容量（50 KiB）。
pub const DEFAULT_BUFFER_SIZE: usize = 50 * 1024;

static DEFAULT_POOL: OnceLock<BufferPool> = OnceLock::new();

/// 进程级默认缓冲池。
///
/// # 契约（What）
/// - 首次调用时惰性创建，生命周期等同进程，容量为 [`DEFAULT_BUFFER_SIZE`]；
/// - 引擎不会隐式使用该池：需要共享时由调用方显式注入，
///   例如 `StreamEngine::with_pool(config, default_pool().clone())`。
///   测试可以改为注入独立实例，互不干扰。
pub fn default_pool() -> &'static BufferPool {
    DEFAULT_POOL.get_or_init(|| BufferPool::new(DEFAULT_BUFFER_SIZE))
}
