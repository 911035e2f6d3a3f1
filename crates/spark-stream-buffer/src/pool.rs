use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use bytes::BytesMut;
use spin::Mutex;

use crate::pooled_buffer::{BufferRecycler, PooledBuffer, ReclaimedBuffer};

/// 自由链表默认最多缓存的缓冲数量。
pub const DEFAULT_MAX_BUFFERS: usize = 64;

/// `BufferPool` 基于自由链表复用 `BytesMut`，供流式编码的热路径租借缓冲。
///
/// # 模块角色（Why）
/// - 每个编码调用都要租借一块至少 `buffer_size` 字节的缓冲；池预热后，
///   租借与归还只在自由链表上弹出/压入，不再触发堆分配；
/// - 句柄 [`PooledBuffer`] 在 `Drop` 阶段自动归还，调用方无需关注回收细节。
///
/// # 核心机制（How）
/// - 内部维护 `spin::Mutex<Vec<BytesMut>>` 作为自由链表，构造时按 `max_buffers` 预留槽位，
///   归还时压入不会触发扩容；
/// - `PoolMetrics` 通过原子计数跟踪租借次数、未命中次数、活跃租约与闲置字节数，支撑 [`stats`](Self::stats)；
/// - 自由链表满时直接丢弃归还的缓冲，避免突发峰值长期占用内存。
///
/// # 契约说明（What）
/// - **线程安全**：`Clone` 只复制 `Arc`，多个引擎可共享同一池，也可各自持有独立实例；
/// - **后置条件**：[`acquire`](Self::acquire) 返回的缓冲长度为 0，容量不小于 `buffer_size`；
/// - **隔离性**：缓冲在归还时被清空，下一位租借者看不到上一位写入的内容。
///
/// # 设计权衡（Trade-offs）
/// - 使用自旋锁而非阻塞锁：临界区只有一次 `Vec::pop`/`push`，持锁时间极短；
/// - 归还的缓冲保留其历史最大容量；若单个超大条目撑大了缓冲，可调用
///   [`shrink_to_fit`](Self::shrink_to_fit) 清空缓存归还峰值内存。
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// 创建最小容量为 `buffer_size` 的池，自由链表上限为 [`DEFAULT_MAX_BUFFERS`]。
    pub fn new(buffer_size: usize) -> Self {
        Self::with_max_buffers(buffer_size, DEFAULT_MAX_BUFFERS)
    }

    /// 创建池并指定自由链表最多缓存的缓冲数量。
    pub fn with_max_buffers(buffer_size: usize, max_buffers: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner::new(buffer_size, max_buffers)),
        }
    }

    /// 租借一块缓冲。
    ///
    /// # 契约
    /// - 返回值长度为 0，容量 `>= buffer_size()`；
    /// - 句柄离开作用域或调用 [`PooledBuffer::release`] 时归还。
    pub fn acquire(&self) -> PooledBuffer {
        let raw = self.inner.acquire_buffer();
        let recycler: Arc<dyn BufferRecycler> = self.inner.clone();
        PooledBuffer::new(raw, recycler)
    }

    /// 归还一个可能缺席的句柄；`None` 为空操作。
    pub fn release(&self, handle: Option<PooledBuffer>) {
        if let Some(buffer) = handle {
            buffer.release();
        }
    }

    /// 租借时保证的最小容量。
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// 清空自由链表，返回释放的字节数。
    pub fn shrink_to_fit(&self) -> usize {
        self.inner.shrink_free_list()
    }

    /// 读取统计快照。
    pub fn stats(&self) -> PoolStats {
        self.inner.snapshot()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("max_buffers", &self.inner.max_buffers)
            .finish()
    }
}

/// 缓冲池的统计快照。
///
/// - `total_acquired`：累计租借次数；
/// - `pool_misses`：自由链表未命中、需要新分配的次数；
/// - `active_leases`：当前尚未归还的租约数；
/// - `free_buffers` / `available_bytes`：自由链表中的缓冲数量与容量总和；
/// - `dropped_buffers`：因自由链表已满而被丢弃的归还次数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total_acquired: u64,
    pub pool_misses: u64,
    pub active_leases: usize,
    pub free_buffers: usize,
    pub available_bytes: usize,
    pub dropped_buffers: u64,
}

struct PoolInner {
    buffer_size: usize,
    max_buffers: usize,
    free_list: Mutex<Vec<BytesMut>>,
    metrics: PoolMetrics,
}

impl PoolInner {
    fn new(buffer_size: usize, max_buffers: usize) -> Self {
        Self {
            buffer_size,
            max_buffers,
            free_list: Mutex::new(Vec::with_capacity(max_buffers)),
            metrics: PoolMetrics::default(),
        }
    }

    /// 从自由链表或堆上获取一个满足容量的 `BytesMut`。
    fn acquire_buffer(&self) -> BytesMut {
        let reused = self.free_list.lock().pop();
        self.metrics.total_acquired.fetch_add(1, Ordering::Relaxed);
        self.metrics.active_leases.fetch_add(1, Ordering::Relaxed);

        let mut buffer = match reused {
            Some(buf) => {
                saturating_sub(&self.metrics.available_bytes, buf.capacity());
                buf
            }
            None => {
                self.metrics.pool_misses.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.buffer_size)
            }
        };
        buffer.clear();
        if buffer.capacity() < self.buffer_size {
            buffer.reserve(self.buffer_size);
        }
        buffer
    }

    fn shrink_free_list(&self) -> usize {
        let drained: Vec<BytesMut> = self.free_list.lock().drain(..).collect();
        let reclaimed: usize = drained.iter().map(BytesMut::capacity).sum();
        saturating_sub(&self.metrics.available_bytes, reclaimed);
        reclaimed
    }

    fn snapshot(&self) -> PoolStats {
        let free_buffers = self.free_list.lock().len();
        PoolStats {
            total_acquired: self.metrics.total_acquired.load(Ordering::Relaxed),
            pool_misses: self.metrics.pool_misses.load(Ordering::Relaxed),
            active_leases: self.metrics.active_leases.load(Ordering::Relaxed),
            free_buffers,
            available_bytes: self.metrics.available_bytes.load(Ordering::Relaxed),
            dropped_buffers: self.metrics.dropped_buffers.load(Ordering::Relaxed),
        }
    }
}

impl BufferRecycler for PoolInner {
    fn reclaim(&self, reclaimed: ReclaimedBuffer) {
        saturating_sub(&self.metrics.active_leases, 1);
        let capacity = reclaimed.capacity();
        let buffer = reclaimed.into_buffer();
        let mut list = self.free_list.lock();
        if list.len() < self.max_buffers && capacity > 0 {
            list.push(buffer);
            self.metrics
                .available_bytes
                .fetch_add(capacity, Ordering::Relaxed);
        } else {
            drop(list);
            self.metrics.dropped_buffers.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Default)]
struct PoolMetrics {
    total_acquired: AtomicU64,
    pool_misses: AtomicU64,
    active_leases: AtomicUsize,
    available_bytes: AtomicUsize,
    dropped_buffers: AtomicU64,
}

fn saturating_sub(target: &AtomicUsize, value: usize) {
    let _ = target.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(value))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reusable_capacity_returns_to_pool() {
        let pool = BufferPool::new(64);
        {
            let mut buffer = pool.acquire();
            assert!(buffer.capacity() >= 64);
            buffer.extend_from_slice(&[1, 2, 3, 4]);
        }
        let snapshot = pool.stats();
        assert_eq!(snapshot.free_buffers, 1);
        assert!(snapshot.available_bytes >= 64);

        let second = pool.acquire();
        assert!(second.is_empty(), "复用的缓冲必须被清空");
        let after = pool.stats();
        assert_eq!(after.pool_misses, 1, "第二次租借应命中自由链表");
        assert_eq!(after.available_bytes, 0);
    }

    #[test]
    fn overflowing_free_list_drops_buffers() {
        let pool = BufferPool::with_max_buffers(8, 1);
        let first = pool.acquire();
        let second = pool.acquire();
        drop(first);
        drop(second);
        let stats = pool.stats();
        assert_eq!(stats.free_buffers, 1);
        assert_eq!(stats.dropped_buffers, 1);
        assert_eq!(stats.active_leases, 0);
    }
}
