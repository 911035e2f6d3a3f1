use std::{
    fmt,
    mem,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use bytes::BytesMut;

/// `BufferRecycler` 描述缓冲池在租借结束时的回收入口。
///
/// # 设计初衷（Why）
/// - 把“归还”动作收敛到 [`PooledBuffer`] 的 `Drop`/`release` 中，
///   调用方无需在每条错误退出路径上手动归还；
/// - 回收句柄以 trait 对象注入，测试可以替换为记录型探针观察回收事件。
///
/// # 契约定义（What）
/// - 实现必须线程安全，且不得在 `reclaim` 中 panic，否则 `Drop` 路径上的 panic 会导致进程中止；
/// - 每次租借对应恰好一次 `reclaim` 调用。
pub trait BufferRecycler: Send + Sync + 'static {
    /// 接收一次归还。
    fn reclaim(&self, reclaimed: ReclaimedBuffer);
}

/// 一次回收动作所携带的上下文。
///
/// - `capacity`：归还时底层缓冲的容量，用于更新池侧统计；
/// - `buffer`：被归还的 `BytesMut`，长度已被清零但保留容量。
#[derive(Debug)]
pub struct ReclaimedBuffer {
    capacity: usize,
    buffer: BytesMut,
}

impl ReclaimedBuffer {
    /// 以已清空的缓冲构造回收上下文。
    pub fn new(mut buffer: BytesMut) -> Self {
        buffer.clear();
        Self {
            capacity: buffer.capacity(),
            buffer,
        }
    }

    /// 返回本次回收的容量。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 消耗结构并取回可复用的 `BytesMut`。
    pub fn into_buffer(self) -> BytesMut {
        self.buffer
    }
}

/// `PooledBuffer` 是从 [`BufferPool`](crate::BufferPool) 租借得到的独占字节缓冲。
///
/// # 设计动机（Why）
/// - 编码引擎需要一块可追加写入、可整体清空、容量跨刷写保留的缓冲；
/// - 把归还逻辑放进 `Drop`，使“每次租借恰好归还一次”在错误路径上同样成立。
///
/// # 使用方式（How）
/// - 通过 `Deref`/`DerefMut` 直接以 `BytesMut` 的 API 读写（例如 `extend_from_slice`、`BufMut::writer`）；
/// - 显式调用 [`release`](Self::release) 或让句柄离开作用域，两者等价。
///
/// # 契约说明（What）
/// - 租借时长度为 0，此前内容不可见；
/// - 归还后句柄已被移动，编译器保证不会再被读取；
/// - 句柄只能被一个持有者独占，不实现 `Clone`。
pub struct PooledBuffer {
    buffer: BytesMut,
    recycler: Arc<dyn BufferRecycler>,
}

impl PooledBuffer {
    /// 使用给定的 `BytesMut` 与回收句柄创建缓冲。
    ///
    /// 传入的 `inner` 会被清空，调用方无需预先重置。
    pub fn new(mut inner: BytesMut, recycler: Arc<dyn BufferRecycler>) -> Self {
        inner.clear();
        Self {
            buffer: inner,
            recycler,
        }
    }

    /// 显式归还缓冲，语义与 `Drop` 相同。
    pub fn release(self) {
        drop(self);
    }

    /// 清空内容并保留容量，供“刷出后继续累积”的场景复用同一块内存。
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buffer.len())
            .field("capacity", &self.buffer.capacity())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        // 取走底层 `BytesMut`，留下的空壳不持有堆内存。
        let buffer = mem::take(&mut self.buffer);
        self.recycler.reclaim(ReclaimedBuffer::new(buffer));
    }
}
