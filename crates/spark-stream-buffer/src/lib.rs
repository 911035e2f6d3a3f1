//! `spark-stream-buffer` 为流式编码引擎提供可复用的字节缓冲池。
//!
//! # 模块定位（Why）
//! - 流式编码会不断地“写入 → 刷出 → 重置”缓冲，若每次都向堆申请内存，
//!   大结果集场景下会产生明显的分配抖动；
//! - 本 crate 以 `bytes::BytesMut` 为底层载体，提供作用域化的租借/归还语义，
//!   保证“租借即清空、归还后不可再读”的约束由所有权而非约定来维护。
//!
//! # 设计概要（How）
//! - `pool` 模块实现 [`BufferPool`]：基于自由链表复用 `BytesMut`，并通过原子计数暴露统计快照；
//! - `pooled_buffer` 模块实现 [`PooledBuffer`]：RAII 句柄，`Drop` 时经由 [`BufferRecycler`] 归还；
//! - `global` 模块提供进程级默认池 [`default_pool`]，仅在调用方显式注入时使用。
//!
//! # 契约（What）
//! - 所有公开类型满足 `Send + Sync + 'static`（`PooledBuffer` 仅需 `Send`），可在多个编排任务间共享；
//! - 同一块缓冲在任一时刻只被一个持有者独占，不存在跨调用的数据可见性。

mod global;
mod pool;
mod pooled_buffer;

pub use global::{DEFAULT_BUFFER_SIZE, default_pool};
pub use pool::{BufferPool, DEFAULT_MAX_BUFFERS, PoolStats};
pub use pooled_buffer::{BufferRecycler, PooledBuffer, ReclaimedBuffer};
