//! `pool_contract` 集成测试：从 crate 公开 API 视角验证 `BufferPool` 的租借/归还契约。
//!
//! # 测试目标（Why）
//! - 任意租借/归还序列下，租借得到的缓冲长度为 0 且容量不小于 `buffer_size`；
//! - 多线程并发租借时互不可见、统计收敛；
//! - `release(None)`、`shrink_to_fit` 等边界操作行为稳定。

use std::{sync::Arc, thread};

use proptest::prelude::*;
use spark_stream_buffer::{BufferPool, DEFAULT_BUFFER_SIZE, PooledBuffer, default_pool};

/// 租借/归还序列中的单步动作。
#[derive(Clone, Debug)]
enum Step {
    /// 租借一块缓冲并写入给定长度的数据。
    Acquire(usize),
    /// 归还当前持有的第 `n % held` 块缓冲。
    Release(usize),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0usize..4096).prop_map(Step::Acquire),
        any::<usize>().prop_map(Step::Release),
    ]
}

proptest! {
    /// 任意序列下租借结果都满足“长度为 0、容量达标”，且活跃租约数与持有数量一致。
    #[test]
    fn acquired_buffers_are_empty_with_minimum_capacity(
        buffer_size in 1usize..2048,
        steps in proptest::collection::vec(step(), 1..64),
    ) {
        let pool = BufferPool::new(buffer_size);
        let mut held: Vec<PooledBuffer> = Vec::new();
        for step in steps {
            match step {
                Step::Acquire(fill) => {
                    let mut buffer = pool.acquire();
                    prop_assert_eq!(buffer.len(), 0);
                    prop_assert!(buffer.capacity() >= buffer_size);
                    buffer.extend_from_slice(&vec![0xAB; fill]);
                    held.push(buffer);
                }
                Step::Release(n) if !held.is_empty() => {
                    let index = n % held.len();
                    pool.release(Some(held.swap_remove(index)));
                }
                Step::Release(_) => pool.release(None),
            }
            prop_assert_eq!(pool.stats().active_leases, held.len());
        }
        drop(held);
        prop_assert_eq!(pool.stats().active_leases, 0);
    }
}

/// 多线程并发租借：每个线程写入自身标记并校验未被其他线程污染。
#[test]
fn concurrent_leases_are_isolated() {
    let pool = Arc::new(BufferPool::new(256));
    let workers: Vec<_> = (0u8..8)
        .map(|marker| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for _ in 0..500 {
                    let mut buffer = pool.acquire();
                    assert!(buffer.is_empty(), "租借得到的缓冲必须为空");
                    buffer.extend_from_slice(&[marker; 128]);
                    assert!(buffer.iter().all(|byte| *byte == marker));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("工作线程不应 panic");
    }
    let stats = pool.stats();
    assert_eq!(stats.active_leases, 0);
    assert_eq!(stats.total_acquired, 8 * 500);
    assert!(stats.pool_misses <= 8, "预热后不应再发生新分配");
}

/// 归还后容量保留：被撑大的缓冲再次租出时仍保持更大容量。
#[test]
fn grown_capacity_is_retained_across_leases() {
    let pool = BufferPool::with_max_buffers(16, 1);
    let grown = {
        let mut buffer = pool.acquire();
        buffer.extend_from_slice(&[1u8; 1024]);
        buffer.capacity()
    };
    let reused = pool.acquire();
    assert!(reused.is_empty());
    assert_eq!(reused.capacity(), grown);
}

/// `shrink_to_fit` 释放自由链表缓存并刷新统计。
#[test]
fn shrink_to_fit_releases_cached_buffers() {
    let pool = BufferPool::new(48);
    let cached_capacity = pool.acquire().capacity();
    let reclaimed = pool.shrink_to_fit();
    assert!(reclaimed >= cached_capacity, "回收字节数至少应覆盖已缓存容量");
    let stats = pool.stats();
    assert_eq!(stats.available_bytes, 0, "收缩后不应保留闲置容量");
    assert_eq!(stats.free_buffers, 0);
}

/// 进程级默认池使用默认容量，且多次获取为同一实例。
#[test]
fn default_pool_is_process_wide() {
    let first = default_pool();
    let second = default_pool();
    assert!(std::ptr::eq(first, second));
    assert_eq!(first.buffer_size(), DEFAULT_BUFFER_SIZE);
    let buffer = first.acquire();
    assert!(buffer.capacity() >= DEFAULT_BUFFER_SIZE);
}
