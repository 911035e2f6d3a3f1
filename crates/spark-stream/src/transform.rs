//! 转换适配器：构建在 [`Transformer`] / [`BatchTransformer`] 契约之上的无状态组合。
//!
//! # 模块定位（Why）
//! - 外部协作者通常只有一个“领域转换函数”（返回值或错误，不认识引擎类型），
//!   这里提供把它包装成引擎契约的适配器，以及链式、可取消、并行等常用组合；
//! - 适配器不依赖任何 I/O，可脱离引擎单独测试和复用。
//!
//! # 组合一览（What）
//! - [`adapt`] / [`adapt_batch`]：包装领域函数，错误附带固定前缀（批量时附带首个失败下标）；
//! - [`cancellable_batch`]：每处理一个条目前检查取消令牌，取消时不返回部分结果；
//! - [`Chain`]：按顺序串联同类型阶段，首个错误原样返回；空链即恒等变换；
//! - [`parallel_batch`]：把一批条目切分给多个工作线程，保持输入顺序，首错即停。

use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    thread,
};

use spin::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    contract::{BatchTransformer, Transformer},
    error::{BoxError, TransformError},
};

/// 由 [`adapt`] 构造的单条目转换器。
#[derive(Clone)]
pub struct Adapted<F> {
    domain: F,
}

/// 把领域函数包装为 [`Transformer`]，错误渲染为 `transformation error: …`。
pub fn adapt<I, O, E, F>(domain: F) -> Adapted<F>
where
    F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
    E: Into<BoxError>,
{
    Adapted { domain }
}

impl<I, O, E, F> Transformer<I, O> for Adapted<F>
where
    F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
    E: Into<BoxError>,
{
    fn transform(&self, item: I) -> Result<O, BoxError> {
        (self.domain)(item).map_err(|err| TransformError::Item(err.into()).into())
    }
}

/// 由 [`adapt_batch`] 构造的批量转换器。
#[derive(Clone)]
pub struct AdaptedBatch<F> {
    domain: F,
}

/// 把逐条的领域函数包装为 [`BatchTransformer`]。
///
/// 按顺序处理，遇到首个失败条目即返回 `transformation error at index N: …`，不返回部分结果。
pub fn adapt_batch<I, O, E, F>(domain: F) -> AdaptedBatch<F>
where
    F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
    E: Into<BoxError>,
{
    AdaptedBatch { domain }
}

impl<I, O, E, F> BatchTransformer<I, O> for AdaptedBatch<F>
where
    F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
    E: Into<BoxError>,
{
    fn transform_batch(&self, items: Vec<I>) -> Result<Vec<O>, BoxError> {
        sequential(&self.domain, items)
    }
}

/// 顺序执行领域函数，首个失败条目携带其下标返回。
fn sequential<I, O, E, F>(domain: &F, items: Vec<I>) -> Result<Vec<O>, BoxError>
where
    F: Fn(I) -> Result<O, E>,
    E: Into<BoxError>,
{
    let mut out = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        match domain(item) {
            Ok(value) => out.push(value),
            Err(err) => {
                return Err(TransformError::AtIndex {
                    index,
                    source: err.into(),
                }
                .into());
            }
        }
    }
    Ok(out)
}

/// 由 [`cancellable_batch`] 构造的可取消批量转换器。
#[derive(Clone)]
pub struct CancellableBatch<F> {
    cancel: CancellationToken,
    domain: F,
}

/// 可感知取消的批量转换。
///
/// 处理每个条目前检查令牌；一旦观察到取消立即返回 [`TransformError::Cancelled`]，
/// 已转换的部分结果被丢弃（全有或全无）。
pub fn cancellable_batch<I, O, E, F>(cancel: CancellationToken, domain: F) -> CancellableBatch<F>
where
    F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
    E: Into<BoxError>,
{
    CancellableBatch { cancel, domain }
}

impl<I, O, E, F> BatchTransformer<I, O> for CancellableBatch<F>
where
    F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
    E: Into<BoxError>,
{
    fn transform_batch(&self, items: Vec<I>) -> Result<Vec<O>, BoxError> {
        let mut out = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(TransformError::Cancelled.into());
            }
            match (self.domain)(item) {
                Ok(value) => out.push(value),
                Err(err) => {
                    return Err(TransformError::AtIndex {
                        index,
                        source: err.into(),
                    }
                    .into());
                }
            }
        }
        Ok(out)
    }
}

type Stage<T> = Box<dyn Fn(T) -> Result<T, BoxError> + Send + Sync>;

/// 同类型阶段的有序链。
///
/// # 契约（What）
/// - 阶段按加入顺序从左到右执行；
/// - 首个失败阶段的错误原样返回，不再包装；
/// - 空链是恒等变换。
pub struct Chain<T> {
    stages: Vec<Stage<T>>,
}

impl<T> Chain<T> {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// 在链尾追加一个阶段。
    pub fn then<F>(mut self, stage: F) -> Self
    where
        F: Fn(T) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// 依次执行所有阶段。
    pub fn apply(&self, item: T) -> Result<T, BoxError> {
        self.stages.iter().try_fold(item, |acc, stage| stage(acc))
    }
}

impl<T> Default for Chain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Chain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("stages", &self.stages.len())
            .finish()
    }
}

impl<T: 'static> Transformer<T, T> for Chain<T> {
    fn transform(&self, item: T) -> Result<T, BoxError> {
        self.apply(item)
    }
}

/// 由阶段列表直接构造 [`Chain`]。
pub fn chain<T>(stages: Vec<Stage<T>>) -> Chain<T> {
    Chain { stages }
}

/// 由 [`parallel_batch`] 构造的并行批量转换器。
#[derive(Clone)]
pub struct ParallelBatch<F> {
    workers: usize,
    domain: F,
}

/// 并行批量转换，仅适用于 CPU 密集型的领域函数。
///
/// # 契约（What）
/// - 批次被切分为 `min(workers, len)` 段连续区间，各段交给一个作用域线程；`workers == 0` 按 1 处理；
/// - 输出顺序与输入一致，与各线程的完成先后无关；
/// - 任一条目失败后，其余线程在处理下一个条目前观察到停止标志并退出；
///   结果要么完整，要么整体被首个错误（`transformation error at index N: …`）取代；
/// - 空批次直接返回空结果，不派生线程。
pub fn parallel_batch<I, O, E, F>(workers: usize, domain: F) -> ParallelBatch<F>
where
    F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
    E: Into<BoxError>,
{
    ParallelBatch {
        workers: workers.max(1),
        domain,
    }
}

impl<F> ParallelBatch<F> {
    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl<I, O, E, F> BatchTransformer<I, O> for ParallelBatch<F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
    E: Into<BoxError>,
{
    fn transform_batch(&self, items: Vec<I>) -> Result<Vec<O>, BoxError> {
        let total = items.len();
        if total == 0 {
            return Ok(Vec::new());
        }
        let workers = self.workers.min(total);
        if workers == 1 {
            return sequential(&self.domain, items);
        }

        let segments = split_segments(items, workers);
        let stop = AtomicBool::new(false);
        let first_error: Mutex<Option<(usize, BoxError)>> = Mutex::new(None);
        let domain = &self.domain;

        let outputs: Vec<Option<Vec<O>>> = thread::scope(|scope| {
            let handles: Vec<_> = segments
                .into_iter()
                .map(|(offset, segment)| {
                    let stop = &stop;
                    let first_error = &first_error;
                    scope.spawn(move || {
                        let mut out = Vec::with_capacity(segment.len());
                        for (position, item) in segment.into_iter().enumerate() {
                            if stop.load(Ordering::Acquire) {
                                return None;
                            }
                            match domain(item) {
                                Ok(value) => out.push(value),
                                Err(err) => {
                                    let mut slot = first_error.lock();
                                    if slot.is_none() {
                                        *slot = Some((offset + position, err.into()));
                                    }
                                    stop.store(true, Ordering::Release);
                                    return None;
                                }
                            }
                        }
                        Some(out)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or(None))
                .collect()
        });

        if let Some((index, source)) = first_error.into_inner() {
            return Err(TransformError::AtIndex { index, source }.into());
        }
        let mut merged = Vec::with_capacity(total);
        for segment in outputs {
            match segment {
                Some(values) => merged.extend(values),
                None => {
                    return Err(TransformError::Item("parallel worker terminated abnormally".into())
                        .into());
                }
            }
        }
        Ok(merged)
    }
}

/// 把 `items` 切分为 `parts` 段尽量等长的连续区间，返回 `(起始下标, 条目)`。
fn split_segments<I>(items: Vec<I>, parts: usize) -> Vec<(usize, Vec<I>)> {
    let total = items.len();
    let base = total / parts;
    let extra = total % parts;
    let mut iter = items.into_iter();
    let mut offset = 0;
    (0..parts)
        .map(|part| {
            let len = base + usize::from(part < extra);
            let segment: Vec<I> = iter.by_ref().take(len).collect();
            let start = offset;
            offset += len;
            (start, segment)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn double(x: i64) -> Result<i64, BoxError> {
        Ok(x * 2)
    }

    fn fail_on_negative(x: i64) -> Result<i64, BoxError> {
        if x < 0 {
            Err(format!("negative input {x}").into())
        } else {
            Ok(x)
        }
    }

    #[test]
    fn adapt_prefixes_errors() {
        let transformer = adapt(fail_on_negative);
        assert_eq!(transformer.transform(4).expect("正数应通过"), 4);
        let err = transformer.transform(-1).expect_err("负数应失败");
        assert_eq!(err.to_string(), "transformation error: negative input -1");
    }

    #[test]
    fn adapt_batch_reports_first_failing_index() {
        let transformer = adapt_batch(fail_on_negative);
        let err = transformer
            .transform_batch(vec![1, 2, -3, -4])
            .expect_err("批次中含负数");
        assert_eq!(
            err.to_string(),
            "transformation error at index 2: negative input -3"
        );
        let ok = transformer.transform_batch(vec![5, 6]).expect("全部为正");
        assert_eq!(ok, vec![5, 6]);
    }

    #[test]
    fn cancellable_batch_is_all_or_nothing() {
        let cancel = CancellationToken::new();
        let observed = cancel.clone();
        let transformer = cancellable_batch(cancel.clone(), move |x: i64| {
            if x == 2 {
                observed.cancel();
            }
            Ok::<_, BoxError>(x)
        });
        let err = transformer
            .transform_batch(vec![1, 2, 3])
            .expect_err("中途取消");
        let err = err
            .downcast::<TransformError>()
            .expect("应为 TransformError");
        assert!(matches!(*err, TransformError::Cancelled));

        let fresh = cancellable_batch(CancellationToken::new(), double);
        assert_eq!(
            fresh.transform_batch(vec![1, 2, 3]).expect("未取消"),
            vec![2, 4, 6]
        );
    }

    #[test]
    fn chain_applies_left_to_right_and_passes_errors_through() {
        let chain = Chain::new()
            .then(|x: i64| Ok(x + 1))
            .then(|x: i64| Ok(x * 10));
        assert_eq!(chain.transform(1).expect("链执行成功"), 20);

        let failing = Chain::new()
            .then(|_: i64| Err::<i64, BoxError>("stage one failed".into()))
            .then(|_: i64| panic!("失败后不应执行后续阶段"));
        let err = failing.transform(1).expect_err("首阶段失败");
        assert_eq!(err.to_string(), "stage one failed");
    }

    #[test]
    fn empty_chain_is_identity() {
        let identity: Chain<String> = chain(Vec::new());
        assert!(identity.is_empty());
        assert_eq!(identity.transform("same".to_owned()).expect("恒等"), "same");
    }

    #[test]
    fn parallel_batch_matches_sequential_for_any_worker_count() {
        let input: Vec<i64> = (0..97).collect();
        let expected: Vec<i64> = input.iter().map(|x| x * 2).collect();
        for workers in [0, 1, 2, 3, 8, 200] {
            let transformer = parallel_batch(workers, double);
            let out = transformer
                .transform_batch(input.clone())
                .expect("并行转换成功");
            assert_eq!(out, expected, "workers = {workers}");
        }
    }

    #[test]
    fn parallel_batch_handles_empty_batch() {
        let transformer = parallel_batch(4, double);
        assert!(
            transformer
                .transform_batch(Vec::new())
                .expect("空批次")
                .is_empty()
        );
    }

    #[test]
    fn parallel_batch_discards_results_on_error() {
        let transformer = parallel_batch(3, fail_on_negative);
        let err = transformer
            .transform_batch(vec![1, 2, 3, 4, -5, 6, 7, 8, 9])
            .expect_err("含负数");
        let err = err
            .downcast::<TransformError>()
            .expect("应为 TransformError");
        assert_eq!(err.index(), Some(4));
    }

    #[test]
    fn split_segments_covers_all_items_in_order() {
        let segments = split_segments((0..10).collect::<Vec<_>>(), 3);
        let offsets: Vec<usize> = segments.iter().map(|(offset, _)| *offset).collect();
        assert_eq!(offsets, vec![0, 4, 7]);
        let flattened: Vec<i32> = segments.into_iter().flat_map(|(_, seg)| seg).collect();
        assert_eq!(flattened, (0..10).collect::<Vec<_>>());
    }
}
