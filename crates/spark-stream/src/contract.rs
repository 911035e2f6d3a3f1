//! 抓取与转换契约：外部协作者交给引擎的两类回调。
//!
//! # 契约概览（What）
//! - [`DataFetcher`] / [`BatchFetcher`]：拿到 [`FetchContext`] 后异步产出条目（或条目分组），
//!   返回一对一次性序列 [`FetchStreams`]：有界条目队列 + 至多一次的错误槽；
//! - [`Transformer`] / [`BatchTransformer`]：把条目映射为可编码的值，纯函数语义；
//! - 抓取器负责在完成或取消令牌触发时终止两条序列；引擎无法检测未终止的序列，
//!   那属于抓取器的资源泄漏。

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::BoxError;

/// 引擎启动抓取器时传入的上下文。
///
/// - `cancel`：本次调用的取消令牌（调用方令牌的子令牌；消费方放弃输出时同样会触发）；
/// - `queue_depth`：条目队列的深度，[`channel`](Self::channel) 据此创建有界队列；
/// - `batch_size`：批量抓取器建议的每批条数。
#[derive(Clone, Debug)]
pub struct FetchContext {
    cancel: CancellationToken,
    queue_depth: usize,
    batch_size: usize,
}

impl FetchContext {
    pub fn new(cancel: CancellationToken, queue_depth: usize, batch_size: usize) -> Self {
        Self {
            cancel,
            queue_depth: queue_depth.max(1),
            batch_size: batch_size.max(1),
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// 创建一对生产端/消费端：条目队列深度为 `queue_depth`，错误槽深度为 1。
    pub fn channel<T>(&self) -> (FetchSink<T>, FetchStreams<T>) {
        let (item_tx, item_rx) = mpsc::channel(self.queue_depth);
        let (error_tx, error_rx) = oneshot::channel();
        (
            FetchSink {
                items: item_tx,
                error: error_tx,
                cancel: self.cancel.clone(),
            },
            FetchStreams {
                items: item_rx,
                errors: error_rx,
            },
        )
    }
}

/// 抓取器返回给引擎的一次性序列对。
///
/// - `items`：条目队列；所有发送端释放即视为“没有更多条目”；
/// - `errors`：错误槽，最多携带一个错误；发送端未发送就被释放表示“无错误”。
#[derive(Debug)]
pub struct FetchStreams<T> {
    pub items: mpsc::Receiver<T>,
    pub errors: oneshot::Receiver<BoxError>,
}

/// 抓取器持有的生产端。
///
/// `fail` 消费生产端，因此“至多发送一次错误”由所有权保证；
/// 生产端被释放时两条序列同时终止。
#[derive(Debug)]
pub struct FetchSink<T> {
    items: mpsc::Sender<T>,
    error: oneshot::Sender<BoxError>,
    cancel: CancellationToken,
}

impl<T> FetchSink<T> {
    /// 推送一个条目；队列满时等待（背压）。
    ///
    /// 返回 `false` 表示引擎已不再接收（调用结束或取消令牌已触发），抓取器应停止生产。
    pub async fn send(&self, item: T) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.items.send(item) => sent.is_ok(),
        }
    }

    /// 报告数据源失败并结束生产。
    pub fn fail(self, error: impl Into<BoxError>) {
        let _ = self.error.send(error.into());
    }

    /// 取消令牌是否已触发。
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 取消令牌，供抓取器在自身的等待点上组合。
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// 单条目抓取器。
///
/// 任意 `FnOnce(FetchContext) -> FetchStreams<T>` 闭包都满足该契约。
pub trait DataFetcher<T>: Send + 'static {
    /// 启动生产并返回序列对；实现者通常在此处 `tokio::spawn` 自己的生产任务。
    fn start(self, ctx: FetchContext) -> FetchStreams<T>;
}

impl<T, F> DataFetcher<T> for F
where
    F: FnOnce(FetchContext) -> FetchStreams<T> + Send + 'static,
{
    fn start(self, ctx: FetchContext) -> FetchStreams<T> {
        self(ctx)
    }
}

/// 批量抓取器：形状与 [`DataFetcher`] 相同，但每次产出一组条目，组大小可以变化。
pub trait BatchFetcher<T>: Send + 'static {
    fn start_batches(self, ctx: FetchContext) -> FetchStreams<Vec<T>>;
}

impl<T, F> BatchFetcher<T> for F
where
    F: DataFetcher<Vec<T>>,
{
    fn start_batches(self, ctx: FetchContext) -> FetchStreams<Vec<T>> {
        self.start(ctx)
    }
}

/// 单条目转换函数：`item -> value`。
///
/// 实现者不应假设存在调用方未显式提供的共享可变状态。
pub trait Transformer<I, O>: Send + Sync + 'static {
    fn transform(&self, item: I) -> Result<O, BoxError>;
}

impl<I, O, F> Transformer<I, O> for F
where
    F: Fn(I) -> Result<O, BoxError> + Send + Sync + 'static,
{
    fn transform(&self, item: I) -> Result<O, BoxError> {
        self(item)
    }
}

/// 批量转换函数：`items -> values`。
///
/// 输出长度应等于输入长度；任一条目失败即整批失败。
pub trait BatchTransformer<I, O>: Send + Sync + 'static {
    fn transform_batch(&self, items: Vec<I>) -> Result<Vec<O>, BoxError>;
}

impl<I, O, F> BatchTransformer<I, O> for F
where
    F: Fn(Vec<I>) -> Result<Vec<O>, BoxError> + Send + Sync + 'static,
{
    fn transform_batch(&self, items: Vec<I>) -> Result<Vec<O>, BoxError> {
        self(items)
    }
}
