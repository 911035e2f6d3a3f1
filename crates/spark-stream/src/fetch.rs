//! 常用抓取器构造函数。
//!
//! 这些辅助函数把同步迭代器或异步 `Stream` 适配为 [`DataFetcher`](crate::DataFetcher) /
//! [`BatchFetcher`](crate::BatchFetcher)：在 Tokio 上派生一个生产任务，按队列背压推送条目，
//! 在取消令牌触发、消费端离开或源耗尽时终止两条序列。

use futures::{Stream, StreamExt};

use crate::{
    contract::{FetchContext, FetchStreams},
    error::BoxError,
};

/// 把同步迭代器适配为单条目抓取器。
///
/// 迭代器在生产任务内被逐个推进，适合已在内存中或廉价生成的数据。
pub fn from_iter<I>(items: I) -> impl FnOnce(FetchContext) -> FetchStreams<I::Item> + Send + 'static
where
    I: IntoIterator + Send + 'static,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    move |ctx: FetchContext| {
        let (sink, streams) = ctx.channel();
        tokio::spawn(async move {
            for item in items {
                if !sink.send(item).await {
                    return;
                }
            }
        });
        streams
    }
}

/// 把 `Result` 流适配为单条目抓取器；首个 `Err` 会作为数据源错误上报并结束生产。
pub fn from_stream<S, T, E>(source: S) -> impl FnOnce(FetchContext) -> FetchStreams<T> + Send + 'static
where
    S: Stream<Item = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    move |ctx: FetchContext| {
        let (sink, streams) = ctx.channel();
        tokio::spawn(async move {
            let mut source = Box::pin(source);
            loop {
                let next = tokio::select! {
                    biased;
                    _ = sink.cancellation().cancelled() => return,
                    next = source.next() => next,
                };
                match next {
                    Some(Ok(item)) => {
                        if !sink.send(item).await {
                            return;
                        }
                    }
                    Some(Err(error)) => {
                        sink.fail(error);
                        return;
                    }
                    None => return,
                }
            }
        });
        streams
    }
}

/// 把同步迭代器按 `batch_size` 分组，适配为批量抓取器。
///
/// 最后一组可能不足 `batch_size`；空迭代器不产生任何分组。
pub fn batches_from_iter<I>(
    items: I,
) -> impl FnOnce(FetchContext) -> FetchStreams<Vec<I::Item>> + Send + 'static
where
    I: IntoIterator + Send + 'static,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    move |ctx: FetchContext| {
        let batch_size = ctx.batch_size();
        let (sink, streams) = ctx.channel();
        tokio::spawn(async move {
            let mut iter = items.into_iter();
            loop {
                let batch: Vec<_> = iter.by_ref().take(batch_size).collect();
                if batch.is_empty() {
                    return;
                }
                if !sink.send(batch).await {
                    return;
                }
            }
        });
        streams
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{BatchFetcher, DataFetcher};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn from_iter_yields_items_in_order() {
        let ctx = FetchContext::new(CancellationToken::new(), 2, 10);
        let mut streams = from_iter(vec![1, 2, 3]).start(ctx);
        let mut seen = Vec::new();
        while let Some(item) = streams.items.recv().await {
            seen.push(item);
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(streams.errors.await.is_err(), "正常结束不应产生错误");
    }

    #[tokio::test]
    async fn batches_respect_batch_size() {
        let ctx = FetchContext::new(CancellationToken::new(), 4, 2);
        let mut streams = batches_from_iter(1..=5).start_batches(ctx);
        let mut groups = Vec::new();
        while let Some(group) = streams.items.recv().await {
            groups.push(group);
        }
        assert_eq!(groups, vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[tokio::test]
    async fn from_stream_reports_first_error() {
        let source = futures::stream::iter(vec![
            Ok::<_, BoxError>(1),
            Err("source broke".into()),
            Ok(3),
        ]);
        let ctx = FetchContext::new(CancellationToken::new(), 4, 10);
        let mut streams = from_stream(source).start(ctx);
        assert_eq!(streams.items.recv().await, Some(1));
        assert_eq!(streams.items.recv().await, None);
        let error = streams.errors.await.expect("应收到数据源错误");
        assert_eq!(error.to_string(), "source broke");
    }

    #[tokio::test]
    async fn cancellation_terminates_production() {
        let cancel = CancellationToken::new();
        let ctx = FetchContext::new(cancel.clone(), 1, 10);
        let mut streams = from_iter(0..).start(ctx);
        assert_eq!(streams.items.recv().await, Some(0));
        cancel.cancel();
        // 取消后生产任务退出；队列中可能残留至多 `queue_depth` 个条目。
        let mut drained = 0;
        while streams.items.recv().await.is_some() {
            drained += 1;
        }
        assert!(drained <= 1);
    }
}
