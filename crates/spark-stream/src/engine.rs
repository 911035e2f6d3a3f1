//! 流式引擎：抓取 → 转换 → 编码 → 缓冲 → 刷写。
//!
//! # 模块定位（Why）
//! - 把可能非常大的、惰性产出的条目序列编码为一个 JSON 数组，并以分块形式交给消费方，
//!   内存占用只与刷写阈值和队列深度相关，而与结果集大小无关；
//! - 单条目模式（[`StreamEngine::stream`]）与批量模式（[`StreamEngine::stream_batch`]）共享同一套
//!   状态机与编码/刷写逻辑，区别只在“一个入站事件映射为几个输出值”。
//!
//! # 状态机（How）
//! ```text
//! START → EMIT_OPEN → FETCH_WAIT ⇄ {TRANSFORM, ENCODE, APPEND, MAYBE_FLUSH} → EMIT_CLOSE → DONE
//!                          │
//!                          ├─ 抓取/转换/编码错误 → FAILED（输出一个错误分块）
//!                          └─ 取消令牌触发       → CANCELLED（不再输出任何分块）
//! ```
//! - 每次调用派生一个编排任务；抓取器自行运行生产任务，两者通过有界条目队列（深度 `queue_depth`）
//!   与至多一次的错误槽通信；
//! - 编排任务用 `tokio::select!` 同时等待取消、错误与下一个条目；
//! - 输出侧同样是有界队列：消费方变慢时，编排任务阻塞在入队上，进而不再从条目队列取数，
//!   抓取器随之被背压。
//!
//! # 契约（What）
//! - 所有数据分块按序拼接恰好是一个合法 JSON 数组（零条目时为 `[]`），`]` 只出现在最后一个分块；
//! - 刷写判断为“追加后长度严格大于阈值”，单个超大条目可以让某个分块暂时超过阈值；
//! - 首个错误以恰好一个错误分块结束序列；取消时序列直接结束，不输出残缺分块。
//! - 转换函数 panic 同样视为转换错误（`transformer error: transformer panicked`），
//!   序列仍以错误分块结束，而不是静默截断。

use std::{
    iter,
    panic::{self, AssertUnwindSafe},
};

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use spark_stream_buffer::{BufferPool, PooledBuffer};
use tokio::{
    runtime::{Handle, RuntimeFlavor},
    sync::{mpsc, oneshot},
    task,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, trace, warn};

use crate::{
    config::StreamConfig,
    contract::{BatchFetcher, BatchTransformer, DataFetcher, FetchContext, FetchStreams, Transformer},
    error::{BoxError, StreamError},
    output::{ChunkStream, OutputChunk, StreamResult},
};

const ARRAY_OPEN: &[u8] = b"[";
const ARRAY_CLOSE: &[u8] = b"]";
const SEPARATOR: &[u8] = b",";

/// 流式转换引擎。
///
/// # 教案式说明
/// - **意图 (Why)**：配置与缓冲池在引擎构造时确定，并在多次调用之间复用；
/// - **契约 (What)**：
///   - [`new`](Self::new) 为引擎创建独立的缓冲池；[`with_pool`](Self::with_pool) 注入共享池
///     （例如进程级的 [`default_pool`](spark_stream_buffer::default_pool)）；
///   - `stream`/`stream_batch` 需在 Tokio 运行时内调用，编排任务通过 `tokio::spawn` 派生；
/// - **设计权衡 (Trade-offs)**：配置在构造时归一化，调用期间不再重复校验。
#[derive(Clone, Debug)]
pub struct StreamEngine {
    config: StreamConfig,
    pool: BufferPool,
}

impl StreamEngine {
    /// 使用独立缓冲池创建引擎，池的最小容量取自 `buffer_size`。
    pub fn new(config: StreamConfig) -> Self {
        let config = config.validated();
        let pool = BufferPool::new(config.buffer_size());
        Self { config, pool }
    }

    /// 使用外部注入的缓冲池创建引擎。
    pub fn with_pool(config: StreamConfig, pool: BufferPool) -> Self {
        Self {
            config: config.validated(),
            pool,
        }
    }

    /// 归一化后的配置。
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// 引擎使用的缓冲池。
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// 单条目模式：每个抓取到的条目经 `transformer` 映射为一个输出值。
    ///
    /// `cancel` 为调用方的取消令牌；引擎为本次调用派生子令牌，丢弃返回的
    /// [`ChunkStream`] 只会取消本次调用，不影响调用方令牌。
    pub fn stream<T, O, F, X>(
        &self,
        cancel: &CancellationToken,
        fetcher: F,
        transformer: X,
    ) -> StreamResult
    where
        T: Send + 'static,
        O: Serialize + Send + 'static,
        F: DataFetcher<T>,
        X: Transformer<T, O>,
    {
        self.launch(
            cancel,
            "single",
            false,
            move |ctx| fetcher.start(ctx),
            move |_: &CancellationToken| {
                move |item: T| {
                    transformer
                        .transform(item)
                        .map(iter::once)
                        .map_err(StreamError::Transform)
                }
            },
        )
    }

    /// 批量模式：每个抓取到的分组整体交给 `transformer`，再逐个编码输出。
    ///
    /// 分组内任一条目转换失败即终止整条流；转换结果数量与输入不一致同样视为转换错误。
    /// 多线程运行时下，批量转换经 `block_in_place` 执行，不会占住其他任务的工作线程。
    pub fn stream_batch<T, O, F, X>(
        &self,
        cancel: &CancellationToken,
        fetcher: F,
        transformer: X,
    ) -> StreamResult
    where
        T: Send + 'static,
        O: Serialize + Send + 'static,
        F: BatchFetcher<T>,
        X: BatchTransformer<T, O>,
    {
        self.stream_batch_with(cancel, fetcher, move |_| transformer)
    }

    /// 批量模式，转换器由 `build` 基于本次调用的取消令牌构造。
    ///
    /// 传入的令牌与抓取器观察到的令牌相同：调用方取消或消费方丢弃 [`ChunkStream`] 都会触发它，
    /// 因此 [`cancellable_batch`](crate::transform::cancellable_batch) 可以中途放弃正在处理的批次。
    ///
    /// ```ignore
    /// engine.stream_batch_with(&cancel, fetcher, |token| transform::cancellable_batch(token, redact));
    /// ```
    pub fn stream_batch_with<T, O, F, X, B>(
        &self,
        cancel: &CancellationToken,
        fetcher: F,
        build: B,
    ) -> StreamResult
    where
        T: Send + 'static,
        O: Serialize + Send + 'static,
        F: BatchFetcher<T>,
        X: BatchTransformer<T, O>,
        B: FnOnce(CancellationToken) -> X,
    {
        self.launch(
            cancel,
            "batch",
            true,
            move |ctx| fetcher.start_batches(ctx),
            move |invocation: &CancellationToken| {
                let transformer = build(invocation.clone());
                move |batch: Vec<T>| {
                    let expected = batch.len();
                    let values = transformer
                        .transform_batch(batch)
                        .map_err(StreamError::Transform)?;
                    if values.len() != expected {
                        let mismatch: BoxError = format!(
                            "batch transformer returned {} values for {expected} items",
                            values.len()
                        )
                        .into();
                        return Err(StreamError::Transform(mismatch));
                    }
                    Ok(values)
                }
            },
        )
    }

    /// 派生编排任务并返回结果句柄。
    ///
    /// `make_map` 拿到本次调用的取消令牌后构造映射函数；`offload` 为真时映射在
    /// `block_in_place` 中执行。
    fn launch<T, R, S, M, K>(
        &self,
        cancel: &CancellationToken,
        mode: &'static str,
        offload: bool,
        start: S,
        make_map: K,
    ) -> StreamResult
    where
        T: Send + 'static,
        R: IntoIterator + Send + 'static,
        R::Item: Serialize + Send + 'static,
        R::IntoIter: Send + 'static,
        S: FnOnce(FetchContext) -> FetchStreams<T> + Send + 'static,
        M: FnMut(T) -> Result<R, StreamError> + Send + 'static,
        K: FnOnce(&CancellationToken) -> M,
    {
        let invocation = cancel.child_token();
        let map = make_map(&invocation);
        let (output, receiver) = mpsc::channel(self.config.queue_depth());
        let ctx = FetchContext::new(
            invocation.clone(),
            self.config.queue_depth(),
            self.config.batch_size(),
        );
        let orchestrator = Orchestrator {
            cancel: invocation.clone(),
            output,
            pool: self.pool.clone(),
            threshold: self.config.chunk_threshold(),
            offload,
            stats: RunStats::default(),
        };
        tokio::spawn(
            orchestrator
                .run(ctx, start, map)
                .instrument(debug_span!("spark_stream", mode)),
        );
        StreamResult::started(ChunkStream::new(receiver, invocation.drop_guard()))
    }
}

/// 编排任务在一次等待中观察到的事件。
enum Event<T> {
    Cancelled,
    FetchFailed(BoxError),
    ErrorSlotClosed,
    Item(T),
    Exhausted,
}

/// 编排任务的终止原因。
enum Halt {
    /// 正常结束或已输出错误分块。
    Done,
    /// 取消令牌触发或消费方离开，不再输出任何分块。
    Abandoned,
}

#[derive(Default)]
struct RunStats {
    items: u64,
    chunks: u64,
    bytes: u64,
}

struct Orchestrator {
    cancel: CancellationToken,
    output: mpsc::Sender<OutputChunk>,
    pool: BufferPool,
    threshold: usize,
    offload: bool,
    stats: RunStats,
}

impl Orchestrator {
    async fn run<T, R, S, M>(mut self, ctx: FetchContext, start: S, map: M)
    where
        R: IntoIterator,
        R::Item: Serialize,
        S: FnOnce(FetchContext) -> FetchStreams<T>,
        M: FnMut(T) -> Result<R, StreamError>,
    {
        let writer = JsonArrayWriter::open(&self.pool, self.threshold);
        debug!(threshold = self.threshold, "stream opened");
        let streams = start(ctx);
        let halt = self.drive(writer, streams, map).await;
        match halt {
            Halt::Done => debug!(
                items = self.stats.items,
                chunks = self.stats.chunks,
                bytes = self.stats.bytes,
                "stream finished"
            ),
            Halt::Abandoned => debug!(
                items = self.stats.items,
                chunks = self.stats.chunks,
                "stream cancelled"
            ),
        }
        // 本次调用结束后通知抓取器停止生产。
        self.cancel.cancel();
    }

    async fn drive<T, R, M>(
        &mut self,
        mut writer: JsonArrayWriter,
        streams: FetchStreams<T>,
        mut map: M,
    ) -> Halt
    where
        R: IntoIterator,
        R::Item: Serialize,
        M: FnMut(T) -> Result<R, StreamError>,
    {
        let FetchStreams {
            mut items,
            mut errors,
        } = streams;
        let mut errors_open = true;

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Event::Cancelled,
                received = &mut errors, if errors_open => match received {
                    Ok(error) => Event::FetchFailed(error),
                    Err(_) => Event::ErrorSlotClosed,
                },
                next = items.recv() => match next {
                    Some(item) => Event::Item(item),
                    None => Event::Exhausted,
                },
            };

            match event {
                Event::Cancelled => return Halt::Abandoned,
                Event::ErrorSlotClosed => errors_open = false,
                Event::FetchFailed(error) => {
                    return self.fail(StreamError::Fetch(error)).await;
                }
                Event::Exhausted => {
                    if errors_open && let Some(error) = pending_error(&mut errors) {
                        return self.fail(StreamError::Fetch(error)).await;
                    }
                    let tail = writer.finish();
                    return if self.emit_data(tail).await {
                        Halt::Done
                    } else {
                        Halt::Abandoned
                    };
                }
                Event::Item(item) => {
                    let values = match self.apply(&mut map, item) {
                        Ok(values) => values,
                        Err(_) if self.cancel.is_cancelled() => return Halt::Abandoned,
                        Err(error) => return self.fail(error).await,
                    };
                    for value in values {
                        if let Err(error) = writer.append(&value) {
                            return self.fail(error).await;
                        }
                        self.stats.items += 1;
                        if let Some(chunk) = writer.take_ready_chunk() {
                            trace!(len = chunk.len(), "flushing chunk");
                            if !self.emit_data(chunk).await {
                                return Halt::Abandoned;
                            }
                        }
                    }
                }
            }
        }
    }

    /// 执行映射；映射函数 panic 时转换为转换错误，编排任务继续负责收尾。
    fn apply<T, R, M>(&self, map: &mut M, item: T) -> Result<R, StreamError>
    where
        M: FnMut(T) -> Result<R, StreamError>,
    {
        let guarded = move || match panic::catch_unwind(AssertUnwindSafe(move || map(item))) {
            Ok(outcome) => outcome,
            Err(_) => Err(StreamError::Transform("transformer panicked".into())),
        };
        // `block_in_place` 只能在多线程运行时中调用。
        if self.offload && Handle::current().runtime_flavor() == RuntimeFlavor::MultiThread {
            task::block_in_place(guarded)
        } else {
            guarded()
        }
    }

    /// 输出错误分块并结束本次调用。
    async fn fail(&mut self, error: StreamError) -> Halt {
        warn!(code = error.code(), error = %error, items = self.stats.items, "stream failed");
        if self.emit(OutputChunk::Error(error)).await {
            Halt::Done
        } else {
            Halt::Abandoned
        }
    }

    async fn emit_data(&mut self, chunk: Bytes) -> bool {
        let len = chunk.len() as u64;
        let delivered = self.emit(OutputChunk::Data(chunk)).await;
        if delivered {
            self.stats.chunks += 1;
            self.stats.bytes += len;
        }
        delivered
    }

    /// 入队一个分块；输出队列满时等待，同时响应取消。
    ///
    /// 返回 `false` 表示取消令牌已触发或消费方已丢弃序列。
    async fn emit(&self, chunk: OutputChunk) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.output.send(chunk) => sent.is_ok(),
        }
    }
}

/// 条目队列关闭时，检查错误槽中是否已有尚未被观察到的错误。
fn pending_error(errors: &mut oneshot::Receiver<BoxError>) -> Option<BoxError> {
    errors.try_recv().ok()
}

/// 把编码后的条目累积为 JSON 数组片段的写入器。
///
/// # 契约（What）
/// - `open` 时租借缓冲并写入 `[`；
/// - `append` 在非首个条目前写入 `,`；编码失败时回退到追加前的长度；
/// - `take_ready_chunk` 仅当长度严格大于阈值时取出当前内容并重置缓冲（保留容量）；
/// - `finish` 写入 `]` 并取出最后一个分块；缓冲随写入器的销毁归还池中，恰好一次。
struct JsonArrayWriter {
    buffer: PooledBuffer,
    threshold: usize,
    first: bool,
}

impl JsonArrayWriter {
    fn open(pool: &BufferPool, threshold: usize) -> Self {
        let mut buffer = pool.acquire();
        buffer.extend_from_slice(ARRAY_OPEN);
        Self {
            buffer,
            threshold,
            first: true,
        }
    }

    fn append<V: Serialize>(&mut self, value: &V) -> Result<(), StreamError> {
        let mark = self.buffer.len();
        if !self.first {
            self.buffer.extend_from_slice(SEPARATOR);
        }
        let target: &mut BytesMut = &mut self.buffer;
        if let Err(error) = serde_json::to_writer(target.writer(), value) {
            self.buffer.truncate(mark);
            return Err(StreamError::Encode(error));
        }
        self.first = false;
        Ok(())
    }

    fn take_ready_chunk(&mut self) -> Option<Bytes> {
        if self.buffer.len() > self.threshold {
            let chunk = Bytes::copy_from_slice(&self.buffer);
            self.buffer.reset();
            Some(chunk)
        } else {
            None
        }
    }

    fn finish(mut self) -> Bytes {
        self.buffer.extend_from_slice(ARRAY_CLOSE);
        Bytes::copy_from_slice(&self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser::{Error as _, Serializer};

    struct Unencodable;

    impl Serialize for Unencodable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("value cannot be represented"))
        }
    }

    #[test]
    fn writer_separates_items_and_closes_array() {
        let pool = BufferPool::new(64);
        let mut writer = JsonArrayWriter::open(&pool, 1024);
        writer.append(&1).expect("编码整数");
        writer.append(&"two").expect("编码字符串");
        assert!(writer.take_ready_chunk().is_none(), "未超过阈值不应刷出");
        assert_eq!(&writer.finish()[..], br#"[1,"two"]"#);
        assert_eq!(pool.stats().active_leases, 0, "写入器结束后缓冲应归还");
    }

    #[test]
    fn writer_flushes_only_when_strictly_above_threshold() {
        let pool = BufferPool::new(16);
        // "[1" 长度为 2，等于阈值时不刷出。
        let mut writer = JsonArrayWriter::open(&pool, 2);
        writer.append(&1).expect("编码整数");
        assert!(writer.take_ready_chunk().is_none());
        writer.append(&2).expect("编码整数");
        let chunk = writer.take_ready_chunk().expect("超过阈值应刷出");
        assert_eq!(&chunk[..], b"[1,2");
        writer.append(&3).expect("编码整数");
        assert_eq!(&writer.finish()[..], b",3]");
    }

    #[test]
    fn writer_rolls_back_failed_encoding() {
        let pool = BufferPool::new(16);
        let mut writer = JsonArrayWriter::open(&pool, 1024);
        writer.append(&1).expect("编码整数");
        let error = writer.append(&Unencodable).expect_err("应编码失败");
        assert!(matches!(error, StreamError::Encode(_)));
        assert_eq!(&writer.finish()[..], b"[1]");
    }

    #[test]
    fn empty_array_is_two_bytes() {
        let pool = BufferPool::new(16);
        let writer = JsonArrayWriter::open(&pool, 1);
        assert_eq!(&writer.finish()[..], b"[]");
    }
}
