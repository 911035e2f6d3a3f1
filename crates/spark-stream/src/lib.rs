#![doc = r#"
# spark-stream

## 设计动机（Why）
- **定位**：把可能非常大、惰性产出的记录序列转换为分块输出的 JSON 数组，
  内存占用有界，消费方可以边收边转发（例如写入 HTTP 响应体）。
- **架构角色**：外部应用只需提供两个回调契约（抓取器、转换函数），并消费一个输出契约
  （分块序列 + 条目计数提示）；SQL、HTTP、业务脱敏等都留在调用方。

## 核心契约（What）
- [`StreamEngine::stream`] / [`StreamEngine::stream_batch`]：需在 Tokio 运行时中调用，
  返回 [`StreamResult`]，其中 [`ChunkStream`] 是一次性的分块序列；
- 所有数据分块按序拼接恰好构成一个合法 JSON 数组；错误以恰好一个
  [`OutputChunk::Error`] 终止序列；取消时序列直接结束；
- 条目计数提示恒为 `-1`（未知），需要总数的调用方自行计算。

## 实现策略（How）
- 编排任务以 `tokio::select!` 同时等待取消令牌、错误槽与条目队列；
- 编码直接写入从 [`spark_stream_buffer::BufferPool`] 租借的缓冲，超过阈值即刷出并重置；
- [`transform`] 模块提供适配、链式、可取消与并行的转换组合；[`fetch`] 模块提供常用抓取器。

## 风险与考量（Trade-offs）
- 刷写判断发生在追加之后，单个超大条目会让对应分块超过阈值；
- 抓取器必须在完成或取消时终止两条序列，否则编排任务会一直等待直到调用方取消。
"#]

mod config;
mod contract;
mod engine;
mod error;
pub mod fetch;
mod output;
pub mod transform;

pub use config::{
    DEFAULT_BATCH_SIZE, DEFAULT_BUFFER_SIZE, DEFAULT_CHUNK_THRESHOLD, DEFAULT_QUEUE_DEPTH,
    StreamConfig,
};
pub use contract::{
    BatchFetcher, BatchTransformer, DataFetcher, FetchContext, FetchSink, FetchStreams,
    Transformer,
};
pub use engine::StreamEngine;
pub use error::{BoxError, ConfigError, StreamError, TransformError, codes};
pub use output::{
    ChunkStream, CollectedPayload, OutputChunk, STATUS_OK, StreamResult, UNKNOWN_ITEM_COUNT,
};

pub use spark_stream_buffer::{BufferPool, PoolStats, PooledBuffer, default_pool};
pub use tokio_util::sync::CancellationToken;
