//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义流式引擎对外暴露的错误语义：抓取失败、转换失败、编码失败、取消；
//! - 每个变体附带稳定错误码，便于调用方映射到自己的传输层状态码或告警维度。
//!
//! ## 设计要求（What）
//! - 所有错误均为终止性错误：引擎自身不做重试，重试策略属于重新发起整个调用的外部协作者；
//! - 协作者错误以 [`BoxError`] 形式透传，保留原始 `source` 链。

use std::{error::Error as StdError, io};

use thiserror::Error;

/// 协作者（抓取器、转换函数）返回的不透明错误类型。
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// 流式引擎错误码常量。
pub mod codes {
    pub const FETCH_FAILED: &str = "spark.stream.fetch_failed";
    pub const TRANSFORM_FAILED: &str = "spark.stream.transform_failed";
    pub const ENCODE_FAILED: &str = "spark.stream.encode_failed";
    pub const CANCELLED: &str = "spark.stream.cancelled";
    pub const IO_FAILED: &str = "spark.stream.io_failed";
}

/// 流式引擎错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把一次流式调用可能遇到的四类终止原因区分开，调用方据此决定响应策略；
/// - **契约 (What)**：
///   - 任一错误出现时，输出序列恰好以一个携带该错误的分块结束，之后不再有分块；
///   - “已成功输出一段前缀、随后出现错误分块”是正常的终止形态，消费方必须能处理；
/// - **执行逻辑 (How)**：`Display` 文案带有固定前缀（`fetcher error`、`transformer error` 等），
///   `code()` 返回稳定错误码。
#[derive(Debug, Error)]
pub enum StreamError {
    /// 数据源失败。
    #[error("fetcher error: {0}")]
    Fetch(#[source] BoxError),

    /// 单条或整批转换失败。
    #[error("transformer error: {0}")]
    Transform(#[source] BoxError),

    /// 转换结果无法编码为 JSON。
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),

    /// 调用方取消或放弃了本次调用。
    #[error("stream cancelled")]
    Cancelled,

    /// 将分块转发到外部写端失败。
    #[error("output write failed: {0}")]
    Io(#[from] io::Error),
}

impl StreamError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            StreamError::Fetch(_) => codes::FETCH_FAILED,
            StreamError::Transform(_) => codes::TRANSFORM_FAILED,
            StreamError::Encode(_) => codes::ENCODE_FAILED,
            StreamError::Cancelled => codes::CANCELLED,
            StreamError::Io(_) => codes::IO_FAILED,
        }
    }

    /// 是否由取消引起。
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StreamError::Cancelled)
    }
}

/// 转换适配器产生的错误。
///
/// - `Item`：单条转换失败，文案为 `transformation error: …`；
/// - `AtIndex`：批量转换中首个失败条目的位置，文案为 `transformation error at index N: …`；
/// - `Cancelled`：可感知取消的批量转换在处理途中观察到取消。
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("transformation error: {0}")]
    Item(#[source] BoxError),

    #[error("transformation error at index {index}: {source}")]
    AtIndex {
        index: usize,
        #[source]
        source: BoxError,
    },

    #[error("transformation cancelled")]
    Cancelled,
}

impl TransformError {
    /// 失败条目在批次中的下标；非批量错误返回 `None`。
    pub fn index(&self) -> Option<usize> {
        match self {
            TransformError::AtIndex { index, .. } => Some(*index),
            _ => None,
        }
    }
}

/// 配置文本解析失败。
///
/// 数值校验不会失败（非正数会被替换为默认值），只有语法或类型错误会走到这里。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid stream configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_stage_prefix() {
        let fetch = StreamError::Fetch("connection reset".into());
        assert_eq!(fetch.to_string(), "fetcher error: connection reset");
        assert_eq!(fetch.code(), codes::FETCH_FAILED);

        let transform = StreamError::Transform(
            TransformError::AtIndex {
                index: 3,
                source: "bad row".into(),
            }
            .into(),
        );
        assert_eq!(
            transform.to_string(),
            "transformer error: transformation error at index 3: bad row"
        );
        assert!(StreamError::Cancelled.is_cancelled());
    }

    #[test]
    fn transform_error_exposes_index() {
        let err = TransformError::AtIndex {
            index: 7,
            source: "boom".into(),
        };
        assert_eq!(err.index(), Some(7));
        assert_eq!(TransformError::Item("boom".into()).index(), None);
    }
}
