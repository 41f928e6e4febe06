use crate::{Error, sealed::Sealed};
use alloc::borrow::Cow;
use alloc::sync::Arc;
use core::fmt;

/// `CoreError` is the single error domain shared by every fallible operation in this crate.
///
/// # 设计背景（Why）
/// - 通道状态机、Pipeline 调度与出站缓冲在出错时需要一个跨层统一的错误形态，
///   以便 `fire_exception_caught`、日志 Sink 与测试断言都能对同一结构做模式匹配。
/// - 保持 `no_std + alloc` 可用性，不直接依赖 `std::error::Error`。
///
/// # 契约说明（What）
/// - `code`：稳定的 `'static` 字符串，遵循 `<domain>.<reason>` 命名（见 [`codes`]）。
/// - `message`：面向排障人员的自然语言描述。
/// - `cause`：可选的底层原因，保持错误链可回溯。
/// - `category`：驱动自动化策略（重试/取消/超时）的结构化分类，见 [`ErrorCategory`]。
#[derive(Debug, Clone)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<ErrorCause>,
    category: Option<ErrorCategory>,
}

impl CoreError {
    /// 构造核心错误，默认不含底层原因与显式分类。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            category: None,
        }
    }

    /// 附带底层原因并返回新的核心错误。
    ///
    /// The cause is stored behind an `Arc` rather than a `Box` so that a
    /// single underlying failure (e.g. one transport error during a flush)
    /// can be cheaply fanned out into many independent [`CoreError`] values
    /// without re-boxing or losing the source chain.
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// 为现有错误设置底层原因。
    pub fn set_cause(&mut self, cause: impl Error + Send + Sync + 'static) {
        self.cause = Some(Arc::new(cause));
    }

    /// 附带结构化分类。
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// 就地更新分类信息。
    pub fn set_category(&mut self, category: ErrorCategory) {
        self.category = Some(category);
    }

    /// 获取结构化错误分类；若未显式设置，按错误码回退到一个保守的默认值。
    pub fn category(&self) -> ErrorCategory {
        self.category
            .clone()
            .unwrap_or_else(|| default_category_for(self.code))
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 获取描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 获取底层原因。
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_ref()
            .map(|boxed| boxed.as_ref() as &(dyn Error + 'static))
    }
}

impl Sealed for CoreError {}

/// 错误分类枚举，驱动自动化容错策略。
///
/// # 契约说明（What）
/// - `Retryable`：调用方可在退避后重试。
/// - `NonRetryable`：确定性失败，重试无意义。
/// - `Cancelled` / `Timeout`：对应 Promise 的取消与超时语义。
/// - `ProtocolViolation`：对端或本地违反了链路协议，通常应触发关闭。
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    Retryable,
    NonRetryable,
    Cancelled,
    Timeout,
    ProtocolViolation,
}

/// `ErrorCause` 封装底层原因，保持 `Send + Sync` 以方便跨线程传递与廉价克隆。
pub type ErrorCause = Arc<dyn Error + Send + Sync + 'static>;

/// 框架统一的返回值别名。
pub type Result<T, E = CoreError> = core::result::Result<T, E>;

/// 本核心内置的稳定错误码集合，对应外部接口约定的错误分类（见该模块的设计说明）。
///
/// 每个常量的命名遵循 `<domain>.<reason>`，对应字段语义见各常量上的注释；
/// 这些码值与该模块所描述的错误分类一一对应，保持可观测系统中的稳定识别符。
pub mod codes {
    /// 操作作用于出站缓冲已置空或 `close_completion` 已完成的通道。
    pub const CLOSED_CHANNEL: &str = "pipeline.closed_channel";
    /// 通道处于 open 但尚未 active 时尝试 flush。
    pub const NOT_YET_CONNECTED: &str = "pipeline.not_yet_connected";
    /// 通道已经连接，重复发起 connect。
    pub const ALREADY_CONNECTED: &str = "pipeline.already_connected";
    /// 已有一次 connect 正在进行。
    pub const CONNECTION_PENDING: &str = "pipeline.connection_pending";
    /// 注册到的执行器与通道已绑定的执行器不兼容。
    pub const INCOMPATIBLE_EXECUTOR: &str = "pipeline.incompatible_executor";
    /// 通道已经完成过一次注册。
    pub const ALREADY_REGISTERED: &str = "pipeline.already_registered";
    /// 执行器拒绝了提交的任务。
    pub const REJECTED_EXECUTION: &str = "pipeline.rejected_execution";
    /// `handler_added`/`handler_removed` 回调抛出的异常包装。
    pub const PIPELINE_EXCEPTION: &str = "pipeline.handler_exception";
    /// 连接被对端拒绝，包装底层 socket 错误与对端地址。
    pub const CONNECT_EXCEPTION: &str = "pipeline.connect_exception";
}

fn default_category_for(code: &str) -> ErrorCategory {
    match code {
        codes::NOT_YET_CONNECTED | codes::CONNECTION_PENDING => ErrorCategory::Retryable,
        codes::PIPELINE_EXCEPTION => ErrorCategory::ProtocolViolation,
        _ => ErrorCategory::NonRetryable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_falls_back_to_code_default_when_unset() {
        let err = CoreError::new(codes::NOT_YET_CONNECTED, "flush before active");
        assert_eq!(err.category(), ErrorCategory::Retryable);
    }

    #[test]
    fn explicit_category_overrides_default() {
        let err = CoreError::new(codes::CLOSED_CHANNEL, "write after close")
            .with_category(ErrorCategory::Cancelled);
        assert_eq!(err.category(), ErrorCategory::Cancelled);
    }

    #[test]
    fn cause_chain_is_observable_through_source() {
        let inner = CoreError::new("inner.code", "inner message");
        let outer = CoreError::new(codes::CONNECT_EXCEPTION, "connect refused").with_cause(inner);
        let as_err: &dyn Error = &outer;
        let source = as_err.source().expect("cause must be present");
        assert_eq!(alloc::format!("{}", source), "[inner.code] inner message");
    }
}
