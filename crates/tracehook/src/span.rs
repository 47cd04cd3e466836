//! Span 定义和管理
//! Span definition and management
//!
//! 一个 Span 记录一次工作单元的执行：名称、类型、起止时间、状态、属性与事件
//! A span records one unit of work: name, kind, start and end time, status,
//! attributes and events

use super::context::{SpanId, SpanRef, TraceId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Span 类型
/// Span kind of a unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpanKind {
    /// 链式步骤
    /// Chain step
    Chain,
    /// 智能体
    /// Agent
    Agent,
    /// 工具调用
    /// Tool call
    Tool,
    /// 大模型调用
    /// LLM call
    Llm,
    /// 检索器
    /// Retriever
    Retriever,
    /// 未识别
    /// Unrecognized
    #[default]
    Unknown,
}

impl SpanKind {
    pub const ALL: [SpanKind; 6] = [
        SpanKind::Chain,
        SpanKind::Agent,
        SpanKind::Tool,
        SpanKind::Llm,
        SpanKind::Retriever,
        SpanKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Chain => "CHAIN",
            SpanKind::Agent => "AGENT",
            SpanKind::Tool => "TOOL",
            SpanKind::Llm => "LLM",
            SpanKind::Retriever => "RETRIEVER",
            SpanKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for SpanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Span 状态
/// Span status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpanStatus {
    /// 未设置（运行中）
    /// Unset (still running)
    #[default]
    Unset,
    /// 成功
    /// Success
    Ok,
    /// 错误
    /// Error
    Error { message: String },
}

impl SpanStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, SpanStatus::Ok)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SpanStatus::Error { .. })
    }
}

/// Span 属性值
/// Span attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpanAttribute {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl SpanAttribute {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SpanAttribute::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SpanAttribute::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// 把 JSON 标量映射为属性；复合值序列化为字符串
    /// Maps a JSON scalar onto an attribute; composite values become strings
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => SpanAttribute::String(s.clone()),
            serde_json::Value::Bool(b) => SpanAttribute::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => SpanAttribute::Int(i),
                None => SpanAttribute::Float(n.as_f64().unwrap_or_default()),
            },
            other => SpanAttribute::String(other.to_string()),
        }
    }
}

impl From<&str> for SpanAttribute {
    fn from(v: &str) -> Self {
        SpanAttribute::String(v.to_string())
    }
}

impl From<String> for SpanAttribute {
    fn from(v: String) -> Self {
        SpanAttribute::String(v)
    }
}

impl From<i64> for SpanAttribute {
    fn from(v: i64) -> Self {
        SpanAttribute::Int(v)
    }
}

impl From<i32> for SpanAttribute {
    fn from(v: i32) -> Self {
        SpanAttribute::Int(v as i64)
    }
}

impl From<u32> for SpanAttribute {
    fn from(v: u32) -> Self {
        SpanAttribute::Int(v as i64)
    }
}

impl From<f64> for SpanAttribute {
    fn from(v: f64) -> Self {
        SpanAttribute::Float(v)
    }
}

impl From<bool> for SpanAttribute {
    fn from(v: bool) -> Self {
        SpanAttribute::Bool(v)
    }
}

/// Span 事件
/// Span event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    /// 事件名称
    /// Event name
    pub name: String,
    /// 事件时间
    /// Event time
    pub timestamp: DateTime<Utc>,
    /// 事件属性
    /// Event attributes
    pub attributes: HashMap<String, SpanAttribute>,
}

impl SpanEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timestamp: Utc::now(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<SpanAttribute>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// 结构化错误事件：类型、消息、调用链
    /// Structured error event: type, message and trace
    pub fn exception(
        error_type: impl Into<String>,
        message: impl Into<String>,
        trace: impl Into<String>,
    ) -> Self {
        Self::new(EXCEPTION_EVENT)
            .with_attribute(EXCEPTION_TYPE, error_type.into())
            .with_attribute(EXCEPTION_MESSAGE, message.into())
            .with_attribute(EXCEPTION_STACKTRACE, trace.into())
    }

    pub fn attribute(&self, key: &str) -> Option<&SpanAttribute> {
        self.attributes.get(key)
    }
}

pub const EXCEPTION_EVENT: &str = "exception";
pub const EXCEPTION_TYPE: &str = "exception.type";
pub const EXCEPTION_MESSAGE: &str = "exception.message";
pub const EXCEPTION_STACKTRACE: &str = "exception.stacktrace";

/// Span 数据 - 导出记录
/// Span data - the export record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanData {
    /// Span ID
    pub id: SpanId,
    /// Trace ID
    pub trace_id: TraceId,
    /// 父 Span ID
    /// Parent span ID
    pub parent_id: Option<SpanId>,
    /// Span 名称
    /// Span name
    pub name: String,
    /// Span 类型
    /// Span kind
    pub kind: SpanKind,
    /// 开始时间
    /// Start time
    pub start_time: DateTime<Utc>,
    /// 结束时间
    /// End time
    pub end_time: Option<DateTime<Utc>>,
    /// 状态
    /// Status
    pub status: SpanStatus,
    /// 属性
    /// Attributes
    pub attributes: HashMap<String, SpanAttribute>,
    /// 事件
    /// Events
    pub events: Vec<SpanEvent>,
}

impl SpanData {
    pub fn attribute(&self, key: &str) -> Option<&SpanAttribute> {
        self.attributes.get(key)
    }

    /// 持续时间（毫秒）
    /// Duration in milliseconds
    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }
}

/// Span - 追踪的基本单元
/// Span - the basic unit of tracing
///
/// 句柄可克隆，但只有打开它的执行上下文会写入；结束后所有写入都被忽略
/// The handle is cloneable, but only the execution context that opened it
/// writes to it; every write after the end is ignored
pub struct Span {
    inner: Arc<Mutex<SpanData>>,
}

impl Span {
    /// 创建新的 Span
    /// Create a new span
    pub(crate) fn new(
        name: impl Into<String>,
        span_ref: SpanRef,
        parent: Option<SpanRef>,
        kind: SpanKind,
    ) -> Self {
        let data = SpanData {
            id: span_ref.span_id,
            trace_id: span_ref.trace_id,
            parent_id: parent.map(|p| p.span_id),
            name: name.into(),
            kind,
            start_time: Utc::now(),
            end_time: None,
            status: SpanStatus::Unset,
            attributes: HashMap::new(),
            events: Vec::new(),
        };
        Self {
            inner: Arc::new(Mutex::new(data)),
        }
    }

    /// 获取 Span 引用
    /// Get the span reference
    pub fn span_ref(&self) -> SpanRef {
        let inner = self.inner.lock();
        SpanRef::new(inner.trace_id, inner.id)
    }

    /// 获取 Span ID
    /// Get the span ID
    pub fn span_id(&self) -> SpanId {
        self.inner.lock().id
    }

    /// 获取父 Span ID
    /// Get the parent span ID
    pub fn parent_id(&self) -> Option<SpanId> {
        self.inner.lock().parent_id
    }

    /// 是否已结束
    /// Whether the span has ended
    pub fn is_ended(&self) -> bool {
        self.inner.lock().end_time.is_some()
    }

    /// 设置属性
    /// Set an attribute
    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<SpanAttribute>) {
        let mut inner = self.inner.lock();
        if inner.end_time.is_none() {
            inner.attributes.insert(key.into(), value.into());
        }
    }

    /// 批量设置属性
    /// Set several attributes
    pub fn set_attributes(&self, attributes: impl IntoIterator<Item = (String, SpanAttribute)>) {
        let mut inner = self.inner.lock();
        if inner.end_time.is_none() {
            inner.attributes.extend(attributes);
        }
    }

    /// 添加事件
    /// Add an event
    pub fn add_event(&self, event: SpanEvent) {
        let mut inner = self.inner.lock();
        if inner.end_time.is_none() {
            inner.events.push(event);
        }
    }

    /// 设置状态
    /// Set the status
    pub fn set_status(&self, status: SpanStatus) {
        let mut inner = self.inner.lock();
        if inner.end_time.is_none() {
            inner.status = status;
        }
    }

    /// 设置为成功状态
    /// Set the status to OK
    pub fn set_ok(&self) {
        self.set_status(SpanStatus::Ok);
    }

    /// 设置为错误状态
    /// Set the status to ERROR
    pub fn set_error(&self, message: impl Into<String>) {
        self.set_status(SpanStatus::Error {
            message: message.into(),
        });
    }

    /// 记录错误：追加 exception 事件并把状态置为 ERROR
    /// Record an error: appends an exception event and sets the status to ERROR
    pub fn record_error<E>(&self, error: &E)
    where
        E: fmt::Debug + fmt::Display + ?Sized,
    {
        let message = error.to_string();
        self.add_event(SpanEvent::exception(
            std::any::type_name::<E>(),
            message.clone(),
            format!("{:?}", error),
        ));
        self.set_error(message);
    }

    /// 结束 Span，返回结束时刻的数据快照；重复结束返回 None
    /// End the span and return a snapshot of its data; ending twice returns None
    pub fn end(&self) -> Option<SpanData> {
        let mut inner = self.inner.lock();
        if inner.end_time.is_some() {
            return None;
        }
        inner.end_time = Some(Utc::now());
        Some(inner.clone())
    }

    /// 获取 Span 数据
    /// Get the span data
    pub fn data(&self) -> SpanData {
        self.inner.lock().clone()
    }
}

impl Clone for Span {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Span")
            .field("id", &inner.id)
            .field("name", &inner.name)
            .field("kind", &inner.kind)
            .field("ended", &inner.end_time.is_some())
            .finish()
    }
}
