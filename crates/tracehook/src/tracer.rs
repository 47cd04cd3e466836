//! 事件追踪器
//! Event tracer
//!
//! 把工作单元的生命周期通知转换为 Span。每个单元是一个小状态机：
//! Converts unit-of-work lifecycle notifications into spans. Each unit is a
//! small state machine:
//!
//! ```text
//! RUNNING ──complete──▶ COMPLETED
//!    │
//!    ├──fail──────────▶ FAILED
//!    └──drop──────────▶ FAILED (cancelled / panicked)
//! ```
//!
//! 追踪器内部的任何故障（导出错误、导出器 panic、状态序列化 panic）都只记录日志，
//! 不会改变被追踪单元的结果。
//! Faults inside the tracer (export errors, exporter panics, serializer
//! panics) are logged and never change the traced unit's outcome.

use super::attributes;
use super::capture::{self, JsonSerializer, StateSerializer, StateSnapshot};
use super::classify::UnitMetadata;
use super::context::SpanRef;
use super::exporter::SpanExporter;
use super::propagator::{self, ExecutionContext};
use super::registry::{RunRegistry, RunRegistryConfig};
use super::session;
use super::span::{Span, SpanAttribute, SpanData};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub(crate) const CANCELLED_MESSAGE: &str = "unit of work cancelled";
pub(crate) const PANICKED_MESSAGE: &str = "unit of work panicked";
pub(crate) const EXPIRED_MESSAGE: &str = "unit of work expired before completion";
pub(crate) const SHUTDOWN_MESSAGE: &str = "tracer shut down before completion";

/// 追踪器配置
/// Tracer configuration
#[derive(Debug, Clone)]
pub struct TracerConfig {
    /// 服务名称
    /// Service name
    pub service_name: String,
    /// 是否记录状态
    /// Whether state snapshots are attached at all
    pub capture_state: bool,
    /// 是否记录输入状态
    /// Whether input state is attached
    pub capture_input: bool,
    /// 单个快照的最大字节数
    /// Byte limit of a single snapshot
    pub max_state_size: usize,
    /// 回调模式下的运行注册表配置
    /// Run registry used by callback-style notifications
    pub registry: RunRegistryConfig,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            service_name: "tracehook".to_string(),
            capture_state: true,
            capture_input: true,
            max_state_size: capture::DEFAULT_MAX_STATE_SIZE,
            registry: RunRegistryConfig::default(),
        }
    }
}

impl TracerConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_capture_state(mut self, enabled: bool) -> Self {
        self.capture_state = enabled;
        self
    }

    pub fn with_capture_input(mut self, enabled: bool) -> Self {
        self.capture_input = enabled;
        self
    }

    pub fn with_max_state_size(mut self, max_bytes: usize) -> Self {
        self.max_state_size = max_bytes;
        self
    }

    pub fn with_registry(mut self, registry: RunRegistryConfig) -> Self {
        self.registry = registry;
        self
    }
}

/// 工作单元状态
/// Unit-of-work state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Running,
    Completed,
    Failed,
}

/// 写 Span、捕获状态、导出
/// Writes spans, captures state, exports
struct Recorder {
    config: TracerConfig,
    exporter: Arc<dyn SpanExporter>,
    serializer: Arc<dyn StateSerializer>,
}

impl Recorder {
    fn attach_state<S>(&self, span: &Span, value_key: &str, mime_key: &str, state: &S)
    where
        S: Serialize + ?Sized,
    {
        let max_bytes = self.config.max_state_size;
        let serializer = self.serializer.as_ref();
        let snapshot = panic::catch_unwind(AssertUnwindSafe(|| {
            capture::capture_with(serializer, state, max_bytes)
        }))
        .unwrap_or_else(|_| {
            warn!("State serialization panicked");
            StateSnapshot::Unserializable {
                type_name: std::any::type_name::<S>(),
            }
        });

        if snapshot.is_truncated() {
            debug!(key = value_key, "State snapshot truncated");
        }
        span.set_attribute(value_key, snapshot.to_json());
        span.set_attribute(mime_key, snapshot.mime_type());
    }

    fn export(&self, data: SpanData) {
        let span_id = data.id;
        let exporter = self.exporter.as_ref();
        match panic::catch_unwind(AssertUnwindSafe(|| exporter.export(data))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(span_id = %span_id, error = %e, "Span export failed"),
            Err(_) => warn!(span_id = %span_id, "Span exporter panicked"),
        }
    }
}

/// 活动工作单元
/// An active unit of work
///
/// 必须以 [`complete`](Self::complete) 或 [`fail`](Self::fail) 结束；
/// 未结束就被丢弃时（panic 或 future 被取消）记录为 FAILED。
/// Must end through `complete` or `fail`; dropping it unfinished (panic or
/// cancelled future) records it as FAILED.
pub struct ActiveUnit {
    span: Option<Span>,
    recorder: Arc<Recorder>,
    state: UnitState,
    /// 结束时需要从当前上下文弹出的 Span
    /// Span to pop from the current context when the unit ends
    pushed: Option<SpanRef>,
}

impl ActiveUnit {
    /// 抑制区域内的单元不产生 Span
    /// Units inside a suppressed region produce no span
    pub fn is_recording(&self) -> bool {
        self.span.is_some()
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn span_ref(&self) -> Option<SpanRef> {
        self.span.as_ref().map(|s| s.span_ref())
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<SpanAttribute>) {
        if let Some(span) = &self.span {
            span.set_attribute(key, value);
        }
    }

    /// 正常完成：记录输出状态并导出
    /// Normal return: records the output state and exports
    pub fn complete<S>(mut self, output: &S)
    where
        S: Serialize + ?Sized,
    {
        self.pop();
        if let Some(span) = &self.span {
            if self.recorder.config.capture_state {
                self.recorder.attach_state(
                    span,
                    attributes::OUTPUT_VALUE,
                    attributes::OUTPUT_MIME_TYPE,
                    output,
                );
            }
            span.set_ok();
        }
        self.state = UnitState::Completed;
        self.end();
    }

    /// 失败：记录错误事件并导出
    /// Failure: records an exception event and exports
    pub fn fail<E>(mut self, error: &E)
    where
        E: fmt::Debug + fmt::Display + ?Sized,
    {
        self.pop();
        if let Some(span) = &self.span {
            span.record_error(error);
        }
        self.state = UnitState::Failed;
        self.end();
    }

    /// 按结果完成或失败
    /// Complete or fail according to `result`
    pub fn finish<T, E>(self, result: &Result<T, E>)
    where
        T: Serialize,
        E: fmt::Debug + fmt::Display,
    {
        match result {
            Ok(output) => self.complete(output),
            Err(error) => self.fail(error),
        }
    }

    fn abandon(&mut self, message: &str) {
        self.pop();
        if let Some(span) = &self.span {
            span.set_error(message);
        }
        self.state = UnitState::Failed;
        self.end();
    }

    fn pop(&mut self) {
        if let Some(span_ref) = self.pushed.take() {
            propagator::exit(span_ref);
        }
    }

    fn end(&mut self) {
        if let Some(data) = self.span.as_ref().and_then(|s| s.end()) {
            self.recorder.export(data);
        }
    }
}

impl Drop for ActiveUnit {
    fn drop(&mut self) {
        if self.state == UnitState::Running {
            let message = if std::thread::panicking() {
                PANICKED_MESSAGE
            } else {
                CANCELLED_MESSAGE
            };
            self.abandon(message);
        }
    }
}

impl fmt::Debug for ActiveUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveUnit")
            .field("span", &self.span)
            .field("state", &self.state)
            .finish()
    }
}

/// 事件追踪器
/// Event tracer
#[derive(Clone)]
pub struct EventTracer {
    recorder: Arc<Recorder>,
    runs: Arc<RunRegistry<ActiveUnit>>,
}

impl EventTracer {
    pub fn new(config: TracerConfig, exporter: Arc<dyn SpanExporter>) -> Self {
        Self::with_serializer(config, exporter, Arc::new(JsonSerializer))
    }

    pub fn with_serializer(
        config: TracerConfig,
        exporter: Arc<dyn SpanExporter>,
        serializer: Arc<dyn StateSerializer>,
    ) -> Self {
        let runs = Arc::new(RunRegistry::new(config.registry.clone()));
        Self {
            recorder: Arc::new(Recorder {
                config,
                exporter,
                serializer,
            }),
            runs,
        }
    }

    pub fn config(&self) -> &TracerConfig {
        &self.recorder.config
    }

    pub fn exporter(&self) -> &Arc<dyn SpanExporter> {
        &self.recorder.exporter
    }

    /// 打开一个工作单元：创建 Span、分类、写入元数据、会话标识和输入状态
    /// Open a unit of work: create the span, classify it, attach metadata,
    /// session identifiers and the input state
    fn open<I>(&self, meta: &UnitMetadata, input: &I, parent: Option<SpanRef>) -> ActiveUnit
    where
        I: Serialize + ?Sized,
    {
        let mut unit = ActiveUnit {
            span: None,
            recorder: self.recorder.clone(),
            state: UnitState::Running,
            pushed: None,
        };
        if propagator::is_suppressed() {
            return unit;
        }

        let span_ref = parent.map(|p| p.child()).unwrap_or_else(SpanRef::root);
        let kind = meta.classify();
        let name = if meta.name.is_empty() {
            meta.unit_type.clone().unwrap_or_else(|| "unit".to_string())
        } else {
            meta.name.clone()
        };

        let span = Span::new(name, span_ref, parent, kind);
        span.set_attribute(attributes::SPAN_KIND, kind.as_str());
        span.set_attribute(attributes::SERVICE_NAME, self.recorder.config.service_name.as_str());
        if !meta.name.is_empty() {
            span.set_attribute(attributes::NODE_NAME, meta.name.as_str());
        }
        span.set_attributes(
            meta.metadata
                .iter()
                .map(|(k, v)| (k.clone(), SpanAttribute::from_json(v))),
        );
        if !meta.tags.is_empty() {
            span.set_attribute(attributes::TAGS, meta.tags.join(","));
        }

        let session = session::get_session_context();
        if let Some(session_id) = session.session_id {
            span.set_attribute(attributes::SESSION_ID, session_id);
        }
        if let Some(thread_id) = session.thread_id {
            span.set_attribute(attributes::THREAD_ID, thread_id);
        }

        let config = &self.recorder.config;
        if config.capture_state && config.capture_input {
            self.recorder.attach_state(
                &span,
                attributes::INPUT_VALUE,
                attributes::INPUT_MIME_TYPE,
                input,
            );
        }

        unit.span = Some(span);
        unit
    }

    /// 在当前执行上下文中开始一个同步工作单元
    /// Start a synchronous unit of work in the current execution context
    ///
    /// The unit's span becomes the current parent until the unit ends.
    pub fn start_unit<I>(&self, meta: &UnitMetadata, input: &I) -> ActiveUnit
    where
        I: Serialize + ?Sized,
    {
        let mut unit = self.open(meta, input, propagator::current_span());
        if let Some(span_ref) = unit.span_ref() {
            propagator::push(span_ref);
            unit.pushed = Some(span_ref);
        }
        unit
    }

    /// 开始一个异步工作单元，返回它专属的执行上下文
    /// Start an async unit of work together with its own execution context
    ///
    /// The context is a fork of the current one with the unit's span on top;
    /// run the unit's future inside it with [`ExecutionContext::scope`].
    pub fn start_scoped<I>(&self, meta: &UnitMetadata, input: &I) -> (ActiveUnit, ExecutionContext)
    where
        I: Serialize + ?Sized,
    {
        let mut ctx = propagator::fork_current();
        let unit = self.open(meta, input, ctx.current_span());
        if let Some(span_ref) = unit.span_ref() {
            ctx.push(span_ref);
        }
        (unit, ctx)
    }

    /// 追踪同步闭包
    /// Trace a synchronous closure
    pub fn trace<I, T, E, F>(&self, meta: &UnitMetadata, input: &I, f: F) -> Result<T, E>
    where
        I: Serialize + ?Sized,
        T: Serialize,
        E: fmt::Debug + fmt::Display,
        F: FnOnce() -> Result<T, E>,
    {
        let unit = self.start_unit(meta, input);
        let result = f();
        unit.finish(&result);
        result
    }

    /// 追踪 future；跨越 `.await` 时活动 Span 保持不变
    /// Trace a future; the active span survives `.await` points
    pub async fn trace_async<I, T, E, Fut>(
        &self,
        meta: &UnitMetadata,
        input: &I,
        future: Fut,
    ) -> Result<T, E>
    where
        I: Serialize + ?Sized,
        T: Serialize,
        E: fmt::Debug + fmt::Display,
        Fut: Future<Output = Result<T, E>>,
    {
        let (unit, ctx) = self.start_scoped(meta, input);
        let result = ctx.scope(future).await;
        unit.finish(&result);
        result
    }

    /// 回调模式：开始
    /// Callback style: unit started
    ///
    /// The parent is the span registered under `parent_run_id` when it is
    /// still live, otherwise the current execution context's active span.
    /// Callback-style units are not pushed onto the execution context.
    pub fn on_start<I>(
        &self,
        run_id: Uuid,
        parent_run_id: Option<Uuid>,
        meta: &UnitMetadata,
        input: &I,
    ) where
        I: Serialize + ?Sized,
    {
        let parent = parent_run_id
            .and_then(|id| self.runs.with(&id, |unit| unit.span_ref()).flatten())
            .or_else(propagator::current_span);

        let unit = self.open(meta, input, parent);
        unit.set_attribute(attributes::RUN_ID, run_id.to_string());
        if let Some(parent_run_id) = parent_run_id {
            unit.set_attribute(attributes::PARENT_RUN_ID, parent_run_id.to_string());
        }

        for evicted in self.runs.register(run_id, unit) {
            self.expire(evicted);
        }
    }

    /// 回调模式：完成
    /// Callback style: unit finished
    pub fn on_end<O>(&self, run_id: Uuid, output: &O)
    where
        O: Serialize + ?Sized,
    {
        match self.runs.remove(&run_id) {
            Some(unit) => unit.complete(output),
            None => warn!(run_id = %run_id, "on_end for unknown run"),
        }
    }

    /// 回调模式：失败
    /// Callback style: unit failed
    pub fn on_error<E>(&self, run_id: Uuid, error: &E)
    where
        E: fmt::Debug + fmt::Display + ?Sized,
    {
        match self.runs.remove(&run_id) {
            Some(unit) => unit.fail(error),
            None => warn!(run_id = %run_id, "on_error for unknown run"),
        }
    }

    /// 回收过期的回调单元，返回数量
    /// Reclaim expired callback-style units; returns how many
    pub fn reap_expired(&self) -> usize {
        let expired = self.runs.reap_expired();
        let count = expired.len();
        for unit in expired {
            self.expire(unit);
        }
        count
    }

    pub fn active_runs(&self) -> usize {
        self.runs.len()
    }

    fn expire(&self, mut unit: ActiveUnit) {
        debug!(span = ?unit.span_ref(), "Reclaiming unfinished run");
        unit.abandon(EXPIRED_MESSAGE);
    }

    /// 结束所有未完成的回调单元并关闭导出器
    /// Finish every pending callback-style unit and shut the exporter down
    pub fn shutdown(&self) {
        for mut unit in self.runs.drain() {
            unit.abandon(SHUTDOWN_MESSAGE);
        }
        let exporter = self.recorder.exporter.as_ref();
        if let Err(e) = exporter.force_flush() {
            warn!(error = %e, "Exporter flush failed");
        }
        if let Err(e) = exporter.shutdown() {
            warn!(error = %e, "Exporter shutdown failed");
        }
    }
}

impl fmt::Debug for EventTracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTracer")
            .field("config", &self.recorder.config)
            .field("active_runs", &self.runs.len())
            .finish()
    }
}
