//! Span 导出器
//! Span exporters
//!
//! 追踪器同步调用 [`SpanExporter::export`]，实现不得阻塞调用方；
//! 需要异步后端时由 [`BatchSpanExporter`] 转交给后台任务
//! The tracer calls [`SpanExporter::export`] synchronously and sinks must not
//! block; async backends sit behind [`BatchSpanExporter`]

use super::error::{ExportError, ExportResult};
use super::span::SpanData;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// 导出器配置
/// Exporter configuration
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// 服务名称
    /// Service name
    pub service_name: String,
    /// 批量大小
    /// Batch size
    pub batch_size: usize,
    /// 导出间隔（毫秒）
    /// Export interval (milliseconds)
    pub export_interval_ms: u64,
    /// 最大队列大小
    /// Maximum queue size
    pub max_queue_size: usize,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown-service".to_string(),
            batch_size: 512,
            export_interval_ms: 5000,
            max_queue_size: 2048,
        }
    }
}

impl ExporterConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_export_interval(mut self, interval_ms: u64) -> Self {
        self.export_interval_ms = interval_ms.max(1);
        self
    }

    pub fn with_max_queue_size(mut self, max_size: usize) -> Self {
        self.max_queue_size = max_size.max(1);
        self
    }
}

/// 同步 Span 导出接口
/// Synchronous span sink
pub trait SpanExporter: Send + Sync {
    /// 导出一条已结束的 Span
    /// Export one finished span
    fn export(&self, span: SpanData) -> ExportResult<()>;

    fn force_flush(&self) -> ExportResult<()> {
        Ok(())
    }

    fn shutdown(&self) -> ExportResult<()> {
        Ok(())
    }
}

/// 异步批量导出后端
/// Async batch backend
#[async_trait]
pub trait TracingExporter: Send + Sync {
    /// 导出一批 spans
    /// Export a batch of spans
    async fn export(&self, spans: Vec<SpanData>) -> ExportResult<()>;

    /// 关闭导出器
    /// Shutdown exporter
    async fn shutdown(&self) -> ExportResult<()> {
        Ok(())
    }
}

/// Console 导出器 - 输出到日志
/// Console Exporter - writes spans to the log
pub struct ConsoleExporter {
    config: ExporterConfig,
    /// 是否使用 JSON 格式
    /// Whether to use JSON format
    json_format: bool,
    /// 是否只输出摘要
    /// Whether to output summary only
    summary_only: bool,
}

impl ConsoleExporter {
    pub fn new(config: ExporterConfig) -> Self {
        Self {
            config,
            json_format: false,
            summary_only: false,
        }
    }

    pub fn with_json_format(mut self) -> Self {
        self.json_format = true;
        self
    }

    pub fn with_summary_only(mut self) -> Self {
        self.summary_only = true;
        self
    }

    pub(crate) fn format_span(&self, span: &SpanData) -> ExportResult<String> {
        if self.json_format {
            return Ok(serde_json::to_string(span)?);
        }

        let duration = span.duration_ms().unwrap_or(0);
        if self.summary_only {
            return Ok(format!(
                "[{}] {} | trace={} span={} | {}ms | {:?}",
                span.kind, span.name, span.trace_id, span.id, duration, span.status
            ));
        }

        let parent = span
            .parent_id
            .map(|p| p.to_hex())
            .unwrap_or_else(|| "none".to_string());
        let mut attributes: Vec<_> = span.attributes.iter().collect();
        attributes.sort_by(|a, b| a.0.cmp(b.0));

        Ok(format!(
            r#"
┌─ Span ─────────────────────────────────────────────────────
│ Name:      {}
│ Service:   {}
│ Kind:      {}
│ TraceId:   {}
│ SpanId:    {}
│ ParentId:  {}
│ Duration:  {}ms
│ Status:    {:?}
│ Attributes: {:?}
│ Events:    {} events
└────────────────────────────────────────────────────────────"#,
            span.name,
            self.config.service_name,
            span.kind,
            span.trace_id,
            span.id,
            parent,
            duration,
            span.status,
            attributes,
            span.events.len()
        ))
    }
}

impl SpanExporter for ConsoleExporter {
    fn export(&self, span: SpanData) -> ExportResult<()> {
        info!("{}", self.format_span(&span)?);
        Ok(())
    }

    fn shutdown(&self) -> ExportResult<()> {
        info!("Console exporter shutdown");
        Ok(())
    }
}

#[async_trait]
impl TracingExporter for ConsoleExporter {
    async fn export(&self, spans: Vec<SpanData>) -> ExportResult<()> {
        for span in spans {
            SpanExporter::export(self, span)?;
        }
        Ok(())
    }
}

/// 内存导出器 - 保存所有已结束的 Span
/// In-memory exporter - keeps every finished span
#[derive(Default)]
pub struct InMemoryExporter {
    spans: Mutex<Vec<SpanData>>,
    shut_down: AtomicBool,
}

impl InMemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<SpanData> {
        self.spans.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.spans.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.lock().is_empty()
    }

    /// 按名称查找第一条 Span
    /// First span with the given name
    pub fn find(&self, name: &str) -> Option<SpanData> {
        self.spans.lock().iter().find(|s| s.name == name).cloned()
    }

    pub fn clear(&self) {
        self.spans.lock().clear();
    }
}

impl SpanExporter for InMemoryExporter {
    fn export(&self, span: SpanData) -> ExportResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ExportError::Shutdown);
        }
        self.spans.lock().push(span);
        Ok(())
    }

    fn shutdown(&self) -> ExportResult<()> {
        self.shut_down.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl TracingExporter for InMemoryExporter {
    async fn export(&self, spans: Vec<SpanData>) -> ExportResult<()> {
        for span in spans {
            SpanExporter::export(self, span)?;
        }
        Ok(())
    }
}

/// 复合导出器 - 同时导出到多个目标
/// Composite Exporter - Exports to multiple targets simultaneously
pub struct CompositeExporter {
    exporters: Vec<Arc<dyn SpanExporter>>,
}

impl CompositeExporter {
    pub fn new(exporters: Vec<Arc<dyn SpanExporter>>) -> Self {
        Self { exporters }
    }

    pub fn add_exporter(&mut self, exporter: Arc<dyn SpanExporter>) {
        self.exporters.push(exporter);
    }

    fn for_each(&self, op: impl Fn(&dyn SpanExporter) -> ExportResult<()>) -> ExportResult<()> {
        let errors: Vec<String> = self
            .exporters
            .iter()
            .filter_map(|exporter| op(exporter.as_ref()).err())
            .map(|e| e.to_string())
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ExportError::Backend(errors.join("; ")))
        }
    }
}

impl SpanExporter for CompositeExporter {
    fn export(&self, span: SpanData) -> ExportResult<()> {
        self.for_each(|exporter| exporter.export(span.clone()))
    }

    fn force_flush(&self) -> ExportResult<()> {
        self.for_each(|exporter| exporter.force_flush())
    }

    fn shutdown(&self) -> ExportResult<()> {
        self.for_each(|exporter| exporter.shutdown())
    }
}

enum BatchMessage {
    Span(SpanData),
    Flush(oneshot::Sender<()>),
}

/// 异步批处理导出器
/// Asynchronous batch exporter
///
/// 记录通过有界队列交给后台任务；队列满时丢弃并记录日志，从不阻塞调用方
/// Records are handed to a background task over a bounded queue; when the
/// queue is full the record is dropped and logged, never blocking the caller
pub struct BatchSpanExporter {
    sender: Mutex<Option<mpsc::Sender<BatchMessage>>>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BatchSpanExporter {
    /// 必须在 tokio 运行时内调用
    /// Must be called from within a tokio runtime
    pub fn new(exporter: Arc<dyn TracingExporter>, config: ExporterConfig) -> Self {
        let (sender, mut receiver) = mpsc::channel::<BatchMessage>(config.max_queue_size.max(1));

        let export_interval = std::time::Duration::from_millis(config.export_interval_ms.max(1));
        let batch_size = config.batch_size.max(1);

        // 启动后台导出任务
        // Start background export task
        let worker = tokio::spawn(async move {
            let mut buffer = Vec::with_capacity(batch_size);
            let mut interval = tokio::time::interval(export_interval);

            loop {
                tokio::select! {
                    message = receiver.recv() => match message {
                        Some(BatchMessage::Span(span)) => {
                            buffer.push(span);
                            if buffer.len() >= batch_size {
                                export_batch(exporter.as_ref(), &mut buffer).await;
                            }
                        }
                        Some(BatchMessage::Flush(ack)) => {
                            export_batch(exporter.as_ref(), &mut buffer).await;
                            let _ = ack.send(());
                        }
                        None => {
                            export_batch(exporter.as_ref(), &mut buffer).await;
                            if let Err(e) = exporter.shutdown().await {
                                error!("Failed to shut down span backend: {}", e);
                            }
                            debug!("Batch exporter worker stopped");
                            break;
                        }
                    },
                    _ = interval.tick() => {
                        export_batch(exporter.as_ref(), &mut buffer).await;
                    }
                }
            }
        });

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// 导出当前缓冲并等待后台任务确认
    /// Export the current buffer and wait for the worker to acknowledge
    pub async fn flush(&self) -> ExportResult<()> {
        let sender = self.sender.lock().clone().ok_or(ExportError::Shutdown)?;
        let (ack, done) = oneshot::channel();
        sender
            .send(BatchMessage::Flush(ack))
            .await
            .map_err(|_| ExportError::ChannelClosed)?;
        done.await.map_err(|_| ExportError::ChannelClosed)
    }

    /// 关闭队列并等待后台任务导出剩余记录
    /// Close the queue and wait for the worker to drain it
    pub async fn shutdown_and_wait(&self) -> ExportResult<()> {
        self.sender.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker
                .await
                .map_err(|e| ExportError::Backend(format!("Batch worker failed: {}", e)))?;
        }
        Ok(())
    }
}

async fn export_batch(exporter: &dyn TracingExporter, buffer: &mut Vec<SpanData>) {
    if buffer.is_empty() {
        return;
    }
    let to_export: Vec<_> = std::mem::take(buffer);
    let count = to_export.len();
    match exporter.export(to_export).await {
        Ok(()) => debug!(count, "Exported span batch"),
        Err(e) => error!("Failed to export spans: {}", e),
    }
}

impl SpanExporter for BatchSpanExporter {
    fn export(&self, span: SpanData) -> ExportResult<()> {
        let guard = self.sender.lock();
        let sender = guard.as_ref().ok_or(ExportError::Shutdown)?;
        sender.try_send(BatchMessage::Span(span)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!("Span export queue is full, dropping span");
                ExportError::Backend("export queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => ExportError::ChannelClosed,
        })
    }

    fn force_flush(&self) -> ExportResult<()> {
        let guard = self.sender.lock();
        let sender = guard.as_ref().ok_or(ExportError::Shutdown)?;
        let (ack, _) = oneshot::channel();
        sender
            .try_send(BatchMessage::Flush(ack))
            .map_err(|_| ExportError::ChannelClosed)
    }

    fn shutdown(&self) -> ExportResult<()> {
        self.sender.lock().take();
        Ok(())
    }
}
