//! 执行上下文传播
//! Execution context propagation
//!
//! 每个逻辑执行上下文（原生线程或 tokio 任务）持有自己的活动 Span 栈、会话标识和抑制标志。
//! Every logical execution context (native thread or tokio task) owns its own
//! active-span stack, session identifiers and suppression flag.
//!
//! 派生子上下文时只复制父上下文当前的栈顶和标识，之后两者互不可见。
//! Forking a child copies the parent's current stack top and identifiers;
//! afterwards pushes and pops on either side are invisible to the other.
//!
//! 查找顺序：任务作用域（[`ExecutionContext::scope`]、[`spawn`]），
//! 然后是按任务 ID 保存的未作用域 tokio 任务上下文，最后是线程本地存储。
//! Lookup order: the task scope installed by [`ExecutionContext::scope`] or
//! [`spawn`], then a per-task-id context for plain `tokio::spawn` tasks, then
//! the thread-local context.
//!
//! 普通 `tokio::spawn` 的任务从空上下文开始；需要继承父 Span 和会话时使用 [`spawn`]。
//! A plain `tokio::spawn` task starts from an empty context; use [`spawn`] to
//! inherit the parent span and session.

use super::context::{SpanId, SpanRef};
use super::session::SessionContext;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::marker::PhantomData;
use tokio::task::Id as TaskId;
use tracing::{debug, warn};

/// 同时保留上下文的未作用域任务数上限
/// Maximum number of unscoped tasks whose context is kept at once
pub const MAX_UNSCOPED_TASKS: usize = 10_000;

thread_local! {
    static THREAD_CONTEXT: RefCell<ExecutionContext> = RefCell::new(ExecutionContext::default());
}

tokio::task_local! {
    static TASK_CONTEXT: RefCell<ExecutionContext>;
}

lazy_static::lazy_static! {
    static ref UNSCOPED_TASKS: Mutex<UnscopedTasks> = Mutex::new(UnscopedTasks::default());
}

/// 执行上下文
/// Execution context
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    /// 活动 Span 栈，栈顶为最内层
    /// Active-span stack, innermost on top
    stack: Vec<SpanRef>,
    /// 会话标识
    /// Session identifiers
    pub(crate) session: SessionContext,
    /// 是否抑制 Span 生成
    /// Whether span emission is suppressed
    suppressed: bool,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, session: SessionContext) -> Self {
        self.session = session;
        self
    }

    pub fn with_suppressed(mut self, suppressed: bool) -> Self {
        self.suppressed = suppressed;
        self
    }

    /// 当前栈顶
    /// Current top of stack
    pub fn current_span(&self) -> Option<SpanRef> {
        self.stack.last().copied()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    /// 派生子上下文：复制栈顶、会话标识和抑制标志
    /// Fork a child context: copies the stack top, session and suppression flag
    pub fn fork(&self) -> Self {
        Self {
            stack: self.current_span().into_iter().collect(),
            session: self.session.clone(),
            suppressed: self.suppressed,
        }
    }

    pub(crate) fn push(&mut self, span: SpanRef) {
        self.stack.push(span);
    }

    /// 移除指定 Span；返回是否找到
    /// Remove the given span; returns whether it was found
    pub(crate) fn remove(&mut self, span_id: SpanId) -> bool {
        match self.stack.iter().rposition(|s| s.span_id == span_id) {
            Some(pos) if pos + 1 == self.stack.len() => {
                self.stack.pop();
                true
            }
            Some(pos) => {
                warn!(
                    span_id = %span_id,
                    depth = self.stack.len(),
                    "Exiting span that is not on top of the stack"
                );
                self.stack.remove(pos);
                true
            }
            None => false,
        }
    }

    /// 在此上下文中同步执行闭包，结束后恢复之前的上下文
    /// Run a closure inside this context, restoring the previous one afterwards
    pub fn run<R>(self, f: impl FnOnce() -> R) -> R {
        let previous = with_current(|current| std::mem::replace(current, self));
        let _restore = RestoreGuard {
            previous: Some(previous),
        };
        f()
    }

    /// 在此上下文中执行 future，跨越挂起点保持不变
    /// Run a future inside this context; the context survives suspension points
    pub fn scope<F: Future>(self, future: F) -> impl Future<Output = F::Output> {
        TASK_CONTEXT.scope(RefCell::new(self), future)
    }
}

struct RestoreGuard {
    previous: Option<ExecutionContext>,
}

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            try_with_current(|current| *current = previous);
        }
    }
}

/// 未作用域 tokio 任务的上下文，按任务 ID 保存
/// Contexts of unscoped tokio tasks, keyed by task id
///
/// An entry exists only while its context differs from the empty one, so a
/// task that pops its spans and clears its session leaves nothing behind.
/// Tasks that end with state still set are evicted oldest first once the
/// table exceeds [`MAX_UNSCOPED_TASKS`].
#[derive(Default)]
struct UnscopedTasks {
    contexts: HashMap<TaskId, (u64, ExecutionContext)>,
    order: VecDeque<(u64, TaskId)>,
    next_seq: u64,
}

impl UnscopedTasks {
    fn with<R>(&mut self, id: TaskId, f: impl FnOnce(&mut ExecutionContext) -> R) -> R {
        let (seq, mut ctx, is_new) = match self.contexts.remove(&id) {
            Some((seq, ctx)) => (seq, ctx, false),
            None => {
                self.next_seq += 1;
                (self.next_seq, ExecutionContext::default(), true)
            }
        };
        let result = f(&mut ctx);

        if ctx != ExecutionContext::default() {
            if is_new {
                self.order.push_back((seq, id));
            }
            self.contexts.insert(id, (seq, ctx));
            self.evict();
        }
        result
    }

    fn evict(&mut self) {
        while self.contexts.len() > MAX_UNSCOPED_TASKS {
            let Some((seq, id)) = self.order.pop_front() else {
                break;
            };
            if self.contexts.get(&id).is_some_and(|(live, _)| *live == seq) {
                self.contexts.remove(&id);
                warn!(task_id = %id, "Evicting execution context of unscoped task");
            }
        }
        // 清理已移除条目留下的顺序记录
        // Drop order records of entries that are already gone
        if self.order.len() > self.contexts.len() * 2 + 64 {
            let contexts = &self.contexts;
            self.order
                .retain(|(seq, id)| contexts.get(id).is_some_and(|(live, _)| live == seq));
        }
    }
}

fn in_task_scope() -> bool {
    TASK_CONTEXT.try_with(|_| ()).is_ok()
}

/// 访问当前执行上下文：任务作用域、未作用域任务、线程本地
/// Access the current execution context: task scope, unscoped task, then
/// thread-local
///
/// `f` must not re-enter the propagator.
pub(crate) fn with_current<R>(f: impl FnOnce(&mut ExecutionContext) -> R) -> R {
    if in_task_scope() {
        TASK_CONTEXT.with(|cell| f(&mut cell.borrow_mut()))
    } else if let Some(id) = tokio::task::try_id() {
        UNSCOPED_TASKS.lock().with(id, f)
    } else {
        THREAD_CONTEXT.with(|cell| f(&mut cell.borrow_mut()))
    }
}

/// 同上，但在线程本地存储已销毁时返回 None
/// As above, but yields None once thread-local storage is being torn down
pub(crate) fn try_with_current<R>(f: impl FnOnce(&mut ExecutionContext) -> R) -> Option<R> {
    if in_task_scope() {
        TASK_CONTEXT.try_with(|cell| f(&mut cell.borrow_mut())).ok()
    } else if let Some(id) = tokio::task::try_id() {
        Some(UNSCOPED_TASKS.lock().with(id, f))
    } else {
        THREAD_CONTEXT
            .try_with(|cell| f(&mut cell.borrow_mut()))
            .ok()
    }
}

/// 当前执行上下文的快照
/// Snapshot of the current execution context
pub fn current() -> ExecutionContext {
    with_current(|ctx| ctx.clone())
}

/// 当前活动 Span
/// Currently active span
pub fn current_span() -> Option<SpanRef> {
    with_current(|ctx| ctx.current_span())
}

/// 从当前上下文派生子上下文
/// Fork a child context from the current one
pub fn fork_current() -> ExecutionContext {
    with_current(|ctx| ctx.fork())
}

/// 在给定上下文中同步执行闭包
/// Run a closure inside the given context
pub fn in_context<R>(ctx: ExecutionContext, f: impl FnOnce() -> R) -> R {
    ctx.run(f)
}

/// 进入 Span：压栈并返回守卫，守卫释放时出栈
/// Enter a span: pushes it and returns a guard that pops it on drop
pub fn enter(span: SpanRef) -> ContextGuard {
    push(span);
    ContextGuard {
        span,
        _not_send: PhantomData,
    }
}

/// 压栈但不返回守卫；调用方负责之后调用 [`exit`]
/// Push without a guard; the caller is responsible for calling [`exit`]
pub(crate) fn push(span: SpanRef) {
    with_current(|ctx| ctx.push(span));
}

/// 退出 Span；不在当前上下文中时忽略
/// Exit a span; ignored when the span is not in the current context
pub fn exit(span: SpanRef) {
    match try_with_current(|ctx| ctx.remove(span.span_id)) {
        Some(true) => {}
        Some(false) => debug!(span_id = %span.span_id, "Span not active in current context"),
        None => debug!(span_id = %span.span_id, "Execution context already torn down"),
    }
}

/// 出栈守卫，正常返回、错误和 panic 路径上都会出栈
/// Pop guard; pops on normal, error and panic paths alike
#[must_use = "dropping the guard exits the span immediately"]
pub struct ContextGuard {
    span: SpanRef,
    _not_send: PhantomData<*const ()>,
}

impl ContextGuard {
    pub fn span(&self) -> SpanRef {
        self.span
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        exit(self.span);
    }
}

/// 在派生上下文中启动 tokio 任务
/// Spawn a tokio task inside a forked context
pub fn spawn<F>(future: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let ctx = fork_current();
    tokio::spawn(ctx.scope(future))
}

/// 在派生上下文中执行阻塞闭包
/// Run a blocking closure inside a forked context
pub fn spawn_blocking<F, R>(f: F) -> tokio::task::JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let ctx = fork_current();
    tokio::task::spawn_blocking(move || ctx.run(f))
}

/// 在派生上下文中启动原生线程
/// Spawn a native thread inside a forked context
pub fn spawn_thread<F, R>(f: F) -> std::thread::JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let ctx = fork_current();
    std::thread::spawn(move || ctx.run(f))
}

/// 是否处于抑制区域
/// Whether span emission is suppressed here
pub fn is_suppressed() -> bool {
    with_current(|ctx| ctx.suppressed)
}

/// 在抑制区域内执行闭包，期间不产生任何 Span
/// Run a closure with span emission suppressed for nested units of work
pub fn suppress_instrumentation<R>(f: impl FnOnce() -> R) -> R {
    let previous = with_current(|ctx| std::mem::replace(&mut ctx.suppressed, true));
    let _restore = SuppressGuard { previous };
    f()
}

/// 异步版本
/// Async variant
pub fn suppress_instrumentation_async<F: Future>(future: F) -> impl Future<Output = F::Output> {
    fork_current().with_suppressed(true).scope(future)
}

struct SuppressGuard {
    previous: bool,
}

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        try_with_current(|ctx| ctx.suppressed = previous);
    }
}
