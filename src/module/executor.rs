//! 操作执行器
//!
//! 模块回调（激活、停用、事件分发）一律在专用工作线程上执行，调用方只在
//! 共享条件变量上等待结果，因此回调运行期间不会持有包锁。
//!
//! - 工作线程空闲超过保活时间后退出；繁忙时新建线程，达到上限则排队。工作线程上
//!   发起的操作从不排队，否则回调等待自己所占的线程会形成死锁。
//! - START/STOP 有超时，从工作线程取到操作时开始计时：超时的调用方标记中止并立即
//!   返回，工作线程在回调最终返回后自行执行镜像的回滚清理。被放弃的线程不计入上限。
//!   事件分发没有超时。
//! - 同一模块同时只有一个 START/STOP 操作；回调内对同一模块再次发起操作会立即得到
//!   非法状态错误。

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, error, warn};

use crate::core::config::{AbortPolicy, ExecutorConfig};
use crate::utils::{CoreError, Result};

/// 操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    BundleEvent,
    Start,
    Stop,
}

impl OperationKind {
    /// 是否受超时与单模块互斥约束
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, OperationKind::Start | OperationKind::Stop)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::BundleEvent => f.write_str("BUNDLE_EVENT"),
            OperationKind::Start => f.write_str("START"),
            OperationKind::Stop => f.write_str("STOP"),
        }
    }
}

/// 执行器统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub workers: usize,
    pub idle: usize,
    pub busy: usize,
    /// 达到线程上限后排队的操作
    pub queued: usize,
    /// 超时后被放弃的操作
    pub abandoned: u64,
    pub completed: u64,
}

thread_local! {
    /// 当前线程正在执行的生命周期操作链（目标模块 id）
    static TARGET_CHAIN: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
    static IN_EVENT_DISPATCH: Cell<bool> = const { Cell::new(false) };
    static ON_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// 当前线程是否处于事件分发回调中
pub fn in_event_dispatch() -> bool {
    IN_EVENT_DISPATCH.with(Cell::get)
}

/// 当前线程是否在执行 START/STOP 回调
pub fn in_lifecycle_operation() -> bool {
    TARGET_CHAIN.with(|c| !c.borrow().is_empty())
}

/// 从 panic 负载中取出消息
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "未知 panic".to_string()
    }
}

type Job = Box<dyn FnOnce() -> bool + Send + 'static>;

#[derive(Default)]
struct OpStatus {
    /// 工作线程取到操作的时刻
    started: Option<Instant>,
    done: bool,
    aborted: bool,
}

#[derive(Default)]
struct Board {
    ops: HashMap<u64, OpStatus>,
    busy_targets: HashSet<u64>,
}

#[derive(Default)]
struct Dispatch {
    idle: Vec<(u64, Sender<Job>)>,
    backlog: VecDeque<Job>,
    shutdown: bool,
}

struct Shared {
    config: ExecutorConfig,
    board: Mutex<Board>,
    completion: Condvar,
    dispatch: Mutex<Dispatch>,
    next_op: AtomicU64,
    next_worker: AtomicU64,
    workers: AtomicUsize,
    busy: AtomicUsize,
    /// 仍在运行已放弃操作的线程
    detached: AtomicUsize,
    abandoned: AtomicU64,
    completed: AtomicU64,
}

impl Shared {
    fn release_target(&self, target: u64) {
        self.board.lock().busy_targets.remove(&target);
        self.completion.notify_all();
    }

    /// 计入线程上限的工作线程数
    fn counted_workers(&self) -> usize {
        self.workers
            .load(Ordering::SeqCst)
            .saturating_sub(self.detached.load(Ordering::SeqCst))
    }

    fn at_capacity(&self) -> bool {
        let max = self.config.max_workers;
        max > 0 && self.counted_workers() >= max
    }
}

/// 已完成操作的模块占用
///
/// 调用方在提交完状态后丢弃它，同一模块的下一个操作才会开始。
pub struct OperationGuard {
    release: Option<(Arc<Shared>, u64)>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if let Some((shared, target)) = self.release.take() {
            shared.release_target(target);
        }
    }
}

/// 操作执行器
pub struct OperationExecutor {
    shared: Arc<Shared>,
}

impl OperationExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                board: Mutex::new(Board::default()),
                completion: Condvar::new(),
                dispatch: Mutex::new(Dispatch::default()),
                next_op: AtomicU64::new(1),
                next_worker: AtomicU64::new(1),
                workers: AtomicUsize::new(0),
                busy: AtomicUsize::new(0),
                detached: AtomicUsize::new(0),
                abandoned: AtomicU64::new(0),
                completed: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.shared.config
    }

    /// 在工作线程上执行操作并等待结果
    ///
    /// # Arguments
    ///
    /// * `target` - 目标模块 id（事件分发时仅用于日志）
    /// * `op` - 在工作线程上运行的回调
    /// * `on_abort` - 调用方超时放弃后，由工作线程在 `op` 返回时执行的清理
    ///
    /// # Errors
    ///
    /// * `IllegalState` - 回调内重入同一模块，或等待模块上的前一个操作超时
    /// * `Timeout` - START/STOP 超过配置的时长
    /// * `Internal` - 回调 panic
    pub fn execute<T, F, A>(
        &self,
        target: u64,
        kind: OperationKind,
        op: F,
        on_abort: A,
    ) -> Result<(T, OperationGuard)>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
        A: FnOnce(T) + Send + 'static,
    {
        let shared = &self.shared;
        let lifecycle = kind.is_lifecycle();
        let timeout = shared.config.operation_timeout();
        let chain = TARGET_CHAIN.with(|c| c.borrow().clone());

        if lifecycle {
            if chain.contains(&target) {
                return Err(CoreError::illegal_state(
                    target,
                    format!("操作链 {} 中不能对同一模块再次发起 {} 操作", format_chain(&chain), kind),
                ));
            }
            let deadline = Instant::now() + timeout;
            let mut board = shared.board.lock();
            while board.busy_targets.contains(&target) {
                if shared.completion.wait_until(&mut board, deadline).timed_out()
                    && board.busy_targets.contains(&target)
                {
                    return Err(CoreError::illegal_state(target, "模块已有进行中的生命周期操作"));
                }
            }
            board.busy_targets.insert(target);
        }

        let op_id = shared.next_op.fetch_add(1, Ordering::SeqCst);
        shared.board.lock().ops.insert(op_id, OpStatus::default());

        let slot: Arc<Mutex<Option<thread::Result<T>>>> = Arc::new(Mutex::new(None));
        let job: Job = {
            let shared = shared.clone();
            let slot = slot.clone();
            let mut job_chain = chain;
            if lifecycle {
                job_chain.push(target);
            }
            let event = kind == OperationKind::BundleEvent || in_event_dispatch();
            Box::new(move || {
                if let Some(status) = shared.board.lock().ops.get_mut(&op_id) {
                    status.started = Some(Instant::now());
                }
                shared.completion.notify_all();
                let outcome = with_context(job_chain, event, || catch_unwind(AssertUnwindSafe(op)));
                shared.completed.fetch_add(1, Ordering::Relaxed);

                let mut board = shared.board.lock();
                let aborted = board.ops.get(&op_id).map(|s| s.aborted).unwrap_or(false);
                if !aborted {
                    *slot.lock() = Some(outcome);
                    if let Some(status) = board.ops.get_mut(&op_id) {
                        status.done = true;
                    }
                    drop(board);
                    shared.completion.notify_all();
                    return false;
                }

                board.ops.remove(&op_id);
                drop(board);
                match outcome {
                    Ok(value) => {
                        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| on_abort(value))) {
                            error!(module_id = target, %kind, panic = %panic_message(&*payload), "中止清理 panic");
                        }
                    }
                    Err(payload) => {
                        warn!(module_id = target, %kind, panic = %panic_message(&*payload), "已放弃的操作 panic");
                    }
                }
                if lifecycle {
                    shared.release_target(target);
                }
                shared.detached.fetch_sub(1, Ordering::SeqCst);
                debug!(module_id = target, %kind, "已放弃操作的清理完成");
                shared.config.abort_policy == AbortPolicy::Retire
            })
        };

        if let Err(e) = self.dispatch(job) {
            shared.board.lock().ops.remove(&op_id);
            if lifecycle {
                shared.release_target(target);
            }
            return Err(e);
        }

        let mut board = shared.board.lock();
        loop {
            let (started, done) = board
                .ops
                .get(&op_id)
                .map(|s| (s.started, s.done))
                .unwrap_or((None, false));
            if done {
                board.ops.remove(&op_id);
                break;
            }
            // 排队中的操作不计时
            let Some(started) = started.filter(|_| lifecycle) else {
                shared.completion.wait(&mut board);
                continue;
            };
            let timed_out = shared
                .completion
                .wait_until(&mut board, started + timeout)
                .timed_out();
            let done = board.ops.get(&op_id).map(|s| s.done).unwrap_or(false);
            if timed_out && !done {
                if let Some(status) = board.ops.get_mut(&op_id) {
                    status.aborted = true;
                }
                shared.detached.fetch_add(1, Ordering::SeqCst);
                drop(board);
                shared.abandoned.fetch_add(1, Ordering::Relaxed);
                warn!(module_id = target, %kind, timeout_ms = shared.config.operation_timeout_ms, "操作超时，放弃等待");
                self.drain_backlog();
                return Err(CoreError::Timeout {
                    module_id: target,
                    kind: kind.to_string(),
                    timeout_ms: shared.config.operation_timeout_ms,
                });
            }
        }
        drop(board);

        let guard = OperationGuard {
            release: lifecycle.then(|| (shared.clone(), target)),
        };
        let outcome = slot
            .lock()
            .take()
            .ok_or_else(|| CoreError::Internal("操作结果丢失".to_string()))?;
        match outcome {
            Ok(value) => Ok((value, guard)),
            Err(payload) => Err(CoreError::Internal(format!(
                "模块 {} 的 {} 操作 panic: {}",
                target,
                kind,
                panic_message(&*payload)
            ))),
        }
    }

    fn dispatch(&self, mut job: Job) -> Result<()> {
        let shared = &self.shared;
        let mut dispatch = shared.dispatch.lock();
        if dispatch.shutdown {
            return Err(CoreError::illegal_state(0, "执行器已关闭"));
        }
        while let Some((_, sender)) = dispatch.idle.pop() {
            match sender.send(job) {
                Ok(()) => return Ok(()),
                Err(returned) => job = returned.0,
            }
        }

        if shared.at_capacity() {
            if !on_worker() {
                debug!(max_workers = shared.config.max_workers, "工作线程已满，操作排队");
                dispatch.backlog.push_back(job);
                return Ok(());
            }
            debug!(max_workers = shared.config.max_workers, "工作线程上发起的操作，超出上限新建线程");
        }
        drop(dispatch);
        spawn_worker(shared, job)
    }

    /// 被放弃的线程让出名额后，为排队的操作补充线程
    fn drain_backlog(&self) {
        let shared = &self.shared;
        loop {
            let job = {
                let mut dispatch = shared.dispatch.lock();
                if dispatch.shutdown || !dispatch.idle.is_empty() || shared.at_capacity() {
                    return;
                }
                match dispatch.backlog.pop_front() {
                    Some(job) => job,
                    None => return,
                }
            };
            if let Err(e) = spawn_worker(shared, job) {
                warn!(error = %e, "无法为排队的操作创建工作线程");
                return;
            }
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        let dispatch = self.shared.dispatch.lock();
        ExecutorStats {
            workers: self.shared.workers.load(Ordering::SeqCst),
            idle: dispatch.idle.len(),
            busy: self.shared.busy.load(Ordering::SeqCst),
            queued: dispatch.backlog.len(),
            abandoned: self.shared.abandoned.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
        }
    }

    /// 关闭执行器：空闲线程立即退出，繁忙线程完成当前操作后退出
    pub fn shutdown(&self) {
        let idle = {
            let mut dispatch = self.shared.dispatch.lock();
            dispatch.shutdown = true;
            std::mem::take(&mut dispatch.idle)
        };
        for (_, sender) in idle {
            let _ = sender.send(Box::new(|| true));
        }
    }
}

impl Drop for OperationExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn format_chain(chain: &[u64]) -> String {
    chain
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn with_context<R>(chain: Vec<u64>, event: bool, f: impl FnOnce() -> R) -> R {
    let previous_chain = TARGET_CHAIN.with(|c| c.replace(chain));
    let previous_event = IN_EVENT_DISPATCH.with(|c| c.replace(event));
    let result = f();
    TARGET_CHAIN.with(|c| c.replace(previous_chain));
    IN_EVENT_DISPATCH.with(|c| c.set(previous_event));
    result
}

fn spawn_worker(shared: &Arc<Shared>, first: Job) -> Result<()> {
    let id = shared.next_worker.fetch_add(1, Ordering::SeqCst);
    let (sender, receiver) = bounded::<Job>(1);
    let worker_shared = shared.clone();
    shared.workers.fetch_add(1, Ordering::SeqCst);
    thread::Builder::new()
        .name(format!("chips-op-{}", id))
        .spawn(move || worker_loop(worker_shared, id, sender, receiver, first))
        .map_err(|e| {
            shared.workers.fetch_sub(1, Ordering::SeqCst);
            CoreError::InitFailed(format!("无法创建工作线程: {}", e))
        })?;
    debug!(worker = id, "工作线程已创建");
    Ok(())
}

fn on_worker() -> bool {
    ON_WORKER.with(Cell::get)
}

fn worker_loop(shared: Arc<Shared>, id: u64, sender: Sender<Job>, receiver: Receiver<Job>, first: Job) {
    ON_WORKER.with(|c| c.set(true));
    let mut job = first;
    loop {
        shared.busy.fetch_add(1, Ordering::SeqCst);
        let retire = job();
        shared.busy.fetch_sub(1, Ordering::SeqCst);
        if retire {
            break;
        }
        match next_job(&shared, id, &sender, &receiver) {
            Some(next) => job = next,
            None => break,
        }
    }
    shared.workers.fetch_sub(1, Ordering::SeqCst);
    debug!(worker = id, "工作线程退出");
}

fn next_job(shared: &Shared, id: u64, sender: &Sender<Job>, receiver: &Receiver<Job>) -> Option<Job> {
    {
        let mut dispatch = shared.dispatch.lock();
        if let Some(job) = dispatch.backlog.pop_front() {
            return Some(job);
        }
        if dispatch.shutdown {
            return None;
        }
        dispatch.idle.push((id, sender.clone()));
    }

    match receiver.recv_timeout(shared.config.keep_alive()) {
        Ok(job) => Some(job),
        Err(RecvTimeoutError::Timeout) => {
            let mut dispatch = shared.dispatch.lock();
            if let Some(pos) = dispatch.idle.iter().position(|(worker, _)| *worker == id) {
                dispatch.idle.remove(pos);
                return None;
            }
            // 已被取走，任务正在路上
            drop(dispatch);
            receiver.recv().ok()
        }
        Err(RecvTimeoutError::Disconnected) => None,
    }
}
