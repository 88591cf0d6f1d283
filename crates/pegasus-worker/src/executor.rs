//! Task execution engine: one task at a time, fanned out across a fixed
//! pool of executors, each running tasklets on a blocking thread with its
//! own context. Failures retry locally; a tasklet that keeps failing
//! aborts the task cooperatively.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use pegasus_core::{Registry, Task, TaskGenerator, TaskReport, TaskSpec, TaskStatus, Tasklet, TaskletCtx};

use crate::config::WorkerCfg;
use crate::register::MasterClient;

const REPORT_RETRY_CNT: u32 = 5;
const REPORT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Shared progress of the in-flight task, read by the status monitor.
pub struct TaskProgress {
    pub tid: String,
    pub desc: String,
    pub start_ts: DateTime<Utc>,
    pub total: usize,
    pub done: AtomicUsize,
}

impl TaskProgress {
    pub fn snapshot(&self, finished: bool) -> TaskStatus {
        TaskStatus {
            tid: self.tid.clone(),
            desc: self.desc.clone(),
            start_ts: self.start_ts,
            finished,
            total: self.total,
            done: self.done.load(Ordering::Relaxed),
        }
    }
}

pub struct TaskEngine {
    registry: Arc<Registry>,
    master: Arc<MasterClient>,
    cfg: WorkerCfg,
    busy_kind: Mutex<Option<String>>,
    progress: Mutex<Option<Arc<TaskProgress>>>,
}

impl TaskEngine {
    pub fn new(registry: Arc<Registry>, master: Arc<MasterClient>, cfg: WorkerCfg) -> Self {
        Self {
            registry,
            master,
            cfg,
            busy_kind: Mutex::new(None),
            progress: Mutex::new(None),
        }
    }

    pub fn cfg(&self) -> &WorkerCfg {
        &self.cfg
    }

    pub fn master(&self) -> &Arc<MasterClient> {
        &self.master
    }

    pub fn current_progress(&self) -> Option<Arc<TaskProgress>> {
        self.progress.lock().expect("progress mutex poisoned").clone()
    }

    /// Accept one task spec. Rejected while a task is in flight or when the
    /// kind is unknown; acceptance spawns the task lifecycle and returns.
    pub fn accept(self: &Arc<Self>, tspec: TaskSpec) -> anyhow::Result<()> {
        let generator = self
            .registry
            .task_generator(&tspec.kind)
            .ok_or_else(|| anyhow::anyhow!("Task kind {:?} not supported", tspec.kind))?;

        {
            let mut busy = self.busy_kind.lock().expect("busy mutex poisoned");
            if let Some(kind) = busy.as_ref() {
                anyhow::bail!("Worker busy with task {kind:?}");
            }
            *busy = Some(tspec.kind.clone());
        }

        tracing::info!(tid = %tspec.tid, kind = %tspec.kind, "task accepted");
        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_task(tspec, generator).await;
        });
        Ok(())
    }

    async fn run_task(self: Arc<Self>, tspec: TaskSpec, generator: TaskGenerator) {
        let start_ts = Utc::now();
        let (output, err, status) = self.execute_task(&tspec, generator).await;

        let report = TaskReport {
            err: err.unwrap_or_default(),
            tid: tspec.tid.clone(),
            kind: tspec.kind.clone(),
            start_ts,
            end_ts: Utc::now(),
            status,
            output,
        };
        self.send_report(&report).await;

        *self.progress.lock().expect("progress mutex poisoned") = None;
        *self.busy_kind.lock().expect("busy mutex poisoned") = None;
        tracing::info!(tid = %tspec.tid, failed = report.failed(), "task finished");
    }

    async fn execute_task(
        &self,
        tspec: &TaskSpec,
        generator: TaskGenerator,
    ) -> (Value, Option<String>, Option<TaskStatus>) {
        let mut task: Box<dyn Task> = match generator(tspec) {
            Ok(task) => task,
            Err(err) => {
                return (
                    Value::Null,
                    Some(format!("Fail to spawn task {:?}, {err:#}", tspec.tid)),
                    None,
                );
            }
        };
        if let Err(err) = task.init(self.cfg.executor_count) {
            return (
                Value::Null,
                Some(format!("Fail to init task {:?}, {err:#}", tspec.tid)),
                None,
            );
        }

        let total = task.tasklet_count();
        let progress = Arc::new(TaskProgress {
            tid: tspec.tid.clone(),
            desc: task.desc(),
            start_ts: Utc::now(),
            total,
            done: AtomicUsize::new(0),
        });
        *self.progress.lock().expect("progress mutex poisoned") = Some(progress.clone());

        let abort = Arc::new(AtomicBool::new(false));
        let task_err: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let (todo_tx, todo_rx) = mpsc::channel::<Box<dyn Tasklet>>(self.cfg.tasklet_buf.max(1));
        let todo_rx = Arc::new(tokio::sync::Mutex::new(todo_rx));
        let (done_tx, mut done_rx) = mpsc::channel::<Box<dyn Tasklet>>(total.max(1));

        let mut executors: JoinSet<Option<Box<dyn TaskletCtx>>> = JoinSet::new();
        for _ in 0..self.cfg.executor_count.max(1) {
            executors.spawn(run_executor(
                todo_rx.clone(),
                done_tx.clone(),
                task.new_tasklet_ctx(),
                abort.clone(),
                task_err.clone(),
                progress.clone(),
                self.cfg.tasklet_max_retry.max(1),
            ));
        }
        drop(done_tx);
        // Only executors hold the receiver now; once they all exit on an
        // abort, a blocked producer send fails instead of hanging.
        drop(todo_rx);

        // Producer: feed tasklets until exhausted or the task aborted.
        let mut idx = 0usize;
        loop {
            if abort.load(Ordering::SeqCst) {
                break;
            }
            let Some(tasklet) = task.next_tasklet(format!("{}-{}", tspec.tid, idx)) else {
                break;
            };
            idx += 1;
            if todo_tx.send(tasklet).await.is_err() {
                break;
            }
        }
        drop(todo_tx);

        let mut ctxs: Vec<Box<dyn TaskletCtx>> = Vec::new();
        while let Some(res) = executors.join_next().await {
            match res {
                Ok(Some(ctx)) => ctxs.push(ctx),
                Ok(None) => {}
                Err(err) => {
                    let mut slot = task_err.lock().expect("task err mutex poisoned");
                    if slot.is_none() {
                        *slot = Some(format!("executor join error, {err}"));
                    }
                }
            }
        }

        let mut done = Vec::new();
        while let Some(tasklet) = done_rx.recv().await {
            done.push(tasklet);
        }

        let err = task_err.lock().expect("task err mutex poisoned").take();
        let output = if err.is_none() {
            task.reduce_tasklets(done);
            task.output()
        } else {
            Value::Null
        };

        for mut ctx in ctxs {
            ctx.close();
        }

        (output, err, Some(progress.snapshot(true)))
    }

    async fn send_report(&self, report: &TaskReport) {
        for attempt in 1..=REPORT_RETRY_CNT {
            match self.master.post_report(report).await {
                // Delivered, or rejected outright; either way we are done.
                Ok(_) => return,
                Err(err) => {
                    tracing::warn!(
                        tid = %report.tid,
                        attempt,
                        error = %err,
                        "fail to post task report"
                    );
                }
            }
            tokio::time::sleep(REPORT_RETRY_DELAY).await;
        }
        tracing::error!(tid = %report.tid, "giving up on task report");
    }
}

async fn run_executor(
    todo: Arc<tokio::sync::Mutex<mpsc::Receiver<Box<dyn Tasklet>>>>,
    done: mpsc::Sender<Box<dyn Tasklet>>,
    ctx: Box<dyn TaskletCtx>,
    abort: Arc<AtomicBool>,
    task_err: Arc<Mutex<Option<String>>>,
    progress: Arc<TaskProgress>,
    max_retry: u32,
) -> Option<Box<dyn TaskletCtx>> {
    let mut ctx = Some(ctx);
    loop {
        if abort.load(Ordering::SeqCst) {
            break;
        }
        let tasklet = {
            let mut rx = todo.lock().await;
            rx.recv().await
        };
        let Some(mut tasklet) = tasklet else { break };

        let tasklet_id = tasklet.tasklet_id().to_string();
        let mut moved_ctx = ctx.take().expect("ctx present between tasklets");
        let exec = tokio::task::spawn_blocking(move || {
            let mut last_err = None;
            for attempt in 1..=max_retry {
                match tasklet.execute(moved_ctx.as_mut()) {
                    Ok(()) => {
                        last_err = None;
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(tasklet = %tasklet.tasklet_id(), attempt, error = %err, "retry execute tasklet");
                        last_err = Some(err);
                    }
                }
            }
            (tasklet, moved_ctx, last_err)
        });

        match exec.await {
            Ok((tasklet, back, None)) => {
                ctx = Some(back);
                progress.done.fetch_add(1, Ordering::Relaxed);
                if done.send(tasklet).await.is_err() {
                    break;
                }
            }
            Ok((_, back, Some(err))) => {
                ctx = Some(back);
                let mut slot = task_err.lock().expect("task err mutex poisoned");
                if slot.is_none() {
                    *slot = Some(format!("Fail on tasklet {tasklet_id:?}, {err:#}"));
                }
                drop(slot);
                abort.store(true, Ordering::SeqCst);
                break;
            }
            Err(join_err) => {
                // The execute panicked; its context is gone with it.
                let mut slot = task_err.lock().expect("task err mutex poisoned");
                if slot.is_none() {
                    *slot = Some(format!("Fail on tasklet {tasklet_id:?}, {join_err}"));
                }
                drop(slot);
                abort.store(true, Ordering::SeqCst);
                break;
            }
        }
    }
    ctx
}
