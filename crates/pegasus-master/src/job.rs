//! Per-job dispatch pipeline: a producer draining the job's task stream, a
//! single dispatcher feeding the worker pool, and a completion collector
//! driven by incoming task reports. All three share one `JobMeta` under a
//! mutex and stop on a shared finish signal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use pegasus_core::task::generate_tid;
use pegasus_core::{SharedJob, TaskReport, TaskSpec, TaskStatus};

use crate::meta::{JobMeta, TaskMeta};
use crate::pool::WorkerPool;

/// Capacity of the todo-task queue; the producer blocks beyond this.
const BUF_TASK_CNT: usize = 10;

#[derive(Default)]
struct JobInner {
    active: bool,
    meta: Option<JobMeta>,
    reports: Vec<TaskReport>,
    err_cnts: HashMap<String, u32>,
    done: usize,
    total: usize,
    finish_tx: Option<watch::Sender<bool>>,
    reassign_tx: Option<mpsc::UnboundedSender<TaskSpec>>,
}

impl JobInner {
    fn signal_finish(&self) {
        if let Some(tx) = &self.finish_tx {
            let _ = tx.send(true);
        }
    }

    fn meta_mut(&mut self) -> &mut JobMeta {
        self.meta.as_mut().expect("job meta set while active")
    }
}

pub struct JobRunner {
    pool: Arc<WorkerPool>,
    inner: Mutex<JobInner>,
}

impl JobRunner {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            inner: Mutex::new(JobInner::default()),
        }
    }

    /// Run one job to completion and return its metadata. Blocks until all
    /// task reports are in, the job aborts, or dispatch becomes impossible.
    pub async fn run_job(self: &Arc<Self>, job: SharedJob, env: Option<&Value>) -> JobMeta {
        let start_ts = Utc::now();
        let (kind, total, init_err) = {
            let mut j = job.lock().expect("job mutex poisoned");
            let kind = j.kind().to_string();
            match j.init(env) {
                Ok(()) => (kind, j.calc_task_count(), None),
                Err(err) => (kind, 0, Some(err)),
            }
        };

        let mut meta = JobMeta::new(kind.clone(), start_ts, total);
        if let Some(err) = init_err {
            meta.err_msg = format!("Fail to init job {kind:?}, {err:#}");
            meta.finished = true;
            meta.end_ts = Some(Utc::now());
            self.store_final_meta(&meta);
            return meta;
        }

        tracing::info!(%kind, total, "running job");

        // Source-less jobs skip the dispatch pipeline entirely.
        if total == 0 {
            self.finish_job(&job, &mut meta, Vec::new());
            self.store_final_meta(&meta);
            return meta;
        }

        let (finish_tx, finish_rx) = watch::channel(false);
        let mut finish_main = finish_rx.clone();
        let (todo_tx, todo_rx) = mpsc::channel::<TaskSpec>(BUF_TASK_CNT);
        let (reassign_tx, reassign_rx) = mpsc::unbounded_channel::<TaskSpec>();

        {
            let mut inner = self.inner.lock().expect("job mutex poisoned");
            *inner = JobInner {
                active: true,
                meta: Some(meta.clone()),
                reports: Vec::new(),
                err_cnts: HashMap::new(),
                done: 0,
                total,
                finish_tx: Some(finish_tx),
                reassign_tx: Some(reassign_tx.clone()),
            };
        }
        self.pool.set_reassign_sink(reassign_tx);

        let producer = tokio::spawn(produce_tasks(job.clone(), todo_tx, finish_rx.clone()));
        let dispatcher = tokio::spawn(dispatch_tasks(
            self.clone(),
            todo_rx,
            reassign_rx,
            finish_rx,
        ));

        // Completion (or abort) is signalled from the report path.
        let _ = finish_main.changed().await;

        self.pool.clear_reassign_sink();
        let _ = producer.await;
        let _ = dispatcher.await;

        let reports = {
            let mut inner = self.inner.lock().expect("job mutex poisoned");
            inner.active = false;
            inner.finish_tx = None;
            inner.reassign_tx = None;
            meta = inner.meta.take().expect("job meta set while active");
            std::mem::take(&mut inner.reports)
        };

        if !meta.failed() {
            self.finish_job(&job, &mut meta, reports);
        } else {
            meta.finished = true;
            meta.end_ts = Some(Utc::now());
        }
        self.store_final_meta(&meta);
        tracing::info!(%kind, err = %meta.err_msg, "job finished");
        meta
    }

    /// Reduce the collected reports and feed the output to the successor
    /// jobs. Called exactly once per job, after all reports are in.
    fn finish_job(&self, job: &SharedJob, meta: &mut JobMeta, reports: Vec<TaskReport>) {
        let reduce_res = {
            let mut j = job.lock().expect("job mutex poisoned");
            j.reduce(&reports)
        };
        match reduce_res {
            Ok(()) => feed_next_jobs(job),
            Err(err) => {
                meta.err_msg = format!("Fail to reduce job {:?}, {err:#}", meta.kind);
            }
        }
        meta.finished = true;
        meta.end_ts = Some(Utc::now());
    }

    fn store_final_meta(&self, meta: &JobMeta) {
        let mut inner = self.inner.lock().expect("job mutex poisoned");
        inner.meta = Some(meta.clone());
        inner.active = false;
    }

    /// Snapshot of the current (or most recent) job meta.
    pub fn current_meta(&self) -> Option<JobMeta> {
        let inner = self.inner.lock().expect("job mutex poisoned");
        inner.meta.clone()
    }

    fn record_dispatched(&self, tspec: &TaskSpec, worker_label: String) {
        let mut inner = self.inner.lock().expect("job mutex poisoned");
        if !inner.active {
            return;
        }
        let err_cnt = inner.err_cnts.get(&tspec.tid).copied().unwrap_or(0);
        let meta = inner.meta_mut();
        meta.dispatched += 1;
        meta.task_metas.insert(
            tspec.tid.clone(),
            TaskMeta {
                tid: tspec.tid.clone(),
                kind: tspec.kind.clone(),
                start_ts: Utc::now(),
                end_ts: None,
                worker_label,
                dispatched: true,
                finished: false,
                err_cnt,
                err_msg: String::new(),
                status: None,
            },
        );
    }

    fn fail_job(&self, msg: String) {
        let mut inner = self.inner.lock().expect("job mutex poisoned");
        if !inner.active {
            return;
        }
        tracing::error!(%msg, "job aborted");
        inner.meta_mut().err_msg = msg;
        inner.signal_finish();
    }

    /// Collect one task report. Failed reports are requeued until the
    /// per-task failure cap trips, which aborts the whole job.
    pub fn collect_report(&self, tspec: TaskSpec, report: TaskReport) -> anyhow::Result<()> {
        let task_max_err = self.pool.cfg().task_max_err;
        let mut inner = self.inner.lock().expect("job mutex poisoned");
        if !inner.active {
            anyhow::bail!("no job running, report for task {:?} ignored", report.tid);
        }

        if report.failed() {
            let cnt = {
                let cnt = inner.err_cnts.entry(report.tid.clone()).or_insert(0);
                *cnt += 1;
                *cnt
            };
            {
                let meta = inner.meta_mut();
                if let Some(tm) = meta.task_metas.get_mut(&report.tid) {
                    tm.err_cnt = cnt;
                    tm.err_msg = report.err.clone();
                }
            }
            if cnt > task_max_err {
                let msg = format!(
                    "Task {:?} failed {} times, last error {}",
                    report.tid, cnt, report.err
                );
                tracing::error!(%msg, "job aborted");
                inner.meta_mut().err_msg = msg;
                inner.signal_finish();
            } else if let Some(tx) = &inner.reassign_tx {
                tracing::info!(tid = %tspec.tid, cnt, "task failed, requeueing");
                let _ = tx.send(tspec);
            }
            return Ok(());
        }

        inner.done += 1;
        let done = inner.done;
        let total = inner.total;
        {
            let meta = inner.meta_mut();
            meta.done = done;
            if let Some(tm) = meta.task_metas.get_mut(&report.tid) {
                tm.finished = true;
                tm.end_ts = Some(report.end_ts);
                tm.status = report.status.clone();
            }
        }
        inner.reports.push(report);
        if done == total {
            inner.signal_finish();
        }
        Ok(())
    }

    /// Apply a live progress snapshot pushed by a worker.
    pub fn update_task_status(&self, status: TaskStatus) {
        let mut inner = self.inner.lock().expect("job mutex poisoned");
        if !inner.active {
            return;
        }
        let meta = inner.meta_mut();
        if let Some(tm) = meta.task_metas.get_mut(&status.tid) {
            tm.status = Some(status);
        }
    }
}

async fn produce_tasks(
    job: SharedJob,
    todo_tx: mpsc::Sender<TaskSpec>,
    mut finish_rx: watch::Receiver<bool>,
) {
    let mut idx = 0usize;
    loop {
        if *finish_rx.borrow() {
            break;
        }
        let tspec = {
            let mut j = job.lock().expect("job mutex poisoned");
            j.next_task(generate_tid(idx))
        };
        idx += 1;
        let Some(tspec) = tspec else { break };
        tokio::select! {
            res = todo_tx.send(tspec) => {
                if res.is_err() {
                    break;
                }
            }
            _ = finish_rx.changed() => break,
        }
    }
}

async fn dispatch_tasks(
    runner: Arc<JobRunner>,
    mut todo_rx: mpsc::Receiver<TaskSpec>,
    mut reassign_rx: mpsc::UnboundedReceiver<TaskSpec>,
    mut finish_rx: watch::Receiver<bool>,
) {
    let mut todo_done = false;
    loop {
        let tspec = tokio::select! {
            t = todo_rx.recv(), if !todo_done => {
                match t {
                    Some(t) => Some(t),
                    None => {
                        todo_done = true;
                        None
                    }
                }
            }
            t = reassign_rx.recv() => t,
            _ = finish_rx.changed() => break,
        };
        let Some(tspec) = tspec else {
            if *finish_rx.borrow() {
                break;
            }
            continue;
        };

        match runner.pool.dispatch_task(&tspec).await {
            Ok(label) => runner.record_dispatched(&tspec, label),
            Err(err) => {
                runner.fail_job(format!(
                    "Fail to dispatch task {:?}, {err}",
                    tspec.tid
                ));
                break;
            }
        }
        if *finish_rx.borrow() {
            break;
        }
    }
}

fn feed_next_jobs(job: &SharedJob) {
    let (output, next_jobs) = {
        let j = job.lock().expect("job mutex poisoned");
        (j.output(), j.next_jobs())
    };
    for next in next_jobs {
        next.lock().expect("job mutex poisoned").append_input(output.clone());
    }
}
