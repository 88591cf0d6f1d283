//! End-to-end cluster tests: a real master and real workers over HTTP on
//! ephemeral ports. Each worker runs in its own runtime so it can be
//! killed mid-flight.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use pegasus_core::{
    Job, ProjStats, Project, Registry, SharedJob, Task, TaskGenerator, TaskReport, TaskSpec,
    Tasklet, TaskletCtx, WorkerRegForm, decode_spec, shared_job,
};
use pegasus_master::{MasterCfg, MasterState, ProjMeta, ProjReceipt};
use pegasus_worker::{TaskEngine, WorkerCfg};

// ---- test-only churn project: configurable-slow, optionally failing ----

const CHURN_KIND: &str = "test:churn";

struct ChurnJob {
    total: usize,
    emitted: usize,
    sleep_ms: u64,
    always_fail: bool,
    done: Vec<Value>,
}

impl ChurnJob {
    fn new(total: usize, sleep_ms: u64, always_fail: bool) -> Self {
        Self {
            total,
            emitted: 0,
            sleep_ms,
            always_fail,
            done: Vec::new(),
        }
    }
}

impl Job for ChurnJob {
    fn kind(&self) -> &str {
        CHURN_KIND
    }
    fn append_input(&mut self, _input: Value) {}
    fn init(&mut self, _env: Option<&Value>) -> anyhow::Result<()> {
        Ok(())
    }
    fn calc_task_count(&self) -> usize {
        self.total
    }
    fn next_task(&mut self, tid: String) -> Option<TaskSpec> {
        if self.emitted == self.total {
            return None;
        }
        self.emitted += 1;
        Some(TaskSpec {
            tid,
            kind: CHURN_KIND.into(),
            spec: json!({"sleep_ms": self.sleep_ms, "always_fail": self.always_fail}),
        })
    }
    fn reduce(&mut self, reports: &[TaskReport]) -> anyhow::Result<()> {
        self.done = reports.iter().map(|r| r.output.clone()).collect();
        Ok(())
    }
    fn output(&self) -> Value {
        json!(self.done.len())
    }
    fn next_jobs(&self) -> Vec<SharedJob> {
        Vec::new()
    }
    fn task_generator(&self) -> Option<TaskGenerator> {
        Some(churn_gen)
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct ChurnSpec {
    sleep_ms: u64,
    always_fail: bool,
}

fn churn_gen(tspec: &TaskSpec) -> anyhow::Result<Box<dyn Task>> {
    let spec: ChurnSpec = decode_spec(tspec)?;
    Ok(Box::new(ChurnTask {
        tid: tspec.tid.clone(),
        sleep_ms: spec.sleep_ms,
        always_fail: spec.always_fail,
        left: 1,
    }))
}

struct ChurnTask {
    tid: String,
    sleep_ms: u64,
    always_fail: bool,
    left: usize,
}

impl Task for ChurnTask {
    fn init(&mut self, _executor_count: usize) -> anyhow::Result<()> {
        Ok(())
    }
    fn new_tasklet_ctx(&self) -> Box<dyn TaskletCtx> {
        Box::new(ChurnCtx)
    }
    fn task_id(&self) -> &str {
        &self.tid
    }
    fn kind(&self) -> &str {
        CHURN_KIND
    }
    fn desc(&self) -> String {
        "churn".into()
    }
    fn tasklet_count(&self) -> usize {
        1
    }
    fn next_tasklet(&mut self, tasklet_id: String) -> Option<Box<dyn Tasklet>> {
        if self.left == 0 {
            return None;
        }
        self.left -= 1;
        Some(Box::new(ChurnTasklet {
            id: tasklet_id,
            sleep_ms: self.sleep_ms,
            always_fail: self.always_fail,
        }))
    }
    fn reduce_tasklets(&mut self, _tasklets: Vec<Box<dyn Tasklet>>) {}
    fn output(&self) -> Value {
        json!(1)
    }
}

struct ChurnCtx;
impl TaskletCtx for ChurnCtx {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct ChurnTasklet {
    id: String,
    sleep_ms: u64,
    always_fail: bool,
}

impl Tasklet for ChurnTasklet {
    fn tasklet_id(&self) -> &str {
        &self.id
    }
    fn execute(&mut self, _ctx: &mut dyn TaskletCtx) -> anyhow::Result<()> {
        if self.always_fail {
            anyhow::bail!("injected failure");
        }
        std::thread::sleep(Duration::from_millis(self.sleep_ms));
        Ok(())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct TestProject {
    name: &'static str,
    total: usize,
    sleep_ms: u64,
    always_fail: bool,
    jobs: Vec<SharedJob>,
}

impl Project for TestProject {
    fn name(&self) -> &str {
        self.name
    }
    fn init_jobs(&mut self) {
        let job: SharedJob = shared_job(ChurnJob::new(self.total, self.sleep_ms, self.always_fail));
        self.jobs = vec![job];
    }
    fn init(&mut self, _config: &str) -> anyhow::Result<()> {
        self.init_jobs();
        Ok(())
    }
    fn jobs(&self) -> Vec<SharedJob> {
        self.jobs.clone()
    }
    fn finish(&mut self, _stats: &ProjStats) -> anyhow::Result<()> {
        Ok(())
    }
}

fn churn_factory() -> Box<dyn Project> {
    Box::new(TestProject {
        name: "Churn",
        total: 8,
        sleep_ms: 400,
        always_fail: false,
        jobs: Vec::new(),
    })
}

fn flaky_factory() -> Box<dyn Project> {
    Box::new(TestProject {
        name: "Flaky",
        total: 1,
        sleep_ms: 0,
        always_fail: true,
        jobs: Vec::new(),
    })
}

// ---- cluster harness ----

fn test_registry() -> Arc<Registry> {
    let mut reg = Registry::new();
    reg.register_project(pegasus_mergesort::project_factory).unwrap();
    reg.register_project(churn_factory).unwrap();
    reg.register_project(flaky_factory).unwrap();
    Arc::new(reg)
}

fn fast_master_cfg() -> MasterCfg {
    MasterCfg {
        hb_interval_ms: 50,
        monitor_interval_ms: 250,
        hb_cnt_good: 3,
        hb_cnt_norm: 2,
        max_fault_cnt: 100,
        task_max_err: 5,
        pending_grace_ticks: 8,
        start_unstable: false,
        allow_master_takeover: true,
    }
}

fn fast_worker_cfg() -> WorkerCfg {
    WorkerCfg {
        executor_count: 4,
        tasklet_buf: 8,
        tasklet_max_retry: 3,
        status_interval_ms: 200,
    }
}

async fn spawn_master() -> (Arc<MasterState>, std::net::SocketAddr) {
    let state = MasterState::new(fast_master_cfg(), test_registry()).unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    state.pool.spawn_monitor();
    let st = state.clone();
    tokio::spawn(async move {
        pegasus_master::serve(st, listener).await.unwrap();
    });
    (state, addr)
}

async fn worker_main(master_addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let http = reqwest::Client::new();
    let form = WorkerRegForm {
        name: format!("worker@{addr}"),
        ip: addr.ip().to_string(),
        port: addr.port(),
    };
    let master = reqwest::Url::parse(&format!("http://{master_addr}/"))?;
    let client = Arc::new(pegasus_worker::register(http, master, &form).await?);
    let engine = Arc::new(TaskEngine::new(test_registry(), client.clone(), fast_worker_cfg()));
    pegasus_worker::start_heartbeat(client).await?;
    pegasus_worker::spawn_status_monitor(engine.clone());
    pegasus_worker::serve(engine, listener).await
}

/// One worker in its own runtime; killing it drops every task it runs.
struct WorkerProc {
    rt: Option<tokio::runtime::Runtime>,
}

impl WorkerProc {
    fn start(master_addr: std::net::SocketAddr) -> Self {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        rt.spawn(async move {
            if let Err(err) = worker_main(master_addr).await {
                eprintln!("worker exited: {err:#}");
            }
        });
        Self { rt: Some(rt) }
    }

    fn kill(&mut self) {
        if let Some(rt) = self.rt.take() {
            rt.shutdown_background();
        }
    }
}

impl Drop for WorkerProc {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn wait_for_workers(state: &MasterState, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let active = state
            .pool
            .workers_snapshot()
            .iter()
            .filter(|w| w.state == pegasus_master::WorkerState::Active)
            .count();
        if active >= count {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "workers never became active"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn start_project(
    addr: std::net::SocketAddr,
    name: &str,
    config: &str,
) -> ProjReceipt {
    let res = reqwest::Client::new()
        .post(format!("http://{addr}/project?proj={name}"))
        .body(config.to_string())
        .send()
        .await
        .unwrap();
    assert!(res.status().is_success());
    serde_json::from_str(&res.text().await.unwrap()).unwrap()
}

async fn fetch_status(addr: std::net::SocketAddr) -> ProjMeta {
    let res = reqwest::Client::new()
        .get(format!("http://{addr}/project/status"))
        .send()
        .await
        .unwrap();
    assert!(res.status().is_success());
    serde_json::from_str(&res.text().await.unwrap()).unwrap()
}

async fn wait_finished(addr: std::net::SocketAddr, timeout: Duration) -> ProjMeta {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let meta = fetch_status(addr).await;
        // Snapshot self-consistency: a task meta only exists once dispatched.
        for jm in &meta.job_metas {
            for tm in jm.task_metas.values() {
                assert!(tm.dispatched, "undispatched task meta in snapshot");
            }
        }
        if meta.finished {
            return meta;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "project never finished: {meta:?}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

// ---- scenarios ----

#[tokio::test]
async fn happy_path_mergesort_dumps_sorted_sequence() {
    let (state, addr) = spawn_master().await;
    let _workers: Vec<WorkerProc> = (0..3).map(|_| WorkerProc::start(addr)).collect();
    wait_for_workers(&state, 3).await;

    let dir = tempfile::tempdir().unwrap();
    let config = json!({"out_dir": dir.path().display().to_string()}).to_string();
    let receipt = start_project(addr, "Mergesort", &config).await;
    assert!(receipt.err_msg.is_empty(), "receipt: {receipt:?}");
    assert!(receipt.proj_id.starts_with("proj"));

    let meta = wait_finished(addr, Duration::from_secs(30)).await;
    assert!(meta.err_msg.is_empty(), "project failed: {}", meta.err_msg);
    assert_eq!(meta.job_metas.len(), 3);
    assert_eq!(meta.job_metas[0].kind, "Mergesort:randints");
    assert_eq!(meta.job_metas[0].total, 4);
    assert_eq!(meta.job_metas[0].done, 4);
    assert_eq!(meta.job_metas[1].kind, "Mergesort:mergesort");
    assert_eq!(meta.job_metas[1].total, 8);
    assert_eq!(meta.job_metas[1].done, 8);
    assert_eq!(meta.job_metas[2].kind, "Mergesort:dumpres");
    assert_eq!(meta.job_metas[2].total, 0);

    // The dump file holds 10+20+30+40 integers in ascending order.
    let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(entries.len(), 1);
    let raw = std::fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
    let ints: Vec<i64> = serde_json::from_str(&raw).unwrap();
    assert_eq!(ints.len(), 100);
    assert!(ints.windows(2).all(|w| w[0] <= w[1]), "not sorted");
}

#[tokio::test]
async fn killed_worker_task_is_reassigned_and_job_completes() {
    let (state, addr) = spawn_master().await;
    let mut workers: Vec<WorkerProc> = (0..3).map(|_| WorkerProc::start(addr)).collect();
    wait_for_workers(&state, 3).await;

    let receipt = start_project(addr, "Churn", "{}").await;
    assert!(receipt.err_msg.is_empty(), "receipt: {receipt:?}");

    // Let dispatch fan out, then take one worker down mid-task.
    tokio::time::sleep(Duration::from_millis(150)).await;
    workers[0].kill();

    let meta = wait_finished(addr, Duration::from_secs(30)).await;
    assert!(meta.err_msg.is_empty(), "project failed: {}", meta.err_msg);
    assert_eq!(meta.job_metas.len(), 1);
    let jm = &meta.job_metas[0];
    assert_eq!(jm.total, 8);
    assert_eq!(jm.done, 8);
    assert!(
        jm.dispatched >= 9,
        "expected a reassignment, dispatched = {}",
        jm.dispatched
    );
}

#[tokio::test]
async fn persistently_failing_task_aborts_the_job() {
    let (state, addr) = spawn_master().await;
    let _workers: Vec<WorkerProc> = (0..3).map(|_| WorkerProc::start(addr)).collect();
    wait_for_workers(&state, 3).await;

    let receipt = start_project(addr, "Flaky", "{}").await;
    assert!(receipt.err_msg.is_empty(), "receipt: {receipt:?}");

    let meta = wait_finished(addr, Duration::from_secs(30)).await;
    assert!(!meta.err_msg.is_empty(), "project should have failed");
    assert_eq!(meta.job_metas.len(), 1);
    let jm = &meta.job_metas[0];
    assert!(
        jm.err_msg.starts_with("Task \"tsk-"),
        "unexpected message: {}",
        jm.err_msg
    );
    assert!(
        jm.err_msg.contains("failed 6 times"),
        "unexpected message: {}",
        jm.err_msg
    );
}

#[tokio::test]
async fn second_project_is_rejected_while_busy() {
    let (state, addr) = spawn_master().await;
    let _workers: Vec<WorkerProc> = (0..2).map(|_| WorkerProc::start(addr)).collect();
    wait_for_workers(&state, 2).await;

    let receipt = start_project(addr, "Churn", "{}").await;
    assert!(receipt.err_msg.is_empty(), "receipt: {receipt:?}");

    let rejected = start_project(addr, "Mergesort", "{}").await;
    assert!(
        rejected.err_msg.contains("in running"),
        "receipt: {rejected:?}"
    );
    assert!(rejected.proj_id.is_empty());

    // The running project is unaffected and a new one starts once free.
    let meta = wait_finished(addr, Duration::from_secs(30)).await;
    assert!(meta.err_msg.is_empty(), "project failed: {}", meta.err_msg);

    let receipt = start_project(addr, "Churn", "{}").await;
    assert!(receipt.err_msg.is_empty(), "receipt: {receipt:?}");
    let meta = wait_finished(addr, Duration::from_secs(30)).await;
    assert!(meta.err_msg.is_empty(), "project failed: {}", meta.err_msg);

    let unknown = start_project(addr, "Nope", "{}").await;
    assert!(unknown.err_msg.contains("not supported"));
}
