//! Project sequencing: at most one project runs at a time; its jobs run
//! strictly in order, each fed by its predecessors' outputs.

use std::sync::{Arc, Mutex};

use chrono::Utc;

use pegasus_core::task::ProjStats;
use pegasus_core::{Project, Registry};

use crate::job::JobRunner;
use crate::meta::{JobMeta, ProjMeta, ProjReceipt};

struct ProjInner {
    free: bool,
    idx: u64,
    meta: ProjMeta,
}

pub struct ProjectRunner {
    registry: Arc<Registry>,
    jobs: Arc<JobRunner>,
    inner: Mutex<ProjInner>,
}

impl ProjectRunner {
    pub fn new(registry: Arc<Registry>, jobs: Arc<JobRunner>) -> Self {
        Self {
            registry,
            jobs,
            inner: Mutex::new(ProjInner {
                free: true,
                idx: 0,
                meta: ProjMeta::empty(),
            }),
        }
    }

    /// Start a project run. Rejected synchronously (non-empty `ErrMsg` in
    /// the receipt) when another project is running or the name is unknown.
    pub fn try_run(self: &Arc<Self>, name: &str, config: String) -> ProjReceipt {
        let proj = match self.registry.project(name) {
            Some(proj) => proj,
            None => {
                return ProjReceipt {
                    err_msg: format!("Proj {name:?} not supported"),
                    proj_id: String::new(),
                };
            }
        };

        let pid = {
            let mut inner = self.inner.lock().expect("project mutex poisoned");
            if !inner.free {
                return ProjReceipt {
                    err_msg: format!("Project {:?} in running", inner.meta.pid),
                    proj_id: String::new(),
                };
            }
            let pid = format!(
                "proj{}-{}",
                Utc::now().timestamp_nanos_opt().unwrap_or_default(),
                inner.idx
            );
            inner.idx += 1;
            inner.free = false;
            inner.meta = ProjMeta {
                name: name.to_string(),
                pid: pid.clone(),
                start_ts: Some(Utc::now()),
                end_ts: None,
                err_msg: String::new(),
                finished: false,
                job_metas: Vec::new(),
            };
            pid
        };

        tracing::info!(project = %name, %pid, "run project");
        let runner = self.clone();
        tokio::spawn(async move {
            runner.run_loop(proj, config).await;
        });

        ProjReceipt {
            err_msg: String::new(),
            proj_id: pid,
        }
    }

    async fn run_loop(self: Arc<Self>, mut proj: Box<dyn Project>, config: String) {
        let start_ts = Utc::now();

        if let Err(err) = proj.init(&config) {
            self.finish_with(format!("Fail on project init, {err:#}"));
            return;
        }

        let env = proj.env();
        let jobs = proj.jobs();
        let job_count = jobs.len();
        let mut err_msg = String::new();

        for job in jobs {
            let jmeta = self.jobs.run_job(job, env.as_ref()).await;
            let failed = jmeta.failed();
            let kind = jmeta.kind.clone();
            let job_err = jmeta.err_msg.clone();
            self.push_job_meta(jmeta);
            if failed {
                err_msg = format!("Fail on job {kind:?}, {job_err}");
                break;
            }
        }

        let stats = ProjStats {
            start_ts,
            end_ts: Utc::now(),
            job_count,
        };
        if let Err(err) = proj.finish(&stats) {
            if err_msg.is_empty() {
                err_msg = format!("Fail on project finish, {err:#}");
            }
        }
        self.finish_with(err_msg);
    }

    fn push_job_meta(&self, jmeta: JobMeta) {
        let mut inner = self.inner.lock().expect("project mutex poisoned");
        inner.meta.job_metas.push(jmeta);
    }

    fn finish_with(&self, err_msg: String) {
        let mut inner = self.inner.lock().expect("project mutex poisoned");
        let pid = inner.meta.pid.clone();
        inner.meta.err_msg = err_msg;
        inner.meta.finished = true;
        inner.meta.end_ts = Some(Utc::now());
        inner.free = true;
        if inner.meta.err_msg.is_empty() {
            tracing::info!(%pid, "project finished");
        } else {
            tracing::error!(%pid, err = %inner.meta.err_msg, "project failed");
        }
    }

    /// Merged status snapshot: the stored per-job metas plus the live meta
    /// of the job currently running (when not yet stored).
    pub fn status(&self) -> ProjMeta {
        let mut meta = {
            let inner = self.inner.lock().expect("project mutex poisoned");
            inner.meta.clone()
        };
        if let Some(live) = self.jobs.current_meta() {
            let already_stored = meta
                .job_metas
                .iter()
                .any(|jm| jm.kind == live.kind && jm.start_ts == live.start_ts);
            // A live meta older than this run belongs to a previous project.
            let belongs_here = meta
                .start_ts
                .map(|ps| live.start_ts >= ps)
                .unwrap_or(false);
            if !already_stored && !meta.finished && belongs_here {
                meta.job_metas.push(live);
            }
        }
        meta
    }
}
