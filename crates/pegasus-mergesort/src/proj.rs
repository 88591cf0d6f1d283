//! Project wiring: randints → mergesort → dumpres.

use serde::Deserialize;
use serde_json::Value;

use pegasus_core::task::ProjStats;
use pegasus_core::{Project, SharedJob, shared_job};

use crate::dumpres::JobDumpres;
use crate::mergesort::JobMergesort;
use crate::randints::JobRandInts;

pub const PROJ_MERGESORT: &str = "Mergesort";

#[derive(Debug, Default, Deserialize)]
struct MergesortConfig {
    #[serde(default)]
    out_dir: Option<String>,
}

#[derive(Default)]
pub struct ProjMergesort {
    env: Option<Value>,
    jobs: Vec<SharedJob>,
}

pub fn project_factory() -> Box<dyn Project> {
    Box::new(ProjMergesort::default())
}

impl Project for ProjMergesort {
    fn name(&self) -> &str {
        PROJ_MERGESORT
    }

    fn init_jobs(&mut self) {
        let dumpres: SharedJob = shared_job(JobDumpres::new());
        let mergesort: SharedJob = shared_job(JobMergesort::new(vec![dumpres.clone()]));
        let randints: SharedJob = shared_job(JobRandInts::new(vec![mergesort.clone()]));
        self.jobs = vec![randints, mergesort, dumpres];
    }

    fn init(&mut self, config: &str) -> anyhow::Result<()> {
        let config = config.trim();
        let cfg: MergesortConfig = if config.is_empty() {
            MergesortConfig::default()
        } else {
            serde_json::from_str(config)
                .map_err(|err| anyhow::anyhow!("Fail to parse project config, {err}"))?
        };
        self.env = Some(serde_json::json!({ "out_dir": cfg.out_dir }));
        self.init_jobs();
        Ok(())
    }

    fn env(&self) -> Option<Value> {
        self.env.clone()
    }

    fn jobs(&self) -> Vec<SharedJob> {
        self.jobs.clone()
    }

    fn finish(&mut self, stats: &ProjStats) -> anyhow::Result<()> {
        tracing::info!(
            jobs = stats.job_count,
            took = %(stats.end_ts - stats.start_ts),
            "mergesort project finished"
        );
        Ok(())
    }
}
