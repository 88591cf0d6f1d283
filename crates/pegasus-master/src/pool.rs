//! Worker pool manager: the single source of truth about worker existence,
//! identity, and health.
//!
//! Records live in a dense slot arena; each worker additionally belongs to at
//! most one state list (`free`, `busy`, `unstable`, `fault`, `dead`), kept as
//! ordered index sets. List membership and worker state always agree; a
//! worker is off-list only in the short window while a dispatch is posting
//! its task.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, mpsc};

use pegasus_core::{TaskReport, TaskSpec, WorkerRegForm};

use crate::config::MasterCfg;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Pending,
    Active,
    Unstable,
    Fault,
    Dead,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WorkerId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Free,
    Busy,
    Unstable,
    Fault,
    Dead,
}

#[derive(Debug)]
pub struct WorkerRecord {
    pub key: String,
    pub label: String,
    pub name: String,
    pub addr: String,
    pub state: WorkerState,
    pub status_start: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub last_hb: Option<DateTime<Utc>>,
    pub hb_win_cnt: u32,
    pub fault_cnt: u32,
    pub task_spec: Option<TaskSpec>,
    pub done_tasks: usize,
    list: Option<ListKind>,
    in_dispatch: bool,
}

/// Copy of one worker record for status queries and tests.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub key: String,
    pub label: String,
    pub addr: String,
    pub state: WorkerState,
    pub hb_win_cnt: u32,
    pub fault_cnt: u32,
    pub done_tasks: usize,
    pub task_tid: Option<String>,
}

/// One state transition observed by a monitor sweep.
#[derive(Debug, Clone)]
pub struct TransitionRec {
    pub label: String,
    pub addr: String,
    pub from: WorkerState,
    pub to: WorkerState,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no workers available")]
    Exhausted,
    #[error("worker key {0:?} not registered")]
    UnknownKey(String),
    #[error("report for task {got:?} does not match current assignment {want:?}")]
    StaleReport { got: String, want: String },
}

#[derive(Default)]
struct PoolInner {
    reg_num: u64,
    slots: Vec<Option<WorkerRecord>>,
    by_key: HashMap<String, WorkerId>,
    free: BTreeSet<WorkerId>,
    busy: BTreeSet<WorkerId>,
    unstable: BTreeSet<WorkerId>,
    fault: BTreeSet<WorkerId>,
    dead: BTreeSet<WorkerId>,
}

impl PoolInner {
    fn record(&self, id: WorkerId) -> Option<&WorkerRecord> {
        self.slots.get(id.0).and_then(|s| s.as_ref())
    }

    fn record_mut(&mut self, id: WorkerId) -> Option<&mut WorkerRecord> {
        self.slots.get_mut(id.0).and_then(|s| s.as_mut())
    }

    fn list_set(&mut self, list: ListKind) -> &mut BTreeSet<WorkerId> {
        match list {
            ListKind::Free => &mut self.free,
            ListKind::Busy => &mut self.busy,
            ListKind::Unstable => &mut self.unstable,
            ListKind::Fault => &mut self.fault,
            ListKind::Dead => &mut self.dead,
        }
    }

    fn remove_from_list(&mut self, id: WorkerId) {
        let Some(list) = self.record(id).and_then(|w| w.list) else {
            return;
        };
        self.list_set(list).remove(&id);
        if let Some(w) = self.record_mut(id) {
            w.list = None;
        }
    }

    /// Move a worker onto `list`. Returns true when it landed on `free`,
    /// i.e. when waiters should be woken.
    fn insert_into_list(&mut self, id: WorkerId, list: ListKind) -> bool {
        self.remove_from_list(id);
        self.list_set(list).insert(id);
        if let Some(w) = self.record_mut(id) {
            w.list = Some(list);
        }
        list == ListKind::Free
    }

    fn set_state(&mut self, id: WorkerId, state: WorkerState) {
        if let Some(w) = self.record_mut(id) {
            w.state = state;
            w.status_start = Utc::now();
        }
    }

    fn remove_worker(&mut self, id: WorkerId) {
        self.remove_from_list(id);
        if let Some(slot) = self.slots.get_mut(id.0) {
            if let Some(w) = slot.take() {
                self.by_key.remove(&w.key);
            }
        }
    }

    /// True while at least one worker could still serve a dispatch now or
    /// in the future. Dead and Fault workers never come back.
    fn has_viable_worker(&self) -> bool {
        self.slots.iter().flatten().any(|w| {
            matches!(
                w.state,
                WorkerState::Pending | WorkerState::Active | WorkerState::Unstable
            )
        })
    }

    fn pop_free(&mut self) -> Option<WorkerId> {
        let id = self.free.iter().next().copied()?;
        self.free.remove(&id);
        if let Some(w) = self.record_mut(id) {
            w.list = None;
            w.in_dispatch = true;
        }
        Some(id)
    }
}

pub struct WorkerPool {
    cfg: MasterCfg,
    http: reqwest::Client,
    inner: Mutex<PoolInner>,
    free_notify: Notify,
    reassign_tx: Mutex<Option<mpsc::UnboundedSender<TaskSpec>>>,
}

impl WorkerPool {
    pub fn new(cfg: MasterCfg) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            cfg,
            http,
            inner: Mutex::new(PoolInner::default()),
            free_notify: Notify::new(),
            reassign_tx: Mutex::new(None),
        })
    }

    pub fn cfg(&self) -> &MasterCfg {
        &self.cfg
    }

    /// First registration step: allocate a key and a Pending record.
    pub fn register(&self) -> String {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        let now = Utc::now();
        let key = format!("{}-{}", now.timestamp_nanos_opt().unwrap_or_default(), inner.reg_num);
        let label = format!("Worker#{:03}", inner.reg_num);
        inner.reg_num += 1;

        let record = WorkerRecord {
            key: key.clone(),
            label: label.clone(),
            name: String::new(),
            addr: String::new(),
            state: WorkerState::Pending,
            status_start: now,
            registered_at: now,
            last_hb: None,
            hb_win_cnt: 0,
            fault_cnt: 0,
            task_spec: None,
            done_tasks: 0,
            list: None,
            in_dispatch: false,
        };
        let id = WorkerId(inner.slots.len());
        inner.slots.push(Some(record));
        inner.by_key.insert(key.clone(), id);
        tracing::info!(%key, %label, "worker registered");
        key
    }

    /// Second registration step: record the address and admit the worker.
    pub fn verify(&self, key: &str, form: &WorkerRegForm) -> Result<(), PoolError> {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        let id = *inner
            .by_key
            .get(key)
            .ok_or_else(|| PoolError::UnknownKey(key.to_string()))?;

        let start_unstable = self.cfg.start_unstable;
        let (label, addr) = {
            let w = inner.record_mut(id).ok_or_else(|| PoolError::UnknownKey(key.to_string()))?;
            w.name = form.name.clone();
            w.addr = form.addr();
            (w.label.clone(), w.addr.clone())
        };

        let woke_free = if start_unstable {
            inner.set_state(id, WorkerState::Unstable);
            inner.insert_into_list(id, ListKind::Unstable)
        } else {
            inner.set_state(id, WorkerState::Active);
            inner.insert_into_list(id, ListKind::Free)
        };
        drop(inner);

        tracing::info!(%key, %label, %addr, "worker verified");
        if woke_free {
            self.free_notify.notify_waiters();
        }
        Ok(())
    }

    pub fn update_heartbeat(&self, key: &str, ts: DateTime<Utc>) -> Result<(), PoolError> {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        let id = *inner
            .by_key
            .get(key)
            .ok_or_else(|| PoolError::UnknownKey(key.to_string()))?;
        let w = inner
            .record_mut(id)
            .ok_or_else(|| PoolError::UnknownKey(key.to_string()))?;
        w.hb_win_cnt += 1;
        w.last_hb = Some(ts);
        Ok(())
    }

    /// Route task reassignments for the currently running job.
    pub fn set_reassign_sink(&self, tx: mpsc::UnboundedSender<TaskSpec>) {
        *self.reassign_tx.lock().expect("reassign mutex poisoned") = Some(tx);
    }

    pub fn clear_reassign_sink(&self) {
        *self.reassign_tx.lock().expect("reassign mutex poisoned") = None;
    }

    fn reassign(&self, tspec: TaskSpec) {
        let guard = self.reassign_tx.lock().expect("reassign mutex poisoned");
        match guard.as_ref() {
            Some(tx) => {
                tracing::info!(tid = %tspec.tid, "reassign task");
                let _ = tx.send(tspec);
            }
            None => {
                tracing::warn!(tid = %tspec.tid, "no job running, dropping orphaned task");
            }
        }
    }

    /// Pop a free worker, waiting until one joins `free` or no viable
    /// worker remains in the pool.
    async fn get_free_worker(&self) -> Result<(WorkerId, String, String), PoolError> {
        loop {
            let notified = self.free_notify.notified();
            {
                let mut inner = self.inner.lock().expect("pool mutex poisoned");
                if let Some(id) = inner.pop_free() {
                    let w = inner.record(id).expect("popped worker must exist");
                    return Ok((id, w.addr.clone(), w.label.clone()));
                }
                if !inner.has_viable_worker() {
                    return Err(PoolError::Exhausted);
                }
            }
            notified.await;
        }
    }

    /// Dispatch one task spec to some free worker, demoting workers that
    /// fail the HTTP post and retrying until a post sticks or the pool is
    /// exhausted. Returns the label of the worker that took the task.
    ///
    /// The assignment is recorded before the post so that a worker fast
    /// enough to report back mid-dispatch still matches its assignment;
    /// the report path defers list placement to us in that case.
    pub async fn dispatch_task(&self, tspec: &TaskSpec) -> Result<String, PoolError> {
        enum After {
            Removed,
            Busy,
            Release(WorkerState),
            Demote,
        }

        loop {
            let (id, addr, label) = self.get_free_worker().await?;
            {
                let mut inner = self.inner.lock().expect("pool mutex poisoned");
                if let Some(w) = inner.record_mut(id) {
                    w.task_spec = Some(tspec.clone());
                }
            }

            let url = format!("http://{addr}/task");
            let res = self.http.post(&url).json(tspec).send().await;
            let posted = match res {
                Ok(res) if res.status().is_success() => true,
                Ok(res) => {
                    let status = res.status();
                    let body = res.text().await.unwrap_or_default();
                    tracing::warn!(%label, %status, %body, "task post rejected");
                    false
                }
                Err(err) => {
                    tracing::warn!(%label, error = %err, "task post failed");
                    false
                }
            };

            let mut inner = self.inner.lock().expect("pool mutex poisoned");
            let after = match inner.record_mut(id) {
                // Removed while the post was in flight; try another worker.
                None => After::Removed,
                Some(w) => {
                    w.in_dispatch = false;
                    let still_assigned = w
                        .task_spec
                        .as_ref()
                        .map(|t| t.tid == tspec.tid)
                        .unwrap_or(false);
                    if posted {
                        if still_assigned {
                            After::Busy
                        } else {
                            // Reported before we got here; place it now.
                            After::Release(w.state)
                        }
                    } else {
                        if still_assigned {
                            w.task_spec = None;
                        }
                        After::Demote
                    }
                }
            };

            match after {
                After::Removed => continue,
                After::Busy => {
                    inner.insert_into_list(id, ListKind::Busy);
                    tracing::info!(tid = %tspec.tid, %label, "task dispatched");
                    return Ok(label);
                }
                After::Release(state) => {
                    let woke = match state {
                        WorkerState::Fault => inner.insert_into_list(id, ListKind::Fault),
                        WorkerState::Unstable => inner.insert_into_list(id, ListKind::Unstable),
                        _ => inner.insert_into_list(id, ListKind::Free),
                    };
                    drop(inner);
                    if woke {
                        self.free_notify.notify_waiters();
                    }
                    tracing::info!(tid = %tspec.tid, %label, "task dispatched and already reported");
                    return Ok(label);
                }
                After::Demote => {
                    inner.set_state(id, WorkerState::Unstable);
                    inner.insert_into_list(id, ListKind::Unstable);
                }
            }
        }
    }

    /// Apply a task report to the worker that sent it and release the
    /// worker back to the pool, returning the assignment the report closed.
    /// Reports carrying an unknown key or a tid that is not the worker's
    /// current assignment leave the pool untouched.
    pub fn handle_task_report(&self, key: &str, report: &TaskReport) -> Result<TaskSpec, PoolError> {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        let id = *inner
            .by_key
            .get(key)
            .ok_or_else(|| PoolError::UnknownKey(key.to_string()))?;

        let max_fault = self.cfg.max_fault_cnt;
        let (label, tspec, goes_fault, was_unstable, mid_dispatch) = {
            let w = inner
                .record_mut(id)
                .ok_or_else(|| PoolError::UnknownKey(key.to_string()))?;
            match &w.task_spec {
                Some(t) if t.tid == report.tid => {}
                other => {
                    return Err(PoolError::StaleReport {
                        got: report.tid.clone(),
                        want: other.as_ref().map(|t| t.tid.clone()).unwrap_or_default(),
                    });
                }
            }
            let tspec = w.task_spec.take().expect("tid matched above");
            if report.failed() {
                w.fault_cnt += 1;
            } else {
                w.done_tasks += 1;
            }
            (
                w.label.clone(),
                tspec,
                report.failed() && w.fault_cnt >= max_fault,
                w.state == WorkerState::Unstable,
                w.in_dispatch,
            )
        };

        if goes_fault {
            inner.set_state(id, WorkerState::Fault);
            tracing::warn!(%label, "worker moved to fault");
        }
        // A worker still mid-dispatch is placed by the dispatching side
        // once its post bookkeeping finishes.
        let woke_free = if mid_dispatch {
            false
        } else if goes_fault {
            inner.insert_into_list(id, ListKind::Fault)
        } else if was_unstable {
            inner.insert_into_list(id, ListKind::Unstable)
        } else {
            inner.insert_into_list(id, ListKind::Free)
        };
        drop(inner);

        tracing::info!(%label, tid = %report.tid, failed = report.failed(), "task report handled");
        if woke_free || goes_fault {
            // Fault releases can make the pool hopeless; blocked
            // dispatchers must re-check.
            self.free_notify.notify_waiters();
        }
        Ok(tspec)
    }

    pub fn worker_exists(&self, key: &str) -> bool {
        let inner = self.inner.lock().expect("pool mutex poisoned");
        inner.by_key.contains_key(key)
    }

    pub fn workers_snapshot(&self) -> Vec<WorkerSnapshot> {
        let inner = self.inner.lock().expect("pool mutex poisoned");
        inner
            .slots
            .iter()
            .flatten()
            .map(|w| WorkerSnapshot {
                key: w.key.clone(),
                label: w.label.clone(),
                addr: w.addr.clone(),
                state: w.state,
                hb_win_cnt: w.hb_win_cnt,
                fault_cnt: w.fault_cnt,
                done_tasks: w.done_tasks,
                task_tid: w.task_spec.as_ref().map(|t| t.tid.clone()),
            })
            .collect()
    }

    /// One monitor sweep: evaluate every worker's heartbeat window, apply
    /// the state machine, reap Pending/Dead workers, and requeue tasks held
    /// by workers that just died.
    pub fn monitor_sweep(&self) -> Vec<TransitionRec> {
        let now = Utc::now();
        let mut recs = Vec::new();
        let mut orphaned: Vec<TaskSpec> = Vec::new();
        let mut woke = false;

        {
            let mut inner = self.inner.lock().expect("pool mutex poisoned");
            let ids: Vec<WorkerId> = (0..inner.slots.len())
                .map(WorkerId)
                .filter(|id| inner.record(*id).is_some())
                .collect();

            for id in ids {
                let (state, status_start, registered_at, hb_win_cnt, in_dispatch, label, addr) = {
                    let w = inner.record(id).expect("checked above");
                    (
                        w.state,
                        w.status_start,
                        w.registered_at,
                        w.hb_win_cnt,
                        w.in_dispatch,
                        w.label.clone(),
                        w.addr.clone(),
                    )
                };

                if in_dispatch || state == WorkerState::Fault {
                    continue;
                }

                if state == WorkerState::Pending {
                    let waited = (now - registered_at)
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    if waited >= self.cfg.pending_grace() {
                        inner.remove_worker(id);
                        woke = true;
                        recs.push(TransitionRec {
                            label,
                            addr,
                            from: state,
                            to: WorkerState::Removed,
                        });
                    }
                    continue;
                }

                let in_state = (now - status_start).to_std().unwrap_or(Duration::ZERO);
                if in_state < self.cfg.monitor_interval() {
                    continue;
                }

                if state == WorkerState::Dead {
                    inner.remove_worker(id);
                    woke = true;
                    recs.push(TransitionRec {
                        label,
                        addr,
                        from: state,
                        to: WorkerState::Removed,
                    });
                    continue;
                }

                if hb_win_cnt >= self.cfg.hb_cnt_good {
                    if state == WorkerState::Unstable {
                        inner.set_state(id, WorkerState::Active);
                        let has_task = inner
                            .record(id)
                            .map(|w| w.task_spec.is_some())
                            .unwrap_or(false);
                        if !has_task {
                            woke |= inner.insert_into_list(id, ListKind::Free);
                        }
                        recs.push(TransitionRec {
                            label,
                            addr,
                            from: state,
                            to: WorkerState::Active,
                        });
                    }
                } else if hb_win_cnt < self.cfg.hb_cnt_norm {
                    match state {
                        WorkerState::Active => {
                            inner.set_state(id, WorkerState::Unstable);
                            let has_task = inner
                                .record(id)
                                .map(|w| w.task_spec.is_some())
                                .unwrap_or(false);
                            if !has_task {
                                inner.insert_into_list(id, ListKind::Unstable);
                            }
                            recs.push(TransitionRec {
                                label,
                                addr,
                                from: state,
                                to: WorkerState::Unstable,
                            });
                        }
                        WorkerState::Unstable => {
                            if let Some(w) = inner.record_mut(id) {
                                if let Some(tspec) = w.task_spec.take() {
                                    orphaned.push(tspec);
                                }
                            }
                            inner.set_state(id, WorkerState::Dead);
                            inner.insert_into_list(id, ListKind::Dead);
                            woke = true;
                            recs.push(TransitionRec {
                                label,
                                addr,
                                from: state,
                                to: WorkerState::Dead,
                            });
                        }
                        _ => {}
                    }
                }

                if let Some(w) = inner.record_mut(id) {
                    w.hb_win_cnt = 0;
                }
            }
        }

        for tspec in orphaned {
            self.reassign(tspec);
        }
        if woke {
            // Removals and deaths can make the pool hopeless; blocked
            // dispatchers must re-check.
            self.free_notify.notify_waiters();
        }
        recs
    }

    /// Run the monitor sweep forever at the configured interval.
    pub fn spawn_monitor(self: &std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let period = pool.cfg.monitor_interval().max(Duration::from_millis(1));
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so workers get one
            // full window before evaluation.
            tick.tick().await;
            loop {
                tick.tick().await;
                let recs = pool.monitor_sweep();
                for rec in &recs {
                    tracing::info!(
                        label = %rec.label,
                        addr = %rec.addr,
                        from = ?rec.from,
                        to = ?rec.to,
                        "worker state transition"
                    );
                }
            }
        })
    }

    /// Check the state/list agreement invariant; test hook.
    #[cfg(test)]
    pub(crate) fn assert_lists_agree(&self) {
        let inner = self.inner.lock().expect("pool mutex poisoned");
        for (idx, slot) in inner.slots.iter().enumerate() {
            let Some(w) = slot else { continue };
            let id = WorkerId(idx);
            if w.in_dispatch {
                assert!(w.list.is_none(), "{}: dispatching worker on a list", w.label);
                continue;
            }
            let expected = match (w.state, w.task_spec.is_some()) {
                (WorkerState::Pending, _) => None,
                (_, true) => Some(ListKind::Busy),
                (WorkerState::Active, false) => Some(ListKind::Free),
                (WorkerState::Unstable, false) => Some(ListKind::Unstable),
                (WorkerState::Fault, false) => Some(ListKind::Fault),
                (WorkerState::Dead, false) => Some(ListKind::Dead),
                (WorkerState::Removed, false) => None,
            };
            assert_eq!(w.list, expected, "{}: state/list disagree", w.label);
            if let Some(list) = w.list {
                let present = match list {
                    ListKind::Free => inner.free.contains(&id),
                    ListKind::Busy => inner.busy.contains(&id),
                    ListKind::Unstable => inner.unstable.contains(&id),
                    ListKind::Fault => inner.fault.contains(&id),
                    ListKind::Dead => inner.dead.contains(&id),
                };
                assert!(present, "{}: missing from its list", w.label);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_cfg() -> MasterCfg {
        MasterCfg {
            hb_interval_ms: 10,
            // Zero interval opens every monitor gate immediately.
            monitor_interval_ms: 0,
            ..MasterCfg::default()
        }
    }

    fn form(port: u16) -> WorkerRegForm {
        WorkerRegForm {
            name: "w".into(),
            ip: "127.0.0.1".into(),
            port,
        }
    }

    fn state_of(pool: &WorkerPool, key: &str) -> WorkerState {
        pool.workers_snapshot()
            .into_iter()
            .find(|w| w.key == key)
            .map(|w| w.state)
            .expect("worker present")
    }

    #[test]
    fn register_then_verify_lands_on_free() {
        let pool = WorkerPool::new(fast_cfg()).unwrap();
        let key = pool.register();
        assert_eq!(state_of(&pool, &key), WorkerState::Pending);

        pool.verify(&key, &form(9001)).unwrap();
        assert_eq!(state_of(&pool, &key), WorkerState::Active);
        pool.assert_lists_agree();
    }

    #[test]
    fn verify_with_unknown_key_is_rejected() {
        let pool = WorkerPool::new(fast_cfg()).unwrap();
        let err = pool.verify("nope", &form(9001)).unwrap_err();
        assert!(matches!(err, PoolError::UnknownKey(_)));
        assert!(pool.workers_snapshot().is_empty());
    }

    #[test]
    fn start_unstable_policy_defers_admission() {
        let cfg = MasterCfg {
            start_unstable: true,
            ..fast_cfg()
        };
        let pool = WorkerPool::new(cfg).unwrap();
        let key = pool.register();
        pool.verify(&key, &form(9001)).unwrap();
        assert_eq!(state_of(&pool, &key), WorkerState::Unstable);
        pool.assert_lists_agree();

        // A good heartbeat window promotes it.
        for _ in 0..5 {
            pool.update_heartbeat(&key, Utc::now()).unwrap();
        }
        pool.monitor_sweep();
        assert_eq!(state_of(&pool, &key), WorkerState::Active);
        pool.assert_lists_agree();
    }

    #[test]
    fn heartbeat_with_unknown_key_never_mutates() {
        let pool = WorkerPool::new(fast_cfg()).unwrap();
        let key = pool.register();
        pool.verify(&key, &form(9001)).unwrap();

        let err = pool.update_heartbeat("bogus", Utc::now()).unwrap_err();
        assert!(matches!(err, PoolError::UnknownKey(_)));
        let snap = pool.workers_snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].hb_win_cnt, 0);
    }

    #[test]
    fn silent_worker_walks_active_unstable_dead_removed() {
        let pool = WorkerPool::new(fast_cfg()).unwrap();
        let key = pool.register();
        pool.verify(&key, &form(9001)).unwrap();

        pool.monitor_sweep();
        assert_eq!(state_of(&pool, &key), WorkerState::Unstable);
        pool.assert_lists_agree();

        pool.monitor_sweep();
        assert_eq!(state_of(&pool, &key), WorkerState::Dead);
        pool.assert_lists_agree();

        pool.monitor_sweep();
        assert!(pool.workers_snapshot().is_empty());
    }

    #[test]
    fn window_counter_resets_each_sweep() {
        let pool = WorkerPool::new(fast_cfg()).unwrap();
        let key = pool.register();
        pool.verify(&key, &form(9001)).unwrap();

        for _ in 0..7 {
            pool.update_heartbeat(&key, Utc::now()).unwrap();
        }
        assert_eq!(pool.workers_snapshot()[0].hb_win_cnt, 7);
        pool.monitor_sweep();
        assert_eq!(pool.workers_snapshot()[0].hb_win_cnt, 0);
        assert_eq!(state_of(&pool, &key), WorkerState::Active);
    }

    #[test]
    fn pending_worker_survives_its_grace_window() {
        let cfg = MasterCfg {
            // A long window keeps the grace gate shut.
            monitor_interval_ms: 60_000,
            ..MasterCfg::default()
        };
        let pool = WorkerPool::new(cfg).unwrap();
        let key = pool.register();

        pool.monitor_sweep();
        assert_eq!(state_of(&pool, &key), WorkerState::Pending);
    }

    #[test]
    fn stale_report_is_rejected_without_release() {
        let pool = WorkerPool::new(fast_cfg()).unwrap();
        let key = pool.register();
        pool.verify(&key, &form(9001)).unwrap();

        let report = TaskReport {
            err: String::new(),
            tid: "tsk-1-0".into(),
            kind: "k".into(),
            start_ts: Utc::now(),
            end_ts: Utc::now(),
            status: None,
            output: serde_json::Value::Null,
        };
        let err = pool.handle_task_report(&key, &report).unwrap_err();
        assert!(matches!(err, PoolError::StaleReport { .. }));
        assert_eq!(pool.workers_snapshot()[0].done_tasks, 0);
        pool.assert_lists_agree();
    }

    #[tokio::test]
    async fn dispatch_on_empty_pool_is_exhausted() {
        let pool = WorkerPool::new(fast_cfg()).unwrap();
        let tspec = TaskSpec {
            tid: "tsk-1-0".into(),
            kind: "k".into(),
            spec: serde_json::Value::Null,
        };
        let err = pool.dispatch_task(&tspec).await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted));
    }
}
