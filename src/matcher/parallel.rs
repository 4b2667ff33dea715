//! Parallel fan-out over base matchers
//!
//! `match_request` pushes each base matcher onto a bounded task channel and
//! spawns a pool of worker tasks that drain it, collecting per-matcher
//! results. Any worker error discards all partial results. The final match
//! list is a stable descending sort by rule priority; batches are reordered
//! by dispatch index first so the output does not depend on worker
//! scheduling.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{WafError, WafResult};
use crate::matcher::Matcher;
use crate::model::{sort_matches_by_priority, CheckRequest, RuleMatch};
use crate::model::Rule;

pub struct ParallelMatcher {
    matchers: RwLock<Vec<Arc<dyn Matcher>>>,
    workers: RwLock<usize>,
}

impl Default for ParallelMatcher {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ParallelMatcher {
    pub fn new(matchers: Vec<Arc<dyn Matcher>>) -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            matchers: RwLock::new(matchers),
            workers: RwLock::new(workers),
        }
    }

    pub fn set_workers(&self, workers: usize) -> WafResult<()> {
        if workers == 0 {
            return Err(WafError::rule_match("worker count must be positive"));
        }
        *self.workers.write() = workers;
        Ok(())
    }

    /// Index a rule into every base matcher. A failure aborts and surfaces;
    /// callers must expect partial state and retry or reload.
    pub fn add(&self, rule: &Rule) -> WafResult<()> {
        let matchers = self.matchers.write();
        for matcher in matchers.iter() {
            matcher.add(rule)?;
        }
        Ok(())
    }

    /// Remove a rule from every base matcher.
    pub fn remove(&self, rule_id: i64) -> WafResult<()> {
        if rule_id <= 0 {
            return Err(WafError::rule_match("invalid rule id"));
        }
        let matchers = self.matchers.write();
        for matcher in matchers.iter() {
            matcher.remove(rule_id)?;
        }
        Ok(())
    }

    pub fn clear(&self) -> WafResult<()> {
        let matchers = self.matchers.write();
        for matcher in matchers.iter() {
            matcher.clear()?;
        }
        Ok(())
    }

    /// Fan the request out to all base matchers and aggregate their matches,
    /// sorted by rule priority descending (stable on ties).
    pub async fn match_request(
        &self,
        cancel: &CancelToken,
        req: &CheckRequest,
    ) -> WafResult<Vec<RuleMatch>> {
        cancel.ensure_active()?;
        if req.uri.is_empty() {
            return Err(WafError::rule_match("request uri must not be empty"));
        }

        let (matchers, workers) = {
            let guard = self.matchers.read();
            (guard.clone(), *self.workers.read())
        };
        if matchers.is_empty() {
            return Err(WafError::rule_match("no matchers available"));
        }

        let (task_tx, task_rx) = mpsc::channel::<(usize, Arc<dyn Matcher>)>(matchers.len());
        let (result_tx, mut result_rx) = mpsc::channel::<(usize, Vec<RuleMatch>)>(matchers.len());
        let (err_tx, mut err_rx) = mpsc::channel::<WafError>(matchers.len());
        let task_rx = Arc::new(Mutex::new(task_rx));

        let req = Arc::new(req.clone());
        let worker_count = workers.min(matchers.len());
        let mut handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let task_rx = Arc::clone(&task_rx);
            let result_tx = result_tx.clone();
            let err_tx = err_tx.clone();
            let cancel = cancel.clone();
            let req = Arc::clone(&req);

            handles.push(tokio::spawn(async move {
                loop {
                    let task = { task_rx.lock().await.recv().await };
                    let Some((idx, matcher)) = task else {
                        break;
                    };
                    match matcher.match_request(&cancel, &req) {
                        Ok(matches) => {
                            let _ = result_tx.send((idx, matches)).await;
                        }
                        Err(err) => {
                            let _ = err_tx.send(err).await;
                            break;
                        }
                    }
                }
            }));
        }
        // Workers hold the only remaining clones; result channels close when
        // they finish.
        drop(result_tx);
        drop(err_tx);

        // Dispatch, aborting immediately if the caller cancels.
        for (idx, matcher) in matchers.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(WafError::rule_match("operation cancelled"));
            }
            if task_tx.send((idx, matcher)).await.is_err() {
                break;
            }
        }
        drop(task_tx);

        let mut batches = Vec::new();
        while let Some(batch) = result_rx.recv().await {
            batches.push(batch);
        }
        let first_err = err_rx.recv().await;

        for handle in handles {
            if handle.await.is_err() {
                return Err(WafError::system("matcher worker panicked"));
            }
        }

        if let Some(err) = first_err {
            return Err(err);
        }

        // Batches arrive in completion order; restore dispatch order before
        // the priority sort so ties break deterministically.
        batches.sort_by_key(|(idx, _)| *idx);
        let mut all: Vec<RuleMatch> = batches.into_iter().flat_map(|(_, m)| m).collect();
        sort_matches_by_priority(&mut all);

        debug!(matches = all.len(), "parallel match complete");
        Ok(all)
    }
}
