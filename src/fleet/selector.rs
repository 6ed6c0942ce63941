//! Worker selection: scores connected workers for a task type.
//!
//! Score = 50 base, then:
//! - +20 if the worker declares the task's tool category
//! - up to +15 for low average latency (0 at 15s or more)
//! - up to +15 for a low error rate (only once the worker has run tasks)
//! - +10 per distinct preferred tag the worker carries
//! - -30 if the worker reports itself busy
//! - +5 with a GPU, +5 with 16 GB RAM or more
//!
//! Ties go to the lowest worker id.

use std::sync::Arc;

use tracing::debug;

use crate::fleet::model::{TaskType, Worker, WorkerStatus, normalize_tags};
use crate::fleet::registry::WorkerRegistry;

const BASE_SCORE: f64 = 50.0;
const CATEGORY_BONUS: f64 = 20.0;
const LATENCY_BONUS_MAX: f64 = 15.0;
const RELIABILITY_BONUS_MAX: f64 = 15.0;
const TAG_BONUS: f64 = 10.0;
const BUSY_PENALTY: f64 = 30.0;
const GPU_BONUS: f64 = 5.0;
const RAM_BONUS: f64 = 5.0;
const RAM_BONUS_THRESHOLD_GB: f64 = 16.0;

/// Score one worker for a task type.
pub fn score(worker: &Worker, task_type: TaskType, preferred_tags: &[String]) -> f64 {
    let mut score = BASE_SCORE;

    if let Some(category) = task_type.required_category()
        && worker.capabilities.supports(category)
    {
        score += CATEGORY_BONUS;
    }

    score += (LATENCY_BONUS_MAX - worker.avg_latency_ms / 1000.0).max(0.0);

    if let Some(error_rate) = worker.error_rate() {
        score += (1.0 - error_rate) * RELIABILITY_BONUS_MAX;
    }

    let matching_tags = normalize_tags(preferred_tags.to_vec())
        .iter()
        .filter(|t| worker.has_tag(t))
        .count();
    score += matching_tags as f64 * TAG_BONUS;

    if worker.status == WorkerStatus::Busy {
        score -= BUSY_PENALTY;
    }

    if worker.capabilities.gpu {
        score += GPU_BONUS;
    }
    if worker.capabilities.ram_gb >= RAM_BONUS_THRESHOLD_GB {
        score += RAM_BONUS;
    }

    score
}

/// Pick the highest-scoring candidate. Candidates must be in id order for the
/// tie-break to hold.
pub fn pick_best(
    candidates: Vec<Worker>,
    task_type: TaskType,
    preferred_tags: &[String],
) -> Option<Worker> {
    let mut best: Option<(Worker, f64)> = None;
    for worker in candidates {
        if !worker.status.is_available() {
            continue;
        }
        let s = score(&worker, task_type, preferred_tags);
        debug!(worker_id = %worker.id, name = %worker.name, score = s, "Scored worker");
        match &best {
            Some((_, best_score)) if s <= *best_score => {}
            _ => best = Some((worker, s)),
        }
    }
    best.map(|(worker, _)| worker)
}

pub struct WorkerSelector {
    registry: Arc<WorkerRegistry>,
}

impl WorkerSelector {
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self { registry }
    }

    /// Best connected worker for the task type, or `None` when no route exists.
    pub async fn select_best(
        &self,
        task_type: TaskType,
        preferred_tags: &[String],
    ) -> Option<Worker> {
        let candidates = self.registry.list_online().await;
        if candidates.is_empty() {
            debug!(task_type = %task_type, "No online workers");
            return None;
        }
        pick_best(candidates, task_type, preferred_tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::model::Capabilities;
    use crate::fleet::registry::Registration;
    use crate::fleet::store::MemoryStore;
    use crate::fleet::model::ConnectionHandle;

    fn worker(name: &str, tools: &[&str]) -> Worker {
        let mut w = Worker::new(
            name,
            "",
            Capabilities {
                hostname: name.to_lowercase(),
                tools: tools.iter().map(|t| t.to_string()).collect(),
                ..Default::default()
            },
            vec![],
        );
        w.status = WorkerStatus::Online;
        w
    }

    #[test]
    fn reliable_fast_worker_wins() {
        let mut a = worker("A", &["command"]);
        a.avg_latency_ms = 500.0;
        a.task_count = 10;
        let mut b = worker("B", &[]);
        b.avg_latency_ms = 2000.0;
        b.task_count = 10;
        b.error_count = 5;

        let sa = score(&a, TaskType::Command, &[]);
        let sb = score(&b, TaskType::Command, &[]);
        assert!((sa - 99.5).abs() < 1e-9);
        assert!((sb - 70.5).abs() < 1e-9);

        let picked = pick_best(vec![b, a.clone()], TaskType::Command, &[]).unwrap();
        assert_eq!(picked.id, a.id);
    }

    #[test]
    fn same_category_still_prefers_lower_latency_and_errors() {
        let mut a = worker("A", &["command"]);
        a.avg_latency_ms = 500.0;
        a.task_count = 4;
        let mut b = worker("B", &["command"]);
        b.avg_latency_ms = 3000.0;
        b.task_count = 4;
        b.error_count = 1;
        assert!(score(&a, TaskType::Command, &[]) > score(&b, TaskType::Command, &[]));
    }

    #[test]
    fn untested_worker_gets_no_reliability_term() {
        let w = worker("fresh", &[]);
        // base + full latency bonus (no samples yet)
        assert!((score(&w, TaskType::SystemInfo, &[]) - 65.0).abs() < 1e-9);
    }

    #[test]
    fn latency_bonus_saturates_at_zero() {
        let mut w = worker("slow", &[]);
        w.avg_latency_ms = 40_000.0;
        assert!((score(&w, TaskType::SystemInfo, &[]) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn tags_hardware_and_busy_adjust_score() {
        let mut w = worker("rig", &["desktop"]);
        w.tags = vec!["gpu".into(), "home".into()];
        w.capabilities.gpu = true;
        w.capabilities.ram_gb = 32.0;
        let tags = vec!["home".to_string(), "gpu".to_string(), "office".to_string()];
        // 50 + 20 + 15 + 20 + 5 + 5
        assert!((score(&w, TaskType::Screenshot, &tags) - 115.0).abs() < 1e-9);

        w.status = WorkerStatus::Busy;
        assert!((score(&w, TaskType::Screenshot, &tags) - 85.0).abs() < 1e-9);
    }

    #[test]
    fn repeated_preferred_tags_count_once() {
        let mut w = worker("rig", &[]);
        w.tags = vec!["home".into()];
        let once = score(&w, TaskType::Custom, &["home".to_string()]);
        let repeated = score(
            &w,
            TaskType::Custom,
            &["home".to_string(), "HOME".to_string(), " home ".to_string()],
        );
        assert!((once - 75.0).abs() < 1e-9);
        assert!((repeated - once).abs() < 1e-9);
    }

    #[test]
    fn busy_worker_is_still_eligible() {
        let mut only = worker("only", &["command"]);
        only.status = WorkerStatus::Busy;
        assert!(pick_best(vec![only], TaskType::Command, &[]).is_some());
    }

    #[test]
    fn never_picks_offline_or_errored() {
        let mut off = worker("off", &["command"]);
        off.status = WorkerStatus::Offline;
        let mut broken = worker("broken", &["command"]);
        broken.status = WorkerStatus::Error;
        assert!(pick_best(vec![off, broken], TaskType::Command, &[]).is_none());
    }

    #[test]
    fn tie_goes_to_first_candidate() {
        let mut a = worker("a", &[]);
        let mut b = worker("b", &[]);
        if b.id < a.id {
            std::mem::swap(&mut a, &mut b);
        }
        let picked = pick_best(vec![a.clone(), b], TaskType::Custom, &[]).unwrap();
        assert_eq!(picked.id, a.id);
    }

    #[tokio::test]
    async fn select_best_uses_connected_workers_only() {
        let registry = Arc::new(
            WorkerRegistry::load(Arc::new(MemoryStore::new()))
                .await
                .unwrap(),
        );
        let selector = WorkerSelector::new(Arc::clone(&registry));
        assert!(selector.select_best(TaskType::Command, &[]).await.is_none());

        let registered = registry
            .register(Registration {
                name: "Garage-PC".into(),
                description: String::new(),
                capabilities: Capabilities {
                    hostname: "garage".into(),
                    tools: vec!["command".into()],
                    ..Default::default()
                },
                tags: vec![],
            })
            .await
            .unwrap();
        // Registered but not connected.
        assert!(selector.select_best(TaskType::Command, &[]).await.is_none());

        let (handle, _rx) = ConnectionHandle::new();
        registry.set_online(registered.id, handle).await.unwrap();
        let picked = selector.select_best(TaskType::Command, &[]).await.unwrap();
        assert_eq!(picked.id, registered.id);
        assert_eq!(picked.status, WorkerStatus::Online);
    }
}
