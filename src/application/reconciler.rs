use crate::domain::models::{InstanceStatus, Target, TargetInstance};
use crate::domain::window::Window;
use crate::infrastructure::error::EngineError;
use crate::infrastructure::instance_repository::{CreateOutcome, TargetInstanceRepository};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration as TokioDuration};

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const DEFAULT_WRITE_CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u8,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedTarget {
    pub target_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub active: Vec<TargetInstance>,
    pub created: usize,
    pub expired: usize,
    pub skipped: Vec<SkippedTarget>,
}

pub struct InstanceReconciler<R: TargetInstanceRepository> {
    instance_repo: Arc<R>,
    retry_policy: RetryPolicy,
    write_concurrency: usize,
    now_provider: NowProvider,
}

impl<R: TargetInstanceRepository + 'static> InstanceReconciler<R> {
    pub fn new(instance_repo: Arc<R>) -> Self {
        Self {
            instance_repo,
            retry_policy: RetryPolicy::default(),
            write_concurrency: DEFAULT_WRITE_CONCURRENCY,
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_write_concurrency(mut self, write_concurrency: usize) -> Self {
        self.write_concurrency = write_concurrency.max(1);
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    // Compares the supplied target definitions against the instance
    // snapshot, creates missing current-window instances, expires stale
    // active ones, and returns the active set. Per-target writes are
    // independent; a target whose writes keep failing is reported as
    // skipped and picked up again on the next pass.
    pub async fn reconcile(
        &self,
        user_id: &str,
        targets: &[Target],
        instances: &[TargetInstance],
        timezone: Tz,
    ) -> Result<ReconcileOutcome, EngineError> {
        let now = (self.now_provider)();

        let mut by_target: HashMap<&str, Vec<&TargetInstance>> = HashMap::new();
        for instance in instances {
            if instance.user_id == user_id {
                by_target
                    .entry(instance.target_id.as_str())
                    .or_default()
                    .push(instance);
            }
        }

        let mut write_tasks: JoinSet<TargetOutcome> = JoinSet::new();
        let mut outcomes = Vec::new();

        for target in targets {
            if target.is_archived {
                continue;
            }

            let window = target.window.window_at(timezone, now);
            let history = by_target
                .get(target.id.as_str())
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let plan = build_plan(user_id, target, &window, history, now);

            if plan.stale_active.is_empty() && plan.creation.is_none() {
                outcomes.push(TargetOutcome {
                    target_id: plan.target_id,
                    active: plan.current_active,
                    created: 0,
                    expired: 0,
                    failures: Vec::new(),
                });
                continue;
            }

            write_tasks.spawn(execute_plan(
                Arc::clone(&self.instance_repo),
                self.retry_policy.clone(),
                plan,
            ));
            if write_tasks.len() >= self.write_concurrency {
                collect_outcome(&mut write_tasks, &mut outcomes).await?;
            }
        }

        while !write_tasks.is_empty() {
            collect_outcome(&mut write_tasks, &mut outcomes).await?;
        }

        let mut outcome = ReconcileOutcome::default();
        for target_outcome in outcomes {
            outcome.created += target_outcome.created;
            outcome.expired += target_outcome.expired;
            if !target_outcome.failures.is_empty() {
                outcome.skipped.push(SkippedTarget {
                    target_id: target_outcome.target_id,
                    reason: target_outcome.failures.join("; "),
                });
            }
            if let Some(active) = target_outcome.active {
                outcome.active.push(active);
            }
        }
        outcome
            .active
            .sort_by(|left, right| left.target_id.cmp(&right.target_id));
        Ok(outcome)
    }
}

#[derive(Debug)]
struct TargetPlan {
    target_id: String,
    // Active instances whose window has passed, current-window or not.
    stale_active: Vec<TargetInstance>,
    // The current-window instance, when it is active and still inside its
    // window. Needs no write.
    current_active: Option<TargetInstance>,
    creation: Option<TargetInstance>,
}

#[derive(Debug)]
struct TargetOutcome {
    target_id: String,
    active: Option<TargetInstance>,
    created: usize,
    expired: usize,
    failures: Vec<String>,
}

fn build_plan(
    user_id: &str,
    target: &Target,
    window: &Window,
    history: &[&TargetInstance],
    now: DateTime<Utc>,
) -> TargetPlan {
    let mut stale_active = Vec::new();
    let mut current: Option<TargetInstance> = None;
    let mut has_completed = false;

    for instance in history {
        if instance.window_key == window.key {
            current = Some((*instance).clone());
        }
        if instance.status == InstanceStatus::Completed {
            has_completed = true;
        }
        if instance.status == InstanceStatus::Active && now > instance.window_end {
            stale_active.push((*instance).clone());
        }
    }

    // One-time targets are exhausted by their first completion: once any
    // instance in the history is completed, no window ever gets another.
    let creation = if current.is_none() && (target.is_recurring || !has_completed) {
        Some(TargetInstance {
            id: TargetInstance::identity(&target.id, &window.key),
            user_id: user_id.to_string(),
            target_id: target.id.clone(),
            window_key: window.key.clone(),
            window_start: window.start,
            window_end: window.end,
            status: InstanceStatus::Active,
            created_at: now,
            completed_at: None,
        })
    } else {
        None
    };

    let current_active = current
        .filter(|instance| instance.status == InstanceStatus::Active && now <= instance.window_end);

    TargetPlan {
        target_id: target.id.clone(),
        stale_active,
        current_active,
        creation,
    }
}

async fn execute_plan<R: TargetInstanceRepository>(
    instance_repo: Arc<R>,
    retry_policy: RetryPolicy,
    plan: TargetPlan,
) -> TargetOutcome {
    let mut outcome = TargetOutcome {
        target_id: plan.target_id,
        active: plan.current_active,
        created: 0,
        expired: 0,
        failures: Vec::new(),
    };

    for stale in &plan.stale_active {
        let result = with_retry(&retry_policy, || {
            let instance_repo = Arc::clone(&instance_repo);
            let user_id = stale.user_id.clone();
            let instance_id = stale.id.clone();
            async move { instance_repo.mark_expired(&user_id, &instance_id).await }
        })
        .await;

        match result {
            Ok(true) => outcome.expired += 1,
            Ok(false) => {}
            Err(error) => outcome
                .failures
                .push(format!("expire {}: {error}", stale.id)),
        }
    }

    if let Some(staged) = plan.creation {
        let result = with_retry(&retry_policy, || {
            let instance_repo = Arc::clone(&instance_repo);
            let staged = staged.clone();
            async move { instance_repo.create_if_absent(&staged).await }
        })
        .await;

        match result {
            Ok(CreateOutcome::Created(stored)) => {
                outcome.created += 1;
                if stored.status == InstanceStatus::Active {
                    outcome.active = Some(stored);
                }
            }
            // Another device materialized this window first; its record, in
            // whatever status it reached, is the canonical one.
            Ok(CreateOutcome::Existing(stored)) => {
                if stored.status == InstanceStatus::Active {
                    outcome.active = Some(stored);
                }
            }
            Err(error) => outcome
                .failures
                .push(format!("create {}: {error}", staged.id)),
        }
    }

    outcome
}

async fn collect_outcome(
    write_tasks: &mut JoinSet<TargetOutcome>,
    outcomes: &mut Vec<TargetOutcome>,
) -> Result<(), EngineError> {
    let Some(join_result) = write_tasks.join_next().await else {
        return Ok(());
    };
    let target_outcome = join_result.map_err(|error| {
        EngineError::StoreUnavailable(format!("failed to join reconcile write task: {error}"))
    })?;
    outcomes.push(target_outcome);
    Ok(())
}

async fn with_retry<T, F, Fut>(retry_policy: &RetryPolicy, operation: F) -> Result<T, EngineError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let max_attempts = retry_policy.max_attempts.max(1);
    let mut attempt: u8 = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if should_retry(&error) && attempt + 1 < max_attempts => {
                let delay = retry_policy
                    .base_delay_ms
                    .saturating_mul(2u64.saturating_pow(attempt as u32));
                sleep(TokioDuration::from_millis(delay)).await;
                attempt = attempt.saturating_add(1);
            }
            Err(error) => return Err(error),
        }
    }
}

fn should_retry(error: &EngineError) -> bool {
    match error {
        EngineError::StoreUnavailable(_) => true,
        EngineError::Sqlite(error) => {
            let message = error.to_string().to_ascii_lowercase();
            message.contains("locked") || message.contains("busy")
        }
        _ => false,
    }
}
