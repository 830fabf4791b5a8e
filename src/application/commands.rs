use crate::application::bootstrap::bootstrap_workspace;
use crate::application::completion::CompletionHandler;
use crate::application::reconciler::{InstanceReconciler, RetryPolicy, SkippedTarget};
use crate::domain::models::{InstanceStatus, Target, TargetInstance};
use crate::infrastructure::config::reconcile_config_path;
use crate::infrastructure::error::EngineError;
use crate::infrastructure::instance_repository::{
    SqliteTargetInstanceRepository, TargetInstanceRepository,
};
use chrono::Utc;
use chrono_tz::Tz;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub struct AppState {
    config_dir: PathBuf,
    database_path: PathBuf,
    logs_dir: PathBuf,
    instance_repo: Arc<SqliteTargetInstanceRepository>,
    log_guard: Mutex<()>,
}

impl AppState {
    pub fn new(workspace_root: PathBuf) -> Result<Self, EngineError> {
        let bootstrap = bootstrap_workspace(&workspace_root)?;
        let config_dir = workspace_root.join("config");
        let logs_dir = workspace_root.join("logs");
        let instance_repo = Arc::new(SqliteTargetInstanceRepository::new(&bootstrap.database_path));

        Ok(Self {
            config_dir,
            database_path: bootstrap.database_path,
            logs_dir,
            instance_repo,
            log_guard: Mutex::new(()),
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn command_error(&self, command: &str, error: &EngineError) -> String {
        self.log_error(command, &error.to_string());
        error.to_string()
    }

    pub fn log_info(&self, command: &str, message: &str) {
        self.append_log("info", command, message);
    }

    pub fn log_error(&self, command: &str, message: &str) {
        self.append_log("error", command, message);
    }

    fn append_log(&self, level: &str, command: &str, message: &str) {
        let Ok(_guard) = self.log_guard.lock() else {
            return;
        };
        let path = self.logs_dir.join("commands.log");
        let payload = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "level": level,
            "command": command,
            "message": message,
        });

        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{}", payload);
        }
    }
}

#[derive(Debug, Clone)]
struct ReconcileSettings {
    max_attempts: u8,
    base_delay_ms: u64,
    write_concurrency: usize,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            write_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileResponse {
    pub active: Vec<TargetInstance>,
    pub created: usize,
    pub expired: usize,
    pub skipped: Vec<SkippedTarget>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetHistoryItem {
    pub id: String,
    pub window_key: String,
    pub window_start: String,
    pub window_end: String,
    pub status: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetHistoryResponse {
    pub target_id: String,
    pub active_count: u32,
    pub completed_count: u32,
    pub expired_count: u32,
    pub items: Vec<TargetHistoryItem>,
}

pub async fn reconcile_targets_impl(
    state: &AppState,
    user_id: String,
    targets: Vec<Target>,
    timezone: String,
) -> Result<ReconcileResponse, EngineError> {
    let user_id = normalize_user_id(&user_id)?;
    let timezone = parse_timezone(&timezone)?;
    for target in &targets {
        target.validate().map_err(EngineError::InvalidInput)?;
    }

    let settings = load_reconcile_settings(state.config_dir());
    let reconciler = InstanceReconciler::new(Arc::clone(&state.instance_repo))
        .with_retry_policy(RetryPolicy {
            max_attempts: settings.max_attempts,
            base_delay_ms: settings.base_delay_ms,
        })
        .with_write_concurrency(settings.write_concurrency);

    let snapshot = state.instance_repo.list_for_user(&user_id).await?;
    let outcome = reconciler
        .reconcile(&user_id, &targets, &snapshot, timezone)
        .await?;

    for skipped in &outcome.skipped {
        state.log_error(
            "reconcile_targets",
            &format!(
                "skipped target_id={} reason={}",
                skipped.target_id, skipped.reason
            ),
        );
    }
    state.log_info(
        "reconcile_targets",
        &format!(
            "reconciled user_id={user_id} active={} created={} expired={} skipped={}",
            outcome.active.len(),
            outcome.created,
            outcome.expired,
            outcome.skipped.len()
        ),
    );

    Ok(ReconcileResponse {
        active: outcome.active,
        created: outcome.created,
        expired: outcome.expired,
        skipped: outcome.skipped,
    })
}

pub async fn complete_instance_impl(
    state: &AppState,
    user_id: String,
    instance_id: String,
) -> Result<TargetInstance, EngineError> {
    let user_id = normalize_user_id(&user_id)?;
    let instance_id = instance_id.trim();
    if instance_id.is_empty() {
        return Err(EngineError::InvalidInput(
            "instance_id must not be empty".to_string(),
        ));
    }

    let handler = CompletionHandler::new(Arc::clone(&state.instance_repo));
    let completed = handler.complete(&user_id, instance_id).await?;

    state.log_info(
        "complete_instance",
        &format!("completed instance_id={instance_id} user_id={user_id}"),
    );
    Ok(completed)
}

pub async fn list_instances_impl(
    state: &AppState,
    user_id: String,
    target_id: Option<String>,
    status: Option<String>,
) -> Result<Vec<TargetInstance>, EngineError> {
    let user_id = normalize_user_id(&user_id)?;
    let status_filter = status
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(InstanceStatus::parse)
        .transpose()
        .map_err(EngineError::InvalidInput)?;
    let target_filter = target_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned);

    let mut instances = match target_filter {
        Some(target_id) => {
            state
                .instance_repo
                .list_for_target(&user_id, &target_id)
                .await?
        }
        None => state.instance_repo.list_for_user(&user_id).await?,
    };
    if let Some(status) = status_filter {
        instances.retain(|instance| instance.status == status);
    }
    instances.sort_by(|left, right| {
        (left.window_start, &left.id).cmp(&(right.window_start, &right.id))
    });
    Ok(instances)
}

pub async fn target_history_impl(
    state: &AppState,
    user_id: String,
    target_id: String,
) -> Result<TargetHistoryResponse, EngineError> {
    let user_id = normalize_user_id(&user_id)?;
    let target_id = target_id.trim();
    if target_id.is_empty() {
        return Err(EngineError::InvalidInput(
            "target_id must not be empty".to_string(),
        ));
    }

    let instances = state
        .instance_repo
        .list_for_target(&user_id, target_id)
        .await?;

    let mut active_count = 0u32;
    let mut completed_count = 0u32;
    let mut expired_count = 0u32;
    for instance in &instances {
        match instance.status {
            InstanceStatus::Active => active_count += 1,
            InstanceStatus::Completed => completed_count += 1,
            InstanceStatus::Expired => expired_count += 1,
        }
    }

    let items = instances
        .into_iter()
        .map(|instance| TargetHistoryItem {
            id: instance.id,
            window_key: instance.window_key,
            window_start: instance.window_start.to_rfc3339(),
            window_end: instance.window_end.to_rfc3339(),
            status: instance.status.as_str().to_string(),
            completed_at: instance.completed_at.map(|value| value.to_rfc3339()),
        })
        .collect::<Vec<_>>();

    Ok(TargetHistoryResponse {
        target_id: target_id.to_string(),
        active_count,
        completed_count,
        expired_count,
        items,
    })
}

fn normalize_user_id(user_id: &str) -> Result<String, EngineError> {
    let normalized = user_id.trim();
    if normalized.is_empty() {
        return Err(EngineError::InvalidInput(
            "user_id must not be empty".to_string(),
        ));
    }
    Ok(normalized.to_string())
}

// The timezone is always the caller's choice; the engine never falls back
// to a default zone.
fn parse_timezone(value: &str) -> Result<Tz, EngineError> {
    let normalized = value.trim();
    if normalized.is_empty() {
        return Err(EngineError::InvalidInput(
            "timezone must not be empty (IANA zone id)".to_string(),
        ));
    }
    normalized
        .parse::<Tz>()
        .map_err(|_| EngineError::InvalidInput(format!("unknown timezone: {normalized}")))
}

fn load_reconcile_settings(config_dir: &Path) -> ReconcileSettings {
    let mut settings = ReconcileSettings::default();
    let Ok(raw) = fs::read_to_string(reconcile_config_path(config_dir)) else {
        return settings;
    };
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&raw) else {
        return settings;
    };

    if let Some(value) = parsed.get("maxAttempts").and_then(serde_json::Value::as_u64) {
        settings.max_attempts = value.clamp(1, u64::from(u8::MAX)) as u8;
    }
    if let Some(value) = parsed.get("baseDelayMs").and_then(serde_json::Value::as_u64) {
        settings.base_delay_ms = value;
    }
    if let Some(value) = parsed
        .get("writeConcurrency")
        .and_then(serde_json::Value::as_u64)
    {
        settings.write_concurrency = value.max(1) as usize;
    }

    settings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::WindowType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_TEMP_WORKSPACE: AtomicUsize = AtomicUsize::new(0);

    struct TempWorkspace {
        path: PathBuf,
    }

    impl TempWorkspace {
        fn new() -> Self {
            let sequence = NEXT_TEMP_WORKSPACE.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!(
                "habitloop-command-tests-{}-{}",
                std::process::id(),
                sequence
            ));
            fs::create_dir_all(&path).expect("create temp workspace");
            Self { path }
        }

        fn app_state(&self) -> AppState {
            AppState::new(self.path.clone()).expect("initialize app state")
        }
    }

    impl Drop for TempWorkspace {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    fn sample_target(id: &str, window: WindowType, is_recurring: bool) -> Target {
        let now = Utc::now();
        Target {
            id: id.to_string(),
            title: format!("Target {id}"),
            window,
            required_count: 2,
            is_recurring,
            is_archived: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn reconcile_creates_an_instance_and_is_idempotent() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state();
        let targets = vec![sample_target("tgt-1", WindowType::Week, true)];

        let first = reconcile_targets_impl(
            &state,
            "usr-1".to_string(),
            targets.clone(),
            "UTC".to_string(),
        )
        .await
        .expect("first reconcile");
        assert_eq!(first.created, 1);
        assert_eq!(first.active.len(), 1);
        assert!(state.database_path().exists());

        let second = reconcile_targets_impl(
            &state,
            "usr-1".to_string(),
            targets,
            "UTC".to_string(),
        )
        .await
        .expect("second reconcile");
        assert_eq!(second.created, 0);
        assert_eq!(second.active[0].id, first.active[0].id);
    }

    #[tokio::test]
    async fn complete_then_reconcile_returns_no_active_instance() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state();
        let targets = vec![sample_target("tgt-1", WindowType::Week, true)];

        let reconciled = reconcile_targets_impl(
            &state,
            "usr-1".to_string(),
            targets.clone(),
            "UTC".to_string(),
        )
        .await
        .expect("reconcile");
        let instance_id = reconciled.active[0].id.clone();

        let completed =
            complete_instance_impl(&state, "usr-1".to_string(), instance_id.clone())
                .await
                .expect("completion");
        assert_eq!(completed.status, InstanceStatus::Completed);
        assert!(completed.completed_at.is_some());

        let after = reconcile_targets_impl(
            &state,
            "usr-1".to_string(),
            targets,
            "UTC".to_string(),
        )
        .await
        .expect("reconcile after completion");
        assert!(after.active.is_empty());
        assert_eq!(after.created, 0);

        let again = complete_instance_impl(&state, "usr-1".to_string(), instance_id).await;
        assert!(matches!(again, Err(EngineError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn one_time_target_never_returns_after_completion() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state();
        let targets = vec![sample_target("tgt-1", WindowType::Month, false)];

        let reconciled = reconcile_targets_impl(
            &state,
            "usr-1".to_string(),
            targets.clone(),
            "UTC".to_string(),
        )
        .await
        .expect("reconcile");
        complete_instance_impl(&state, "usr-1".to_string(), reconciled.active[0].id.clone())
            .await
            .expect("completion");

        let after = reconcile_targets_impl(
            &state,
            "usr-1".to_string(),
            targets,
            "UTC".to_string(),
        )
        .await
        .expect("reconcile after completion");
        assert!(after.active.is_empty());
        assert_eq!(after.created, 0);
    }

    #[tokio::test]
    async fn custom_window_targets_use_epoch_bucket_keys() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state();
        let targets = vec![sample_target(
            "tgt-1",
            WindowType::Custom { duration_days: 14 },
            true,
        )];

        let reconciled = reconcile_targets_impl(
            &state,
            "usr-1".to_string(),
            targets,
            "America/New_York".to_string(),
        )
        .await
        .expect("reconcile");
        assert!(reconciled.active[0].window_key.starts_with("custom-"));
    }

    #[tokio::test]
    async fn reconcile_rejects_invalid_inputs() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state();

        let empty_user = reconcile_targets_impl(
            &state,
            "   ".to_string(),
            Vec::new(),
            "UTC".to_string(),
        )
        .await;
        assert!(matches!(empty_user, Err(EngineError::InvalidInput(_))));

        let bad_timezone = reconcile_targets_impl(
            &state,
            "usr-1".to_string(),
            Vec::new(),
            "Mars/Olympus_Mons".to_string(),
        )
        .await;
        assert!(matches!(bad_timezone, Err(EngineError::InvalidInput(_))));

        let mut invalid_target = sample_target("tgt-1", WindowType::Week, true);
        invalid_target.required_count = 0;
        let bad_target = reconcile_targets_impl(
            &state,
            "usr-1".to_string(),
            vec![invalid_target],
            "UTC".to_string(),
        )
        .await;
        assert!(matches!(bad_target, Err(EngineError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn complete_rejects_unknown_instances() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state();

        let result =
            complete_instance_impl(&state, "usr-1".to_string(), "ti:missing:2025-W05".to_string())
                .await;
        assert!(matches!(result, Err(EngineError::InstanceNotFound(_))));
    }

    #[tokio::test]
    async fn list_instances_filters_by_target_and_status() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state();
        let targets = vec![
            sample_target("tgt-1", WindowType::Week, true),
            sample_target("tgt-2", WindowType::Month, true),
        ];

        let reconciled = reconcile_targets_impl(
            &state,
            "usr-1".to_string(),
            targets,
            "UTC".to_string(),
        )
        .await
        .expect("reconcile");
        let week_instance = reconciled
            .active
            .iter()
            .find(|instance| instance.target_id == "tgt-1")
            .expect("week instance")
            .clone();
        complete_instance_impl(&state, "usr-1".to_string(), week_instance.id.clone())
            .await
            .expect("completion");

        let all = list_instances_impl(&state, "usr-1".to_string(), None, None)
            .await
            .expect("list all");
        assert_eq!(all.len(), 2);

        let completed = list_instances_impl(
            &state,
            "usr-1".to_string(),
            None,
            Some("completed".to_string()),
        )
        .await
        .expect("list completed");
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, week_instance.id);

        let for_target = list_instances_impl(
            &state,
            "usr-1".to_string(),
            Some("tgt-2".to_string()),
            None,
        )
        .await
        .expect("list for target");
        assert_eq!(for_target.len(), 1);
        assert_eq!(for_target[0].target_id, "tgt-2");

        let bad_status = list_instances_impl(
            &state,
            "usr-1".to_string(),
            None,
            Some("cancelled".to_string()),
        )
        .await;
        assert!(matches!(bad_status, Err(EngineError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn target_history_counts_statuses() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state();
        let targets = vec![sample_target("tgt-1", WindowType::Week, true)];

        let reconciled = reconcile_targets_impl(
            &state,
            "usr-1".to_string(),
            targets,
            "UTC".to_string(),
        )
        .await
        .expect("reconcile");
        complete_instance_impl(&state, "usr-1".to_string(), reconciled.active[0].id.clone())
            .await
            .expect("completion");

        let history = target_history_impl(&state, "usr-1".to_string(), "tgt-1".to_string())
            .await
            .expect("history");
        assert_eq!(history.target_id, "tgt-1");
        assert_eq!(history.completed_count, 1);
        assert_eq!(history.active_count, 0);
        assert_eq!(history.expired_count, 0);
        assert_eq!(history.items.len(), 1);
        assert!(history.items[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn command_errors_are_appended_to_the_log() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state();

        let message = state.command_error(
            "complete_instance",
            &EngineError::InstanceNotFound("ti:missing:2025-W05".to_string()),
        );
        assert!(message.contains("ti:missing:2025-W05"));

        let log = fs::read_to_string(workspace.path.join("logs").join("commands.log"))
            .expect("log file exists");
        assert!(log.contains("\"level\":\"error\""));
        assert!(log.contains("complete_instance"));
    }

    #[test]
    fn reconcile_settings_fall_back_to_defaults_on_malformed_config() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state();

        fs::write(
            reconcile_config_path(state.config_dir()),
            "not valid json",
        )
        .expect("overwrite config");
        let settings = load_reconcile_settings(state.config_dir());
        assert_eq!(settings.max_attempts, 3);
        assert_eq!(settings.base_delay_ms, 200);
        assert_eq!(settings.write_concurrency, 4);
    }

    #[test]
    fn reconcile_settings_read_overrides() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state();

        fs::write(
            reconcile_config_path(state.config_dir()),
            r#"{"schema":1,"maxAttempts":5,"baseDelayMs":50,"writeConcurrency":2}"#,
        )
        .expect("overwrite config");
        let settings = load_reconcile_settings(state.config_dir());
        assert_eq!(settings.max_attempts, 5);
        assert_eq!(settings.base_delay_ms, 50);
        assert_eq!(settings.write_concurrency, 2);
    }
}
