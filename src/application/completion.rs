use crate::application::reconciler::NowProvider;
use crate::domain::models::{InstanceEvent, TargetInstance};
use crate::infrastructure::error::EngineError;
use crate::infrastructure::instance_repository::TargetInstanceRepository;
use chrono::Utc;
use std::sync::Arc;

pub struct CompletionHandler<R: TargetInstanceRepository> {
    instance_repo: Arc<R>,
    now_provider: NowProvider,
}

impl<R: TargetInstanceRepository> CompletionHandler<R> {
    pub fn new(instance_repo: Arc<R>) -> Self {
        Self {
            instance_repo,
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    // Marks an active instance completed. Missing and terminal instances
    // are rejected; a lost race against another device's completion or an
    // expiry surfaces the same way instead of overwriting completed_at.
    pub async fn complete(
        &self,
        user_id: &str,
        instance_id: &str,
    ) -> Result<TargetInstance, EngineError> {
        let now = (self.now_provider)();

        let Some(instance) = self.instance_repo.find_by_id(user_id, instance_id).await? else {
            return Err(EngineError::InstanceNotFound(instance_id.to_string()));
        };
        let completed = instance
            .apply(InstanceEvent::Complete { at: now })
            .map_err(EngineError::InvalidTransition)?;

        let transitioned = self
            .instance_repo
            .mark_completed(user_id, instance_id, now)
            .await?;
        if !transitioned {
            return Err(EngineError::InvalidTransition(format!(
                "instance {instance_id} is no longer active"
            )));
        }

        Ok(completed)
    }
}
