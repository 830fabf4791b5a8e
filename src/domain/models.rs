use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    Week,
    TwoWeeks,
    Month,
    TwoMonths,
    SixMonths,
    Year,
    Custom { duration_days: u32 },
}

impl WindowType {
    pub fn validate(&self) -> Result<(), String> {
        if let WindowType::Custom { duration_days } = self {
            if *duration_days == 0 {
                return Err("target.window.duration_days must be > 0".to_string());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub id: String,
    pub title: String,
    pub window: WindowType,
    pub required_count: u32,
    pub is_recurring: bool,
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Target {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "target.id")?;
        validate_non_empty(&self.title, "target.title")?;
        if self.required_count == 0 {
            return Err("target.required_count must be >= 1".to_string());
        }
        self.window.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Active,
    Completed,
    Expired,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unsupported instance status: {}", other)),
        }
    }

}

#[derive(Debug, Clone, Copy)]
pub enum InstanceEvent {
    Complete { at: DateTime<Utc> },
    ExpireIfPastDeadline { now: DateTime<Utc> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetInstance {
    pub id: String,
    pub user_id: String,
    pub target_id: String,
    pub window_key: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TargetInstance {
    // Identity is derived from the window, so every device materializing the
    // same window converges on the same record.
    pub fn identity(target_id: &str, window_key: &str) -> String {
        format!("ti:{target_id}:{window_key}")
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "instance.id")?;
        validate_non_empty(&self.user_id, "instance.user_id")?;
        validate_non_empty(&self.target_id, "instance.target_id")?;
        validate_non_empty(&self.window_key, "instance.window_key")?;
        if self.window_end <= self.window_start {
            return Err("instance.window_end must be after instance.window_start".to_string());
        }
        match self.status {
            InstanceStatus::Completed if self.completed_at.is_none() => {
                Err("instance.completed_at is required for completed instances".to_string())
            }
            InstanceStatus::Active | InstanceStatus::Expired if self.completed_at.is_some() => {
                Err("instance.completed_at is only allowed on completed instances".to_string())
            }
            _ => Ok(()),
        }
    }

    // The only legal transitions: active -> completed and active -> expired.
    // Terminal statuses reject every event.
    pub fn apply(&self, event: InstanceEvent) -> Result<TargetInstance, String> {
        match (self.status, event) {
            (InstanceStatus::Active, InstanceEvent::Complete { at }) => {
                let mut updated = self.clone();
                updated.status = InstanceStatus::Completed;
                updated.completed_at = Some(at);
                Ok(updated)
            }
            (InstanceStatus::Active, InstanceEvent::ExpireIfPastDeadline { now }) => {
                if now > self.window_end {
                    let mut updated = self.clone();
                    updated.status = InstanceStatus::Expired;
                    Ok(updated)
                } else {
                    Ok(self.clone())
                }
            }
            (status, InstanceEvent::Complete { .. }) => Err(format!(
                "instance {} is {} and cannot be completed",
                self.id,
                status.as_str()
            )),
            (status, InstanceEvent::ExpireIfPastDeadline { .. }) => Err(format!(
                "instance {} is {} and cannot expire",
                self.id,
                status.as_str()
            )),
        }
    }
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn sample_target() -> Target {
        Target {
            id: "tgt-1".to_string(),
            title: "Read four books".to_string(),
            window: WindowType::Month,
            required_count: 4,
            is_recurring: true,
            is_archived: false,
            created_at: fixed_time("2025-01-10T08:00:00Z"),
            updated_at: fixed_time("2025-01-10T08:00:00Z"),
        }
    }

    fn sample_instance() -> TargetInstance {
        TargetInstance {
            id: TargetInstance::identity("tgt-1", "2025-01"),
            user_id: "usr-1".to_string(),
            target_id: "tgt-1".to_string(),
            window_key: "2025-01".to_string(),
            window_start: fixed_time("2025-01-01T00:00:00Z"),
            window_end: fixed_time("2025-02-01T00:00:00Z"),
            status: InstanceStatus::Active,
            created_at: fixed_time("2025-01-10T08:00:00Z"),
            completed_at: None,
        }
    }

    #[test]
    fn target_validate_accepts_valid_target() {
        assert!(sample_target().validate().is_ok());
    }

    #[test]
    fn target_validate_rejects_zero_required_count() {
        let mut target = sample_target();
        target.required_count = 0;
        assert!(target.validate().is_err());
    }

    #[test]
    fn target_validate_rejects_zero_custom_duration() {
        let mut target = sample_target();
        target.window = WindowType::Custom { duration_days: 0 };
        assert!(target.validate().is_err());
    }

    #[test]
    fn instance_validate_rejects_reverse_window() {
        let mut instance = sample_instance();
        instance.window_end = instance.window_start;
        assert!(instance.validate().is_err());
    }

    #[test]
    fn instance_validate_requires_completed_at_iff_completed() {
        let mut completed = sample_instance();
        completed.status = InstanceStatus::Completed;
        assert!(completed.validate().is_err());
        completed.completed_at = Some(fixed_time("2025-01-20T10:00:00Z"));
        assert!(completed.validate().is_ok());

        let mut active = sample_instance();
        active.completed_at = Some(fixed_time("2025-01-20T10:00:00Z"));
        assert!(active.validate().is_err());
    }

    #[test]
    fn identity_is_deterministic() {
        assert_eq!(
            TargetInstance::identity("tgt-1", "2025-W05"),
            TargetInstance::identity("tgt-1", "2025-W05")
        );
        assert_ne!(
            TargetInstance::identity("tgt-1", "2025-W05"),
            TargetInstance::identity("tgt-1", "2025-W06")
        );
    }

    #[test]
    fn complete_transitions_active_instance() {
        let instance = sample_instance();
        let completed_at = fixed_time("2025-01-20T10:00:00Z");
        let completed = instance
            .apply(InstanceEvent::Complete { at: completed_at })
            .expect("active instance completes");
        assert_eq!(completed.status, InstanceStatus::Completed);
        assert_eq!(completed.completed_at, Some(completed_at));
    }

    #[test]
    fn expire_transitions_only_past_deadline() {
        let instance = sample_instance();

        let before_deadline = instance
            .apply(InstanceEvent::ExpireIfPastDeadline {
                now: instance.window_end - Duration::seconds(1),
            })
            .expect("within window is a no-op");
        assert_eq!(before_deadline.status, InstanceStatus::Active);

        let past_deadline = instance
            .apply(InstanceEvent::ExpireIfPastDeadline {
                now: instance.window_end + Duration::seconds(1),
            })
            .expect("past window expires");
        assert_eq!(past_deadline.status, InstanceStatus::Expired);
    }

    #[test]
    fn terminal_statuses_reject_every_event() {
        let now = fixed_time("2025-03-01T00:00:00Z");
        for status in [InstanceStatus::Completed, InstanceStatus::Expired] {
            let mut instance = sample_instance();
            instance.status = status;
            if status == InstanceStatus::Completed {
                instance.completed_at = Some(fixed_time("2025-01-20T10:00:00Z"));
            }

            assert!(instance.apply(InstanceEvent::Complete { at: now }).is_err());
            assert!(
                instance
                    .apply(InstanceEvent::ExpireIfPastDeadline { now })
                    .is_err()
            );
        }
    }

    #[test]
    fn status_parse_roundtrips_known_values() {
        for status in [
            InstanceStatus::Active,
            InstanceStatus::Completed,
            InstanceStatus::Expired,
        ] {
            assert_eq!(InstanceStatus::parse(status.as_str()), Ok(status));
        }
        assert!(InstanceStatus::parse("cancelled").is_err());
    }
}
