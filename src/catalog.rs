//! The deployed queue layout: queue policies, task routes and the beat schedule.
//!
//! Built into the binary; a TOML file may replace or extend parts of it at startup.
//!
//! ```toml
//! [[queues]]
//! name = "search"
//! priority = "low"
//! max_retries = 5
//!
//! [routes]
//! update_search_index = "search"
//!
//! [[schedule]]
//! name = "update-search-index"
//! task = "update_search_index"
//! cron = "*/30 * * * *"
//! queue = "search"
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::error::{DispatchError, Result};
use crate::models::{PriorityTier, QueuePolicy};
use crate::registry::QueueRegistry;
use crate::router::TaskRouter;
use crate::scheduler::{ScheduleConfig, ScheduleEntry};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogFile {
  #[serde(default)]
  pub queues: Vec<QueuePolicy>,
  #[serde(default)]
  pub routes: BTreeMap<String, String>,
  /// Replaces the built-in schedule when non-empty.
  #[serde(default)]
  pub schedule: Vec<ScheduleConfig>,
}

impl CatalogFile {
  pub fn from_toml(text: &str) -> Result<Self> {
    toml::from_str(text).map_err(|e| DispatchError::Config(format!("invalid catalog: {e}")))
  }
}

#[derive(Debug, Clone)]
pub struct Catalog {
  pub queues: Vec<QueuePolicy>,
  pub routes: BTreeMap<String, String>,
  pub schedule: Vec<ScheduleConfig>,
}

fn queue(name: &str, priority: PriorityTier, retries: u32, min_ms: u64, max_ms: u64, description: &str) -> QueuePolicy {
  QueuePolicy::new(name, priority)
    .with_retries(retries, min_ms, max_ms)
    .with_description(description)
}

impl Catalog {
  pub fn standard() -> Self {
    use PriorityTier::{High, Low, Normal};

    let queues = vec![
      queue("default", Normal, 3, 1_000, 900_000, "Unrouted tasks"),
      queue("ai_content", Normal, 3, 1_000, 900_000, "AI content generation tasks"),
      queue("ai_assessment", High, 3, 1_000, 900_000, "AI assessment and grading tasks"),
      queue("ai_communication", High, 2, 500, 300_000, "AI communication tasks"),
      queue("search", Low, 5, 2_000, 600_000, "Search indexing and retrieval tasks"),
      queue("analytics", Low, 3, 5_000, 1_800_000, "Analytics and reporting tasks"),
      queue("file_processing", Normal, 3, 1_000, 600_000, "File processing tasks"),
      queue("communication", Normal, 3, 1_000, 300_000, "Outbound messaging"),
      queue("notifications", High, 5, 1_000, 300_000, "Real-time notification tasks"),
      queue("system", Low, 2, 60_000, 600_000, "Maintenance jobs"),
    ];

    let routes = [
      ("generate_course_summary", "ai_content"),
      ("generate_learning_objectives", "ai_content"),
      ("extract_content_from_file", "ai_content"),
      ("generate_course_glossary", "ai_content"),
      ("generate_quiz_from_content", "ai_assessment"),
      ("grade_assignment_ai", "ai_assessment"),
      ("analyze_student_performance", "ai_assessment"),
      ("draft_email_response", "ai_communication"),
      ("analyze_email_sentiment", "ai_communication"),
      ("categorize_messages", "ai_communication"),
      ("send_bulk_notifications", "communication"),
      ("process_pending_notifications", "communication"),
      ("update_search_index", "search"),
      ("generate_student_insights", "analytics"),
      ("process_learning_analytics", "analytics"),
      ("generate_weekly_report", "analytics"),
      ("process_uploaded_file", "file_processing"),
      ("generate_file_preview", "file_processing"),
      ("convert_document", "file_processing"),
      ("cleanup_expired_sessions", "system"),
      ("backup_course_data", "system"),
    ]
    .into_iter()
    .map(|(t, q)| (t.to_string(), q.to_string()))
    .collect();

    let schedule = vec![
      ScheduleConfig::new("cleanup-expired-sessions", "cleanup_expired_sessions", "0 2 * * *", Some("system")),
      ScheduleConfig::new("backup-course-data", "backup_course_data", "0 3 * * *", Some("system")),
      ScheduleConfig::new("update-search-index", "update_search_index", "*/30 * * * *", Some("search")),
      ScheduleConfig::new("generate-weekly-analytics", "generate_weekly_report", "0 4 * * 1", Some("analytics")),
      ScheduleConfig::new(
        "process-pending-notifications",
        "process_pending_notifications",
        "0 * * * *",
        Some("communication"),
      ),
    ];

    Self { queues, routes, schedule }
  }

  /// Queues with a known name are replaced, new ones appended; routes are merged.
  pub fn apply(&mut self, file: CatalogFile) {
    for policy in file.queues {
      match self.queues.iter_mut().find(|q| q.name == policy.name) {
        Some(existing) => *existing = policy,
        None => self.queues.push(policy),
      }
    }
    self.routes.extend(file.routes);
    if !file.schedule.is_empty() {
      self.schedule = file.schedule;
    }
  }

  /// The standard catalog, overridden by the file at `path` when given.
  pub fn load(path: Option<&Path>) -> Result<Self> {
    let mut catalog = Self::standard();
    if let Some(path) = path {
      let text = std::fs::read_to_string(path)
        .map_err(|e| DispatchError::Config(format!("cannot read catalog {}: {e}", path.display())))?;
      catalog.apply(CatalogFile::from_toml(&text)?);
      info!(path = %path.display(), "Catalog overrides applied");
    }
    Ok(catalog)
  }

  pub fn queue_registry(&self) -> Result<QueueRegistry> {
    QueueRegistry::new(self.queues.clone())
  }

  pub fn router(&self, queues: &QueueRegistry) -> Result<TaskRouter> {
    TaskRouter::new(self.routes.clone(), queues)
  }

  pub fn schedule_entries(&self) -> Result<Vec<ScheduleEntry>> {
    self.schedule.iter().map(ScheduleEntry::from_config).collect()
  }
}
