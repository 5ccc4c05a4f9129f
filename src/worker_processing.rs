//! Work functions of the standard catalog.
//!
//! The AI and storage backends behind these tasks live outside this service; each function here
//! validates its payload, walks through its processing stages reporting progress, and returns a
//! summary of what it handled.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::info;

use crate::registry::TaskSpec;
use crate::task::{TaskContext, WorkFunction, work_fn};

fn require<'a>(payload: &'a Value, field: &str, task: &str) -> Result<&'a Value> {
  payload
    .get(field)
    .filter(|v| !v.is_null())
    .ok_or_else(|| anyhow!("Missing {} in {} task", field, task))
}

async fn run_stages(ctx: &TaskContext, stages: &[u8], step_delay: Duration) {
  for progress in stages {
    sleep(step_delay).await;
    ctx.report_progress(*progress).await;
  }
}

/// A task that needs `required` payload fields and reports progress at each of `stages`.
fn staged(task: &'static str, required: &'static [&'static str], stages: &'static [u8], step_delay: Duration) -> Arc<dyn WorkFunction> {
  work_fn(move |payload: Value, ctx: TaskContext| async move {
    for field in required {
      require(&payload, field, task)?;
    }
    info!("Worker {:?}: Processing {} task {}", ctx.worker_id, task, ctx.message_id);
    run_stages(&ctx, stages, step_delay).await;

    let mut summary = json!({
      "task": task,
      "status": "completed",
      "attempt": ctx.attempt,
      "completed_at": Utc::now(),
    });
    if let Some(text) = payload.get("content_text").and_then(Value::as_str) {
      summary["word_count"] = json!(text.split_whitespace().count());
    }
    Ok(summary)
  })
}

/// Maintenance job; a failure must be looked at rather than re-run.
fn maintenance(task: &'static str, stages: &'static [u8], step_delay: Duration) -> Arc<dyn WorkFunction> {
  work_fn(move |payload: Value, ctx: TaskContext| async move {
    info!("Worker {:?}: Starting {} run {}", ctx.worker_id, task, ctx.message_id);
    if payload.get("fail").and_then(Value::as_bool).unwrap_or(false) {
      return Err(anyhow!("{} aborted by request", task));
    }
    run_stages(&ctx, stages, step_delay).await;
    Ok(json!({
      "task": task,
      "status": "completed",
      "completed_at": Utc::now(),
    }))
  })
}

/// Every task the standard catalog routes or schedules.
pub fn standard_tasks(step_delay: Duration) -> Vec<TaskSpec> {
  let d = step_delay;
  vec![
    TaskSpec::new("generate_course_summary", staged("generate_course_summary", &["course_id", "content_text"], &[25, 50, 75], d)),
    TaskSpec::new("generate_learning_objectives", staged("generate_learning_objectives", &["course_id", "course_title"], &[50], d)),
    TaskSpec::new("extract_content_from_file", staged("extract_content_from_file", &["file_path", "file_type"], &[30, 60, 90], d)),
    TaskSpec::new("generate_course_glossary", staged("generate_course_glossary", &["course_id", "content_text"], &[50], d)),
    TaskSpec::new("generate_quiz_from_content", staged("generate_quiz_from_content", &["course_id", "content_text"], &[20, 40, 60, 80], d)),
    TaskSpec::new("grade_assignment_ai", staged("grade_assignment_ai", &["submission_id"], &[50], d)),
    TaskSpec::new("analyze_student_performance", staged("analyze_student_performance", &["student_id"], &[50], d)),
    TaskSpec::new("draft_email_response", staged("draft_email_response", &["message_id"], &[50], d)),
    TaskSpec::new("analyze_email_sentiment", staged("analyze_email_sentiment", &["message_id"], &[], d)),
    TaskSpec::new("categorize_messages", staged("categorize_messages", &["message_ids"], &[50], d)),
    TaskSpec::new("send_bulk_notifications", staged("send_bulk_notifications", &["user_ids"], &[25, 50, 75], d)),
    TaskSpec::new("process_pending_notifications", staged("process_pending_notifications", &[], &[50], d)),
    TaskSpec::new("update_search_index", staged("update_search_index", &[], &[25, 50, 75], d)),
    TaskSpec::new("generate_student_insights", staged("generate_student_insights", &["student_id"], &[50], d)),
    TaskSpec::new("process_learning_analytics", staged("process_learning_analytics", &["course_id"], &[50], d)),
    TaskSpec::new("generate_weekly_report", staged("generate_weekly_report", &[], &[20, 40, 60, 80], d)),
    TaskSpec::new("process_uploaded_file", staged("process_uploaded_file", &["file_id", "file_path"], &[25, 50, 75], d)),
    TaskSpec::new("generate_file_preview", staged("generate_file_preview", &["file_id"], &[50], d)),
    TaskSpec::new("convert_document", staged("convert_document", &["file_id", "target_format"], &[50], d)),
    TaskSpec::new("cleanup_expired_sessions", maintenance("cleanup_expired_sessions", &[50], d)).no_auto_retry(),
    TaskSpec::new("backup_course_data", maintenance("backup_course_data", &[20, 40, 60, 80], d)).no_auto_retry(),
  ]
}
