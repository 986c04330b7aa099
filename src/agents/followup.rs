//! Follow-up planning after a conversation ends

use super::handlers::CALLBACK_KEY;
use crate::node::{BackgroundAgent, BackgroundError};
use crate::state::{Role, WorkflowState};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;

const NEGATIVE_WORDS: &[&str] = &[
    "angry",
    "annoyed",
    "awful",
    "disappointed",
    "frustrated",
    "horrible",
    "terrible",
    "unhappy",
    "upset",
    "worst",
];

const PRICING_WORDS: &[&str] = &["price", "pricing", "cost", "quote", "how much"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// A follow-up the conversation calls for
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FollowUp {
    pub action: &'static str,
    pub delay_hours: i64,
    pub due_at: DateTime<Utc>,
    pub message: &'static str,
    pub priority: Priority,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub escalate: bool,
}

/// What the planner reads off the state
#[derive(Debug, Clone, PartialEq)]
struct Signals {
    lead_score: u64,
    intent: String,
    sentiment: String,
    callback_scheduled: bool,
}

impl Signals {
    /// Metadata set by earlier agents wins over keyword heuristics
    fn from_state(state: &WorkflowState) -> Self {
        let text = state
            .history()
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ");
        let meta_str = |key: &str| {
            state
                .metadata_value(key)
                .and_then(Value::as_str)
                .map(str::to_lowercase)
        };

        let intent = meta_str("intent").unwrap_or_else(|| {
            if PRICING_WORDS.iter().any(|w| text.contains(w)) {
                "pricing".into()
            } else {
                "general".into()
            }
        });
        let sentiment = meta_str("sentiment").unwrap_or_else(|| {
            if NEGATIVE_WORDS.iter().any(|w| text.contains(w)) {
                "negative".into()
            } else {
                "neutral".into()
            }
        });

        Self {
            lead_score: state
                .metadata_value("lead_score")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            intent,
            sentiment,
            callback_scheduled: state
                .metadata_value(CALLBACK_KEY)
                .and_then(|c| c.get("scheduled"))
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }
}

/// Schedules follow-ups from lead score, intent, sentiment and callbacks
#[derive(Debug, Default)]
pub struct FollowUpPlanner;

impl FollowUpPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Follow-ups for the conversation, in rule order
    pub fn plan(&self, state: &WorkflowState, now: DateTime<Utc>) -> Vec<FollowUp> {
        let signals = Signals::from_state(state);
        let mut plan = Vec::new();
        let mut add = |action, delay_hours, message, priority, escalate| {
            plan.push(FollowUp {
                action,
                delay_hours,
                due_at: now + Duration::hours(delay_hours),
                message,
                priority,
                escalate,
            })
        };

        if signals.lead_score >= 70 {
            add(
                "high_value_followup",
                24,
                "Following up on our conversation about your needs",
                Priority::High,
                false,
            );
        }
        if signals.intent.contains("pricing") && !signals.callback_scheduled {
            add(
                "pricing_followup",
                72,
                "Have you had a chance to review our pricing?",
                Priority::Medium,
                false,
            );
        }
        if matches!(signals.sentiment.as_str(), "negative" | "very_negative") {
            add(
                "satisfaction_check",
                2,
                "Checking in to ensure your concerns were addressed",
                Priority::High,
                true,
            );
        }
        if signals.callback_scheduled {
            add(
                "callback_reminder",
                1,
                "Reminder: your callback is scheduled soon",
                Priority::High,
                false,
            );
        }
        if signals.intent.contains("general") && signals.lead_score < 50 {
            add(
                "nurture_email",
                168,
                "Thought you might find this resource helpful",
                Priority::Low,
                false,
            );
        }
        plan
    }
}

#[async_trait]
impl BackgroundAgent for FollowUpPlanner {
    fn name(&self) -> &str {
        "follow_up"
    }

    async fn run(&self, snapshot: Arc<WorkflowState>) -> Result<Option<Value>, BackgroundError> {
        let plan = self.plan(&snapshot, Utc::now());
        if plan.is_empty() {
            return Ok(None);
        }
        for follow_up in &plan {
            tracing::info!(
                run_id = %snapshot.run_id(),
                action = follow_up.action,
                due_at = %follow_up.due_at,
                "follow-up scheduled"
            );
        }
        Ok(Some(json!({ "follow_ups": plan })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Message, StateDelta};

    fn state(text: &str) -> WorkflowState {
        WorkflowState::new("r").with_messages([Message::user("m1", text)])
    }

    fn actions(plan: &[FollowUp]) -> Vec<&str> {
        plan.iter().map(|f| f.action).collect()
    }

    #[test]
    fn test_general_low_score_gets_nurture() {
        let plan = FollowUpPlanner::new().plan(&state("just browsing"), Utc::now());
        assert_eq!(actions(&plan), vec!["nurture_email"]);
        assert_eq!(plan[0].priority, Priority::Low);
    }

    #[test]
    fn test_pricing_and_negative() {
        let now = Utc::now();
        let plan = FollowUpPlanner::new().plan(
            &state("your pricing is terrible, how much for the basic plan?"),
            now,
        );
        assert_eq!(actions(&plan), vec!["pricing_followup", "satisfaction_check"]);
        assert_eq!(plan[0].due_at, now + Duration::hours(72));
        assert!(plan[1].escalate);
    }

    #[test]
    fn test_metadata_signals_win() {
        let mut s = state("what's the price?");
        s.update(
            "test",
            StateDelta::new()
                .set("lead_score", json!(85))
                .set("intent", json!("booking"))
                .set(CALLBACK_KEY, json!({"scheduled": true, "at": "2026-01-01T00:00:00Z"})),
        )
        .unwrap();

        let plan = FollowUpPlanner::new().plan(&s, Utc::now());
        assert_eq!(actions(&plan), vec!["high_value_followup", "callback_reminder"]);
    }

    #[tokio::test]
    async fn test_agent_reports_plan() {
        let out = FollowUpPlanner::new()
            .run(Arc::new(state("hello there")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out["follow_ups"][0]["action"], "nurture_email");
        assert_eq!(out["follow_ups"][0]["priority"], "low");
        assert!(out["follow_ups"][0].get("escalate").is_none());
    }
}
