//! Keyword rule table used as the default decision provider

use super::handlers::{ScheduleCallback, VerifyContact};
use crate::config::{AppConfig, DelegateConfig, RuleConfig};
use crate::node::{Action, DecisionContext, DecisionError, DecisionProvider};
use crate::state::{TaskResult, TaskSpec};
use crate::template::{TemplateContext, TemplateEngine};
use async_trait::async_trait;
use serde_json::{Value, json};

const FALLBACK_REPLY: &str =
    "Thanks for reaching out! A member of our team will get back to you shortly.";

/// Rules used when the configuration defines none
pub fn default_rules() -> Vec<RuleConfig> {
    vec![
        RuleConfig {
            contains: vec!["call me".into(), "callback".into(), "call back".into()],
            delegate: vec![DelegateConfig {
                kind: ScheduleCallback::KIND.into(),
                payload: Value::Null,
            }],
            ..Default::default()
        },
        RuleConfig {
            contains: vec!["@".into(), "my number".into(), "my email".into()],
            delegate: vec![DelegateConfig {
                kind: VerifyContact::KIND.into(),
                payload: Value::Null,
            }],
            ..Default::default()
        },
        RuleConfig {
            contains: vec!["price".into(), "pricing".into(), "cost".into(), "quote".into()],
            respond: Some(
                "Our plans start at $49/month. Would you like a detailed quote?".into(),
            ),
            ..Default::default()
        },
    ]
}

/// Picks the first rule whose keywords appear in the latest user message.
///
/// Once delegated work has finished the provider answers with a summary of
/// the results instead of consulting the rules again.
#[derive(Debug, Clone)]
pub struct RuleBasedProvider {
    rules: Vec<RuleConfig>,
    engine: TemplateEngine,
    fallback: String,
}

impl RuleBasedProvider {
    pub fn new(rules: Vec<RuleConfig>) -> Self {
        Self {
            rules,
            engine: TemplateEngine::new(),
            fallback: FALLBACK_REPLY.to_string(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        if config.rules.is_empty() {
            Self::new(default_rules())
        } else {
            Self::new(config.rules.clone())
        }
    }

    pub fn with_fallback(mut self, reply: impl Into<String>) -> Self {
        self.fallback = reply.into();
        self
    }

    fn find_rule(&self, text: &str) -> Option<&RuleConfig> {
        let text = text.to_lowercase();
        self.rules.iter().find(|rule| {
            rule.contains
                .iter()
                .any(|needle| text.contains(&needle.to_lowercase()))
        })
    }

    fn action_for(
        &self,
        rule: &RuleConfig,
        message: &str,
        ctx: &DecisionContext<'_>,
    ) -> Result<Action, DecisionError> {
        if let Some(template) = &rule.respond {
            let vars = TemplateContext::new()
                .with("message", json!(message))
                .with("step", json!(ctx.step))
                .with("metadata", json!(ctx.metadata));
            return self
                .engine
                .render(template, &vars)
                .map(Action::Respond)
                .map_err(|e| DecisionError::Rejected(format!("reply template: {}", e)));
        }
        if !rule.delegate.is_empty() {
            // kinds already queued (e.g. carried by the message) run once
            let specs = rule
                .delegate
                .iter()
                .filter(|d| !ctx.pending_tasks.iter().any(|t| t.kind == d.kind))
                .map(|d| TaskSpec::new(d.kind.clone(), with_message(&d.payload, message)))
                .collect();
            return Ok(Action::Delegate(specs));
        }
        if rule.wait {
            return Ok(Action::Wait);
        }
        if let Some(reason) = &rule.fail {
            return Ok(Action::Fail(reason.clone()));
        }
        Ok(Action::Complete)
    }
}

/// Configured payload plus the triggering message under `message`
fn with_message(payload: &Value, message: &str) -> Value {
    let mut payload = match payload {
        Value::Object(map) => Value::Object(map.clone()),
        Value::Null => json!({}),
        other => json!({ "value": other }),
    };
    payload["message"] = json!(message);
    payload
}

fn summarize(ctx: &DecisionContext<'_>) -> String {
    let parts: Vec<String> = ctx
        .results
        .iter()
        .map(|(id, result)| match result {
            TaskResult::Success { .. } => format!("{} done", id),
            TaskResult::Failure { message, .. } => format!("{} failed ({})", id, message),
        })
        .collect();
    format!(
        "Finished {} of {} task(s): {}.",
        ctx.results.len() - ctx.results.failures(),
        ctx.results.len(),
        parts.join(", ")
    )
}

#[async_trait]
impl DecisionProvider for RuleBasedProvider {
    fn name(&self) -> &str {
        "rules"
    }

    async fn decide(&self, ctx: &DecisionContext<'_>) -> Result<Action, DecisionError> {
        if !ctx.awaiting_reply() {
            return Ok(Action::Complete);
        }
        if !ctx.results.is_empty() && ctx.pending_tasks.is_empty() {
            return Ok(Action::Respond(summarize(ctx)));
        }

        let message = ctx
            .last_user_message()
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        match self.find_rule(message) {
            Some(rule) => self.action_for(rule, message, ctx),
            None => Ok(Action::Respond(self.fallback.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Message, Results, Task, TaskErrorKind};
    use std::collections::BTreeMap;

    async fn decide(
        provider: &RuleBasedProvider,
        history: &[Message],
        results: &Results,
    ) -> Action {
        let metadata = BTreeMap::new();
        let ctx = DecisionContext {
            history,
            pending_tasks: &[],
            results,
            metadata: &metadata,
            step: 2,
        };
        provider.decide(&ctx).await.unwrap()
    }

    #[tokio::test]
    async fn test_default_rules() {
        let provider = RuleBasedProvider::from_config(&AppConfig::default());
        let results = Results::new();

        let action = decide(&provider, &[Message::user("m1", "Please CALL ME tomorrow")], &results).await;
        match action {
            Action::Delegate(specs) => {
                assert_eq!(specs.len(), 1);
                assert_eq!(specs[0].kind, ScheduleCallback::KIND);
                assert_eq!(specs[0].payload["message"], "Please CALL ME tomorrow");
            }
            other => panic!("expected delegation, got {:?}", other),
        }

        let action = decide(&provider, &[Message::user("m1", "what does it cost?")], &results).await;
        assert!(matches!(action, Action::Respond(ref text) if text.contains("$49")));

        let action = decide(&provider, &[Message::user("m1", "tell me a story")], &results).await;
        assert_eq!(action, Action::Respond(FALLBACK_REPLY.into()));
    }

    #[tokio::test]
    async fn test_configured_rule_templates() {
        let config = AppConfig {
            rules: vec![
                RuleConfig {
                    contains: vec!["refund".into()],
                    respond: Some("Refund noted for: {{ message }}".into()),
                    ..Default::default()
                },
                RuleConfig {
                    contains: vec!["stop".into()],
                    fail: Some("customer opted out".into()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let provider = RuleBasedProvider::from_config(&config);
        let results = Results::new();

        let action = decide(&provider, &[Message::user("m1", "I want a refund")], &results).await;
        assert_eq!(action, Action::Respond("Refund noted for: I want a refund".into()));

        let action = decide(&provider, &[Message::user("m1", "STOP")], &results).await;
        assert_eq!(action, Action::Fail("customer opted out".into()));
    }

    #[tokio::test]
    async fn test_summarizes_finished_tasks() {
        let provider = RuleBasedProvider::new(default_rules());
        let mut results = Results::new();
        results.insert("task-1", TaskResult::success(json!({"ok": true})));
        results.insert("task-2", TaskResult::failure(TaskErrorKind::Failed, "boom"));

        let action = decide(&provider, &[Message::user("m1", "call me")], &results).await;
        assert_eq!(
            action,
            Action::Respond("Finished 1 of 2 task(s): task-1 done, task-2 failed (boom).".into())
        );
    }

    #[tokio::test]
    async fn test_skips_kinds_already_queued() {
        let provider = RuleBasedProvider::new(default_rules());
        let history = [Message::user("m1", "my email is sam@example.com")];
        let pending = [Task {
            id: "task-1".into(),
            kind: VerifyContact::KIND.into(),
            payload: json!({"email": "sam@example.com"}),
        }];
        let results = Results::new();
        let metadata = BTreeMap::new();
        let ctx = DecisionContext {
            history: &history,
            pending_tasks: &pending,
            results: &results,
            metadata: &metadata,
            step: 2,
        };

        assert_eq!(provider.decide(&ctx).await.unwrap(), Action::Delegate(vec![]));
    }

    #[tokio::test]
    async fn test_custom_fallback_reply() {
        let provider = RuleBasedProvider::new(default_rules()).with_fallback("We'll be in touch.");
        let action = decide(&provider, &[Message::user("m1", "hello there")], &Results::new()).await;
        assert_eq!(action, Action::Respond("We'll be in touch.".into()));
    }

    #[tokio::test]
    async fn test_completes_when_nothing_to_answer() {
        let provider = RuleBasedProvider::new(default_rules());
        let history = [Message::user("m1", "hi"), Message::assistant("r1", "hello")];
        assert_eq!(decide(&provider, &history, &Results::new()).await, Action::Complete);
    }
}
