//! Built-in decision provider, task handlers and background agents
//!
//! These make the conversation graph runnable out of the box: a keyword rule
//! table decides, contact verification and callback booking run in the
//! parallel pool, and follow-up planning plus transcript recording run in the
//! background once the conversation ends.

pub mod followup;
pub mod handlers;
pub mod rules;
pub mod transcript;

pub use followup::{FollowUp, FollowUpPlanner, Priority};
pub use handlers::{ScheduleCallback, VerifyContact};
pub use rules::{RuleBasedProvider, default_rules};
pub use transcript::{TranscriptRecorder, transcript_key};

use crate::checkpoint::Checkpointer;
use crate::config::AppConfig;
use crate::graph::{GraphBuilder, ValidationError, WorkflowGraph, conversation_graph};
use crate::node::{
    BackgroundDispatcher, FastPath, IncomingListener, IntelligenceAgent, MessageSource,
    ParallelExecutor,
};
use std::sync::Arc;

/// Parallel executor with every built-in handler
pub fn default_executor() -> ParallelExecutor {
    ParallelExecutor::new()
        .with_handler(Arc::new(VerifyContact))
        .with_handler(Arc::new(ScheduleCallback))
}

/// Background dispatcher with the follow-up planner, plus the transcript
/// recorder when a store is given
pub fn default_dispatcher(store: Option<Arc<dyn Checkpointer>>) -> BackgroundDispatcher {
    let dispatcher = BackgroundDispatcher::new().with_agent(Arc::new(FollowUpPlanner::new()));
    match store {
        Some(store) => dispatcher.with_agent(Arc::new(TranscriptRecorder::new(store))),
        None => dispatcher,
    }
}

/// Conversation graph wired with the built-in agents, left open for
/// further edges
pub fn default_builder(
    config: &AppConfig,
    source: Arc<dyn MessageSource>,
    background: BackgroundDispatcher,
) -> GraphBuilder {
    let mut intelligence = IntelligenceAgent::new(Arc::new(RuleBasedProvider::from_config(config)));
    if config.fast_path.enabled {
        intelligence = intelligence.with_fast_path(FastPath::from_config(&config.fast_path));
    }

    conversation_graph(
        IncomingListener::new(source),
        intelligence,
        default_executor(),
        background,
    )
}

/// The standard conversation graph
pub fn default_graph(
    config: &AppConfig,
    source: Arc<dyn MessageSource>,
    store: Option<Arc<dyn Checkpointer>>,
) -> Result<WorkflowGraph, ValidationError> {
    default_builder(config, source, default_dispatcher(store)).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointer;
    use crate::node::{NodeKind, StaticSource};
    use crate::state::{Message, Status, TaskSpec, WorkflowState};
    use crate::workflow::{RunPhase, WorkflowRunner};
    use serde_json::json;
    use std::time::Duration;

    fn run_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.engine.retry_delay_ms = 0;
        config
    }

    #[test]
    fn test_default_graph_validates() {
        let graph = default_graph(&AppConfig::default(), Arc::new(StaticSource::default()), None)
            .unwrap();
        assert_eq!(
            graph.node_names(),
            vec!["listener", "intelligence", "parallel", "background"]
        );

        let parallel = graph.node(graph.node_index("parallel").unwrap());
        match parallel.kind() {
            NodeKind::Parallel(executor) => {
                assert_eq!(executor.kinds(), vec!["verify_contact", "schedule_callback"]);
            }
            _ => panic!("parallel node has the wrong kind"),
        }
    }

    #[tokio::test]
    async fn test_callback_conversation_end_to_end() {
        let config = run_config();
        let store = Arc::new(MemoryCheckpointer::new());
        let graph = Arc::new(
            default_graph(
                &config,
                Arc::new(StaticSource::default()),
                Some(store.clone()),
            )
            .unwrap(),
        );
        let runner = WorkflowRunner::new(graph.clone(), config.engine.clone());
        let state = WorkflowState::new("run-cb")
            .with_messages([Message::user("m1", "Can you call me back this afternoon?")]);

        let report = runner.run(state).await.unwrap();

        assert_eq!(report.phase, RunPhase::Completed);
        assert_eq!(report.state.status(), Status::Completed);
        assert_eq!(
            report.reply(),
            Some("Finished 1 of 1 task(s): task-1 done.")
        );
        assert_eq!(report.state.metadata_value("callback").unwrap()["scheduled"], true);

        assert!(graph.drain_background(Duration::from_secs(5)).await);
        let transcript = store.load_latest("run-cb:transcript").unwrap().unwrap();
        assert_eq!(transcript.state.history().len(), 2);
    }

    #[tokio::test]
    async fn test_message_task_and_rule_share_a_kind() {
        let config = run_config();
        let message = Message::user("m1", "my email is sam@example.com").with_task(TaskSpec::new(
            VerifyContact::KIND,
            json!({"email": "sam@example.com"}),
        ));
        let graph = Arc::new(
            default_graph(&config, Arc::new(StaticSource::new(vec![message])), None).unwrap(),
        );
        let runner = WorkflowRunner::new(graph, config.engine.clone());

        let report = runner.run(WorkflowState::new("run-email")).await.unwrap();

        assert_eq!(report.phase, RunPhase::Completed);
        assert_eq!(report.reply(), Some("Finished 1 of 1 task(s): task-1 done."));
        assert_eq!(report.state.metadata_value("contact.verified"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_fast_path_greeting() {
        let mut config = run_config();
        config.fast_path.enabled = true;
        let graph = Arc::new(default_graph(&config, Arc::new(StaticSource::default()), None).unwrap());
        let runner = WorkflowRunner::new(graph, config.engine.clone());

        let report = runner
            .run(WorkflowState::new("run-hi").with_messages([Message::user("m1", "Hello")]))
            .await
            .unwrap();

        assert_eq!(report.reply(), Some("Hello! How can I help you today?"));
        assert_eq!(report.state.metadata_value("fast_path").unwrap(), "template");
    }
}
