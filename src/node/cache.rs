//! Fast-path replies: canned templates and a TTL response cache

use crate::config::{FastPathConfig, TemplateResponse};
use crate::state::{Role, WorkflowState};
use crate::template::{TemplateContext, TemplateEngine, TemplateError};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

fn normalize(message: &str) -> String {
    message.trim().to_lowercase()
}

/// Replies keyed by normalized message text, expiring after a TTL
#[derive(Debug)]
pub struct ResponseCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, message: &str) -> Option<String> {
        let key = normalize(message);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(&key) {
            Some((reply, stored)) if stored.elapsed() < self.ttl => Some(reply.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, message: &str, reply: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(normalize(message), (reply.into(), Instant::now()));
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, (_, stored)| stored.elapsed() < self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where a fast-path reply came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastPathSource {
    Template,
    Cache,
}

impl FastPathSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Template => "template",
            Self::Cache => "cache",
        }
    }
}

/// Shortcut consulted before the decision provider
#[derive(Debug)]
pub struct FastPath {
    templates: Vec<TemplateResponse>,
    max_words: usize,
    cache: ResponseCache,
    engine: TemplateEngine,
}

impl FastPath {
    pub fn from_config(config: &FastPathConfig) -> Self {
        Self {
            templates: config.templates.clone(),
            max_words: config.max_words,
            cache: ResponseCache::new(config.cache_ttl()),
            engine: TemplateEngine::new(),
        }
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// A reply for the latest user message, if one applies.
    ///
    /// Only the opening of an exchange qualifies: once tasks were queued or
    /// produced results the provider must decide.
    pub fn lookup(
        &self,
        state: &WorkflowState,
    ) -> Result<Option<(FastPathSource, String)>, TemplateError> {
        let Some(last) = state.last_message() else {
            return Ok(None);
        };
        if last.role != Role::User || !state.task_queue().is_empty() || !state.results().is_empty()
        {
            return Ok(None);
        }

        if let Some(template) = self.match_template(&last.content) {
            let reply = self
                .engine
                .render(&template.response, &TemplateContext::from_state(state))?;
            return Ok(Some((FastPathSource::Template, reply)));
        }

        Ok(self
            .cache
            .get(&last.content)
            .map(|reply| (FastPathSource::Cache, reply)))
    }

    fn match_template(&self, message: &str) -> Option<&TemplateResponse> {
        let normalized = normalize(message);
        if normalized.split_whitespace().count() > self.max_words {
            return None;
        }
        self.templates
            .iter()
            .find(|t| t.patterns.iter().any(|p| normalize(p) == normalized))
    }
}
