//! Built-in task handlers

use crate::node::{Capabilities, TaskError, TaskHandler, TaskOutput};
use crate::state::{Field, FieldSet, StateSlice, Task};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};

pub const VERIFIED_KEY: &str = "contact.verified";
pub const CALLBACK_KEY: &str = "callback";

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("valid email regex")
});

static EMAIL_IN_TEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").expect("valid email regex")
});

static PHONE_IN_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\+?\d[\d\s().-]{8,}\d").expect("valid phone regex"));

fn payload_str<'a>(task: &'a Task, key: &str) -> Option<&'a str> {
    task.payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Email passes the address pattern
pub fn is_valid_email(email: &str) -> bool {
    EMAIL.is_match(email.trim())
}

/// Phone has 10 to 15 digits once formatting is stripped
pub fn is_valid_phone(phone: &str) -> bool {
    let digits = phone.chars().filter(char::is_ascii_digit).count();
    (10..=15).contains(&digits)
}

/// Checks the email and phone carried by a task.
///
/// Payload `email` / `phone` take precedence; otherwise both are looked
/// for in the payload `message` text.
#[derive(Debug, Default)]
pub struct VerifyContact;

impl VerifyContact {
    pub const KIND: &'static str = "verify_contact";
}

#[async_trait]
impl TaskHandler for VerifyContact {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new(
            FieldSet::new(),
            FieldSet::new().with(Field::metadata(VERIFIED_KEY)),
        )
    }

    async fn run(&self, _slice: &StateSlice, task: &Task) -> Result<TaskOutput, TaskError> {
        let message = payload_str(task, "message").unwrap_or_default();
        let email = payload_str(task, "email")
            .or_else(|| EMAIL_IN_TEXT.find(message).map(|m| m.as_str()));
        let phone = payload_str(task, "phone")
            .or_else(|| PHONE_IN_TEXT.find(message).map(|m| m.as_str().trim()));

        if email.is_none() && phone.is_none() {
            return Err(TaskError::InvalidPayload("no email or phone to verify".into()));
        }

        let mut value = json!({});
        let mut all_valid = true;
        if let Some(email) = email {
            let valid = is_valid_email(email);
            all_valid &= valid;
            value["email"] = json!({ "value": email, "valid": valid });
        }
        if let Some(phone) = phone {
            let valid = is_valid_phone(phone);
            all_valid &= valid;
            value["phone"] = json!({ "value": phone, "valid": valid });
        }

        tracing::debug!(task = %task.id, valid = all_valid, "verified contact");
        Ok(TaskOutput::new(value).with_metadata(VERIFIED_KEY, json!(all_valid)))
    }
}

/// Books a callback: two hours out when the caller named a time, otherwise
/// the next day
#[derive(Debug, Default)]
pub struct ScheduleCallback;

impl ScheduleCallback {
    pub const KIND: &'static str = "schedule_callback";
}

#[async_trait]
impl TaskHandler for ScheduleCallback {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new(
            FieldSet::new(),
            FieldSet::new().with(Field::metadata(CALLBACK_KEY)),
        )
    }

    async fn run(&self, _slice: &StateSlice, task: &Task) -> Result<TaskOutput, TaskError> {
        let preferred = payload_str(task, "preferred_time");
        let delay = if preferred.is_some() {
            Duration::hours(2)
        } else {
            Duration::hours(24)
        };
        let at = (Utc::now() + delay).to_rfc3339();

        let value = json!({
            "scheduled_for": at,
            "preferred_time": preferred,
            "phone": payload_str(task, "phone"),
        });
        Ok(TaskOutput::new(value)
            .with_metadata(CALLBACK_KEY, json!({ "scheduled": true, "at": at })))
    }
}
