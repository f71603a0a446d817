//! Task, profile and state model.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Start-order priority. Sorts `High` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" | "" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Idle,
    Monitoring,
    Carted,
    Checkout,
    Captcha,
    Success,
    Failed,
}

impl TaskState {
    pub const ALL: [TaskState; 7] = [
        TaskState::Idle,
        TaskState::Monitoring,
        TaskState::Carted,
        TaskState::Checkout,
        TaskState::Captcha,
        TaskState::Success,
        TaskState::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Idle => "idle",
            TaskState::Monitoring => "monitoring",
            TaskState::Carted => "carted",
            TaskState::Checkout => "checkout",
            TaskState::Captcha => "captcha",
            TaskState::Success => "success",
            TaskState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failed)
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Success | Failed, _) => false,
            (_, Failed) => true,
            (Idle, Monitoring)
            | (Monitoring, Carted)
            | (Carted, Checkout)
            | (Carted, Captcha)
            | (Checkout, Success)
            | (Checkout, Captcha)
            | (Captcha, Carted)
            | (Captcha, Checkout) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: TaskState,
    pub to: TaskState,
}

/// Billing and shipping details. Shared read-only between tasks.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub name: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub address1: String,
    pub address2: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub country: String,
    pub phone: String,
    pub card_number: String,
    pub card_exp: String,
    pub card_cvv: String,
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last4: String = {
            let digits: Vec<char> = self.card_number.chars().filter(char::is_ascii_digit).collect();
            digits[digits.len().saturating_sub(4)..].iter().collect()
        };
        f.debug_struct("Profile")
            .field("name", &self.name)
            .field("email", &self.email)
            .field("city", &self.city)
            .field("country", &self.country)
            .field("card_number", &format!("****{last4}"))
            .field("card_exp", &"**/**")
            .field("card_cvv", &"***")
            .finish_non_exhaustive()
    }
}

/// One purchase attempt for one product/variant.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub product_id: String,
    pub variant: String,
    pub profile: Arc<Profile>,
    pub proxy_group: String,
    pub priority: Priority,
    state: TaskState,
    pub poll_count: u64,
    pub last_error: Option<String>,
    pub confirmation_id: Option<String>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        product_id: impl Into<String>,
        variant: impl Into<String>,
        profile: Arc<Profile>,
    ) -> Self {
        Self {
            id: id.into(),
            product_id: product_id.into(),
            variant: variant.into(),
            profile,
            proxy_group: "default".into(),
            priority: Priority::Normal,
            state: TaskState::Idle,
            poll_count: 0,
            last_error: None,
            confirmation_id: None,
        }
    }

    pub fn with_proxy_group(mut self, group: impl Into<String>) -> Self {
        self.proxy_group = group.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Moves to `next` if the edge is allowed.
    pub fn transition_to(&mut self, next: TaskState) -> Result<TaskState, InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }

    /// Forces the task into `Failed` with `reason` unless it already finished.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = TaskState::Failed;
        self.last_error = Some(reason.into());
        true
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus {
            id: self.id.clone(),
            product_id: self.product_id.clone(),
            variant: self.variant.clone(),
            priority: self.priority,
            state: self.state,
            poll_count: self.poll_count,
            last_error: self.last_error.clone(),
            confirmation_id: self.confirmation_id.clone(),
        }
    }
}

/// Point-in-time view of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: String,
    pub product_id: String,
    pub variant: String,
    pub priority: Priority,
    pub state: TaskState,
    pub poll_count: u64,
    pub last_error: Option<String>,
    pub confirmation_id: Option<String>,
}

/// Cuts `message` to at most `max` characters.
pub fn truncate(message: &str, max: usize) -> String {
    match message.char_indices().nth(max) {
        Some((index, _)) => message[..index].to_string(),
        None => message.to_string(),
    }
}
