//! Task lifecycle events.
//!
//! The purchase machine reports what it does through an [`EventDispatcher`];
//! handlers turn those events into log lines or status-board updates.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::state::StatusBoard;
use crate::engine::{TaskState, TaskStatus};

#[derive(Debug, Clone)]
pub struct StateChangeEvent {
    pub from: TaskState,
    pub status: TaskStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CaptchaEvent {
    pub task_id: String,
    pub step: String,
    pub solved: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub task_id: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum TaskEvent {
    StateChanged(StateChangeEvent),
    Polled(TaskStatus),
    Captcha(CaptchaEvent),
    Error(ErrorEvent),
}

impl TaskEvent {
    pub fn state_changed(from: TaskState, status: TaskStatus) -> Self {
        TaskEvent::StateChanged(StateChangeEvent {
            from,
            status,
            timestamp: Utc::now(),
        })
    }

    pub fn captcha(task_id: impl Into<String>, step: impl Into<String>, solved: bool) -> Self {
        TaskEvent::Captcha(CaptchaEvent {
            task_id: task_id.into(),
            step: step.into(),
            solved,
            timestamp: Utc::now(),
        })
    }

    pub fn error(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        TaskEvent::Error(ErrorEvent {
            task_id: task_id.into(),
            error: error.into(),
            timestamp: Utc::now(),
        })
    }

    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::StateChanged(change) => &change.status.id,
            TaskEvent::Polled(status) => &status.id,
            TaskEvent::Captcha(captcha) => &captcha.task_id,
            TaskEvent::Error(error) => &error.task_id,
        }
    }
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &TaskEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.register_handler(handler);
        self
    }

    pub fn dispatch(&self, event: TaskEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &TaskEvent) {
        match event {
            TaskEvent::StateChanged(change) => {
                let status = &change.status;
                match status.state {
                    TaskState::Failed => log::error!(
                        "[{}] {} -> failed: {}",
                        status.id,
                        change.from,
                        status.last_error.as_deref().unwrap_or("unknown error")
                    ),
                    TaskState::Success => log::info!(
                        "[{}] order placed: {}",
                        status.id,
                        status.confirmation_id.as_deref().unwrap_or("-")
                    ),
                    to => log::info!("[{}] {} -> {}", status.id, change.from, to),
                }
            }
            TaskEvent::Polled(status) => {
                log::trace!("[{}] poll #{}", status.id, status.poll_count);
            }
            TaskEvent::Captcha(captcha) => {
                log::warn!(
                    "[{}] captcha at {} solved={}",
                    captcha.task_id,
                    captcha.step,
                    captcha.solved
                );
            }
            TaskEvent::Error(error) => {
                log::warn!("[{}] {}", error.task_id, error.error);
            }
        }
    }
}

/// Mirrors task statuses onto a [`StatusBoard`].
#[derive(Clone, Debug)]
pub struct BoardHandler {
    board: StatusBoard,
}

impl BoardHandler {
    pub fn new(board: StatusBoard) -> Self {
        Self { board }
    }
}

impl EventHandler for BoardHandler {
    fn handle(&self, event: &TaskEvent) {
        match event {
            TaskEvent::StateChanged(change) => self.board.update(change.status.clone()),
            TaskEvent::Polled(status) => self.board.update(status.clone()),
            TaskEvent::Captcha(_) | TaskEvent::Error(_) => {}
        }
    }
}
