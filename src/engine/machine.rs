//! Purchase state machine.
//!
//! Drives one [`Task`] from `Idle` through monitoring, cart and checkout to a
//! terminal state. CAPTCHA demands detour through `Captcha` and resume the
//! step they interrupted, once. Step failures end in `Failed` with a bounded
//! message and never escape the machine.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::task::{InvalidTransition, Task, TaskState, truncate};
use crate::external_deps::captcha::InteractiveSolver;
use crate::external_deps::commerce::{
    CartClient, CartOutcome, CheckoutClient, CheckoutOutcome, StockChecker,
};
use crate::external_deps::notifier::{NotificationKind, Notifier};
use crate::modules::events::{EventDispatcher, TaskEvent};
use crate::modules::timing::{HumanAction, human_delay, poll_interval};
use crate::request::RequestClient;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    #[serde(with = "crate::config::millis")]
    pub poll_interval: Duration,
    #[serde(with = "crate::config::millis")]
    pub captcha_timeout: Duration,
    #[serde(with = "crate::config::millis")]
    pub notify_timeout: Duration,
    pub error_display_len: usize,
    /// Polls between progress lines; `0` disables them.
    pub progress_every: u64,
    /// Short human-like pauses before cart and checkout.
    pub humanize: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(300),
            captcha_timeout: Duration::from_secs(120),
            notify_timeout: Duration::from_secs(5),
            error_display_len: 50,
            progress_every: 100,
            humanize: true,
        }
    }
}

/// Everything the machine calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub stock: Arc<dyn StockChecker>,
    pub cart: Arc<dyn CartClient>,
    pub checkout: Arc<dyn CheckoutClient>,
    pub solver: Arc<dyn InteractiveSolver>,
    pub notifier: Arc<dyn Notifier>,
}

enum Flow {
    Continue,
    Stop,
}

pub struct PurchaseMachine {
    task: Task,
    client: RequestClient,
    collaborators: Collaborators,
    config: MachineConfig,
    events: Arc<EventDispatcher>,
    shutdown: CancellationToken,
}

impl PurchaseMachine {
    pub fn new(
        task: Task,
        client: RequestClient,
        collaborators: Collaborators,
        config: MachineConfig,
    ) -> Self {
        Self {
            task,
            client,
            collaborators,
            config,
            events: Arc::new(EventDispatcher::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = events;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn client(&self) -> &RequestClient {
        &self.client
    }

    /// Runs the task to a terminal state and hands it back.
    pub async fn run(mut self) -> Task {
        if let Err(err) = self.drive().await {
            log::error!("[{}] {err}", self.task.id);
            self.fail(err.to_string());
        }
        self.task
    }

    async fn drive(&mut self) -> Result<(), InvalidTransition> {
        self.transition(TaskState::Monitoring)?;
        if let Flow::Stop = self.monitor().await? {
            return Ok(());
        }
        if let Flow::Stop = self.add_to_cart().await? {
            return Ok(());
        }
        self.checkout().await
    }

    async fn monitor(&mut self) -> Result<Flow, InvalidTransition> {
        log::info!("[{}] monitoring {}", self.task.id, self.task.product_id);
        loop {
            if self.shutdown.is_cancelled() {
                self.fail("Shutdown");
                return Ok(Flow::Stop);
            }

            self.task.poll_count += 1;
            self.events.dispatch(TaskEvent::Polled(self.task.status()));

            let started = Utc::now();
            match self
                .collaborators
                .stock
                .check(&self.client, &self.task.product_id)
                .await
            {
                Ok(stock) if stock.in_stock => {
                    log::info!(
                        "[{}] stock found ({} polls): {}",
                        self.task.id,
                        self.task.poll_count,
                        stock.status_text
                    );
                    let product = self.task.product_id.clone();
                    self.notify(NotificationKind::StockFound, &product).await;
                    self.transition(TaskState::Carted)?;
                    return Ok(Flow::Continue);
                }
                Ok(_) => {
                    let every = self.config.progress_every;
                    if every > 0 && self.task.poll_count % every == 0 {
                        log::debug!("[{}] poll #{}", self.task.id, self.task.poll_count);
                    }
                }
                Err(err) => {
                    log::warn!("[{}] poll error: {err}", self.task.id);
                    self.events.dispatch(TaskEvent::error(&self.task.id, err.to_string()));
                    if err.is_session_expired() {
                        self.reauthenticate(started).await;
                    }
                }
            }

            let delay = poll_interval(self.config.poll_interval);
            tokio::select! {
                _ = self.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn add_to_cart(&mut self) -> Result<Flow, InvalidTransition> {
        let mut solved = false;
        let mut reauthenticated = false;
        loop {
            if self.config.humanize {
                human_delay(HumanAction::Click).await;
            }
            let started = Utc::now();
            let result = self
                .collaborators
                .cart
                .add(&self.client, &self.task.product_id, &self.task.variant)
                .await;

            match result {
                Ok(CartOutcome::Added) => {
                    log::info!("[{}] added to cart", self.task.id);
                    self.transition(TaskState::Checkout)?;
                    return Ok(Flow::Continue);
                }
                Ok(CartOutcome::CaptchaRequired { .. }) if solved => {
                    self.fail("CAPTCHA required after solve");
                    return Ok(Flow::Stop);
                }
                Ok(CartOutcome::CaptchaRequired { url }) => {
                    log::warn!("[{}] CAPTCHA required for cart", self.task.id);
                    self.transition(TaskState::Captcha)?;
                    if !self.solve_captcha("cart", url).await {
                        self.fail("CAPTCHA timeout");
                        return Ok(Flow::Stop);
                    }
                    self.transition(TaskState::Carted)?;
                    solved = true;
                }
                Ok(CartOutcome::Failed(reason)) => {
                    self.fail(reason);
                    return Ok(Flow::Stop);
                }
                Err(err) if err.is_session_expired() && !reauthenticated => {
                    reauthenticated = true;
                    if !self.reauthenticate(started).await {
                        self.fail("Session expired");
                        return Ok(Flow::Stop);
                    }
                }
                Err(err) => {
                    self.fail(err.to_string());
                    return Ok(Flow::Stop);
                }
            }
        }
    }

    async fn checkout(&mut self) -> Result<(), InvalidTransition> {
        let mut skip_init = false;
        let mut solved = false;
        let mut reauthenticated = false;
        loop {
            if self.config.humanize {
                human_delay(HumanAction::Checkout).await;
            }
            let started = Utc::now();
            let result = self
                .collaborators
                .checkout
                .run(&self.client, &self.task.profile, skip_init)
                .await;

            match result {
                Ok(CheckoutOutcome::Confirmed(confirmation)) => {
                    self.task.confirmation_id = Some(confirmation.clone());
                    self.transition(TaskState::Success)?;
                    self.notify(NotificationKind::OrderPlaced, &confirmation).await;
                    return Ok(());
                }
                Ok(CheckoutOutcome::CaptchaRequired { step, .. }) if solved => {
                    self.fail_and_notify(format!("{step}: CAPTCHA required after solve"))
                        .await;
                    return Ok(());
                }
                Ok(CheckoutOutcome::CaptchaRequired { step, url }) => {
                    log::warn!("[{}] CAPTCHA at {step}", self.task.id);
                    self.transition(TaskState::Captcha)?;
                    if !self.solve_captcha(&step, url).await {
                        self.fail("CAPTCHA timeout");
                        return Ok(());
                    }
                    self.transition(TaskState::Checkout)?;
                    solved = true;
                    skip_init = true;
                }
                Ok(CheckoutOutcome::Failed { step, reason }) => {
                    self.fail_and_notify(format!("{step}: {reason}")).await;
                    return Ok(());
                }
                Err(err) if err.is_session_expired() && !reauthenticated => {
                    reauthenticated = true;
                    if !self.reauthenticate(started).await {
                        self.fail_and_notify("Session expired".to_string()).await;
                        return Ok(());
                    }
                }
                Err(err) => {
                    self.fail_and_notify(err.to_string()).await;
                    return Ok(());
                }
            }
        }
    }

    async fn solve_captcha(&mut self, step: &str, url: Option<Url>) -> bool {
        let payload = format!("{} needs a CAPTCHA at {step}", self.task.id);
        self.notify(NotificationKind::CaptchaNeeded, &payload).await;

        let token = self
            .collaborators
            .solver
            .solve_within(url.as_ref(), self.config.captcha_timeout)
            .await;
        let solved = match token {
            Some(token) => {
                self.client.set_clearance(token);
                true
            }
            None => {
                log::error!("[{}] CAPTCHA at {step} not solved", self.task.id);
                false
            }
        };
        self.events
            .dispatch(TaskEvent::captcha(&self.task.id, step, solved));
        solved
    }

    /// Revalidates the shared session after an auth failure on a request
    /// started at `since`.
    async fn reauthenticate(&self, since: DateTime<Utc>) -> bool {
        log::warn!("[{}] session expired, revalidating", self.task.id);
        let valid = self.client.session().revalidate(since).await;
        if !valid {
            log::error!("[{}] session still invalid, re-login required", self.task.id);
        }
        valid
    }

    async fn notify(&self, kind: NotificationKind, payload: &str) {
        let send = self.collaborators.notifier.notify(kind, payload);
        match tokio::time::timeout(self.config.notify_timeout, send).await {
            Ok(true) => {}
            Ok(false) => log::warn!("[{}] {kind:?} notification not delivered", self.task.id),
            Err(_) => log::warn!("[{}] {kind:?} notification timed out", self.task.id),
        }
    }

    fn transition(&mut self, next: TaskState) -> Result<(), InvalidTransition> {
        let from = self.task.transition_to(next)?;
        self.events
            .dispatch(TaskEvent::state_changed(from, self.task.status()));
        Ok(())
    }

    fn fail(&mut self, reason: impl AsRef<str>) {
        let from = self.task.state();
        let message = truncate(reason.as_ref(), self.config.error_display_len);
        if self.task.fail(message) {
            self.events
                .dispatch(TaskEvent::state_changed(from, self.task.status()));
        }
    }

    async fn fail_and_notify(&mut self, reason: String) {
        self.fail(&reason);
        self.notify(NotificationKind::Error, &format!("{}: {reason}", self.task.id))
            .await;
    }
}
