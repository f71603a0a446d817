//! Concurrent task runner.
//!
//! Fans a list of tasks out over the tokio runtime, one supervised spawn per
//! task, sharing the transport, proxy pool and session store. A panic or
//! abort inside one task is recorded as that task's `Failed` and never
//! touches its siblings. A background loop samples the status board and
//! publishes it on a `watch` channel for live displays.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::EngineConfig;
use crate::engine::{Collaborators, PurchaseMachine, Task, TaskState, TaskStatus, truncate};
use crate::external_deps::captcha::{InteractiveSolver, PromptSolver};
use crate::external_deps::commerce::{CartClient, CheckoutClient, StockChecker};
use crate::external_deps::notifier::{LogNotifier, Notifier};
use crate::modules::events::{BoardHandler, EventDispatcher, EventHandler, LoggingHandler, TaskEvent};
use crate::modules::proxy::{ProxyPool, mask_address};
use crate::modules::session::{SessionError, SessionStore};
use crate::modules::state::{StatusBoard, count_states};
use crate::modules::timing::RateLimiter;
use crate::request::{HttpTransport, ReqwestTransport, RequestClient};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
	/// How often the aggregation loop samples the status board.
	#[serde(with = "crate::config::millis")]
	pub display_interval: Duration,
	/// First Ctrl+C cancels cooperatively, the second aborts running tasks.
	pub install_signal_handler: bool,
}

impl Default for RunnerConfig {
	fn default() -> Self {
		Self {
			display_interval: Duration::from_millis(250),
			install_signal_handler: true,
		}
	}
}

#[derive(Debug, Error)]
pub enum RunnerError {
	#[error("missing collaborator: {0}")]
	MissingCollaborator(&'static str),
	#[error(transparent)]
	Session(#[from] SessionError),
}

/// Per-state counts plus the final status of every task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
	pub counts: BTreeMap<TaskState, usize>,
	pub tasks: Vec<TaskStatus>,
}

impl RunSummary {
	pub fn from_statuses(tasks: Vec<TaskStatus>) -> Self {
		Self {
			counts: count_states(&tasks),
			tasks,
		}
	}

	pub fn count(&self, state: TaskState) -> usize {
		self.counts.get(&state).copied().unwrap_or(0)
	}

	pub fn succeeded(&self) -> usize {
		self.count(TaskState::Success)
	}

	pub fn failed(&self) -> usize {
		self.count(TaskState::Failed)
	}

	pub fn total(&self) -> usize {
		self.tasks.len()
	}

	pub fn has_failures(&self) -> bool {
		self.failed() > 0
	}

	pub fn task(&self, task_id: &str) -> Option<&TaskStatus> {
		self.tasks.iter().find(|status| status.id == task_id)
	}
}

impl fmt::Display for RunSummary {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", format_counts(&self.counts))
	}
}

fn format_counts(counts: &BTreeMap<TaskState, usize>) -> String {
	counts
		.iter()
		.map(|(state, count)| format!("{state}: {count}"))
		.collect::<Vec<_>>()
		.join(", ")
}

/// Fluent builder for [`Runner`].
pub struct RunnerBuilder {
	config: EngineConfig,
	transport: Option<Arc<dyn HttpTransport>>,
	proxy_pool: Option<Arc<ProxyPool>>,
	session: Option<Arc<SessionStore>>,
	stock: Option<Arc<dyn StockChecker>>,
	cart: Option<Arc<dyn CartClient>>,
	checkout: Option<Arc<dyn CheckoutClient>>,
	solver: Option<Arc<dyn InteractiveSolver>>,
	notifier: Option<Arc<dyn Notifier>>,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl RunnerBuilder {
	pub fn new() -> Self {
		Self {
			config: EngineConfig::default(),
			transport: None,
			proxy_pool: None,
			session: None,
			stock: None,
			cart: None,
			checkout: None,
			solver: None,
			notifier: None,
			handlers: Vec::new(),
		}
	}

	pub fn with_config(mut self, config: EngineConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
		self.transport = Some(transport);
		self
	}

	pub fn with_proxy_pool(mut self, pool: Arc<ProxyPool>) -> Self {
		self.proxy_pool = Some(pool);
		self
	}

	pub fn with_session_store(mut self, session: Arc<SessionStore>) -> Self {
		self.session = Some(session);
		self
	}

	pub fn with_stock_checker(mut self, stock: Arc<dyn StockChecker>) -> Self {
		self.stock = Some(stock);
		self
	}

	pub fn with_cart_client(mut self, cart: Arc<dyn CartClient>) -> Self {
		self.cart = Some(cart);
		self
	}

	pub fn with_checkout_client(mut self, checkout: Arc<dyn CheckoutClient>) -> Self {
		self.checkout = Some(checkout);
		self
	}

	pub fn with_solver(mut self, solver: Arc<dyn InteractiveSolver>) -> Self {
		self.solver = Some(solver);
		self
	}

	pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
		self.notifier = Some(notifier);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn disable_signal_handler(mut self) -> Self {
		self.config.runner.install_signal_handler = false;
		self
	}

	pub fn build(self) -> Result<Runner, RunnerError> {
		let transport = self
			.transport
			.unwrap_or_else(|| Arc::new(ReqwestTransport::new()));
		let proxy_pool = self
			.proxy_pool
			.unwrap_or_else(|| Arc::new(ProxyPool::new(self.config.proxy.clone())));
		let session = match self.session {
			Some(session) => session,
			None => Arc::new(SessionStore::new(self.config.session.clone(), transport.clone())?),
		};

		let collaborators = Collaborators {
			stock: self.stock.ok_or(RunnerError::MissingCollaborator("stock checker"))?,
			cart: self.cart.ok_or(RunnerError::MissingCollaborator("cart client"))?,
			checkout: self
				.checkout
				.ok_or(RunnerError::MissingCollaborator("checkout client"))?,
			solver: self
				.solver
				.unwrap_or_else(|| Arc::new(PromptSolver::new(self.config.machine.captcha_timeout))),
			notifier: self.notifier.unwrap_or_else(|| Arc::new(LogNotifier)),
		};

		let board = StatusBoard::new();
		let mut events = EventDispatcher::new()
			.with_handler(Arc::new(LoggingHandler))
			.with_handler(Arc::new(BoardHandler::new(board.clone())));
		for handler in self.handlers {
			events.register_handler(handler);
		}

		let rate_limiter = self
			.config
			.request
			.requests_per_second
			.filter(|rps| *rps > 0.0)
			.map(|rps| Arc::new(RateLimiter::new(rps)));

		let (status_tx, _) = watch::channel(Vec::new());

		Ok(Runner {
			config: self.config,
			transport,
			proxy_pool,
			session,
			collaborators,
			board,
			events: Arc::new(events),
			rate_limiter,
			status_tx: Arc::new(status_tx),
		})
	}
}

impl Default for RunnerBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Shared state handed to every task supervisor.
#[derive(Clone)]
struct Supervision {
	proxy_pool: Arc<ProxyPool>,
	board: StatusBoard,
	events: Arc<EventDispatcher>,
	abort: CancellationToken,
	error_display_len: usize,
}

/// Runs many purchase tasks concurrently.
pub struct Runner {
	config: EngineConfig,
	transport: Arc<dyn HttpTransport>,
	proxy_pool: Arc<ProxyPool>,
	session: Arc<SessionStore>,
	collaborators: Collaborators,
	board: StatusBoard,
	events: Arc<EventDispatcher>,
	rate_limiter: Option<Arc<RateLimiter>>,
	status_tx: Arc<watch::Sender<Vec<TaskStatus>>>,
}

impl Runner {
	pub fn builder() -> RunnerBuilder {
		RunnerBuilder::new()
	}

	pub fn config(&self) -> &EngineConfig {
		&self.config
	}

	pub fn proxy_pool(&self) -> &Arc<ProxyPool> {
		&self.proxy_pool
	}

	pub fn session(&self) -> &Arc<SessionStore> {
		&self.session
	}

	pub fn board(&self) -> &StatusBoard {
		&self.board
	}

	/// Live task statuses, refreshed every `display_interval` while running.
	pub fn subscribe(&self) -> watch::Receiver<Vec<TaskStatus>> {
		self.status_tx.subscribe()
	}

	/// Runs every task to a terminal state.
	///
	/// Installs Ctrl+C handling unless disabled: the first signal stops tasks
	/// at their next poll, the second aborts whatever is still running.
	pub async fn run_all(&self, tasks: Vec<Task>, interval: Duration) -> RunSummary {
		let shutdown = CancellationToken::new();
		let abort = CancellationToken::new();
		let signals = self
			.config
			.runner
			.install_signal_handler
			.then(|| tokio::spawn(handle_ctrl_c(shutdown.clone(), abort.clone())));

		let summary = self.execute(tasks, interval, shutdown, abort).await;

		if let Some(handle) = signals {
			handle.abort();
		}
		summary
	}

	/// Like [`Runner::run_all`], with cancellation owned by the caller.
	pub async fn run_with_shutdown(
		&self,
		tasks: Vec<Task>,
		interval: Duration,
		shutdown: CancellationToken,
	) -> RunSummary {
		self.execute(tasks, interval, shutdown, CancellationToken::new())
			.await
	}

	async fn execute(
		&self,
		mut tasks: Vec<Task>,
		interval: Duration,
		shutdown: CancellationToken,
		abort: CancellationToken,
	) -> RunSummary {
		self.board.clear();
		tasks.sort_by_key(|task| task.priority);

		if !self.session.is_loaded().await {
			log::error!("no session cookies loaded, log in first");
			for task in &mut tasks {
				task.fail("No session");
				self.board.register(task.status());
			}
			return self.finish();
		}
		if !self.session.ensure_valid().await {
			log::warn!("session may be invalid, continuing anyway");
		}

		for task in &tasks {
			self.board.register(task.status());
		}
		self.publish();
		log::info!("starting {} tasks", tasks.len());

		let mut machine_config = self.config.machine.clone();
		machine_config.poll_interval = interval;
		let supervision = Supervision {
			proxy_pool: self.proxy_pool.clone(),
			board: self.board.clone(),
			events: self.events.clone(),
			abort,
			error_display_len: machine_config.error_display_len,
		};

		let tracker = TaskTracker::new();
		for task in tasks {
			let client = RequestClient::new(
				task.id.clone(),
				self.transport.clone(),
				self.session.clone(),
				self.config.request.clone(),
			)
			.with_proxy(self.proxy_pool.clone(), task.proxy_group.clone())
			.with_rate_limiter(self.rate_limiter.clone());
			match client.proxy() {
				Some(address) => log::debug!("[{}] using proxy {}", task.id, mask_address(&address)),
				None => log::warn!("[{}] no proxy available in '{}', going direct", task.id, task.proxy_group),
			}

			let machine = PurchaseMachine::new(
				task.clone(),
				client,
				self.collaborators.clone(),
				machine_config.clone(),
			)
			.with_events(self.events.clone())
			.with_shutdown(shutdown.clone());

			tracker.spawn(supervise(task, machine, supervision.clone()));
		}
		tracker.close();

		let done = CancellationToken::new();
		let aggregator = tokio::spawn(aggregate(
			self.board.clone(),
			self.status_tx.clone(),
			self.config.runner.display_interval,
			done.clone(),
		));

		tracker.wait().await;
		done.cancel();
		if let Err(err) = aggregator.await {
			log::warn!("status aggregation stopped: {err}");
		}

		self.finish()
	}

	fn publish(&self) {
		self.status_tx.send_replace(self.board.snapshot());
	}

	fn finish(&self) -> RunSummary {
		self.publish();
		let summary = RunSummary::from_statuses(self.board.snapshot());
		log::info!(
			"complete: {} success, {} failed",
			summary.succeeded(),
			summary.failed()
		);
		summary
	}
}

/// Runs one machine in its own spawn so a panic stays inside it, then
/// releases the task's proxy lease.
async fn supervise(task: Task, machine: PurchaseMachine, ctx: Supervision) -> Task {
	let task_id = task.id.clone();
	let mut handle = tokio::spawn(machine.run());

	let joined = tokio::select! {
		joined = &mut handle => joined,
		_ = ctx.abort.cancelled() => {
			handle.abort();
			handle.await
		}
	};
	ctx.proxy_pool.release(&task_id);

	match joined {
		Ok(finished) => finished,
		Err(err) => {
			let reason = join_failure(err);
			log::error!("[{task_id}] {reason}");
			recover(task, &reason, &ctx)
		}
	}
}

fn join_failure(err: JoinError) -> String {
	if err.is_cancelled() {
		return "Aborted".to_string();
	}
	let payload = err.into_panic();
	let message = payload
		.downcast_ref::<&str>()
		.map(|s| s.to_string())
		.or_else(|| payload.downcast_ref::<String>().cloned())
		.unwrap_or_else(|| "unknown panic".to_string());
	format!("Unexpected error: {message}")
}

/// Rebuilds the task from its last published status and marks it failed.
fn recover(mut task: Task, reason: &str, ctx: &Supervision) -> Task {
	let last = ctx.board.get(&task.id);
	let from = last.as_ref().map(|status| status.state).unwrap_or(task.state());
	if let Some(status) = last {
		task.poll_count = status.poll_count;
		task.confirmation_id = status.confirmation_id;
	}
	task.fail(truncate(reason, ctx.error_display_len));
	ctx.events.dispatch(TaskEvent::state_changed(from, task.status()));
	task
}

async fn aggregate(
	board: StatusBoard,
	status_tx: Arc<watch::Sender<Vec<TaskStatus>>>,
	every: Duration,
	done: CancellationToken,
) {
	let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
	loop {
		tokio::select! {
			_ = done.cancelled() => break,
			_ = ticker.tick() => {
				let snapshot = board.snapshot();
				log::debug!("status: {}", format_counts(&count_states(&snapshot)));
				status_tx.send_replace(snapshot);
			}
		}
	}
}

/// First Ctrl+C cancels cooperatively, the second aborts running tasks.
async fn handle_ctrl_c(shutdown: CancellationToken, abort: CancellationToken) {
	if let Err(err) = tokio::signal::ctrl_c().await {
		log::warn!("failed to listen for Ctrl+C: {err}");
		return;
	}
	log::info!("shutdown requested, finishing current tasks...");
	shutdown.cancel();

	if tokio::signal::ctrl_c().await.is_ok() {
		log::warn!("force quitting, aborting running tasks");
		abort.cancel();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn status(id: &str, state: TaskState) -> TaskStatus {
		TaskStatus {
			id: id.into(),
			product_id: "p".into(),
			variant: "M".into(),
			priority: Default::default(),
			state,
			poll_count: 0,
			last_error: None,
			confirmation_id: None,
		}
	}

	#[test]
	fn summary_counts_every_state() {
		let summary = RunSummary::from_statuses(vec![
			status("a", TaskState::Success),
			status("b", TaskState::Failed),
			status("c", TaskState::Success),
		]);
		assert_eq!(summary.succeeded(), 2);
		assert_eq!(summary.failed(), 1);
		assert_eq!(summary.count(TaskState::Captcha), 0);
		assert_eq!(summary.counts.len(), TaskState::ALL.len());
		assert!(summary.has_failures());
		assert!(summary.to_string().contains("success: 2"));
	}

	#[test]
	fn builder_requires_storefront_collaborators() {
		let result = Runner::builder().disable_signal_handler().build();
		assert!(matches!(result, Err(RunnerError::MissingCollaborator("stock checker"))));
	}
}
