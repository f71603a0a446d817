//! Mock collaborators shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use porter_rs::engine::{Collaborators, MachineConfig, TaskState};
use porter_rs::modules::events::{EventHandler, TaskEvent};
use porter_rs::{
    CartClient, CartOutcome, CheckoutClient, CheckoutOutcome, CommerceError, HttpTransport,
    InteractiveSolver, NotificationKind, Notifier, Profile, RawCookie, RequestClient,
    RequestConfig, SessionConfig, SessionStore, StockChecker, StockStatus, TransportError,
    TransportRequest, TransportResponse,
};
use tokio::time::Instant;
use url::Url;

/// Replays queued statuses; answers `200` once the queue is empty.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<(u16, String), TransportError>>>,
    seen: Mutex<Vec<(Instant, TransportRequest)>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, status: u16, body: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Ok((status, body.to_string())));
    }

    pub fn push_error(&self, err: TransportError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    pub fn request_count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.seen.lock().unwrap().iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn gaps(&self) -> Vec<Duration> {
        let seen = self.seen.lock().unwrap();
        seen.windows(2).map(|pair| pair[1].0 - pair[0].0).collect()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let url = request.url.clone();
        self.seen.lock().unwrap().push((Instant::now(), request));
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok((status, body))) => Ok(TransportResponse::new(status, url).with_body(body)),
            Some(Err(err)) => Err(err),
            None => Ok(TransportResponse::new(200, url)),
        }
    }
}

pub fn cookies() -> Vec<RawCookie> {
    vec![
        RawCookie::new("auth", "%7B%22access_token%22%3A%22jwt-abc%22%2C%22expires_in%22%3A3600%7D"),
        RawCookie::new("reese84", "r84"),
        RawCookie::new("datadome", "dd"),
    ]
}

pub async fn session_store(transport: Arc<ScriptedTransport>) -> Arc<SessionStore> {
    let store = SessionStore::new(SessionConfig::default(), transport).unwrap();
    store.load(&cookies()).await.unwrap();
    Arc::new(store)
}

pub async fn request_client(transport: Arc<ScriptedTransport>) -> RequestClient {
    let store = session_store(transport.clone()).await;
    RequestClient::new("task-1", transport, store, RequestConfig::default())
}

pub fn profile() -> Arc<Profile> {
    Arc::new(Profile {
        name: "main".into(),
        email: "buyer@example.com".into(),
        first_name: "Ada".into(),
        last_name: "Lovelace".into(),
        city: "Toronto".into(),
        country: "CA".into(),
        card_number: "4111111111111111".into(),
        ..Default::default()
    })
}

pub fn fast_machine() -> MachineConfig {
    MachineConfig {
        poll_interval: Duration::from_millis(10),
        humanize: false,
        ..Default::default()
    }
}

/// Stock answers in order; the last answer repeats. Products whose id starts
/// with `panic` panic instead.
pub struct ScriptedStock {
    answers: Vec<Result<bool, ()>>,
    calls: Mutex<usize>,
}

impl ScriptedStock {
    pub fn new(answers: &[bool]) -> Arc<Self> {
        Arc::new(Self {
            answers: answers.iter().map(|a| Ok(*a)).collect(),
            calls: Mutex::new(0),
        })
    }

    pub fn with_errors(answers: Vec<Result<bool, ()>>) -> Arc<Self> {
        Arc::new(Self {
            answers,
            calls: Mutex::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl StockChecker for ScriptedStock {
    async fn check(&self, _client: &RequestClient, product_id: &str) -> Result<StockStatus, CommerceError> {
        if product_id.starts_with("panic") {
            panic!("stock parser blew up for {product_id}");
        }
        let index = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls - 1
        };
        let answer = self
            .answers
            .get(index)
            .or(self.answers.last())
            .copied()
            .unwrap_or(Ok(false));
        match answer {
            Ok(true) => Ok(StockStatus::in_stock("Add to cart")),
            Ok(false) => Ok(StockStatus::out_of_stock("Sold out")),
            Err(()) => Err(CommerceError::Unexpected("stock endpoint returned garbage".into())),
        }
    }
}

/// Cart outcomes in order; `Added` once the queue is empty.
#[derive(Default)]
pub struct ScriptedCart {
    outcomes: Mutex<VecDeque<Result<CartOutcome, CommerceError>>>,
    seen: Mutex<Vec<CartCall>>,
}

#[derive(Debug, Clone)]
pub struct CartCall {
    pub task_id: String,
    pub product_id: String,
    pub variant: String,
    pub proxy: Option<String>,
    pub clearance: Option<String>,
}

impl ScriptedCart {
    pub fn new(outcomes: Vec<Result<CartOutcome, CommerceError>>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<CartCall> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl CartClient for ScriptedCart {
    async fn add(
        &self,
        client: &RequestClient,
        product_id: &str,
        variant: &str,
    ) -> Result<CartOutcome, CommerceError> {
        self.seen.lock().unwrap().push(CartCall {
            task_id: client.task_id().to_string(),
            product_id: product_id.to_string(),
            variant: variant.to_string(),
            proxy: client.proxy(),
            clearance: client.clearance(),
        });
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(CartOutcome::Added))
    }
}

/// Checkout outcomes in order; confirms with `ORD-<task>` once empty.
#[derive(Default)]
pub struct ScriptedCheckout {
    outcomes: Mutex<VecDeque<Result<CheckoutOutcome, CommerceError>>>,
    seen: Mutex<Vec<(String, bool)>>,
}

impl ScriptedCheckout {
    pub fn new(outcomes: Vec<Result<CheckoutOutcome, CommerceError>>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    /// `(profile email, skip_init)` per call.
    pub fn calls(&self) -> Vec<(String, bool)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl CheckoutClient for ScriptedCheckout {
    async fn run(
        &self,
        client: &RequestClient,
        profile: &Profile,
        skip_init: bool,
    ) -> Result<CheckoutOutcome, CommerceError> {
        self.seen
            .lock()
            .unwrap()
            .push((profile.email.clone(), skip_init));
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(CheckoutOutcome::Confirmed(format!("ORD-{}", client.task_id()))))
    }
}

pub enum SolverBehaviour {
    Token(&'static str),
    GiveUp,
    Hang,
}

pub struct MockSolver {
    behaviour: SolverBehaviour,
    calls: Mutex<Vec<Option<Url>>>,
}

impl MockSolver {
    pub fn new(behaviour: SolverBehaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<Option<Url>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl InteractiveSolver for MockSolver {
    async fn solve(&self, url: Option<&Url>) -> Option<String> {
        self.calls.lock().unwrap().push(url.cloned());
        match self.behaviour {
            SolverBehaviour::Token(token) => Some(token.to_string()),
            SolverBehaviour::GiveUp => None,
            SolverBehaviour::Hang => std::future::pending().await,
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(NotificationKind, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<(NotificationKind, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, kind: NotificationKind) -> usize {
        self.sent().iter().filter(|(k, _)| *k == kind).count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, kind: NotificationKind, payload: &str) -> bool {
        self.sent.lock().unwrap().push((kind, payload.to_string()));
        true
    }
}

/// Records every state change as `(task, from, to)`.
#[derive(Default)]
pub struct TransitionLog {
    seen: Mutex<Vec<(String, TaskState, TaskState)>>,
}

impl TransitionLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn all(&self) -> Vec<(String, TaskState, TaskState)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn states_of(&self, task_id: &str) -> Vec<TaskState> {
        self.all()
            .into_iter()
            .filter(|(id, _, _)| id == task_id)
            .map(|(_, _, to)| to)
            .collect()
    }
}

impl EventHandler for TransitionLog {
    fn handle(&self, event: &TaskEvent) {
        if let TaskEvent::StateChanged(change) = event {
            self.seen.lock().unwrap().push((
                change.status.id.clone(),
                change.from,
                change.status.state,
            ));
        }
    }
}

pub struct Mocks {
    pub stock: Arc<ScriptedStock>,
    pub cart: Arc<ScriptedCart>,
    pub checkout: Arc<ScriptedCheckout>,
    pub solver: Arc<MockSolver>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Mocks {
    pub fn new(
        stock: Arc<ScriptedStock>,
        cart: Arc<ScriptedCart>,
        checkout: Arc<ScriptedCheckout>,
        solver: Arc<MockSolver>,
    ) -> Self {
        Self {
            stock,
            cart,
            checkout,
            solver,
            notifier: RecordingNotifier::new(),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            stock: self.stock.clone(),
            cart: self.cart.clone(),
            checkout: self.checkout.clone(),
            solver: self.solver.clone(),
            notifier: self.notifier.clone(),
        }
    }
}
