//! # porter-rs
//!
//! Concurrent purchase-task engine: poll product availability, add to cart,
//! run checkout and report the outcome, for many products and identities at
//! once, under rate limiting and bot detection.
//!
//! ## Features
//!
//! - Per-task purchase state machine with CAPTCHA escalation
//! - Typed proxy pool with health tracking and sticky leases
//! - Retrying request layer with backoff and challenge detection
//! - Cookie-based session store with validation and CSRF warm-up
//! - Runner with isolated task failures, live status and graceful shutdown
//!
//! Storefront specifics (stock parsing, cart and checkout payloads) are
//! supplied by the caller through the traits in [`external_deps`].
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use porter_rs::{Profile, Runner, Task};
//! # use porter_rs::{CartClient, CheckoutClient, StockChecker};
//! # fn storefront() -> (Arc<dyn StockChecker>, Arc<dyn CartClient>, Arc<dyn CheckoutClient>) { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (stock, cart, checkout) = storefront();
//!     let runner = Runner::builder()
//!         .with_stock_checker(stock)
//!         .with_cart_client(cart)
//!         .with_checkout_client(checkout)
//!         .build()?;
//!
//!     runner.proxy_pool().load_str("user:pass@10.0.0.1:8080\n", "default");
//!     runner.session().load_json(&std::fs::read_to_string("cookies.json")?).await?;
//!
//!     let profile = Arc::new(Profile::default());
//!     let tasks = vec![Task::new("task-1", "SKU-123", "M", profile)];
//!     let summary = runner.run_all(tasks, Duration::from_millis(300)).await;
//!     println!("{summary}");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod external_deps;
pub mod modules;
pub mod request;
pub mod runner;

pub use crate::config::{ConfigError, EngineConfig};

pub use crate::engine::{
    Collaborators,
    MachineConfig,
    Priority,
    Profile,
    PurchaseMachine,
    Task,
    TaskState,
    TaskStatus,
};

pub use crate::external_deps::{
    CartClient,
    CartOutcome,
    CheckoutClient,
    CheckoutOutcome,
    CommerceError,
    InteractiveSolver,
    LogNotifier,
    NotificationKind,
    Notifier,
    PromptSolver,
    StockChecker,
    StockStatus,
    WebhookNotifier,
};

pub use crate::modules::{
    EventDispatcher,
    EventHandler,
    ProxyConfig,
    ProxyKind,
    ProxyPool,
    RawCookie,
    Session,
    SessionConfig,
    SessionError,
    SessionStore,
    StatusBoard,
    TaskEvent,
};

pub use crate::request::{
    ChallengeDetection,
    HttpTransport,
    RequestClass,
    RequestClient,
    RequestConfig,
    RequestError,
    RequestOutcome,
    ReqwestTransport,
    Response,
    TransportError,
    TransportRequest,
    TransportResponse,
};

pub use crate::runner::{RunSummary, Runner, RunnerBuilder, RunnerConfig, RunnerError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
