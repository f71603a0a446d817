//! Collaborators the engine talks to through narrow interfaces.
//!
//! Storefront clients, interactive CAPTCHA solving and notifications are
//! traits here; the crate ships a stdin prompt solver and webhook/log
//! notifiers.

pub mod captcha;
pub mod commerce;
pub mod notifier;

pub use captcha::{InteractiveSolver, PromptSolver};
pub use commerce::{
    CartClient, CartOutcome, CheckoutClient, CheckoutOutcome, CommerceError, StockChecker,
    StockStatus,
};
pub use notifier::{Level, LogNotifier, NotificationKind, Notifier, WebhookNotifier};
