//! Cross-cutting services module
//!
//! Shared state used by every task of a run: the proxy pool, the session
//! store, the live status board and the event plumbing, plus timing helpers.

pub mod events;
pub mod proxy;
pub mod session;
pub mod state;
pub mod timing;

// Re-export commonly used types
pub use events::{
    BoardHandler, CaptchaEvent, ErrorEvent, EventDispatcher, EventHandler, LoggingHandler,
    StateChangeEvent, TaskEvent,
};
pub use proxy::{GroupStats, Proxy, ProxyConfig, ProxyGroup, ProxyKind, ProxyPool, mask_address};
pub use session::{RawCookie, Session, SessionConfig, SessionError, SessionStore};
pub use state::{StatusBoard, count_states};
pub use timing::{HumanAction, RateLimiter, human_delay, jitter, poll_interval, sleep_with_jitter};
