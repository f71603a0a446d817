//! Task model and the per-task purchase state machine.

pub mod machine;
pub mod task;

pub use machine::{Collaborators, MachineConfig, PurchaseMachine};
pub use task::{InvalidTransition, Priority, Profile, Task, TaskState, TaskStatus, truncate};
