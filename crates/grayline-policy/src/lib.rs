//! grayline-policy — automatic rollback on sustained health breaches.
//!
//! Alert rules are compiled per application ([`rules`]), each rule keeps a
//! [`tracker::BreachTracker`], and the [`engine::RollbackPolicyEngine`]
//! turns a sustained breach into one notification plus, when the policy
//! asks for it, one batch rollback through the rollout coordinator.

pub mod engine;
pub mod notify;
pub mod rules;
pub mod tracker;

pub use engine::{Firing, RollbackPolicyEngine, rollback_scope};
pub use notify::{AlertNotification, LogNotifier, Notifier, NotifyError, WebhookNotifier};
pub use rules::{CompiledPolicy, CompiledRule, PolicyError, compile, validate};
pub use tracker::BreachTracker;
