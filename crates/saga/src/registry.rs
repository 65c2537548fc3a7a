//! Participant action registry.
//!
//! Steps only carry an action name. The registry turns that name back into
//! executable code at run time, which is what lets a restarted process
//! resume a saga it never saw being submitted.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ActionFailure, Result, SagaError};

/// Result of invoking a participant action.
pub type ActionResult = std::result::Result<Value, ActionFailure>;

/// A forward action paired with its compensation.
///
/// Both halves receive the step payload and may be invoked more than once
/// for the same payload, so implementations must tolerate at-least-once
/// delivery on their own.
#[async_trait]
pub trait SagaAction: Send + Sync {
    /// Performs the step.
    async fn forward(&self, payload: &Value) -> ActionResult;

    /// Semantically undoes a successful [`forward`](SagaAction::forward).
    async fn compensate(&self, payload: &Value) -> ActionResult;
}

/// Adapts a pair of async closures into a [`SagaAction`].
struct FnAction<F, C> {
    forward: F,
    compensate: C,
}

#[async_trait]
impl<F, FFut, C, CFut> SagaAction for FnAction<F, C>
where
    F: Fn(Value) -> FFut + Send + Sync + 'static,
    FFut: Future<Output = ActionResult> + Send + 'static,
    C: Fn(Value) -> CFut + Send + Sync + 'static,
    CFut: Future<Output = ActionResult> + Send + 'static,
{
    async fn forward(&self, payload: &Value) -> ActionResult {
        (self.forward)(payload.clone()).await
    }

    async fn compensate(&self, payload: &Value) -> ActionResult {
        (self.compensate)(payload.clone()).await
    }
}

/// Maps action names to their implementations.
///
/// Built once at startup and shared behind an `Arc`.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn SagaAction>>,
}

impl ActionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an action under `name`, replacing any previous binding.
    pub fn register(&mut self, name: impl Into<String>, action: Arc<dyn SagaAction>) -> &mut Self {
        let name = name.into();
        if self.actions.insert(name.clone(), action).is_some() {
            tracing::warn!(action = %name, "action re-registered, previous binding replaced");
        }
        self
    }

    /// Registers a forward/compensate pair of async closures under `name`.
    pub fn register_fn<F, FFut, C, CFut>(
        &mut self,
        name: impl Into<String>,
        forward: F,
        compensate: C,
    ) -> &mut Self
    where
        F: Fn(Value) -> FFut + Send + Sync + 'static,
        FFut: Future<Output = ActionResult> + Send + 'static,
        C: Fn(Value) -> CFut + Send + Sync + 'static,
        CFut: Future<Output = ActionResult> + Send + 'static,
    {
        self.register(name, Arc::new(FnAction {
            forward,
            compensate,
        }))
    }

    /// Looks up the action registered under `name`.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn SagaAction>> {
        self.actions
            .get(name)
            .cloned()
            .ok_or_else(|| SagaError::UnknownAction(name.to_string()))
    }

    /// Returns true if an action is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Returns the registered action names, sorted.
    pub fn action_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.action_names())
            .finish()
    }
}
