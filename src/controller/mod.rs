//! Action registry - the catalogue of atomic browser actions.
//!
//! Every action is registered under a unique name together with its category,
//! a description and the parameters it accepts. The registry validates the
//! parameters of a call, fills in declared defaults and runs the handler
//! against the shared [`Actuator`].
//!
//! Failures never escape [`ActionRegistry::execute`]: validation problems and
//! handler errors alike come back as [`ActionOutcome::Error`].

mod actions;

pub use actions::register_default_actions;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::actuator::{ensure_initialized, Actuator, ActuatorError, InitPolicy};
use crate::config::BrowserConfig;

/// Parameters of one action call.
pub type ActionParams = serde_json::Map<String, Value>;

/// Name of the terminal no-op action. It never touches the actuator.
pub const DONE_ACTION: &str = "done";

/// Category of a registered action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    Navigation,
    Interaction,
    Extraction,
    Utility,
    System,
}

/// Declared parameters of an action.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParamSpec {
    pub required: BTreeSet<String>,
    pub optional: BTreeMap<String, Value>,
}

impl ParamSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: &str) -> Self {
        self.required.insert(name.to_string());
        self
    }

    pub fn optional(mut self, name: &str, default: impl Into<Value>) -> Self {
        self.optional.insert(name.to_string(), default.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.optional.is_empty()
    }
}

/// What a handler gets to work with.
pub struct ActionContext<'a> {
    pub actuator: &'a dyn Actuator,
    pub browser: &'a BrowserConfig,
}

/// Implementation of one action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Parameters the handler accepts. Used when the registration does not
    /// declare any.
    fn params(&self) -> ParamSpec {
        ParamSpec::default()
    }

    /// Run the action. `params` already contains the declared defaults.
    async fn call(&self, ctx: &ActionContext<'_>, params: ActionParams) -> anyhow::Result<Value>;
}

/// Adapter turning an async closure into a handler.
///
/// The closure does not see the actuator, so it suits system and utility
/// actions.
pub struct FnHandler<F> {
    f: F,
    params: ParamSpec,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(ActionParams) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    pub fn new(params: ParamSpec, f: F) -> Self {
        Self { f, params }
    }
}

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(ActionParams) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    fn params(&self) -> ParamSpec {
        self.params.clone()
    }

    async fn call(&self, _ctx: &ActionContext<'_>, params: ActionParams) -> anyhow::Result<Value> {
        (self.f)(params).await
    }
}

/// Registration record of an action.
pub struct ActionDescriptor {
    pub name: String,
    pub category: ActionCategory,
    pub description: String,
    pub params: ParamSpec,
    handler: Arc<dyn ActionHandler>,
}

impl ActionDescriptor {
    pub fn info(&self) -> ActionInfo {
        ActionInfo {
            name: self.name.clone(),
            category: self.category,
            description: self.description.clone(),
            required_params: self.params.required.iter().cloned().collect(),
            optional_params: self.params.optional.clone(),
        }
    }
}

/// Serializable summary of a registered action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionInfo {
    pub name: String,
    pub category: ActionCategory,
    pub description: String,
    pub required_params: Vec<String>,
    pub optional_params: BTreeMap<String, Value>,
}

/// Why an action did not produce a result.
#[derive(Debug, Clone, Error)]
pub enum ActionError {
    #[error("Action '{0}' not found")]
    NotFound(String),

    #[error("Parameter validation failed")]
    InvalidParams(BTreeMap<String, String>),

    #[error("Failed to initialize browser: {0}")]
    Initialization(#[from] ActuatorError),

    #[error("Error executing action: {0}")]
    Handler(String),
}

/// Result of [`ActionRegistry::execute`], serialized with a `status` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    Success {
        action: String,
        result: Value,
    },
    Error {
        action: String,
        message: String,
        /// Only present for parameter validation failures.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        errors: Option<BTreeMap<String, String>>,
    },
}

impl ActionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ActionOutcome::Success { .. })
    }

    pub fn result(&self) -> Option<&Value> {
        match self {
            ActionOutcome::Success { result, .. } => Some(result),
            ActionOutcome::Error { .. } => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            ActionOutcome::Success { .. } => None,
            ActionOutcome::Error { message, .. } => Some(message),
        }
    }

    fn from_result(action: &str, result: Result<Value, ActionError>) -> Self {
        match result {
            Ok(result) => ActionOutcome::Success {
                action: action.to_string(),
                result,
            },
            Err(ActionError::InvalidParams(errors)) => ActionOutcome::Error {
                action: action.to_string(),
                message: ActionError::InvalidParams(BTreeMap::new()).to_string(),
                errors: Some(errors),
            },
            Err(e) => ActionOutcome::Error {
                action: action.to_string(),
                message: e.to_string(),
                errors: None,
            },
        }
    }
}

/// Registry of available actions.
pub struct ActionRegistry {
    actions: RwLock<HashMap<String, Arc<ActionDescriptor>>>,
    actuator: Arc<dyn Actuator>,
    browser: BrowserConfig,
    init_policy: InitPolicy,
}

impl ActionRegistry {
    /// Create an empty registry (no built-in actions).
    pub fn empty(actuator: Arc<dyn Actuator>, browser: BrowserConfig) -> Self {
        let init_policy = InitPolicy::with_max_attempts(browser.init_max_attempts);
        Self {
            actions: RwLock::new(HashMap::new()),
            actuator,
            browser,
            init_policy,
        }
    }

    /// Create a registry with the default browser actions.
    pub fn new(actuator: Arc<dyn Actuator>, browser: BrowserConfig) -> Self {
        let registry = Self::empty(actuator, browser);
        register_default_actions(&registry);
        registry
    }

    pub fn with_init_policy(mut self, policy: InitPolicy) -> Self {
        self.init_policy = policy;
        self
    }

    pub fn actuator(&self) -> &Arc<dyn Actuator> {
        &self.actuator
    }

    /// Register an action. An existing action with the same name is replaced.
    ///
    /// When `params` is `None` the handler's own declaration is used. An
    /// explicit empty spec declares an action without parameters.
    pub fn register(
        &self,
        name: &str,
        handler: Arc<dyn ActionHandler>,
        category: ActionCategory,
        description: &str,
        params: Option<ParamSpec>,
    ) {
        let params = params.unwrap_or_else(|| handler.params());

        let descriptor = Arc::new(ActionDescriptor {
            name: name.to_string(),
            category,
            description: description.to_string(),
            params,
            handler,
        });

        let mut actions = self.actions.write().unwrap_or_else(PoisonError::into_inner);
        if actions.insert(name.to_string(), descriptor).is_some() {
            tracing::warn!(action = %name, "Action is being overridden");
        }
        tracing::debug!(action = %name, category = ?category, "Registered action");
    }

    pub fn get(&self, name: &str) -> Option<Arc<ActionDescriptor>> {
        self.actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// List registered actions, optionally filtered by category, sorted by name.
    pub fn list(&self, category: Option<ActionCategory>) -> Vec<ActionInfo> {
        let actions = self.actions.read().unwrap_or_else(PoisonError::into_inner);
        let mut infos: Vec<ActionInfo> = actions
            .values()
            .filter(|d| category.map_or(true, |c| d.category == c))
            .map(|d| d.info())
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Check `params` against the declaration of `name`.
    ///
    /// Returns one message per problem; an empty map means the call is valid.
    pub fn validate(&self, name: &str, params: &ActionParams) -> BTreeMap<String, String> {
        let Some(descriptor) = self.get(name) else {
            let mut errors = BTreeMap::new();
            errors.insert("action".to_string(), format!("Action '{}' not found", name));
            return errors;
        };
        missing_params(&descriptor.params, params)
    }

    /// Execute an action by name. Never fails; see [`ActionOutcome`].
    pub async fn execute(&self, name: &str, params: ActionParams) -> ActionOutcome {
        let result = self.try_execute(name, params).await;
        if let Err(e) = &result {
            tracing::warn!(action = %name, error = %e, "Action failed");
        }
        ActionOutcome::from_result(name, result)
    }

    async fn try_execute(&self, name: &str, params: ActionParams) -> Result<Value, ActionError> {
        let descriptor = self
            .get(name)
            .ok_or_else(|| ActionError::NotFound(name.to_string()))?;

        let errors = missing_params(&descriptor.params, &params);
        if !errors.is_empty() {
            return Err(ActionError::InvalidParams(errors));
        }

        if descriptor.name != DONE_ACTION {
            ensure_initialized(self.actuator.as_ref(), &self.init_policy).await?;
        }

        let mut merged = ActionParams::new();
        for (key, default) in &descriptor.params.optional {
            merged.insert(key.clone(), default.clone());
        }
        merged.extend(params);

        let ctx = ActionContext {
            actuator: self.actuator.as_ref(),
            browser: &self.browser,
        };

        tracing::debug!(action = %name, "Executing action");
        match AssertUnwindSafe(descriptor.handler.call(&ctx, merged))
            .catch_unwind()
            .await
        {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ActionError::Handler(e.to_string())),
            Err(_) => Err(ActionError::Handler("action handler panicked".to_string())),
        }
    }
}

fn missing_params(spec: &ParamSpec, params: &ActionParams) -> BTreeMap<String, String> {
    spec.required
        .iter()
        .filter(|name| !params.contains_key(name.as_str()))
        .map(|name| {
            (
                name.clone(),
                format!("Missing required parameter: {}", name),
            )
        })
        .collect()
}
