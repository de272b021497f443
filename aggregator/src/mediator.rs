//! Named-operation dispatch between colleagues.
//!
//! Every operation a caller may request is a variant of [`ColleagueOperation`].
//! Handlers are registered once at startup, either keyed to one operation or
//! unkeyed as a fallback, and the resulting [`Mediator`] is immutable.

use crate::errors::AppError;
use crate::linking::LinkTarget;
use crate::run_state::Domain;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColleagueOperation {
    Aggregate(Domain),
    Purge(Domain),
    Link(LinkTarget),
    Unlink(LinkTarget),
    AccountInsights,
}

impl ColleagueOperation {
    /// The closed set of operation keys.
    pub fn all() -> Vec<ColleagueOperation> {
        let mut ops = Vec::new();
        ops.extend(Domain::ALL.into_iter().map(ColleagueOperation::Aggregate));
        ops.extend(Domain::ALL.into_iter().map(ColleagueOperation::Purge));
        ops.extend(LinkTarget::ALL.into_iter().map(ColleagueOperation::Link));
        ops.extend(LinkTarget::ALL.into_iter().map(ColleagueOperation::Unlink));
        ops.push(ColleagueOperation::AccountInsights);
        ops
    }
}

impl fmt::Display for ColleagueOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColleagueOperation::Aggregate(domain) => write!(f, "aggregate:{domain}"),
            ColleagueOperation::Purge(domain) => write!(f, "purge:{domain}"),
            ColleagueOperation::Link(target) => write!(f, "link:{target}"),
            ColleagueOperation::Unlink(target) => write!(f, "unlink:{target}"),
            ColleagueOperation::AccountInsights => f.write_str("account-insights"),
        }
    }
}

impl FromStr for ColleagueOperation {
    type Err = MediatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ColleagueOperation::all()
            .into_iter()
            .find(|op| op.to_string() == s)
            .ok_or_else(|| MediatorError::UnknownOperation(s.to_string()))
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum MediatorError {
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    #[error("more than one keyed handler registered for {0}")]
    DuplicateRegistration(ColleagueOperation),
    #[error("invalid payload for {operation}: {reason}")]
    InvalidPayload {
        operation: ColleagueOperation,
        reason: String,
    },
}

#[async_trait]
pub trait Colleague: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(
        &self,
        operation: ColleagueOperation,
        payload: Value,
    ) -> Result<Option<Value>, AppError>;
}

pub type ColleagueFactory = Arc<dyn Fn() -> Arc<dyn Colleague> + Send + Sync>;

/// How a registered handler is obtained for one `notify` call.
#[derive(Clone)]
pub enum Provider {
    /// One process-wide instance.
    Singleton(Arc<dyn Colleague>),
    /// A fresh instance per call.
    Scoped(ColleagueFactory),
}

impl Provider {
    pub fn singleton(colleague: impl Colleague + 'static) -> Self {
        Provider::Singleton(Arc::new(colleague))
    }

    pub fn scoped<F, C>(factory: F) -> Self
    where
        F: Fn() -> C + Send + Sync + 'static,
        C: Colleague + 'static,
    {
        Provider::Scoped(Arc::new(move || Arc::new(factory()) as Arc<dyn Colleague>))
    }

    fn resolve(&self) -> Arc<dyn Colleague> {
        match self {
            Provider::Singleton(colleague) => Arc::clone(colleague),
            Provider::Scoped(factory) => factory(),
        }
    }
}

#[derive(Default)]
pub struct MediatorBuilder {
    keyed: HashMap<ColleagueOperation, Provider>,
    unkeyed: Vec<Provider>,
}

impl MediatorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keyed(
        mut self,
        operation: ColleagueOperation,
        provider: Provider,
    ) -> Result<Self, MediatorError> {
        if self.keyed.contains_key(&operation) {
            return Err(MediatorError::DuplicateRegistration(operation));
        }
        self.keyed.insert(operation, provider);
        Ok(self)
    }

    /// Registers `provider` for every operation in `operations`.
    pub fn keyed_all(
        self,
        operations: impl IntoIterator<Item = ColleagueOperation>,
        provider: Provider,
    ) -> Result<Self, MediatorError> {
        operations
            .into_iter()
            .try_fold(self, |builder, op| builder.keyed(op, provider.clone()))
    }

    pub fn unkeyed(mut self, provider: Provider) -> Self {
        self.unkeyed.push(provider);
        self
    }

    pub fn build(self) -> Mediator {
        Mediator {
            keyed: self.keyed,
            unkeyed: self.unkeyed,
        }
    }
}

pub struct Mediator {
    keyed: HashMap<ColleagueOperation, Provider>,
    unkeyed: Vec<Provider>,
}

impl Mediator {
    pub fn builder() -> MediatorBuilder {
        MediatorBuilder::new()
    }

    /// Dispatches `operation` to its keyed handler, or else to the first
    /// unkeyed handler that is not `sender`.
    ///
    /// Returns `Ok(None)` when nothing handles the operation. That is
    /// indistinguishable from a handler that produced no result.
    pub async fn notify(
        &self,
        sender: &str,
        operation: ColleagueOperation,
        payload: Value,
    ) -> Result<Option<Value>, AppError> {
        if let Some(provider) = self.keyed.get(&operation) {
            let colleague = provider.resolve();
            tracing::debug!(%operation, sender, handler = colleague.name(), "dispatching keyed");
            return colleague.handle(operation, payload).await;
        }

        for provider in &self.unkeyed {
            let colleague = provider.resolve();
            if colleague.name() == sender {
                continue;
            }
            tracing::debug!(%operation, sender, handler = colleague.name(), "dispatching unkeyed");
            return colleague.handle(operation, payload).await;
        }

        tracing::warn!(%operation, sender, "no colleague handles operation");
        Ok(None)
    }

    pub fn handles(&self, operation: ColleagueOperation) -> bool {
        self.keyed.contains_key(&operation) || !self.unkeyed.is_empty()
    }
}
