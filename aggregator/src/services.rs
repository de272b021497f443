//! One aggregation service per mirrored domain.
//!
//! A service fetches every upstream page, stamps the records and swaps them
//! into the store. Runs are gated by the run-state registry: a second run of
//! the same kind on the same domain is rejected while one is in flight.

use crate::errors::{AppError, Result};
use crate::external::{PagedSource, collect_all};
use crate::mediator::{Colleague, ColleagueOperation};
use crate::metrics_defs::{
    AGGREGATION_CONFLICTS, AGGREGATION_DURATION, AGGREGATION_RECORDS, AGGREGATION_RUNS,
    PURGE_ROWS,
};
use crate::run_state::{Domain, OperationKind, RunFlag, RunGuard, RunStateRegistry};
use crate::store::{Record, Store};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub domain: Domain,
    pub kind: OperationKind,
    /// Records stored by an aggregation, rows removed by a purge.
    pub records: u64,
    pub duration_ms: u64,
}

/// Object-safe view of a domain service, used by the API and the scheduler.
#[async_trait]
pub trait DomainService: Send + Sync {
    fn domain(&self) -> Domain;

    /// Claims the run flag for `kind` without waiting.
    fn begin(&self, kind: OperationKind) -> Result<RunGuard>;

    /// Runs the operation the guard was claimed for. The flag is cleared when
    /// this returns, fails or is cancelled.
    async fn run(&self, guard: RunGuard) -> Result<RunReport>;

    async fn aggregate(&self) -> Result<RunReport> {
        let guard = self.begin(OperationKind::Aggregation)?;
        self.run(guard).await
    }

    async fn purge(&self) -> Result<RunReport> {
        let guard = self.begin(OperationKind::Purge)?;
        self.run(guard).await
    }
}

pub struct AggregationService<S: PagedSource, R: Record> {
    domain: Domain,
    source: S,
    map: fn(S::Item, DateTime<Utc>) -> R,
    store: Store,
    run_state: Arc<RunStateRegistry>,
    record: PhantomData<fn() -> R>,
}

impl<S, R> AggregationService<S, R>
where
    S: PagedSource,
    R: Record,
{
    pub fn new(
        domain: Domain,
        source: S,
        map: fn(S::Item, DateTime<Utc>) -> R,
        store: Store,
        run_state: Arc<RunStateRegistry>,
    ) -> Self {
        AggregationService {
            domain,
            source,
            map,
            store,
            run_state,
            record: PhantomData,
        }
    }

    /// Colleague operations this service answers.
    pub fn operations(&self) -> [ColleagueOperation; 2] {
        [
            ColleagueOperation::Aggregate(self.domain),
            ColleagueOperation::Purge(self.domain),
        ]
    }

    async fn aggregate_with(&self, _guard: RunGuard) -> Result<RunReport> {
        let started = Instant::now();
        tracing::info!(domain = %self.domain, source = self.source.name(), "aggregation started");

        let stored = match self.fetch_and_store().await {
            Ok(stored) => stored,
            Err(e) => {
                shared::counter!(AGGREGATION_RUNS, "domain" => self.domain.as_str(), "outcome" => "failure")
                    .increment(1);
                tracing::error!(domain = %self.domain, error = %e, "aggregation failed, keeping previous records");
                return Err(e);
            }
        };

        let elapsed = started.elapsed();
        shared::counter!(AGGREGATION_RUNS, "domain" => self.domain.as_str(), "outcome" => "success")
            .increment(1);
        shared::histogram!(AGGREGATION_RECORDS, "domain" => self.domain.as_str()).record(stored as f64);
        shared::histogram!(AGGREGATION_DURATION, "domain" => self.domain.as_str())
            .record(elapsed.as_secs_f64());
        tracing::info!(
            domain = %self.domain,
            records = stored,
            elapsed_ms = elapsed.as_millis() as u64,
            "aggregation finished"
        );

        Ok(RunReport {
            domain: self.domain,
            kind: OperationKind::Aggregation,
            records: stored,
            duration_ms: elapsed.as_millis() as u64,
        })
    }

    /// Fetches every page, stamps the records with one time and swaps them in.
    async fn fetch_and_store(&self) -> Result<u64> {
        let items = collect_all(&self.source).await?;
        let aggregated_at = Utc::now();
        let records: Vec<R> = items
            .into_iter()
            .map(|item| (self.map)(item, aggregated_at))
            .collect();
        Ok(self.store.replace_all(&records).await?)
    }

    async fn purge_with(&self, _guard: RunGuard) -> Result<RunReport> {
        let started = Instant::now();
        let removed = self.store.purge::<R>().await?;
        let elapsed = started.elapsed();

        shared::histogram!(PURGE_ROWS, "domain" => self.domain.as_str()).record(removed as f64);
        tracing::info!(domain = %self.domain, removed, "purge finished");

        Ok(RunReport {
            domain: self.domain,
            kind: OperationKind::Purge,
            records: removed,
            duration_ms: elapsed.as_millis() as u64,
        })
    }
}

#[async_trait]
impl<S, R> DomainService for AggregationService<S, R>
where
    S: PagedSource,
    R: Record,
{
    fn domain(&self) -> Domain {
        self.domain
    }

    fn begin(&self, kind: OperationKind) -> Result<RunGuard> {
        let flag = RunFlag::new(self.domain, kind);
        self.run_state.try_begin(flag).map_err(|e| {
            shared::counter!(AGGREGATION_CONFLICTS, "domain" => self.domain.as_str(), "kind" => kind.as_str())
                .increment(1);
            tracing::info!(%flag, "rejected, already running");
            AppError::from(e)
        })
    }

    async fn run(&self, guard: RunGuard) -> Result<RunReport> {
        let flag = guard.flag();
        if flag.domain != self.domain {
            return Err(AppError::Validation(format!(
                "{flag} cannot run on the {} service",
                self.domain
            )));
        }
        match flag.kind {
            OperationKind::Aggregation => self.aggregate_with(guard).await,
            OperationKind::Purge => self.purge_with(guard).await,
        }
    }
}

#[async_trait]
impl<S, R> Colleague for AggregationService<S, R>
where
    S: PagedSource,
    R: Record,
{
    fn name(&self) -> &'static str {
        self.domain.as_str()
    }

    async fn handle(
        &self,
        operation: ColleagueOperation,
        _payload: Value,
    ) -> Result<Option<Value>> {
        let report = match operation {
            ColleagueOperation::Aggregate(domain) if domain == self.domain => {
                DomainService::aggregate(self).await?
            }
            ColleagueOperation::Purge(domain) if domain == self.domain => {
                DomainService::purge(self).await?
            }
            other => {
                tracing::warn!(operation = %other, service = %self.domain, "operation not handled");
                return Ok(None);
            }
        };
        Ok(serde_json::to_value(report).ok())
    }
}

/// Every configured domain service, by domain.
#[derive(Clone, Default)]
pub struct DomainServices {
    services: IndexMap<Domain, Arc<dyn DomainService>>,
}

impl DomainServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, service: Arc<dyn DomainService>) {
        self.services.insert(service.domain(), service);
    }

    pub fn get(&self, domain: Domain) -> Result<Arc<dyn DomainService>> {
        self.services
            .get(&domain)
            .cloned()
            .ok_or_else(|| AppError::NotFound {
                kind: "domain service",
                id: domain.to_string(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn DomainService>> {
        self.services.values()
    }
}
