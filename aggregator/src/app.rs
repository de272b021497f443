//! Builds the running service from configuration.

use crate::api::{self, AppState};
use crate::config::{Config, ConfigError};
use crate::errors::AppError;
use crate::external::{
    CmdbClient, FederationClient, LegacyClient, PagedSource, UpstreamError,
    cmdb::{CmdbApplicationRecord, CmdbUserRecord},
    federation::{FederationOidcClient, FederationSamlConnection},
    legacy::LegacyRecord,
};
use crate::jobs::{AggregationJob, Job, JobError, JobScheduler, PurgeJob};
use crate::linking::{Capabilities, ClientCredentialsTokenProvider, LinkingClient, LinkingColleague};
use crate::mediator::{Colleague, ColleagueOperation, Mediator, MediatorBuilder, MediatorError, Provider};
use crate::pagination::LinkBuilder;
use crate::run_state::{Domain, OperationKind, RunStateRegistry};
use crate::services::{AggregationService, DomainServices, RunReport};
use crate::store::{Record, Store, StoreError};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not open store: {0}")]
    Store(#[from] StoreError),
    #[error("could not build upstream client: {0}")]
    Upstream(#[from] UpstreamError),
    #[error("could not build identity cloud client: {0}")]
    IdentityCloud(#[from] reqwest::Error),
    #[error(transparent)]
    Mediator(#[from] MediatorError),
    #[error("could not schedule job: {0}")]
    Job(#[from] JobError),
    #[error("{0} has no configured upstream")]
    Unconfigured(Domain),
    #[error("listener failed: {0}")]
    Io(#[from] std::io::Error),
}

pub struct App {
    pub state: AppState,
    pub scheduler: JobScheduler,
}

impl App {
    /// Validates `config`, opens and migrates the configured store.
    pub async fn from_config(config: &Config) -> Result<App, StartupError> {
        config.validate()?;
        let store = Store::connect(&config.database.url, config.database.max_connections).await?;
        store.migrate().await?;
        App::with_store(config, store)
    }

    pub fn with_store(config: &Config, store: Store) -> Result<App, StartupError> {
        let run_state = Arc::new(RunStateRegistry::new());
        let mut services = DomainServices::new();
        let mut mediator = Mediator::builder();

        if let Some(upstream) = &config.federation {
            let client = FederationClient::new(
                upstream.http_client()?,
                upstream.url.clone(),
                upstream.auth.clone(),
                upstream.page_size,
            )
            .with_max_pages(upstream.max_pages);
            let saml = AggregationService::new(
                Domain::FederationSaml,
                client.saml_connections(),
                FederationSamlConnection::into_record,
                store.clone(),
                run_state.clone(),
            );
            let oidc = AggregationService::new(
                Domain::FederationOidc,
                client.oidc_clients(),
                FederationOidcClient::into_record,
                store.clone(),
                run_state.clone(),
            );
            mediator = register(mediator, &mut services, saml)?;
            mediator = register(mediator, &mut services, oidc)?;
        }

        if let Some(upstream) = &config.legacy {
            let client = LegacyClient::new(
                upstream.http_client()?,
                upstream.url.clone(),
                upstream.auth.clone(),
                upstream.page_size,
            );
            let legacy = AggregationService::new(
                Domain::Legacy,
                client,
                LegacyRecord::into_record,
                store.clone(),
                run_state.clone(),
            );
            mediator = register(mediator, &mut services, legacy)?;
        }

        if let Some(upstream) = &config.cmdb {
            let client = CmdbClient::new(
                upstream.http_client()?,
                upstream.url.clone(),
                upstream.auth.clone(),
                upstream.page_size,
            );
            let applications = AggregationService::new(
                Domain::CmdbApplications,
                client.applications(),
                CmdbApplicationRecord::into_record,
                store.clone(),
                run_state.clone(),
            );
            let users = AggregationService::new(
                Domain::CmdbUsers,
                client.users(),
                CmdbUserRecord::into_record,
                store.clone(),
                run_state.clone(),
            );
            mediator = register(mediator, &mut services, applications)?;
            mediator = register(mediator, &mut services, users)?;
        }

        let mut capabilities = None;
        if let Some(cloud) = &config.identity_cloud {
            let http_client = reqwest::Client::builder()
                .timeout(Duration::from_secs(cloud.timeout_secs))
                .build()?;
            let tokens = Arc::new(ClientCredentialsTokenProvider::new(
                http_client.clone(),
                cloud.token_url.clone(),
                cloud.client_id.clone(),
                cloud.client_secret.clone(),
                cloud.scope.clone(),
            ));
            let caps = cloud
                .disabled_operations()?
                .into_iter()
                .fold(Capabilities::default(), Capabilities::disable);
            let client = LinkingClient::new(http_client, cloud.url.clone(), tokens, caps.clone());
            mediator = mediator.keyed_all(
                LinkingColleague::operations(),
                Provider::singleton(LinkingColleague::new(Arc::new(client))),
            )?;
            capabilities = Some(caps);
        }

        let state = AppState {
            store,
            run_state,
            services,
            mediator: Arc::new(mediator.build()),
            links: LinkBuilder::new(&config.pagination.base_url),
            max_page_size: config.pagination.max_page_size,
            capabilities,
        };

        Ok(App {
            state,
            scheduler: JobScheduler::new(),
        })
    }

    /// Registers every configured schedule. Needs a running tokio runtime.
    pub fn start_schedules(&self, config: &Config) -> Result<(), StartupError> {
        for schedule in &config.schedules {
            let service = self
                .state
                .services
                .get(schedule.domain)
                .map_err(|_| StartupError::Unconfigured(schedule.domain))?;
            let job: Arc<dyn Job> = match schedule.kind {
                OperationKind::Aggregation => Arc::new(AggregationJob(service)),
                OperationKind::Purge => Arc::new(PurgeJob(service)),
            };
            self.scheduler
                .register(schedule.job_id(), schedule.every(), job)?;
        }
        Ok(())
    }

    /// Runs one operation to completion through the mediator.
    pub async fn run_once(
        &self,
        sender: &str,
        operation: ColleagueOperation,
    ) -> Result<RunReport, AppError> {
        let report = self
            .state
            .mediator
            .notify(sender, operation, Value::Null)
            .await?
            .ok_or_else(|| AppError::Validation(format!("{operation} is not configured")))?;
        serde_json::from_value(report).map_err(|e| AppError::Validation(e.to_string()))
    }

    /// Body of the admin `/run-state` endpoint.
    pub fn status(&self) -> impl Fn() -> Value + Send + Sync + 'static {
        let run_state = self.state.run_state.clone();
        move || {
            let flags: serde_json::Map<String, Value> = run_state
                .snapshot()
                .into_iter()
                .map(|(flag, running)| (flag.to_string(), Value::Bool(running)))
                .collect();
            Value::Object(flags)
        }
    }

    /// Serves the API and the admin endpoints until `shutdown` resolves, then
    /// stops the scheduler.
    pub async fn serve(
        self,
        config: &Config,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), StartupError> {
        self.start_schedules(config)?;

        let store = self.state.store.clone();
        let admin = shared::admin_service::AdminService::<_, _, std::io::Error>::new(
            move || store.is_ready(),
            self.status(),
        );
        let admin_listener = config.admin_listener.clone();
        let admin_task = tokio::spawn(async move {
            if let Err(e) =
                shared::http::run_http_service(&admin_listener.host, admin_listener.port, admin)
                    .await
            {
                tracing::error!(error = %e, "admin listener stopped");
            }
        });

        let served = api::serve(&config.listener, self.state.clone(), shutdown).await;

        admin_task.abort();
        self.scheduler.shutdown().await;
        served?;
        Ok(())
    }
}

fn register<S, R>(
    mediator: MediatorBuilder,
    services: &mut DomainServices,
    service: AggregationService<S, R>,
) -> Result<MediatorBuilder, MediatorError>
where
    S: PagedSource + 'static,
    S::Item: 'static,
    R: Record,
{
    let operations = service.operations();
    let service = Arc::new(service);
    services.insert(service.clone());
    let colleague: Arc<dyn Colleague> = service;
    mediator.keyed_all(operations, Provider::Singleton(colleague))
}
