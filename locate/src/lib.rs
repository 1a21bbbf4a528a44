pub mod api;
pub mod assembler;
pub mod config;
pub mod load;
pub mod metrics_defs;
pub mod priority;
pub mod scheduler;
pub mod selection;
pub mod token;

#[cfg(test)]
mod testutils;

use assembler::QueryAssembler;
use config::{Config, ValidationError};
use load::LoadMonitor;
use rate_table::RateTable;
use scheduler::Scheduler;
use selection::{Selector, TargetBuilder};
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;
use token::{TokenError, TokenSigner};

pub use priority::{PriorityClass, classify};
pub use scheduler::{LoadSignal, NextRequest, Schedule};

#[derive(thiserror::Error, Debug)]
pub enum LocateError {
    #[error("invalid config: {0}")]
    Validation(#[from] ValidationError),
    #[error("token signer: {0}")]
    Token(#[from] TokenError),
    #[error("query API: {0}")]
    Api(#[from] api::LocateApiError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn build_assembler(config: &Config, table: RateTable) -> Result<QueryAssembler, LocateError> {
    config.validate()?;
    let signer = TokenSigner::new(config.token_secret.as_bytes())?;
    let scheduler = Scheduler::new(config.scheduler.clone(), signer, config.base_url.clone());

    Ok(QueryAssembler::new(
        table,
        scheduler,
        Selector::new(&config.selection),
        TargetBuilder::new(config.services.clone()),
        LoadMonitor::new(&config.load),
        config.api_keys.iter().cloned(),
    ))
}

/// Serves the query API and the admin endpoints until either fails.
pub async fn run<F>(config: Config, table: RateTable, is_ready: F) -> Result<(), LocateError>
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let assembler = Arc::new(build_assembler(&config, table)?);

    let listener = config.listener.clone();
    let api_task = async move {
        api::serve(listener, assembler)
            .await
            .map_err(LocateError::from)
    };
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        AdminService::<F, LocateError>::new(is_ready),
    );

    tokio::try_join!(api_task, admin_task)?;
    Ok(())
}
