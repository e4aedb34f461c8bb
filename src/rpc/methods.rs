//! RPC method handlers.
//!
//! Dispatches JSON-RPC method calls to the orchestrator.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;

use crate::core::models::{JobStatus, NewJobRequest};
use crate::core::orchestrator::Orchestrator;
use crate::core::vpn::VpnSession;

use super::protocol::{Request, Response};

const DEFAULT_LIST_LIMIT: u32 = 50;

/// Handles RPC method dispatch and execution.
pub struct MethodHandler {
    orchestrator: Orchestrator,
    start_time: Instant,
}

#[derive(Deserialize)]
struct JobIdParams {
    id: String,
}

fn parse<T: DeserializeOwned>(id: &Value, params: Value) -> Result<T, Response> {
    serde_json::from_value(params).map_err(|e| Response::invalid_params(id.clone(), e.to_string()))
}

impl MethodHandler {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            start_time: Instant::now(),
        }
    }

    /// Handle an RPC request and return a response.
    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);

        let result = match request.method.as_str() {
            "daemon.status" => Ok(self.daemon_status(id.clone())),
            "jobs.create" => self.jobs_create(id.clone(), params).await,
            "jobs.get" => self.jobs_get(id.clone(), params).await,
            "jobs.history" => self.jobs_history(id.clone(), params).await,
            "jobs.list" => self.jobs_list(id.clone(), params).await,
            "jobs.cancel" => self.jobs_cancel(id.clone(), params).await,
            "jobs.finalize" => self.jobs_finalize(id.clone(), params).await,
            "vpn.session" => Ok(self.vpn_session(id.clone())),
            _ => Ok(Response::method_not_found(id, &request.method)),
        };

        result.unwrap_or_else(|response| response)
    }

    /// Get daemon status/health information.
    fn daemon_status(&self, id: Value) -> Response {
        let config = &self.orchestrator.ctx().config;

        #[derive(Serialize)]
        struct DaemonStatus {
            version: &'static str,
            uptime_secs: u64,
            active_jobs: usize,
            pending_correlations: usize,
            vpn: VpnSession,
            rpc_bind: String,
            http_bind: String,
            simulation: bool,
        }

        Response::success(
            id,
            DaemonStatus {
                version: env!("CARGO_PKG_VERSION"),
                uptime_secs: self.start_time.elapsed().as_secs(),
                active_jobs: self.orchestrator.active_jobs(),
                pending_correlations: self.orchestrator.pending_correlations(),
                vpn: self.orchestrator.vpn_session(),
                rpc_bind: config.rpc_bind.to_string(),
                http_bind: config.http_bind.to_string(),
                simulation: config.simulation,
            },
        )
    }

    async fn jobs_create(&self, id: Value, params: Value) -> Result<Response, Response> {
        let request: NewJobRequest = parse(&id, params)?;

        Ok(match self.orchestrator.create_job(request).await {
            Ok(created) => Response::success(id, created),
            Err(e) => Response::provision_error(id, &e),
        })
    }

    async fn jobs_get(&self, id: Value, params: Value) -> Result<Response, Response> {
        let params: JobIdParams = parse(&id, params)?;

        Ok(match self.orchestrator.job(&params.id).await {
            Ok(job) => Response::success(id, job),
            Err(e) => Response::provision_error(id, &e),
        })
    }

    /// Get a single job with its full status history.
    async fn jobs_history(&self, id: Value, params: Value) -> Result<Response, Response> {
        let params: JobIdParams = parse(&id, params)?;

        Ok(match self.orchestrator.job_history(&params.id).await {
            Ok(job) => Response::success(id, job),
            Err(e) => Response::provision_error(id, &e),
        })
    }

    /// List jobs with optional filtering and pagination.
    async fn jobs_list(&self, id: Value, params: Value) -> Result<Response, Response> {
        #[derive(Deserialize, Default)]
        struct Params {
            #[serde(default)]
            limit: Option<u32>,
            #[serde(default)]
            offset: Option<u32>,
            #[serde(default)]
            status: Option<JobStatus>,
        }

        let params: Params = match params {
            Value::Null => Params::default(),
            params => parse(&id, params)?,
        };

        let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT);
        let offset = params.offset.unwrap_or(0);

        Ok(
            match self.orchestrator.list_jobs(limit, offset, params.status).await {
                Ok(jobs) => Response::success(id, jobs),
                Err(e) => Response::provision_error(id, &e),
            },
        )
    }

    async fn jobs_cancel(&self, id: Value, params: Value) -> Result<Response, Response> {
        let params: JobIdParams = parse(&id, params)?;

        Ok(match self.orchestrator.cancel_job(&params.id).await {
            Ok(job) => Response::success(id, job),
            Err(e) => Response::provision_error(id, &e),
        })
    }

    async fn jobs_finalize(&self, id: Value, params: Value) -> Result<Response, Response> {
        let params: JobIdParams = parse(&id, params)?;

        Ok(match self.orchestrator.finalize_job(&params.id).await {
            Ok(job) => Response::success(id, job),
            Err(e) => Response::provision_error(id, &e),
        })
    }

    fn vpn_session(&self, id: Value) -> Response {
        Response::success(id, self.orchestrator.vpn_session())
    }
}
