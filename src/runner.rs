//! Step runner: one logical API call from configuration to envelope.
//!
//! Composes the resolver, dispatcher, status interpreter, and (for HTTP
//! steps with a pagination config) the pagination controller. Errors
//! come out typed and credential-masked, ready for the healing agent.

use std::collections::HashMap;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::endpoint::{Endpoint, RequestOptions, ResponseEnvelope};
use crate::error::Result;
use crate::pagination::{check_status, PaginationRun};
use crate::resolver::{build_scope, Resolver};
use crate::sandbox::Sandbox;
use crate::transport::{Dispatcher, TransportKind};

/// Executes single steps.
///
/// Cheap to share: the expensive parts (HTTP clients, pool registry)
/// live in the dispatcher, which can be shared across runners.
pub struct StepRunner {
    resolver: Resolver,
    dispatcher: Dispatcher,
    sandbox: Sandbox,
}

impl StepRunner {
    pub fn new() -> Self {
        Self::with_dispatcher(Dispatcher::new())
    }

    pub fn with_dispatcher(dispatcher: Dispatcher) -> Self {
        let sandbox = Sandbox::new();
        Self {
            resolver: Resolver::new(sandbox.clone()),
            dispatcher,
            sandbox,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Execute one step to completion.
    ///
    /// HTTP steps with a pagination config iterate through the
    /// pagination controller; everything else is single-shot. Both
    /// paths interpret status the same way.
    #[instrument(skip_all, fields(url = %endpoint.url_host))]
    pub async fn run_step(
        &self,
        endpoint: &Endpoint,
        payload: &Value,
        credentials: &HashMap<String, String>,
        options: &RequestOptions,
        current_item: Option<&Value>,
        cancel: &CancellationToken,
    ) -> Result<ResponseEnvelope> {
        let transport = TransportKind::for_url(&endpoint.url_host);
        let paginated = endpoint.pagination.is_some() && transport.supports_pagination();
        debug!(?transport, paginated, "running step");

        if paginated {
            return PaginationRun {
                endpoint,
                payload,
                credentials,
                current_item,
                options,
                resolver: &self.resolver,
                dispatcher: &self.dispatcher,
                sandbox: &self.sandbox,
                cancel,
            }
            .run()
            .await;
        }

        let scope = build_scope(payload, credentials, None, current_item);
        let resolved = self
            .resolver
            .resolve_endpoint(endpoint, &scope, credentials)
            .await?;
        let outcome = self.dispatcher.dispatch(&resolved, options, cancel).await?;
        check_status(&outcome, endpoint, credentials)?;
        Ok(outcome.envelope)
    }
}

impl Default for StepRunner {
    fn default() -> Self {
        Self::new()
    }
}
