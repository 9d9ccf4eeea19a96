//! DDI client: poll, deployment and cancel fetch, feedback reporting, identification.

use std::collections::BTreeMap;

use chrono::Utc;
use hawkbit_core::feedback::config_data_body;
use hawkbit_core::{
    resolve_cancel, resolve_deployment, resolve_poll, Cancel, CycleError, Deployment, Endpoint,
    Failure, FeedbackMessage, PollReply, ResolverError,
};
use tracing::{debug, info};

use crate::config::Config;
use crate::transport::{Transport, TransportError, TransportOptions};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unusable server reply: {0}")]
    Resolver(#[from] ResolverError),
    #[error("cannot encode request body: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ClientError {
    pub fn failure(&self) -> Failure {
        match self {
            ClientError::Transport(e) => e.failure(),
            ClientError::Resolver(_) | ClientError::Encode(_) => Failure::Skip,
        }
    }
}

impl From<ClientError> for CycleError {
    fn from(e: ClientError) -> Self {
        CycleError::new(e.failure(), e.to_string())
    }
}

pub struct DdiClient {
    transport: Transport,
    endpoint: Endpoint,
    prefer_https: bool,
}

impl DdiClient {
    pub fn new(transport: Transport, endpoint: Endpoint, prefer_https: bool) -> Self {
        Self {
            transport,
            endpoint,
            prefer_https,
        }
    }

    /// Client for `controller` using the configured server, token, TLS and timeouts.
    pub fn from_config(config: &Config, controller: &str) -> Result<Self, TransportError> {
        let c = &config.client;
        let transport = Transport::new(&TransportOptions {
            auth_token: c.auth_token.clone(),
            connect_timeout: config.connect_timeout(),
            timeout: config.timeout(),
            ssl_verify: c.ssl_verify,
        })?;
        let endpoint = Endpoint::new(&c.hawkbit_server, c.ssl, &c.tenant_id, controller);
        Ok(Self::new(transport, endpoint, c.ssl))
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn poll(&self) -> Result<PollReply, ClientError> {
        let body = self.transport.get(&self.endpoint.controller_url()).await?;
        let reply = resolve_poll(&body)?;
        debug!(action = ?reply.action, sleep = ?reply.sleep, "poll reply");
        Ok(reply)
    }

    pub async fn fetch_deployment(&self, url: &str) -> Result<Deployment, ClientError> {
        let body = self.transport.get(url).await?;
        Ok(resolve_deployment(&body, &self.endpoint, self.prefer_https)?)
    }

    pub async fn fetch_cancel(&self, url: &str) -> Result<Cancel, ClientError> {
        let body = self.transport.get(url).await?;
        Ok(resolve_cancel(&body, &self.endpoint)?)
    }

    /// Post one feedback message. No retry here.
    pub async fn send_feedback(&self, url: &str, msg: &FeedbackMessage) -> Result<(), ClientError> {
        let body = msg.to_body(Utc::now())?;
        self.transport.post(url, body).await?;
        debug!(
            action_id = %msg.action_id,
            execution = ?msg.execution,
            finished = ?msg.finished,
            "feedback sent"
        );
        Ok(())
    }

    /// Merge the device attributes into the server's target record.
    pub async fn identify(&self, attributes: &BTreeMap<String, String>) -> Result<(), ClientError> {
        let body = config_data_body(attributes, Utc::now())?;
        self.transport
            .put(&self.endpoint.config_data_url(), body)
            .await?;
        info!(
            controller = self.endpoint.controller(),
            attributes = attributes.len(),
            "device identified"
        );
        Ok(())
    }
}
