//! Explicitly owned bridge session: one child process, one protocol client.
//!
//! Lifecycle is `Unstarted -> Running -> Stopped` and entirely caller driven.
//! A session is never restarted; after `stop()` (or a failed `start()`)
//! construct a new one.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::bridge::client::{ClientOptions, ProtocolClient};
use crate::bridge::transport::{LaunchSpec, Transport};
use crate::error::{BridgeError, Result};
use crate::schema::{self, CapabilityDescriptor, Invoke, ToolSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unstarted,
    Running,
    Stopped,
}

enum Phase {
    Unstarted,
    Running(Arc<ProtocolClient>),
    Stopped,
}

pub struct Session {
    launch: LaunchSpec,
    options: ClientOptions,
    phase: Phase,
}

impl Session {
    pub fn new(launch: LaunchSpec, options: ClientOptions) -> Self {
        Self {
            launch,
            options,
            phase: Phase::Unstarted,
        }
    }

    pub fn state(&self) -> SessionState {
        match self.phase {
            Phase::Unstarted => SessionState::Unstarted,
            Phase::Running(_) => SessionState::Running,
            Phase::Stopped => SessionState::Stopped,
        }
    }

    /// Spawn the child and perform the handshake.
    ///
    /// Returns the child's capability summary. Any failure leaves the session
    /// `Stopped` with the child terminated.
    pub async fn start(&mut self) -> Result<Value> {
        if !matches!(self.phase, Phase::Unstarted) {
            return Err(BridgeError::State(format!(
                "session cannot start from state {:?}",
                self.state()
            )));
        }

        let transport = match Transport::start(&self.launch) {
            Ok(transport) => transport,
            Err(e) => {
                self.phase = Phase::Stopped;
                return Err(e);
            }
        };

        let client = Arc::new(ProtocolClient::new(transport, self.options.clone()));
        match client.initialize().await {
            Ok(summary) => {
                tracing::info!(command = %self.launch.display(), "session running");
                self.phase = Phase::Running(client);
                Ok(summary)
            }
            Err(e) => {
                tracing::warn!(error = %e, "handshake failed, stopping tool server");
                client.stop().await;
                self.phase = Phase::Stopped;
                Err(e)
            }
        }
    }

    /// The running client. Fails with `State` outside `Running`.
    pub fn client(&self) -> Result<&Arc<ProtocolClient>> {
        match &self.phase {
            Phase::Running(client) => Ok(client),
            _ => Err(BridgeError::State(format!(
                "session is {:?}, not running",
                self.state()
            ))),
        }
    }

    /// Whether the session is running and its channel is still open.
    pub fn is_healthy(&self) -> bool {
        self.client().is_ok_and(|client| client.is_connected())
    }

    pub async fn list_capabilities(&self) -> Result<Vec<CapabilityDescriptor>> {
        self.client()?.list_capabilities().await
    }

    pub async fn invoke(&self, name: &str, arguments: Map<String, Value>) -> Result<String> {
        let result = self.client()?.invoke(name, arguments).await;
        if let Err(e) = &result {
            if e.poisons_session() {
                tracing::warn!(tool = name, error = %e, "tool server channel lost, session unusable");
            }
        }
        result
    }

    /// Discover capabilities and bind them to this session's client.
    pub async fn tools(&self) -> Result<ToolSet> {
        let client = Arc::clone(self.client()?);
        let descriptors = client.list_capabilities().await?;
        let invoker: Arc<dyn Invoke> = client;
        Ok(schema::translate(descriptors, invoker))
    }

    /// Stop the child. Safe to call in any state, any number of times.
    pub async fn stop(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Stopped) {
            Phase::Running(client) => client.stop().await,
            Phase::Unstarted => tracing::debug!("stopping a session that never started"),
            Phase::Stopped => {}
        }
    }
}
