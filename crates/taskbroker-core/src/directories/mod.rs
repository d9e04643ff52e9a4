//! Typed ports for the three collaborator systems the broker consults but
//! does not own: the persona directory (who can do what), the device
//! directory (where an agent process currently lives), and the
//! agent-runtime (whether an agent is currently reachable). Each is kept
//! out of scope beyond its interface; the HTTP clients here are thin.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub agent_slug: String,
    pub capabilities: Vec<String>,
    pub active: bool,
}

#[async_trait]
pub trait PersonaDirectory: Send + Sync {
    async fn list_personas(&self) -> Result<Vec<Persona>>;
    async fn get_persona(&self, agent_slug: &str) -> Result<Option<Persona>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub agent_slug: String,
    pub device_id: String,
    pub last_seen_online: bool,
}

#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn device_for_agent(&self, agent_slug: &str) -> Result<Option<DeviceRecord>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub agent_slug: String,
    pub reachable: bool,
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn status(&self, agent_slug: &str) -> Result<RuntimeStatus>;
}

const _: () = {
    fn assert_persona_directory_object_safe(_: &dyn PersonaDirectory) {}
    fn assert_device_directory_object_safe(_: &dyn DeviceDirectory) {}
    fn assert_agent_runtime_object_safe(_: &dyn AgentRuntime) {}
};

/// Production persona-directory client over HTTP.
pub struct HttpPersonaDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPersonaDirectory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl PersonaDirectory for HttpPersonaDirectory {
    async fn list_personas(&self) -> Result<Vec<Persona>> {
        self.client
            .get(format!("{}/personas", self.base_url))
            .send()
            .await
            .context("failed to reach persona directory")?
            .error_for_status()
            .context("persona directory returned an error status")?
            .json()
            .await
            .context("failed to parse persona directory response")
    }

    async fn get_persona(&self, agent_slug: &str) -> Result<Option<Persona>> {
        let response = self
            .client
            .get(format!("{}/personas/{agent_slug}", self.base_url))
            .send()
            .await
            .context("failed to reach persona directory")?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(
            response
                .error_for_status()
                .context("persona directory returned an error status")?
                .json()
                .await
                .context("failed to parse persona directory response")?,
        ))
    }
}

/// Production device-directory client over HTTP.
pub struct HttpDeviceDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDeviceDirectory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl DeviceDirectory for HttpDeviceDirectory {
    async fn device_for_agent(&self, agent_slug: &str) -> Result<Option<DeviceRecord>> {
        let response = self
            .client
            .get(format!("{}/devices/{agent_slug}", self.base_url))
            .send()
            .await
            .context("failed to reach device directory")?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(
            response
                .error_for_status()
                .context("device directory returned an error status")?
                .json()
                .await
                .context("failed to parse device directory response")?,
        ))
    }
}

/// Production agent-runtime client over HTTP.
pub struct HttpAgentRuntime {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAgentRuntime {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl AgentRuntime for HttpAgentRuntime {
    async fn status(&self, agent_slug: &str) -> Result<RuntimeStatus> {
        let reachable = self
            .client
            .get(format!("{}/runtime/{agent_slug}/ping", self.base_url))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false);
        Ok(RuntimeStatus {
            agent_slug: agent_slug.to_owned(),
            reachable,
        })
    }
}

pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryPersonaDirectory {
        personas: Mutex<HashMap<String, Persona>>,
    }

    impl InMemoryPersonaDirectory {
        pub fn with_persona(self, persona: Persona) -> Self {
            self.personas
                .lock()
                .unwrap()
                .insert(persona.agent_slug.clone(), persona);
            self
        }
    }

    #[async_trait]
    impl PersonaDirectory for InMemoryPersonaDirectory {
        async fn list_personas(&self) -> Result<Vec<Persona>> {
            Ok(self.personas.lock().unwrap().values().cloned().collect())
        }

        async fn get_persona(&self, agent_slug: &str) -> Result<Option<Persona>> {
            Ok(self.personas.lock().unwrap().get(agent_slug).cloned())
        }
    }
}
