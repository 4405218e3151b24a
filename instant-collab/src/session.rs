//! Buffer-name → session registry.
//!
//! One [`SyncClient`] per shared buffer. The manager is owned by whoever
//! drives the editor integration; nothing here is global.

use std::collections::HashMap;

use crate::client::{SessionConfig, SessionError, SyncClient};

/// Owns the running sessions, keyed by buffer name.
#[derive(Default)]
pub struct SessionManager {
    sessions: HashMap<String, SyncClient>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a new session for `config.buffer_name`.
    pub async fn start(
        &mut self,
        config: SessionConfig,
        text: &str,
    ) -> Result<&mut SyncClient, SessionError> {
        let name = config.buffer_name.clone();
        if self.sessions.contains_key(&name) {
            return Err(SessionError::State(format!("{name} is already shared")));
        }
        let client = SyncClient::connect(config, text).await?;
        log::info!("Session started for {name}");
        Ok(self.sessions.entry(name).or_insert(client))
    }

    pub fn get(&self, buffer_name: &str) -> Option<&SyncClient> {
        self.sessions.get(buffer_name)
    }

    pub fn get_mut(&mut self, buffer_name: &str) -> Option<&mut SyncClient> {
        self.sessions.get_mut(buffer_name)
    }

    pub fn contains(&self, buffer_name: &str) -> bool {
        self.sessions.contains_key(buffer_name)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sorted buffer names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sessions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Drop sessions whose task has already ended.
    pub fn prune(&mut self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|name, client| {
            let alive = !client.is_finished();
            if !alive {
                log::debug!("Pruning ended session {name}");
            }
            alive
        });
        before - self.sessions.len()
    }

    /// Close one session. Returns `Ok(false)` if there was none.
    pub async fn stop(&mut self, buffer_name: &str) -> Result<bool, SessionError> {
        match self.sessions.remove(buffer_name) {
            Some(client) => {
                client.close().await?;
                log::info!("Session stopped for {buffer_name}");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close every session, reporting the first failure.
    pub async fn stop_all(&mut self) -> Result<(), SessionError> {
        let mut first_error = None;
        for (name, client) in self.sessions.drain() {
            if let Err(e) = client.close().await {
                log::warn!("Session {name} ended with error: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
