//! Named store connections
//!
//! A [`Registry`] maps aliases to [`Client`]s. Aliases are unique, and two
//! configs may not point at the same server-side database (host, port, db):
//! their key namespaces would silently collide.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use keylatch_lock::{Lock, LockError, LockOptions, Locker};
use keylatch_queue::{DelayQueue, DelayQueueConfig};
use keylatch_store::{ConfigError, CoordStore, MemoryStore, StoreConfig};
use tracing::info;

#[cfg(feature = "redis")]
use keylatch_store::{RedisStore, StoreError};

/// One store connection and the primitives built on it
#[derive(Debug, Clone)]
pub struct Client {
    alias: String,
    store: Arc<dyn CoordStore>,
}

impl Client {
    pub fn new(alias: impl Into<String>, store: Arc<dyn CoordStore>) -> Self {
        Self {
            alias: alias.into(),
            store,
        }
    }

    /// A client over a fresh in-process store.
    pub fn in_memory(alias: impl Into<String>) -> Self {
        Self::new(alias, Arc::new(MemoryStore::new()))
    }

    /// Connect to the Redis server described by `config`.
    #[cfg(feature = "redis")]
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let store = RedisStore::connect(config).await?;
        Ok(Self::new(config.alias.clone(), Arc::new(store)))
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn store(&self) -> Arc<dyn CoordStore> {
        self.store.clone()
    }

    pub async fn is_healthy(&self) -> bool {
        self.store.is_healthy().await
    }

    pub fn locker(&self) -> Locker {
        Locker::new(self.store.clone())
    }

    /// Shorthand for `self.locker().acquire(..)`.
    pub async fn acquire_lock(
        &self,
        key: impl Into<String>,
        lease: Duration,
        options: LockOptions,
    ) -> Result<Lock, LockError> {
        self.locker().acquire(key, lease, options).await
    }

    /// Start a delay queue on this connection.
    pub fn delay_queue(&self, config: DelayQueueConfig) -> DelayQueue {
        DelayQueue::new(self.store.clone(), config)
    }
}

/// Alias → client map
#[derive(Debug, Default)]
pub struct Registry {
    clients: HashMap<String, Client>,
    /// endpoint key → alias
    endpoints: HashMap<String, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a set of configs for duplicate aliases and shared endpoints
    /// without connecting.
    pub fn check(configs: &[StoreConfig]) -> Result<(), ConfigError> {
        let mut scratch = Self::new();
        for config in configs {
            config.validate()?;
            scratch.reserve(&config.alias, Some(config.endpoint_key()?))?;
        }
        Ok(())
    }

    /// Connect every config. Nothing is connected if the set is inconsistent.
    #[cfg(feature = "redis")]
    pub async fn connect(configs: &[StoreConfig]) -> Result<Self, StoreError> {
        Self::check(configs)?;
        let mut registry = Self::new();
        for config in configs {
            let client = Client::connect(config).await?;
            registry.insert_client(client, Some(config.endpoint_key()?))?;
        }
        Ok(registry)
    }

    /// Register a client that has no endpoint identity (e.g. in-memory).
    pub fn insert(&mut self, client: Client) -> Result<(), ConfigError> {
        self.insert_client(client, None)
    }

    /// Register a client created from `config`.
    pub fn insert_configured(&mut self, client: Client, config: &StoreConfig) -> Result<(), ConfigError> {
        self.insert_client(client, Some(config.endpoint_key()?))
    }

    fn insert_client(&mut self, client: Client, endpoint: Option<String>) -> Result<(), ConfigError> {
        self.reserve(client.alias(), endpoint)?;
        info!(alias = %client.alias(), store = client.store.name(), "store client registered");
        self.clients.insert(client.alias().to_string(), client);
        Ok(())
    }

    fn reserve(&mut self, alias: &str, endpoint: Option<String>) -> Result<(), ConfigError> {
        if self.clients.contains_key(alias) || self.endpoints.values().any(|a| a == alias) {
            return Err(ConfigError::Conflict(format!("alias {alias:?} already registered")));
        }
        if let Some(endpoint) = endpoint {
            if let Some(existing) = self.endpoints.get(&endpoint) {
                return Err(ConfigError::Conflict(format!(
                    "alias {alias:?} uses endpoint {endpoint} already registered as {existing:?}"
                )));
            }
            self.endpoints.insert(endpoint, alias.to_string());
        }
        Ok(())
    }

    pub fn get(&self, alias: &str) -> Option<&Client> {
        self.clients.get(alias)
    }

    /// The client registered under the empty alias.
    pub fn default_client(&self) -> Option<&Client> {
        self.get("")
    }

    pub fn aliases(&self) -> Vec<&str> {
        let mut aliases: Vec<&str> = self.clients.keys().map(String::as_str).collect();
        aliases.sort_unstable();
        aliases
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
