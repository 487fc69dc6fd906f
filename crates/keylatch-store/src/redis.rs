//! Redis / KeyDB backend
//!
//! Builds a [`fred::clients::Pool`] from a [`StoreConfig`] and runs every
//! multi-step operation as a Lua script so it executes atomically on the
//! server.

use async_trait::async_trait;
use fred::clients::Pool;
use fred::interfaces::{ClientLike, KeysInterface, ListInterface, LuaInterface, SetsInterface};
use fred::types::config::{Config as FredConfig, ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::{Builder, Expiration, SetOptions};
use std::time::Duration;
use tracing::{debug, info};

use crate::backend::{CoordStore, ScheduleEntry, StoreError, SweepKeys, UnscheduleEntry};
use crate::config::StoreConfig;
use crate::scripts;

impl From<fred::error::Error> for StoreError {
    fn from(e: fred::error::Error) -> Self {
        StoreError::Command(e.to_string())
    }
}

fn script_error(e: fred::error::Error) -> StoreError {
    StoreError::Script(e.to_string())
}

fn millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

/// Redis-backed coordination store
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

impl RedisStore {
    /// Wrap an already initialised pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create a connection pool from `config`, connect, and verify it with a PING.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let (host, port) = config.host_port()?;

        let mut fred_config = FredConfig {
            server: ServerConfig::new_centralized(host, port),
            database: Some(config.db),
            username: config.username.clone(),
            password: config.password.clone(),
            ..FredConfig::default()
        };

        if config.tls {
            let connector = TlsConnector::default_rustls()
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            fred_config.tls = Some(connector.into());
        }

        let mut builder = Builder::from_config(fred_config);

        // Exponential reconnect: initial 0ms, base 100ms, max 30s, factor 2.
        builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));
        if let Some(secs) = config.connect_timeout_secs {
            builder.with_connection_config(|c| {
                c.connection_timeout = Duration::from_secs(secs);
            });
        }

        let pool = builder
            .build_pool(config.pool_size)
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        pool.init()
            .await
            .map_err(|e| StoreError::Connection(format!("failed to connect: {e}")))?;

        let _: String = pool
            .ping(None)
            .await
            .map_err(|e| StoreError::Connection(format!("PING failed after connect: {e}")))?;

        info!(
            host = host,
            port = port,
            db = config.db,
            tls = config.tls,
            pool_size = config.pool_size,
            "Redis pool created and verified"
        );

        Ok(Self::new(pool))
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl CoordStore for RedisStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn is_healthy(&self) -> bool {
        self.pool.ping::<String>(None).await.is_ok()
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let result: Option<String> = self
            .pool
            .set(
                key,
                value,
                Some(Expiration::PX(millis(ttl))),
                Some(SetOptions::NX),
                false,
            )
            .await?;
        // Nil reply: the key already exists.
        Ok(result.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let deleted: i64 = self
            .pool
            .eval(scripts::LOCK_RELEASE, vec![key.to_string()], vec![expected.to_string()])
            .await
            .map_err(script_error)?;
        Ok(deleted == 1)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let refreshed: i64 = self
            .pool
            .eval(
                scripts::LOCK_REFRESH,
                vec![key.to_string()],
                vec![expected.to_string(), millis(ttl).to_string()],
            )
            .await
            .map_err(script_error)?;
        Ok(refreshed == 1)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let values: Vec<Option<String>> = self.pool.mget(keys.to_vec()).await?;
        Ok(values)
    }

    async fn random_members(&self, key: &str, count: usize) -> Result<Vec<String>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let members: Vec<String> = self.pool.srandmember(key, Some(count)).await?;
        Ok(members)
    }

    async fn pop_ready(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError> {
        // BRPOP replies nil on timeout, which converts to an empty vec.
        let popped: Vec<String> = self
            .pool
            .brpop(keys.to_vec(), timeout.as_secs_f64())
            .await?;
        match popped.as_slice() {
            [] => Ok(None),
            [list, member] => Ok(Some((list.clone(), member.clone()))),
            other => Err(StoreError::Decode(format!(
                "unexpected BRPOP reply with {} elements",
                other.len()
            ))),
        }
    }

    async fn schedule(&self, entries: &[ScheduleEntry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut keys = Vec::with_capacity(entries.len() * 2);
        let mut args = Vec::with_capacity(entries.len() * 3);
        for entry in entries {
            keys.push(entry.pool_key.clone());
            keys.push(entry.index_key.clone());
            args.push(entry.record.clone());
            args.push(entry.score.to_string());
            args.push(entry.pool_key.clone());
        }
        let _: i64 = self
            .pool
            .eval(scripts::SCHEDULE_JOBS, keys, args)
            .await
            .map_err(script_error)?;
        Ok(())
    }

    async fn unschedule(&self, entries: &[UnscheduleEntry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut keys = Vec::with_capacity(entries.len() * 2);
        let mut args = Vec::with_capacity(entries.len());
        for entry in entries {
            keys.push(entry.index_key.clone());
            keys.push(entry.dead_key.clone());
            args.push(entry.pool_key.clone());
        }
        let _: i64 = self
            .pool
            .eval(scripts::UNSCHEDULE_JOBS, keys, args)
            .await
            .map_err(script_error)?;
        Ok(())
    }

    async fn promote_due(&self, keys: &SweepKeys, now: i64) -> Result<usize, StoreError> {
        let handled: i64 = self
            .pool
            .eval(
                scripts::PROMOTE_DUE,
                vec![keys.index_key.clone(), keys.ready_key.clone(), keys.dead_key.clone()],
                vec![now.to_string()],
            )
            .await
            .map_err(script_error)?;
        debug!(index = %keys.index_key, handled, "promotion sweep");
        Ok(usize::try_from(handled).unwrap_or(0))
    }
}
