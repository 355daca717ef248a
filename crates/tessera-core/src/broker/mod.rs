//! Broker client
//!
//! A thin, reconnecting connection to the shared queue substrate. One
//! [`BrokerClient`] owns its connections; components never share them and
//! instead register as [`ConnectionObserver`]s for lifecycle events.
//!
//! Reconnects follow a capped linear backoff (`min(attempt * 50ms, cap)`)
//! and abandon the connection with `E_COM_RETRY_ATTEMPTS_EXCEEDED` when a
//! configured attempt cap is passed. A `READONLY` reply from the server (a
//! replica answering after failover) forces an immediate reconnect.

mod observer;

pub use observer::{ConnectionObserver, ObserverSet};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{Client, RedisError};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BrokerSettings;
use crate::error::{ExchangeError, ExchangeResult};
use crate::retry::ReconnectPolicy;

/// One command in a transactional batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerCommand {
    /// Command name, e.g. `SET`.
    pub name: String,
    /// Positional arguments.
    pub args: Vec<String>,
}

impl BrokerCommand {
    /// Start a command with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Server identity and capabilities fetched at connection time.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    /// Reported server version.
    pub version: String,
    /// Names of loaded server modules.
    pub modules: Vec<String>,
}

impl ServerInfo {
    /// Whether the server advertises a JSON document module.
    pub fn supports_json(&self) -> bool {
        self.modules
            .iter()
            .any(|m| m == "ReJSON" || m == "ReJSON2")
    }

    /// Whether the server version supports per-field hash expiry.
    pub fn supports_hash_field_expiry(&self) -> bool {
        let mut parts = self.version.split('.');
        let major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        major > 7 || (major == 7 && minor >= 4)
    }

    fn parse_info_section(raw: &str) -> String {
        raw.lines()
            .find_map(|line| line.strip_prefix("redis_version:"))
            .map(|v| v.trim().to_string())
            .unwrap_or_default()
    }

    fn parse_module_names(value: &redis::Value) -> Vec<String> {
        let mut names = Vec::new();
        collect_module_names(value, &mut names);
        names
    }
}

/// Walk a MODULE LIST reply collecting the value following each `name` key.
fn collect_module_names(value: &redis::Value, names: &mut Vec<String>) {
    match value {
        redis::Value::Array(items) | redis::Value::Set(items) => {
            let mut i = 0;
            while i < items.len() {
                if as_text(&items[i]).as_deref() == Some("name") {
                    if let Some(name) = items.get(i + 1).and_then(as_text) {
                        names.push(name);
                        i += 2;
                        continue;
                    }
                }
                collect_module_names(&items[i], names);
                i += 1;
            }
        }
        redis::Value::Map(entries) => {
            for (key, val) in entries {
                if as_text(key).as_deref() == Some("name") {
                    if let Some(name) = as_text(val) {
                        names.push(name);
                    }
                } else {
                    collect_module_names(val, names);
                }
            }
        }
        _ => {}
    }
}

fn as_text(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
        redis::Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

fn is_readonly_error(err: &RedisError) -> bool {
    err.kind() == redis::ErrorKind::ReadOnly || err.code() == Some("READONLY")
}

/// Capability of consuming pub/sub traffic from a channel.
#[async_trait]
pub trait ChannelSubscriber: Send + Sync {
    /// Handle one published payload.
    async fn on_channel_message(&self, channel: &str, payload: String);
}

/// A reconnecting client for the shared queue substrate.
pub struct BrokerClient {
    settings: BrokerSettings,
    identifier: String,
    reconnect_policy: ReconnectPolicy,
    client: parking_lot::RwLock<Option<Client>>,
    manager: Arc<parking_lot::RwLock<Option<ConnectionManager>>>,
    blocking: tokio::sync::Mutex<Option<MultiplexedConnection>>,
    subscriptions: parking_lot::Mutex<HashMap<String, JoinHandle<()>>>,
    observers: ObserverSet<dyn ConnectionObserver>,
    server_info: parking_lot::RwLock<ServerInfo>,
    ready: AtomicBool,
    shutdown: CancellationToken,
    supervisor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl BrokerClient {
    /// Create a client for the given settings. Nothing connects until
    /// [`initialize`](Self::initialize).
    pub fn new(settings: BrokerSettings) -> Arc<Self> {
        let identifier = format!(
            "broker://{}:{}/{}#{}",
            settings.host,
            settings.port,
            settings.db,
            &Uuid::new_v4().to_string()[..8]
        );
        let reconnect_policy =
            ReconnectPolicy::new(settings.retry_max_interval(), settings.retry_max_attempts);
        Arc::new(Self {
            settings,
            identifier,
            reconnect_policy,
            client: parking_lot::RwLock::new(None),
            manager: Arc::new(parking_lot::RwLock::new(None)),
            blocking: tokio::sync::Mutex::new(None),
            subscriptions: parking_lot::Mutex::new(HashMap::new()),
            observers: ObserverSet::new(),
            server_info: parking_lot::RwLock::new(ServerInfo::default()),
            ready: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            supervisor: parking_lot::Mutex::new(None),
        })
    }

    /// Opaque identity of this client's connection.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Whether the connection is currently usable.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Whether the server advertises JSON document commands.
    pub fn is_json_supported(&self) -> bool {
        self.server_info.read().supports_json()
    }

    /// Server identity fetched during initialization.
    pub fn server_info(&self) -> ServerInfo {
        self.server_info.read().clone()
    }

    /// Register a lifecycle observer.
    pub fn add_connection_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.observers.add(observer);
    }

    /// Open the connection, resolve once the server answers, and fetch its
    /// identity and module list.
    pub async fn initialize(self: &Arc<Self>) -> ExchangeResult<()> {
        let url = self.settings.connection_url();
        let client = Client::open(url.as_str())
            .map_err(|e| ExchangeError::general("invalid broker address").with_source(e))?;
        *self.client.write() = Some(client);

        self.reconnect(&self.shutdown).await?;
        self.fetch_server_info().await;

        self.ready.store(true, Ordering::Release);
        self.notify_recovered();
        self.spawn_supervisor();
        info!(identifier = %self.identifier, "broker connection established");
        Ok(())
    }

    /// Run a transactional batch; the raw per-command replies come back in
    /// order.
    pub async fn execute_commands(
        &self,
        commands: &[BrokerCommand],
    ) -> ExchangeResult<Vec<redis::Value>> {
        let mut conn = self.connection()?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in commands {
            let cmd = pipe.cmd(&command.name);
            for arg in &command.args {
                cmd.arg(arg);
            }
        }
        let results: Vec<redis::Value> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_error(e))?;
        Ok(results)
    }

    /// Escape hatch for commands without a dedicated wrapper. The first
    /// element is the command name.
    pub async fn call_command(&self, args: &[String]) -> ExchangeResult<redis::Value> {
        let (name, rest) = args
            .split_first()
            .ok_or_else(|| ExchangeError::general("empty broker command"))?;
        let mut conn = self.connection()?;
        let mut cmd = redis::cmd(name);
        for arg in rest {
            cmd.arg(arg);
        }
        cmd.query_async(&mut conn)
            .await
            .map_err(|e| self.command_error(e))
    }

    /// Run a command that reserves a connection until the server replies.
    ///
    /// Used for blocking list pops. The dedicated connection is created
    /// lazily and recreated after any failure.
    pub async fn blocking_command(
        &self,
        name: &str,
        args: &[String],
    ) -> ExchangeResult<redis::Value> {
        let mut guard = self.blocking.lock().await;
        if guard.is_none() {
            let client = self
                .client
                .read()
                .clone()
                .ok_or_else(|| ExchangeError::general("broker client not initialized"))?;
            let conn = client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| {
                    ExchangeError::general("cannot open blocking connection").with_source(e)
                })?;
            *guard = Some(conn);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(ExchangeError::general("blocking connection unavailable"));
        };

        let mut cmd = redis::cmd(name);
        for arg in args {
            cmd.arg(arg);
        }
        match cmd.query_async(conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                // A broken blocking connection is discarded and rebuilt on
                // the next call.
                *guard = None;
                Err(self.command_error(e))
            }
        }
    }

    /// Publish a payload to a channel, returning the receiver count.
    pub async fn publish_command(&self, channel: &str, payload: &str) -> ExchangeResult<u64> {
        let mut conn = self.connection()?;
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_error(e))
    }

    /// Subscribe a handler to a channel. At most one handler per channel is
    /// allowed on a client.
    pub async fn subscribe_command(
        &self,
        channel: &str,
        subscriber: Arc<dyn ChannelSubscriber>,
    ) -> ExchangeResult<()> {
        if self.subscriptions.lock().contains_key(channel) {
            return Err(ExchangeError::general(format!(
                "channel {} already has a subscriber",
                channel
            )));
        }
        let client = self
            .client
            .read()
            .clone()
            .ok_or_else(|| ExchangeError::general("broker client not initialized"))?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| ExchangeError::general("cannot open pub/sub connection").with_source(e))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| self.command_error(e))?;

        let token = self.shutdown.child_token();
        let name = channel.to_string();
        let task = tokio::spawn(async move {
            let mut stream = Box::pin(pubsub.into_on_message());
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = stream.next() => match next {
                        Some(msg) => {
                            let payload: String = msg.get_payload().unwrap_or_default();
                            subscriber.on_channel_message(&name, payload).await;
                        }
                        None => break,
                    },
                }
            }
        });
        self.subscriptions.lock().insert(channel.to_string(), task);
        Ok(())
    }

    /// Drop the handler subscribed to a channel, if any.
    pub fn unsubscribe_command(&self, channel: &str) {
        if let Some(task) = self.subscriptions.lock().remove(channel) {
            task.abort();
        }
    }

    /// Tear the client down. Attempts a graceful quit and falls back to a
    /// hard disconnect once `timeout` passes. Never fails.
    pub async fn shut_down(&self, timeout: Duration) {
        self.ready.store(false, Ordering::Release);
        self.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = {
            let mut subs = self.subscriptions.lock();
            subs.drain().map(|(_, task)| task).collect()
        };
        for task in tasks {
            task.abort();
        }
        let supervisor = self.supervisor.lock().take();

        let graceful = async {
            if let Some(task) = supervisor {
                let _ = task.await;
            }
            if let Ok(mut conn) = self.connection() {
                let _: Result<redis::Value, _> = redis::cmd("QUIT").query_async(&mut conn).await;
            }
        };
        if tokio::time::timeout(timeout, graceful).await.is_err() {
            warn!(identifier = %self.identifier, "graceful broker quit timed out, disconnecting");
        }

        *self.manager.write() = None;
        *self.blocking.lock().await = None;
        info!(identifier = %self.identifier, "broker connection closed");
    }

    // -- typed command helpers used by the caches ---------------------------

    /// SET with an optional TTL.
    pub async fn set_value(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> ExchangeResult<()> {
        let mut conn = self.connection()?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        let _: () = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_error(e))?;
        Ok(())
    }

    /// GET.
    pub async fn get_value(&self, key: &str) -> ExchangeResult<Option<String>> {
        let mut conn = self.connection()?;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_error(e))
    }

    /// Atomic GET followed by DEL of the same key.
    pub async fn get_and_delete(&self, key: &str) -> ExchangeResult<Option<String>> {
        let results = self
            .execute_commands(&[
                BrokerCommand::new("GET").arg(key),
                BrokerCommand::new("DEL").arg(key),
            ])
            .await?;
        let value = results
            .first()
            .map(|v| redis::from_redis_value::<Option<String>>(v))
            .transpose()
            .map_err(|e| self.command_error(e))?
            .flatten();
        Ok(value)
    }

    /// DEL; true when the key existed.
    pub async fn delete_value(&self, key: &str) -> ExchangeResult<bool> {
        let mut conn = self.connection()?;
        let removed: u64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_error(e))?;
        Ok(removed > 0)
    }

    /// EXPIRE; true when the key existed.
    pub async fn expire_value(&self, key: &str, ttl: Duration) -> ExchangeResult<bool> {
        let mut conn = self.connection()?;
        let set: u64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_error(e))?;
        Ok(set > 0)
    }

    /// HEXPIRE on a single hash field; true when the field existed.
    pub async fn expire_hash_field(
        &self,
        key: &str,
        field: &str,
        ttl: Duration,
    ) -> ExchangeResult<bool> {
        let mut conn = self.connection()?;
        let set: Vec<i64> = redis::cmd("HEXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .arg("FIELDS")
            .arg(1)
            .arg(field)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_error(e))?;
        Ok(set.first().is_some_and(|v| *v > 0))
    }

    /// SADD; number of members actually added.
    pub async fn add_set_members(&self, key: &str, members: &[String]) -> ExchangeResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection()?;
        let mut cmd = redis::cmd("SADD");
        cmd.arg(key);
        for member in members {
            cmd.arg(member);
        }
        cmd.query_async(&mut conn)
            .await
            .map_err(|e| self.command_error(e))
    }

    /// SISMEMBER.
    pub async fn is_set_member(&self, key: &str, member: &str) -> ExchangeResult<bool> {
        let mut conn = self.connection()?;
        redis::cmd("SISMEMBER")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_error(e))
    }

    /// SMEMBERS.
    pub async fn set_members(&self, key: &str) -> ExchangeResult<Vec<String>> {
        let mut conn = self.connection()?;
        redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_error(e))
    }

    /// SUNION over several keys.
    pub async fn union_sets(&self, keys: &[String]) -> ExchangeResult<Vec<String>> {
        let mut conn = self.connection()?;
        let mut cmd = redis::cmd("SUNION");
        for key in keys {
            cmd.arg(key);
        }
        cmd.query_async(&mut conn)
            .await
            .map_err(|e| self.command_error(e))
    }

    /// HSET of one field.
    pub async fn set_hash_field(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> ExchangeResult<()> {
        let mut conn = self.connection()?;
        let _: () = redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_error(e))?;
        Ok(())
    }

    /// HGET.
    pub async fn get_hash_field(&self, key: &str, field: &str) -> ExchangeResult<Option<String>> {
        let mut conn = self.connection()?;
        redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_error(e))
    }

    /// HDEL; true when the field existed.
    pub async fn delete_hash_field(&self, key: &str, field: &str) -> ExchangeResult<bool> {
        let mut conn = self.connection()?;
        let removed: u64 = redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_error(e))?;
        Ok(removed > 0)
    }

    /// LPUSH; resulting list length.
    pub async fn push_to_list(&self, key: &str, value: &str) -> ExchangeResult<u64> {
        let mut conn = self.connection()?;
        redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_error(e))
    }

    /// LREM; number of removed entries.
    pub async fn remove_from_list(
        &self,
        key: &str,
        count: isize,
        value: &str,
    ) -> ExchangeResult<u64> {
        let mut conn = self.connection()?;
        redis::cmd("LREM")
            .arg(key)
            .arg(count)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_error(e))
    }

    /// JSON.SET at a path. Only valid when [`is_json_supported`] reports the
    /// capability.
    ///
    /// [`is_json_supported`]: Self::is_json_supported
    pub async fn set_json_document(
        &self,
        key: &str,
        path: &str,
        document: &str,
    ) -> ExchangeResult<()> {
        let mut conn = self.connection()?;
        let _: () = redis::cmd("JSON.SET")
            .arg(key)
            .arg(path)
            .arg(document)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_error(e))?;
        Ok(())
    }

    /// JSON.GET at a path.
    pub async fn get_json_document(
        &self,
        key: &str,
        path: &str,
    ) -> ExchangeResult<Option<String>> {
        let mut conn = self.connection()?;
        redis::cmd("JSON.GET")
            .arg(key)
            .arg(path)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_error(e))
    }

    // -- connection plumbing ------------------------------------------------

    fn connection(&self) -> ExchangeResult<ConnectionManager> {
        self.manager
            .read()
            .clone()
            .ok_or_else(|| ExchangeError::general("broker client not initialized"))
    }

    fn command_error(&self, err: RedisError) -> ExchangeError {
        if is_readonly_error(&err) {
            warn!(identifier = %self.identifier, "broker answered READONLY, reconnecting");
            self.force_reconnect();
        }
        ExchangeError::from(err)
    }

    /// Replace the managed connection immediately, outside the supervisor's
    /// backoff cycle.
    fn force_reconnect(&self) {
        let Some(client) = self.client.read().clone() else {
            return;
        };
        let slot = Arc::clone(&self.manager);
        let identifier = self.identifier.clone();
        let token = self.shutdown.child_token();
        tokio::spawn(async move {
            if token.is_cancelled() {
                return;
            }
            match ConnectionManager::new(client).await {
                Ok(manager) => {
                    *slot.write() = Some(manager);
                    debug!(identifier = %identifier, "broker connection replaced");
                }
                Err(e) => {
                    warn!(identifier = %identifier, error = %e, "immediate reconnect failed");
                }
            }
        });
    }

    async fn fetch_server_info(&self) {
        let mut info = ServerInfo::default();
        if let Ok(mut conn) = self.connection() {
            let raw: Result<String, _> = redis::cmd("INFO")
                .arg("server")
                .query_async(&mut conn)
                .await;
            if let Ok(raw) = raw {
                info.version = ServerInfo::parse_info_section(&raw);
            }
            let modules: Result<redis::Value, _> = redis::cmd("MODULE")
                .arg("LIST")
                .query_async(&mut conn)
                .await;
            match modules {
                Ok(value) => info.modules = ServerInfo::parse_module_names(&value),
                Err(e) => debug!(error = %e, "MODULE LIST unavailable"),
            }
        }
        *self.server_info.write() = info;
    }

    /// Rebuild the managed connection with the configured backoff until it
    /// answers a PING, the attempt cap is passed, or `token` cancels.
    async fn reconnect(&self, token: &CancellationToken) -> ExchangeResult<()> {
        let client = self
            .client
            .read()
            .clone()
            .ok_or_else(|| ExchangeError::general("broker client not initialized"))?;
        let mut attempt = 1u32;
        loop {
            if token.is_cancelled() {
                return Err(ExchangeError::general("broker client shutting down"));
            }
            self.reconnect_policy.check_attempts(attempt)?;
            match ConnectionManager::new(client.clone()).await {
                Ok(mut manager) => {
                    let pong: Result<String, _> =
                        redis::cmd("PING").query_async(&mut manager).await;
                    match pong {
                        Ok(_) => {
                            *self.manager.write() = Some(manager);
                            return Ok(());
                        }
                        Err(e) => {
                            warn!(identifier = %self.identifier, attempt, error = %e, "broker not answering")
                        }
                    }
                }
                Err(e) => {
                    warn!(identifier = %self.identifier, attempt, error = %e, "broker connect failed")
                }
            }
            tokio::time::sleep(self.reconnect_policy.interval(attempt)).await;
            attempt += 1;
        }
    }

    fn spawn_supervisor(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let token = self.shutdown.child_token();
        let interval = self.settings.ping_interval();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(client) = weak.upgrade() else { break };
                if !client.probe(&token).await {
                    break;
                }
            }
        });
        *self.supervisor.lock() = Some(handle);
    }

    /// One health probe cycle. Returns false when the connection is lost for
    /// good and supervision should stop.
    async fn probe(self: &Arc<Self>, token: &CancellationToken) -> bool {
        let ping: Result<(), String> = match self.connection() {
            Ok(mut conn) => {
                let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
                pong.map(|_| ()).map_err(|e| e.to_string())
            }
            Err(e) => Err(e.to_string()),
        };

        match ping {
            Ok(()) => {
                if !self.ready.swap(true, Ordering::AcqRel) {
                    info!(identifier = %self.identifier, "broker connection recovered");
                    self.notify_recovered();
                }
                true
            }
            Err(e) => {
                if self.ready.swap(false, Ordering::AcqRel) {
                    warn!(identifier = %self.identifier, error = %e, "broker connection disrupted");
                    self.notify_disrupted();
                }
                match self.reconnect(token).await {
                    Ok(()) => {
                        self.ready.store(true, Ordering::Release);
                        info!(identifier = %self.identifier, "broker connection recovered");
                        self.notify_recovered();
                        true
                    }
                    Err(e) => {
                        if !token.is_cancelled() {
                            error!(identifier = %self.identifier, error = %e, "broker connection lost");
                            self.notify_lost();
                        }
                        false
                    }
                }
            }
        }
    }

    fn notify_recovered(&self) {
        for observer in self.observers.snapshot().iter() {
            observer.on_connection_recovered(&self.identifier);
        }
    }

    fn notify_disrupted(&self) {
        for observer in self.observers.snapshot().iter() {
            observer.on_connection_disrupted(&self.identifier);
        }
    }

    fn notify_lost(&self) {
        for observer in self.observers.snapshot().iter() {
            observer.on_connection_lost(&self.identifier);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_command_builder() {
        let cmd = BrokerCommand::new("SET").arg("k").arg("v").arg("EX").arg("5");
        assert_eq!(cmd.name, "SET");
        assert_eq!(cmd.args, vec!["k", "v", "EX", "5"]);
    }

    #[test]
    fn test_server_info_json_detection() {
        let mut info = ServerInfo::default();
        assert!(!info.supports_json());

        info.modules = vec!["search".to_string(), "ReJSON".to_string()];
        assert!(info.supports_json());

        info.modules = vec!["ReJSON2".to_string()];
        assert!(info.supports_json());
    }

    #[test]
    fn test_server_info_hash_field_expiry_gate() {
        let mut info = ServerInfo {
            version: "7.2.5".to_string(),
            ..Default::default()
        };
        assert!(!info.supports_hash_field_expiry());

        info.version = "7.4.0".to_string();
        assert!(info.supports_hash_field_expiry());

        info.version = "8.0.1".to_string();
        assert!(info.supports_hash_field_expiry());

        info.version = String::new();
        assert!(!info.supports_hash_field_expiry());
    }

    #[test]
    fn test_parse_info_section() {
        let raw = "# Server\r\nredis_version:7.4.1\r\nredis_mode:standalone\r\n";
        assert_eq!(ServerInfo::parse_info_section(raw), "7.4.1");
        assert_eq!(ServerInfo::parse_info_section("no version here"), "");
    }

    #[test]
    fn test_parse_module_names_from_array_reply() {
        let reply = redis::Value::Array(vec![redis::Value::Array(vec![
            redis::Value::BulkString(b"name".to_vec()),
            redis::Value::BulkString(b"ReJSON".to_vec()),
            redis::Value::BulkString(b"ver".to_vec()),
            redis::Value::Int(20011),
        ])]);
        assert_eq!(ServerInfo::parse_module_names(&reply), vec!["ReJSON"]);
    }

    #[test]
    fn test_parse_module_names_from_map_reply() {
        let reply = redis::Value::Array(vec![redis::Value::Map(vec![
            (
                redis::Value::BulkString(b"name".to_vec()),
                redis::Value::BulkString(b"ReJSON2".to_vec()),
            ),
            (
                redis::Value::BulkString(b"ver".to_vec()),
                redis::Value::Int(20800),
            ),
        ])]);
        assert_eq!(ServerInfo::parse_module_names(&reply), vec!["ReJSON2"]);
    }

    #[test]
    fn test_client_identifier_embeds_address() {
        let client = BrokerClient::new(BrokerSettings::default());
        assert!(client.identifier().starts_with("broker://localhost:6379/0#"));
        assert!(!client.is_ready());
    }

    #[tokio::test]
    async fn test_commands_fail_before_initialize() {
        let client = BrokerClient::new(BrokerSettings::default());
        assert!(client.get_value("k").await.is_err());
        assert!(client
            .execute_commands(&[BrokerCommand::new("PING")])
            .await
            .is_err());
    }
}
