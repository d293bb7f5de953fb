//! AgentHost - identity routing, activation, hibernation and alarms
//!
//! Every agent name maps to a stable identity (`sha256(name)`), and every
//! identity to at most one running [`AgentActor`]. The host:
//!
//! - spawns actors on demand and serializes concurrent activations of the
//!   same identity behind a per-identity slot lock
//! - owns the raw socket tables used by hibernating connection registries, so
//!   sockets outlive the actors that serve them
//! - hibernates idle actors
//! - owns one durable alarm per identity and wakes the agent when it fires

use crate::agent::{AgentActor, AgentArguments, AgentClass, AgentError, AgentMsg};
use crate::connection::{
    ConnectionRegistry, ConnectionStrategy, HibernatingRegistry, InMemoryRegistry, SocketFrame,
    SocketTable, CLOSE_NORMAL,
};
use crate::mcp::McpError;
use crate::scheduler::Alarm;
use crate::storage::{AgentStorage, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use ractor::{Actor, ActorRef, ActorStatus, MessagingErr, RpcReplyPort};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

/// How long a hibernating actor may take to drain its mailbox
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, thiserror::Error)]
pub enum HostError {
    #[error("Agent not found: {0}")]
    NotFound(String),

    #[error("Failed to spawn agent {name}: {reason}")]
    Spawn { name: String, reason: String },

    #[error("Agent {0} is unavailable")]
    Unavailable(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Mcp(#[from] McpError),
}

/// Whether waking may create storage for a new identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeMode {
    Create,
    /// Fail with [`HostError::NotFound`] unless the identity already has storage
    Existing,
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub data_dir: PathBuf,
    pub in_memory: bool,
    pub idle_timeout: Duration,
}

type Slot = Arc<Mutex<Option<ActorRef<AgentMsg>>>>;

struct HostInner {
    class: AgentClass,
    config: HostConfig,
    slots: DashMap<String, Slot>,
    sockets: DashMap<String, SocketTable>,
    memory_storage: DashMap<String, AgentStorage>,
    alarms: DashMap<String, (i64, AbortHandle)>,
    activity: DashMap<String, Instant>,
    host_db: SqlitePool,
}

#[derive(Clone)]
pub struct AgentHost {
    inner: Arc<HostInner>,
}

/// Stable identity for an agent name
pub fn identity_for(name: &str) -> String {
    hex::encode(Sha256::digest(name.as_bytes()))
}

/// Seconds until `fire_at`; past times fire immediately
fn alarm_delay(fire_at: i64, now: i64) -> u64 {
    fire_at.saturating_sub(now).max(0) as u64
}

impl AgentHost {
    pub async fn new(class: AgentClass, config: HostConfig) -> Result<Self, HostError> {
        let options = if config.in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(StorageError::from)?
        } else {
            tokio::fs::create_dir_all(&config.data_dir)
                .await
                .map_err(|e| StorageError::Database(e.to_string()))?;
            SqliteConnectOptions::new()
                .filename(config.data_dir.join("host.db"))
                .create_if_missing(true)
        };
        let host_db = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(StorageError::from)?;
        sqlx::migrate!("./migrations/host")
            .run(&host_db)
            .await
            .map_err(StorageError::from)?;

        tracing::info!(
            class = %class.name(),
            strategy = ?class.strategy(),
            in_memory = config.in_memory,
            data_dir = %config.data_dir.display(),
            "Agent host ready"
        );

        Ok(Self {
            inner: Arc::new(HostInner {
                class,
                config,
                slots: DashMap::new(),
                sockets: DashMap::new(),
                memory_storage: DashMap::new(),
                alarms: DashMap::new(),
                activity: DashMap::new(),
                host_db,
            }),
        })
    }

    pub fn class(&self) -> &AgentClass {
        &self.inner.class
    }

    fn storage_path(&self, identity: &str) -> PathBuf {
        self.inner
            .config
            .data_dir
            .join("agents")
            .join(format!("{identity}.db"))
    }

    async fn open_storage(&self, identity: &str, mode: WakeMode) -> Result<AgentStorage, HostError> {
        if self.inner.config.in_memory {
            if let Some(storage) = self.inner.memory_storage.get(identity) {
                return Ok(storage.clone());
            }
            if mode == WakeMode::Existing {
                return Err(HostError::NotFound(identity.to_string()));
            }
            let storage = AgentStorage::in_memory().await?;
            self.inner
                .memory_storage
                .insert(identity.to_string(), storage.clone());
            return Ok(storage);
        }

        let path = self.storage_path(identity);
        if mode == WakeMode::Existing && !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(HostError::NotFound(identity.to_string()));
        }
        Ok(AgentStorage::open(&path).await?)
    }

    fn sockets_for(&self, identity: &str) -> SocketTable {
        self.inner
            .sockets
            .entry(identity.to_string())
            .or_default()
            .clone()
    }

    fn touch(&self, identity: &str) {
        self.inner
            .activity
            .insert(identity.to_string(), Instant::now());
    }

    /// Resolve `name` to its running actor, activating it if needed.
    pub async fn wake(&self, name: &str, mode: WakeMode) -> Result<ActorRef<AgentMsg>, HostError> {
        let identity = identity_for(name);
        let slot = self
            .inner
            .slots
            .entry(identity.clone())
            .or_default()
            .clone();
        let mut guard = slot.lock().await;

        if let Some(actor) = guard.as_ref() {
            if actor.get_status() == ActorStatus::Running {
                self.touch(&identity);
                return Ok(actor.clone());
            }
        }

        let storage = self.open_storage(&identity, mode).await?;
        let registry: Box<dyn ConnectionRegistry> = match self.inner.class.strategy() {
            ConnectionStrategy::InMemory => Box::new(InMemoryRegistry::new()),
            ConnectionStrategy::Hibernating => {
                Box::new(HibernatingRegistry::new(self.sockets_for(&identity)))
            }
        };
        let alarm = Arc::new(HostAlarm {
            host: Arc::downgrade(&self.inner),
            identity: identity.clone(),
            name: name.to_string(),
        });

        let args = AgentArguments {
            name: name.to_string(),
            class: self.inner.class.clone(),
            storage,
            registry,
            alarm,
        };
        let (actor, _handle) = Actor::spawn(None, AgentActor, args)
            .await
            .map_err(|e| HostError::Spawn {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        tracing::debug!(agent = %name, identity = %identity, "Agent activated");
        *guard = Some(actor.clone());
        self.touch(&identity);
        Ok(actor)
    }

    /// Send a request to `name` and await its reply. Delivery is retried once
    /// when the actor stopped between activation and delivery.
    pub async fn call<R, F>(&self, name: &str, mode: WakeMode, build: F) -> Result<R, HostError>
    where
        R: Send + 'static,
        F: Fn(RpcReplyPort<R>) -> AgentMsg,
    {
        let mut retried = false;
        loop {
            let actor = self.wake(name, mode).await?;
            match ractor::call!(actor, |reply| build(reply)) {
                Ok(value) => return Ok(value),
                Err(e) if !retried && actor.get_status() != ActorStatus::Running => {
                    tracing::debug!(agent = %name, error = %e, "Agent stopped before reply; retrying");
                    retried = true;
                }
                Err(e) => return Err(HostError::Unavailable(format!("{name}: {e}"))),
            }
        }
    }

    /// Fire-and-forget delivery, with the same single retry as [`call`](Self::call).
    pub async fn cast(&self, name: &str, mode: WakeMode, message: AgentMsg) -> Result<(), HostError> {
        let actor = self.wake(name, mode).await?;
        match actor.cast(message) {
            Ok(()) => Ok(()),
            Err(MessagingErr::SendErr(message)) => {
                tracing::debug!(agent = %name, "Agent stopped before delivery; retrying");
                let actor = self.wake(name, mode).await?;
                actor
                    .cast(message)
                    .map_err(|e| HostError::Unavailable(format!("{name}: {e}")))
            }
            Err(e) => Err(HostError::Unavailable(format!("{name}: {e}"))),
        }
    }

    /// Whether `name` currently has a running actor
    pub async fn is_active(&self, name: &str) -> bool {
        let Some(slot) = self.slot(&identity_for(name)) else {
            return false;
        };
        let guard = slot.lock().await;
        guard
            .as_ref()
            .is_some_and(|actor| actor.get_status() == ActorStatus::Running)
    }

    /// Whether `name` has storage, running or not
    pub async fn exists(&self, name: &str) -> bool {
        let identity = identity_for(name);
        if self.inner.config.in_memory {
            return self.inner.memory_storage.contains_key(&identity);
        }
        tokio::fs::try_exists(self.storage_path(&identity))
            .await
            .unwrap_or(false)
    }

    /// Report a transport that went away on the client side. Nothing is
    /// delivered when the agent no longer knows the connection, so a closed
    /// socket never wakes a hibernated agent just to forget it.
    pub async fn disconnect(&self, name: &str, connection_id: &str, code: u16, reason: String) {
        let identity = identity_for(name);
        let parked = self.inner.class.strategy() == ConnectionStrategy::Hibernating
            && self
                .inner
                .sockets
                .get(&identity)
                .is_some_and(|table| table.contains_key(connection_id));
        if !parked && !self.is_active(name).await {
            return;
        }

        let message = AgentMsg::Close {
            connection_id: connection_id.to_string(),
            code,
            reason,
        };
        if let Err(e) = self.cast(name, WakeMode::Existing, message).await {
            tracing::debug!(agent = %name, connection_id = %connection_id, error = %e, "Close not delivered");
        }
    }

    fn slot(&self, identity: &str) -> Option<Slot> {
        self.inner.slots.get(identity).map(|slot| slot.clone())
    }

    // ========================================================================
    // Hibernation
    // ========================================================================

    /// Stop the actor for `name`, keeping storage, sockets and alarm.
    pub async fn hibernate(&self, name: &str) -> bool {
        self.hibernate_identity(&identity_for(name)).await
    }

    async fn hibernate_identity(&self, identity: &str) -> bool {
        let Some(slot) = self.slot(identity) else {
            return false;
        };
        let mut guard = slot.lock().await;
        let Some(actor) = guard.take() else {
            return false;
        };
        if let Err(e) = actor.drain_and_wait(Some(DRAIN_TIMEOUT)).await {
            tracing::warn!(identity = %identity, error = %e, "Drain failed; stopping agent");
            actor.stop(None);
        }
        self.inner.activity.remove(identity);
        tracing::info!(identity = %identity, "Agent hibernated");
        true
    }

    /// Hibernate every agent idle for longer than the configured timeout.
    /// Agents holding in-memory connections stay up while connected.
    pub async fn evict_idle(&self) -> usize {
        let timeout = self.inner.config.idle_timeout;
        let idle: Vec<String> = self
            .inner
            .activity
            .iter()
            .filter(|entry| entry.value().elapsed() >= timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for identity in idle {
            if self.inner.class.strategy() == ConnectionStrategy::InMemory
                && self.connection_count(&identity).await > 0
            {
                self.touch(&identity);
                continue;
            }
            if self.hibernate_identity(&identity).await {
                evicted += 1;
            }
        }
        evicted
    }

    async fn connection_count(&self, identity: &str) -> usize {
        let actor = match self.slot(identity) {
            Some(slot) => slot.lock().await.clone(),
            None => None,
        };
        match actor {
            Some(actor) => ractor::call!(actor, |reply| AgentMsg::ConnectionCount { reply })
                .unwrap_or(0),
            None => 0,
        }
    }

    pub fn spawn_watchdog(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let host = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let evicted = host.evict_idle().await;
                if evicted > 0 {
                    tracing::debug!(evicted, "Idle agents hibernated");
                }
            }
        })
    }

    /// Stop `name` and delete everything it owns.
    pub async fn destroy(&self, name: &str) -> Result<(), HostError> {
        let identity = identity_for(name);
        self.hibernate_identity(&identity).await;

        if let Some((_, table)) = self.inner.sockets.remove(&identity) {
            for entry in table.iter() {
                let _ = entry.value().sender.send(SocketFrame::Close {
                    code: CLOSE_NORMAL,
                    reason: "session terminated".to_string(),
                });
            }
        }

        self.set_alarm(&identity, name, None).await?;
        self.inner.memory_storage.remove(&identity);
        if !self.inner.config.in_memory {
            remove_database(&self.storage_path(&identity)).await;
        }
        self.inner.slots.remove(&identity);
        tracing::info!(agent = %name, identity = %identity, "Agent destroyed");
        Ok(())
    }

    // ========================================================================
    // Alarms
    // ========================================================================

    async fn set_alarm(&self, identity: &str, name: &str, at: Option<i64>) -> Result<(), StorageError> {
        if let Some((_, (_, handle))) = self.inner.alarms.remove(identity) {
            handle.abort();
        }

        match at {
            None => {
                sqlx::query("DELETE FROM alarms WHERE identity = ?")
                    .bind(identity)
                    .execute(&self.inner.host_db)
                    .await?;
            }
            Some(fire_at) => {
                sqlx::query(
                    "INSERT INTO alarms (identity, name, fire_at) VALUES (?, ?, ?)
                     ON CONFLICT(identity) DO UPDATE SET name = excluded.name, fire_at = excluded.fire_at",
                )
                .bind(identity)
                .bind(name)
                .bind(fire_at)
                .execute(&self.inner.host_db)
                .await?;
                self.arm(identity.to_string(), name.to_string(), fire_at);
            }
        }
        Ok(())
    }

    fn arm(&self, identity: String, name: String, fire_at: i64) {
        let delay = alarm_delay(fire_at, chrono::Utc::now().timestamp());
        let host = Arc::downgrade(&self.inner);
        let key = identity.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay)).await;
            if let Some(inner) = host.upgrade() {
                AgentHost { inner }.fire_alarm(&identity, &name, fire_at).await;
            }
        });
        self.inner.alarms.insert(key, (fire_at, task.abort_handle()));
    }

    async fn fire_alarm(&self, identity: &str, name: &str, fire_at: i64) {
        self.inner
            .alarms
            .remove_if(identity, |_, (armed_at, _)| *armed_at == fire_at);
        if let Err(e) = sqlx::query("DELETE FROM alarms WHERE identity = ? AND fire_at = ?")
            .bind(identity)
            .bind(fire_at)
            .execute(&self.inner.host_db)
            .await
        {
            tracing::warn!(identity = %identity, error = %e, "Failed to clear fired alarm");
        }

        tracing::debug!(agent = %name, fire_at, "Alarm fired");
        match self.cast(name, WakeMode::Existing, AgentMsg::Alarm).await {
            Ok(()) => {}
            Err(HostError::NotFound(_)) => {
                tracing::debug!(agent = %name, "Alarm for destroyed agent dropped");
            }
            Err(e) => tracing::error!(agent = %name, error = %e, "Failed to deliver alarm"),
        }
    }

    /// Re-arm every persisted alarm. Call once at start-up.
    pub async fn restore_alarms(&self) -> Result<usize, HostError> {
        let rows: Vec<(String, String, i64)> =
            sqlx::query_as("SELECT identity, name, fire_at FROM alarms")
                .fetch_all(&self.inner.host_db)
                .await
                .map_err(StorageError::from)?;
        let count = rows.len();
        for (identity, name, fire_at) in rows {
            self.arm(identity, name, fire_at);
        }
        if count > 0 {
            tracing::info!(count, "Alarms restored");
        }
        Ok(count)
    }

    /// Fire time of the armed alarm for `name`, if any
    pub fn alarm_for(&self, name: &str) -> Option<i64> {
        self.inner
            .alarms
            .get(&identity_for(name))
            .map(|entry| entry.value().0)
    }
}

async fn remove_database(path: &Path) {
    let mut files = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        files.push(PathBuf::from(sidecar));
    }
    for file in files {
        match tokio::fs::remove_file(&file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %file.display(), error = %e, "Failed to remove database file"),
        }
    }
}

/// The alarm handed to each actor. Holds the host weakly so actors never keep
/// it alive.
struct HostAlarm {
    host: Weak<HostInner>,
    identity: String,
    name: String,
}

#[async_trait]
impl Alarm for HostAlarm {
    async fn set(&self, at: Option<i64>) -> Result<(), StorageError> {
        match self.host.upgrade() {
            Some(inner) => {
                AgentHost { inner }
                    .set_alarm(&self.identity, &self.name, at)
                    .await
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentBehavior, AgentContext, MethodRegistry, StreamingResponse};
    use crate::scheduler::Schedule;
    use serde_json::{json, Value};

    struct Ticker;

    #[async_trait]
    impl AgentBehavior for Ticker {
        async fn invoke(
            &mut self,
            ctx: &mut AgentContext<'_>,
            method: &str,
            args: Vec<Value>,
            _stream: Option<&mut StreamingResponse>,
        ) -> Result<Value, AgentError> {
            match method {
                "tick" => {
                    ctx.set_state(json!({"ticked": args.first().cloned()})).await?;
                    Ok(Value::Null)
                }
                other => Err(AgentError::NotCallable(other.to_string())),
            }
        }
    }

    fn class(strategy: ConnectionStrategy) -> AgentClass {
        AgentClass::new(
            "ticker",
            MethodRegistry::new().method("tick"),
            strategy,
            || Box::new(Ticker),
        )
    }

    async fn host(dir: &Path, in_memory: bool) -> AgentHost {
        AgentHost::new(
            class(ConnectionStrategy::Hibernating),
            HostConfig {
                data_dir: dir.to_path_buf(),
                in_memory,
                idle_timeout: Duration::from_millis(0),
            },
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_identity_is_stable() {
        assert_eq!(identity_for("a"), identity_for("a"));
        assert_ne!(identity_for("a"), identity_for("b"));
        assert_eq!(identity_for("a").len(), 64);
    }

    #[test]
    fn test_alarm_delay_saturates() {
        assert_eq!(alarm_delay(110, 100), 10);
        assert_eq!(alarm_delay(90, 100), 0);
        assert_eq!(alarm_delay(i64::MIN, 100), 0);
        assert_eq!(alarm_delay(i64::MAX, -100), i64::MAX as u64);
    }

    #[tokio::test]
    async fn test_existing_mode_requires_storage() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(dir.path(), false).await;

        assert!(matches!(
            host.wake("ghost", WakeMode::Existing).await,
            Err(HostError::NotFound(_))
        ));
        host.wake("ghost", WakeMode::Create).await.unwrap();
        host.wake("ghost", WakeMode::Existing).await.unwrap();
    }

    #[tokio::test]
    async fn test_state_survives_hibernation() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(dir.path(), false).await;

        host.call("a", WakeMode::Create, |reply| AgentMsg::SetState {
            state: json!({"x": 1}),
            reply,
        })
        .await
        .unwrap()
        .unwrap();

        assert!(host.hibernate("a").await);
        assert!(!host.is_active("a").await);

        let state = host
            .call("a", WakeMode::Existing, |reply| AgentMsg::GetState { reply })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, Some(json!({"x": 1})));
        assert!(host.is_active("a").await);
    }

    #[tokio::test]
    async fn test_idle_agents_are_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(dir.path(), true).await;
        host.wake("idle", WakeMode::Create).await.unwrap();

        assert_eq!(host.evict_idle().await, 1);
        assert!(!host.is_active("idle").await);
        // in-memory storage is kept for the next activation
        host.wake("idle", WakeMode::Existing).await.unwrap();
    }

    #[tokio::test]
    async fn test_alarm_wakes_hibernated_agent() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(dir.path(), false).await;

        let task = host
            .call("sleepy", WakeMode::Create, |reply| AgentMsg::Schedule {
                when: Schedule::Delay(1),
                callback: "tick".into(),
                payload: json!("hello"),
                reply,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(host.alarm_for("sleepy"), Some(task.time));
        host.hibernate("sleepy").await;

        let mut state = None;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if host.alarm_for("sleepy").is_none() && host.is_active("sleepy").await {
                state = host
                    .call("sleepy", WakeMode::Existing, |reply| AgentMsg::GetState { reply })
                    .await
                    .unwrap()
                    .unwrap();
                if state.is_some() {
                    break;
                }
            }
        }
        assert_eq!(state, Some(json!({"ticked": "hello"})));
    }

    #[tokio::test]
    async fn test_destroy_removes_storage() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(dir.path(), false).await;
        host.wake("doomed", WakeMode::Create).await.unwrap();

        host.destroy("doomed").await.unwrap();
        assert!(matches!(
            host.wake("doomed", WakeMode::Existing).await,
            Err(HostError::NotFound(_))
        ));
    }
}
