//! [`UserLocator`] shared through Redis.
//!
//! The user table lives in the hash `<namespace>:users`. Every process keeps
//! a local copy, so [`UserLocator::locate`] never waits on the network:
//! local bindings apply immediately and are written through by a background
//! task, and changes made by other processes arrive on the
//! `<namespace>:users:events` channel. The copy is reloaded from the hash
//! each time that subscription is (re)established.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::StreamExt;
use redis::{Client, Script};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::TransportError;
use crate::push::UserLocator;
use crate::redis_bus::{RETRY_DELAY, bus_error, connect_with_retry};

const WRITE_CAPACITY: usize = 1024;

const UNBIND_IF_OWNER: &str = r"
if redis.call('HGET', KEYS[1], ARGV[1]) ~= ARGV[2] then return 0 end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('PUBLISH', KEYS[2], ARGV[3])
return 1
";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum UserEvent {
    Bind { user: String, process: String },
    Unbind { user: String, process: String },
}

type UserTable = Arc<RwLock<HashMap<String, String>>>;

fn apply(users: &UserTable, event: &UserEvent) {
    let mut users = users.write().unwrap_or_else(PoisonError::into_inner);
    match event {
        UserEvent::Bind { user, process } => {
            users.insert(user.clone(), process.clone());
        }
        UserEvent::Unbind { user, process } => {
            if users.get(user).is_some_and(|p| p == process) {
                users.remove(user);
            }
        }
    }
}

#[derive(Clone)]
struct Names {
    table: String,
    events: String,
}

/// Networked [`UserLocator`] on a Redis server.
pub struct RedisUserLocator {
    users: UserTable,
    writes: mpsc::Sender<UserEvent>,
    tasks: Vec<AbortHandle>,
}

impl RedisUserLocator {
    /// A locator on the server at `url`. Must be called inside a Tokio
    /// runtime; the server is contacted in the background.
    pub fn new(url: &str, namespace: &str) -> Result<Self, TransportError> {
        let client = Client::open(url).map_err(bus_error)?;
        let names = Names {
            table: format!("{namespace}:users"),
            events: format!("{namespace}:users:events"),
        };
        let users = UserTable::default();
        let (writes, rx) = mpsc::channel(WRITE_CAPACITY);
        let writer = tokio::spawn(write_loop(client.clone(), names.clone(), rx));
        let reader = tokio::spawn(follow_loop(client, names, Arc::clone(&users)));
        Ok(Self {
            users,
            writes,
            tasks: vec![writer.abort_handle(), reader.abort_handle()],
        })
    }

    fn write(&self, event: UserEvent) {
        if let Err(e) = self.writes.try_send(event) {
            tracing::warn!("user table write dropped: {e}");
        }
    }
}

impl UserLocator for RedisUserLocator {
    fn locate(&self, user_id: &str) -> Option<String> {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
    }

    fn bind(&self, user_id: &str, process: &str) {
        let event = UserEvent::Bind {
            user: user_id.to_string(),
            process: process.to_string(),
        };
        apply(&self.users, &event);
        self.write(event);
    }

    fn unbind(&self, user_id: &str, process: &str) {
        let event = UserEvent::Unbind {
            user: user_id.to_string(),
            process: process.to_string(),
        };
        apply(&self.users, &event);
        self.write(event);
    }
}

impl Drop for RedisUserLocator {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn write_loop(client: Client, names: Names, mut rx: mpsc::Receiver<UserEvent>) {
    let mut conn = connect_with_retry(&client, "user table").await;
    let unbind = Script::new(UNBIND_IF_OWNER);
    while let Some(event) = rx.recv().await {
        let encoded = match serde_json::to_string(&event) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!("cannot encode user event: {e}");
                continue;
            }
        };
        let written: Result<(), redis::RedisError> = match &event {
            UserEvent::Bind { user, process } => {
                redis::pipe()
                    .atomic()
                    .cmd("HSET")
                    .arg(&names.table)
                    .arg(user)
                    .arg(process)
                    .ignore()
                    .cmd("PUBLISH")
                    .arg(&names.events)
                    .arg(&encoded)
                    .ignore()
                    .query_async(&mut conn)
                    .await
            }
            UserEvent::Unbind { user, process } => {
                let removed: Result<i64, _> = unbind
                    .key(&names.table)
                    .key(&names.events)
                    .arg(user)
                    .arg(process)
                    .arg(&encoded)
                    .invoke_async(&mut conn)
                    .await;
                removed.map(|_| ())
            }
        };
        if let Err(e) = written {
            tracing::warn!(event = %encoded, "user table write failed: {e}");
        }
    }
}

async fn follow_loop(client: Client, names: Names, users: UserTable) {
    loop {
        if let Err(e) = follow(&client, &names, &users).await {
            tracing::warn!(channel = %names.events, "user table subscription failed: {e}");
        } else {
            tracing::warn!(channel = %names.events, "user table subscription lost");
        }
        tokio::time::sleep(RETRY_DELAY).await;
    }
}

async fn follow(client: &Client, names: &Names, users: &UserTable) -> Result<(), redis::RedisError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(&names.events).await?;

    let mut conn = client.get_multiplexed_async_connection().await?;
    let snapshot: HashMap<String, String> = redis::cmd("HGETALL")
        .arg(&names.table)
        .query_async(&mut conn)
        .await?;
    {
        let mut users = users.write().unwrap_or_else(PoisonError::into_inner);
        // Fill in only: pending local writes win.
        for (user, process) in snapshot {
            users.entry(user).or_insert(process);
        }
    }
    tracing::debug!(channel = %names.events, "following user table");

    let mut messages = pin!(pubsub.into_on_message());
    while let Some(msg) = messages.next().await {
        match serde_json::from_slice::<UserEvent>(msg.get_payload_bytes()) {
            Ok(event) => apply(users, &event),
            Err(e) => tracing::warn!("ignoring malformed user event: {e}"),
        }
    }
    Ok(())
}
