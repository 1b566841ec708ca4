//! Mutual exclusion for ingestion runs that target the same parent.
//!
//! A key is held for the lifetime of an [`InFlightPermit`]; dropping the
//! permit releases it on every path, including early returns and panics
//! unwinding through the handler. With a Redis backend the key is a
//! `SET NX EX` entry so several instances share it; the TTL bounds how long a
//! crashed instance can keep a target locked.

use redis::AsyncCommands;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{debug, warn};

const REDIS_PREFIX: &str = "syllabus:inflight:";

pub fn boards_key(state_id: i64) -> String {
    format!("boards_{state_id}")
}

pub fn subjects_key(board_id: i64, class_id: i64, stream_id: Option<i64>) -> String {
    match stream_id {
        Some(stream) => format!("subjects_{board_id}_{class_id}_{stream}"),
        None => format!("subjects_{board_id}_{class_id}_all"),
    }
}

pub fn chapters_key(subject_id: i64) -> String {
    format!("chapters_{subject_id}")
}

#[derive(Clone)]
struct SharedBackend {
    client: redis::Client,
    ttl: Duration,
}

#[derive(Clone, Default)]
pub struct InFlightGuard {
    local: Arc<Mutex<HashSet<String>>>,
    shared: Option<SharedBackend>,
}

impl InFlightGuard {
    pub fn local() -> Self {
        Self::default()
    }

    pub fn with_redis(client: redis::Client, ttl: Duration) -> Self {
        Self {
            local: Arc::default(),
            shared: Some(SharedBackend { client, ttl }),
        }
    }

    /// `None` when another run already holds `key`.
    pub async fn try_acquire(&self, key: &str) -> Option<InFlightPermit> {
        if let Some(shared) = &self.shared {
            match shared.try_set(key).await {
                Ok(true) => {
                    debug!(target = "syllabus.guard", key, backend = "redis", "guard_acquired");
                    return Some(InFlightPermit {
                        key: key.to_string(),
                        holder: Holder::Shared(shared.clone()),
                    });
                }
                Ok(false) => {
                    debug!(target = "syllabus.guard", key, backend = "redis", "guard_busy");
                    return None;
                }
                Err(err) => {
                    warn!(target = "syllabus.guard", key, error = %err, "redis guard unavailable; using local set");
                }
            }
        }

        let inserted = lock(&self.local).insert(key.to_string());
        if !inserted {
            debug!(target = "syllabus.guard", key, backend = "local", "guard_busy");
            return None;
        }
        debug!(target = "syllabus.guard", key, backend = "local", "guard_acquired");
        Some(InFlightPermit {
            key: key.to_string(),
            holder: Holder::Local(self.local.clone()),
        })
    }

    /// Whether the process-local set currently holds `key`.
    #[cfg(test)]
    pub fn is_held(&self, key: &str) -> bool {
        lock(&self.local).contains(key)
    }
}

impl SharedBackend {
    async fn try_set(&self, key: &str) -> redis::RedisResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(format!("{REDIS_PREFIX}{key}"))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) {
        match self.client.get_multiplexed_async_connection().await {
            Ok(mut conn) => {
                let deleted: redis::RedisResult<i64> =
                    conn.del(format!("{REDIS_PREFIX}{key}")).await;
                if let Err(err) = deleted {
                    warn!(target = "syllabus.guard", key, error = %err, "guard_release_failed");
                }
            }
            Err(err) => {
                warn!(target = "syllabus.guard", key, error = %err, "guard_release_failed");
            }
        }
    }
}

enum Holder {
    Local(Arc<Mutex<HashSet<String>>>),
    Shared(SharedBackend),
}

/// Holds one in-flight key until dropped.
pub struct InFlightPermit {
    key: String,
    holder: Holder,
}

impl InFlightPermit {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        match &self.holder {
            Holder::Local(set) => {
                lock(set).remove(&self.key);
            }
            Holder::Shared(shared) => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    warn!(target = "syllabus.guard", key = %self.key, "no runtime to release guard; relying on ttl");
                    return;
                };
                let shared = shared.clone();
                let key = std::mem::take(&mut self.key);
                runtime.spawn(async move { shared.delete(&key).await });
            }
        }
        debug!(target = "syllabus.guard", "guard_released");
    }
}

fn lock(set: &Mutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_target_shape() {
        assert_eq!(boards_key(7), "boards_7");
        assert_eq!(subjects_key(3, 11, None), "subjects_3_11_all");
        assert_eq!(subjects_key(3, 11, Some(2)), "subjects_3_11_2");
        assert_eq!(chapters_key(42), "chapters_42");
    }

    #[tokio::test]
    async fn second_acquire_fails_until_release() {
        let guard = InFlightGuard::local();
        let permit = guard.try_acquire("boards_7").await.expect("first acquire");
        assert_eq!(permit.key(), "boards_7");
        assert!(guard.try_acquire("boards_7").await.is_none());
        assert!(guard.try_acquire("boards_8").await.is_some());

        drop(permit);
        assert!(!guard.is_held("boards_7"));
        assert!(guard.try_acquire("boards_7").await.is_some());
    }

    #[tokio::test]
    async fn permit_is_released_when_task_fails() {
        let guard = InFlightGuard::local();
        let task_guard = guard.clone();
        let outcome = tokio::spawn(async move {
            let _permit = task_guard.try_acquire("chapters_1").await.expect("acquire");
            Err::<(), &str>("ingestion failed")
        })
        .await
        .expect("join");

        assert!(outcome.is_err());
        assert!(!guard.is_held("chapters_1"));
    }

    #[tokio::test]
    async fn unreachable_redis_falls_back_to_local_set() {
        let client = redis::Client::open("redis://127.0.0.1:1/").expect("client");
        let guard = InFlightGuard::with_redis(client, Duration::from_secs(30));

        let permit = guard.try_acquire("subjects_1_2_all").await.expect("acquire");
        assert!(guard.is_held("subjects_1_2_all"));
        assert!(guard.try_acquire("subjects_1_2_all").await.is_none());
        drop(permit);
        assert!(!guard.is_held("subjects_1_2_all"));
    }
}
