#![forbid(unsafe_code)]

// Room name reservation shared by every server instance

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum NameStoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Outcome of a reservation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Reserved,
    AlreadyTaken,
}

/// Key-existence store guaranteeing a room id is live on at most one instance.
///
/// `reserve` must be an atomic set-if-absent.
#[async_trait]
pub trait NameReservation: Send + Sync {
    async fn exists(&self, room_id: &str) -> Result<bool, NameStoreError>;

    async fn reserve(&self, room_id: &str, owner_token: &str) -> Result<Reservation, NameStoreError>;

    async fn release(&self, room_id: &str) -> Result<(), NameStoreError>;
}

/// Process-local store. Sharing one instance between several registries
/// behaves like several server instances sharing one backend.
#[derive(Default)]
pub struct InMemoryNameReservation {
    names: StdMutex<HashMap<String, String>>,
}

impl InMemoryNameReservation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that currently holds `room_id`
    pub fn holder(&self, room_id: &str) -> Option<String> {
        let names = self.names.lock().unwrap_or_else(|e| e.into_inner());
        names.get(room_id).cloned()
    }
}

#[async_trait]
impl NameReservation for InMemoryNameReservation {
    async fn exists(&self, room_id: &str) -> Result<bool, NameStoreError> {
        let names = self.names.lock().unwrap_or_else(|e| e.into_inner());
        Ok(names.contains_key(room_id))
    }

    async fn reserve(&self, room_id: &str, owner_token: &str) -> Result<Reservation, NameStoreError> {
        let mut names = self.names.lock().unwrap_or_else(|e| e.into_inner());
        if names.contains_key(room_id) {
            return Ok(Reservation::AlreadyTaken);
        }
        names.insert(room_id.to_string(), owner_token.to_string());
        Ok(Reservation::Reserved)
    }

    async fn release(&self, room_id: &str) -> Result<(), NameStoreError> {
        let mut names = self.names.lock().unwrap_or_else(|e| e.into_inner());
        names.remove(room_id);
        Ok(())
    }
}

/// Redis-backed store. One key per live room: `room:{id}:owner` → owner token.
///
/// The multiplexed connection is cheap to clone and safe to use concurrently,
/// so every call clones it instead of locking.
#[derive(Clone)]
pub struct RedisNameReservation {
    connection: MultiplexedConnection,
}

impl RedisNameReservation {
    /// Connects to Redis.
    ///
    /// # Errors
    /// Returns `NameStoreError::Redis` if the URL is invalid or the server is unreachable.
    pub async fn connect(redis_url: &str) -> Result<Self, NameStoreError> {
        // The URL may carry credentials; never log it.
        let client = Client::open(redis_url).map_err(|e| {
            error!(error = %e, "Failed to open Redis client");
            e
        })?;
        let connection = client.get_multiplexed_async_connection().await.map_err(|e| {
            error!(error = %e, "Failed to connect to Redis");
            e
        })?;
        Ok(Self { connection })
    }

    fn key(room_id: &str) -> String {
        format!("room:{room_id}:owner")
    }
}

#[async_trait]
impl NameReservation for RedisNameReservation {
    async fn exists(&self, room_id: &str) -> Result<bool, NameStoreError> {
        let mut conn = self.connection.clone();
        let found: bool = conn.exists(Self::key(room_id)).await?;
        Ok(found)
    }

    async fn reserve(&self, room_id: &str, owner_token: &str) -> Result<Reservation, NameStoreError> {
        let mut conn = self.connection.clone();
        // SET NX replies "OK" when the key was written and nil when it already existed
        let reply: Option<String> = redis::cmd("SET")
            .arg(Self::key(room_id))
            .arg(owner_token)
            .arg("NX")
            .query_async(&mut conn)
            .await?;

        debug!(room_id = %room_id, reserved = reply.is_some(), "Room name reservation");
        Ok(if reply.is_some() {
            Reservation::Reserved
        } else {
            Reservation::AlreadyTaken
        })
    }

    async fn release(&self, room_id: &str) -> Result<(), NameStoreError> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(Self::key(room_id)).await?;
        Ok(())
    }
}
