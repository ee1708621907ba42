//! Pool of authenticated content-server connections.
//!
//! A connection parked in the pool is ready; a connection owned by a request
//! future is in use; a dropped connection is dead. Released connections go
//! to the oldest waiting request before they are parked again. A request
//! future dropped while it holds a connection takes the connection with it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use steam_cm::KeyExchange;
use tokio::sync::oneshot;

use crate::auth::ContentServerConnection;
use crate::error::ContentError;
use crate::http::HttpClient;
use crate::manifest::{self, ChunkId, DepotKey, Manifest};

#[derive(Debug, Default)]
struct PoolState {
    parked: Vec<ContentServerConnection>,
    waiters: VecDeque<oneshot::Sender<ContentServerConnection>>,
    /// Connections that are parked or in use.
    live: usize,
    initializing: usize,
}

impl PoolState {
    fn is_exhausted(&self) -> bool {
        self.live == 0 && self.initializing == 0
    }

    /// Hands `connection` to the oldest waiter still listening, or parks it.
    fn hand_off(&mut self, mut connection: ContentServerConnection) {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(connection) {
                Ok(()) => return,
                Err(returned) => connection = returned,
            }
        }
        self.parked.push(connection);
    }

    /// Forgets a connection that is gone for good.
    fn retire(&mut self) {
        self.live -= 1;
        self.fail_waiters_if_exhausted();
    }

    fn fail_waiters_if_exhausted(&mut self) {
        if self.is_exhausted() && !self.waiters.is_empty() {
            log::warn!("content pool exhausted, failing {} queued requests", self.waiters.len());
            self.waiters.clear();
        }
    }
}

pub struct ContentPool<H: ?Sized> {
    http: Arc<H>,
    state: Arc<Mutex<PoolState>>,
}

impl<H: ?Sized> Clone for ContentPool<H> {
    fn clone(&self) -> Self {
        Self { http: Arc::clone(&self.http), state: Arc::clone(&self.state) }
    }
}

impl<H: ?Sized> ContentPool<H> {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of parked connections.
    pub fn ready_count(&self) -> usize {
        self.lock().parked.len()
    }

    /// Number of connections that are parked or in use.
    pub fn live_count(&self) -> usize {
        self.lock().live
    }

    pub fn initializing_count(&self) -> usize {
        self.lock().initializing
    }

    pub fn queued_count(&self) -> usize {
        self.lock().waiters.len()
    }

    fn release(&self, connection: ContentServerConnection) {
        self.lock().hand_off(connection);
    }
}

/// Claim on a connection that was sent to a waiter. Dropping it before the
/// connection is received puts the connection back.
struct Waiter<'a, H: ?Sized> {
    pool: &'a ContentPool<H>,
    receiver: oneshot::Receiver<ContentServerConnection>,
}

impl<H: ?Sized> Drop for Waiter<'_, H> {
    fn drop(&mut self) {
        self.receiver.close();
        if let Ok(connection) = self.receiver.try_recv() {
            self.pool.release(connection);
        }
    }
}

/// Keeps a connection counted as live while a request owns it.
struct InUse<'a, H: ?Sized> {
    pool: &'a ContentPool<H>,
    host: String,
    armed: bool,
}

impl<'a, H: ?Sized> InUse<'a, H> {
    fn new(pool: &'a ContentPool<H>, connection: &ContentServerConnection) -> Self {
        Self { pool, host: connection.host().to_string(), armed: true }
    }

    fn release(mut self, connection: ContentServerConnection) {
        self.armed = false;
        self.pool.release(connection);
    }

    fn evict(mut self, connection: ContentServerConnection, err: &ContentError) {
        self.armed = false;
        log::warn!("evicting content server {}: {}", self.host, err);
        drop(connection);
        self.pool.lock().retire();
    }
}

impl<H: ?Sized> Drop for InUse<'_, H> {
    fn drop(&mut self) {
        if self.armed {
            log::warn!("content server {} dropped with a cancelled request", self.host);
            self.pool.lock().retire();
        }
    }
}

impl<H: HttpClient + ?Sized + 'static> ContentPool<H> {
    /// Starts one `/initsession/` per server. Must be called inside a tokio
    /// runtime.
    pub fn new(
        servers: Vec<String>,
        app_ticket: Vec<u8>,
        http: Arc<H>,
    ) -> Result<Self, ContentError> {
        Ok(Self::with_key_exchange(servers, app_ticket, http, KeyExchange::backend()?))
    }

    pub fn with_key_exchange(
        servers: Vec<String>,
        app_ticket: Vec<u8>,
        http: Arc<H>,
        exchange: KeyExchange,
    ) -> Self {
        let state = PoolState { initializing: servers.len(), ..Default::default() };
        let pool = Self { http, state: Arc::new(Mutex::new(state)) };
        let app_ticket = Arc::new(app_ticket);

        for host in servers {
            let pool = pool.clone();
            let app_ticket = Arc::clone(&app_ticket);
            let exchange = exchange.clone();
            tokio::spawn(async move {
                let result =
                    ContentServerConnection::init(&*pool.http, &host, &app_ticket, &exchange).await;
                pool.initialized(&host, result);
            });
        }
        pool
    }

    fn initialized(&self, host: &str, result: Result<ContentServerConnection, ContentError>) {
        let mut state = self.lock();
        state.initializing -= 1;
        match result {
            Ok(connection) => {
                state.live += 1;
                state.hand_off(connection);
            }
            Err(err) => {
                log::warn!("content server {host} dropped during initsession: {err}");
                state.fail_waiters_if_exhausted();
            }
        }
    }

    async fn acquire(&self, depot_id: u32) -> Result<ContentServerConnection, ContentError> {
        let mut waiter = {
            let mut state = self.lock();
            let preferred = state.parked.iter().position(|c| c.depot() == Some(depot_id));
            let index = preferred.or(if state.parked.is_empty() { None } else { Some(0) });
            if let Some(index) = index {
                return Ok(state.parked.remove(index));
            }
            if state.is_exhausted() {
                return Err(ContentError::PoolExhausted);
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);
            Waiter { pool: self, receiver }
        };
        (&mut waiter.receiver).await.map_err(|_| ContentError::PoolExhausted)
    }

    /// Runs an authenticated GET of `/depot/{depot_id}{path}` on the best
    /// available connection, queueing until one is free.
    pub async fn request(
        &self,
        depot_id: u32,
        app_ticket: &[u8],
        path: &str,
    ) -> Result<Vec<u8>, ContentError> {
        let mut connection = self.acquire(depot_id).await?;
        let in_use = InUse::new(self, &connection);
        let result = self.run(&mut connection, depot_id, app_ticket, path).await;
        match &result {
            Err(err) if err.evicts_connection() => in_use.evict(connection, err),
            _ => in_use.release(connection),
        }
        result
    }

    async fn run(
        &self,
        connection: &mut ContentServerConnection,
        depot_id: u32,
        app_ticket: &[u8],
        path: &str,
    ) -> Result<Vec<u8>, ContentError> {
        if connection.depot() != Some(depot_id) {
            connection.auth_depot(&*self.http, depot_id, app_ticket).await?;
        }
        connection.get(&*self.http, depot_id, path).await
    }

    pub async fn download_manifest(
        &self,
        depot_id: u32,
        manifest_id: u64,
        app_ticket: &[u8],
        depot_key: &DepotKey,
    ) -> Result<Manifest, ContentError> {
        let body = self.request(depot_id, app_ticket, &format!("/manifest/{manifest_id}/5")).await?;
        let manifest = Manifest::decode(&manifest::unzip(&body)?, depot_key)?;
        log::info!("depot {depot_id} manifest {manifest_id}: {} files", manifest.files.len());
        Ok(manifest)
    }

    /// Fetches one chunk, decrypted and decompressed.
    pub async fn download_chunk(
        &self,
        depot_id: u32,
        chunk_id: &ChunkId,
        app_ticket: &[u8],
        depot_key: &DepotKey,
    ) -> Result<Vec<u8>, ContentError> {
        let path = format!("/chunk/{}", chunk_id.to_hex());
        let body = self.request(depot_id, app_ticket, &path).await?;
        let zipped = depot_key.decrypt(&body)?;
        Ok(manifest::unzip(&zipped)?)
    }
}
