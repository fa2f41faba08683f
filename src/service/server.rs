// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use super::{Metrics, ServerConfig, Shutdown};
use crate::network::{
    Comm, Connection, ConnectionContext, ConnectionTimeouts, HandlerFactory, ProtocolRegistry,
};
use crate::utils::{ConnectionWatchdog, TaskExecutor};
use crate::{AppError, AppResult};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub struct Server<F> {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    registry: ProtocolRegistry,
    factory: Arc<F>,
    watchdog: Arc<ConnectionWatchdog>,
    timeouts: ConnectionTimeouts,
    read_buffer_size: usize,
}

impl<F: HandlerFactory> Server<F> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        listener: TcpListener,
        limit_connections: Arc<Semaphore>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        registry: ProtocolRegistry,
        factory: Arc<F>,
        watchdog: Arc<ConnectionWatchdog>,
        config: &ServerConfig,
    ) -> Self {
        Server {
            listener,
            limit_connections,
            notify_shutdown,
            shutdown_complete_tx,
            registry,
            factory,
            watchdog,
            timeouts: ConnectionTimeouts::from(&config.connection),
            read_buffer_size: config.network.read_buffer_size,
        }
    }

    /// Accepts connections until accepting itself fails.
    ///
    /// Each socket gets its own protocol set, `Comm`, handler and driver
    /// task, and is registered with the connection watchdog for idle
    /// reaping. A connection holds one permit of the connection limit and a
    /// clone of `shutdown_complete_tx` for as long as its driver runs.
    ///
    // Graceful shutdown sequence:
    // 1. The `run loop` is cancelled by the caller once the shutdown signal arrives.
    // 2. The broadcast reaches every driver, which requests its own shutdown,
    //    finishes the request in flight and closes the socket.
    // 3. The watchdogs and task workers leave their loops on the same broadcast.
    // 4. Once every driver has dropped its `shutdown_complete_tx`, the caller's
    //    receiver returns and the process can exit.
    pub async fn run(&self) -> AppResult<()> {
        loop {
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::IllegalStateError(format!("connection limiter: {}", e)))?;

            let (socket, peer) = self.accept().await?;
            let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
            let name = format!("conn-{}-{}", id, peer);
            debug!("accepted {}", name);

            let protocols = match self.registry.instantiate() {
                Ok(protocols) => protocols,
                Err(e) => {
                    error!("{} cannot build protocols: {}", name, e);
                    continue;
                }
            };
            if let Err(e) = socket.set_nodelay(true) {
                warn!("{} set_nodelay failed: {}", name, e);
            }
            let (reader, writer) = socket.into_split();
            let comm = Arc::new(Comm::new(name, protocols, writer));
            let context = ConnectionContext::new(id, Some(peer), comm);
            let handler = self.factory.create(&context);
            let connection = Connection::new(context, handler, self.timeouts);
            self.watchdog.register(id, connection.clone());

            let mut shutdown = Shutdown::subscribe(&self.notify_shutdown);
            let shutdown_complete_tx = self.shutdown_complete_tx.clone();
            let watchdog = self.watchdog.clone();
            let read_buffer_size = self.read_buffer_size;

            tokio::spawn(async move {
                let handle = connection.context().shutdown_handle();
                let driver = connection.clone().run(reader, read_buffer_size);
                tokio::pin!(driver);
                let result = tokio::select! {
                    result = &mut driver => result,
                    _ = shutdown.recv() => {
                        handle.request();
                        driver.await
                    }
                };
                if let Err(err) = result {
                    error!("{} error: {}", connection.context().name(), err);
                }
                watchdog.unregister(id);
                // whether gracefully or unexpectedly closed, release connection
                drop(permit);
                drop(shutdown_complete_tx);
            });
        }
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    async fn accept(&self) -> AppResult<(TcpStream, SocketAddr)> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(err) => {
                    if backoff > 64 {
                        return Err(err.into());
                    }
                    warn!("accept failed, retrying in {}s: {}", backoff, err);
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

impl<F> Drop for Server<F> {
    fn drop(&mut self) {
        debug!("tcp server dropped");
    }
}

/// Runs a server on `listener` until `signal` completes, then shuts every
/// connection and background loop down and waits for them to finish.
pub async fn serve<F, S>(
    listener: TcpListener,
    config: ServerConfig,
    registry: ProtocolRegistry,
    factory: F,
    metrics: Arc<dyn Metrics>,
    signal: S,
) -> AppResult<()>
where
    F: HandlerFactory,
    S: Future<Output = ()>,
{
    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

    let executor = TaskExecutor::new(&config.task, metrics.clone(), notify_shutdown.clone());
    let watchdog = ConnectionWatchdog::new(executor, config.connection.shutdown_timeout, metrics);
    watchdog.clone().start(notify_shutdown.clone());

    let server = Server::new(
        listener,
        Arc::new(Semaphore::new(config.network.max_connection)),
        notify_shutdown.clone(),
        shutdown_complete_tx,
        registry,
        Arc::new(factory),
        watchdog,
        &config,
    );
    info!("tcp server listening on {}", server.local_addr()?);

    tokio::select! {
        res = server.run() => {
            if let Err(err) = res {
                error!(cause = %err, "failed to accept");
            }
        }
        _ = signal => {
            info!("get shutdown signal");
        }
    }

    drop(server);
    // no receivers left is fine: everything already stopped
    let _ = notify_shutdown.send(());
    debug!("waiting for connections to finish");
    shutdown_complete_rx.recv().await;
    info!("server shutdown complete");
    Ok(())
}
