//! Startup and shutdown of the producer and the HTTP server.

use std::fmt;
use std::io;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::camera::Camera;
use crate::server;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Interrupt => write!(f, "interrupt"),
            Signal::Terminate => write!(f, "terminate"),
        }
    }
}

/// How shutdown ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exit {
    /// Both tasks finished within the grace period
    Clean,
    /// Grace period expired or a second signal arrived
    Forced,
    /// Acquisition or the server ended with an error
    Failed,
}

/// Forward SIGINT/SIGTERM into a channel, one message per signal.
#[cfg(unix)]
pub fn listen_for_signals() -> io::Result<mpsc::Receiver<Signal>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                Some(()) = interrupt.recv() => Signal::Interrupt,
                Some(()) = terminate.recv() => Signal::Terminate,
                else => break,
            };
            if tx.send(received).await.is_err() {
                break;
            }
        }
    });
    Ok(rx)
}

#[cfg(not(unix))]
pub fn listen_for_signals() -> io::Result<mpsc::Receiver<Signal>> {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(Signal::Interrupt).await.is_err() {
                break;
            }
        }
    });
    Ok(rx)
}

/// Runs one camera's producer and HTTP server side by side
pub struct Coordinator {
    camera: Camera,
    listener: TcpListener,
    grace: Duration,
}

impl Coordinator {
    pub fn new(camera: Camera, listener: TcpListener, grace: Duration) -> Self {
        Self {
            camera,
            listener,
            grace,
        }
    }

    /// Serve until a signal arrives or either task ends, then shut down.
    ///
    /// Shutdown cancels the shared token, lets the server drain, and waits
    /// for both tasks up to the grace period. A second signal cuts the wait
    /// short. Tasks that finished in time but returned an error give
    /// [`Exit::Failed`].
    pub async fn run(self, mut signals: mpsc::Receiver<Signal>) -> Exit {
        let Self {
            camera,
            listener,
            grace,
        } = self;

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let (mut acquisition, handle) = camera.split();
        let controller = handle.controller.clone();
        let route = handle.route();
        let router = server::router(handle, cancel.clone());

        let acquisition_cancel = cancel.clone();
        let acquisition_task = tracker.spawn_blocking(move || {
            let result = acquisition.run(&acquisition_cancel);
            if let Err(err) = &result {
                tracing::error!("Acquisition failed: {}", err);
            }
            // Without frames there is nothing to serve
            acquisition_cancel.cancel();
            result
        });

        match listener.local_addr() {
            Ok(addr) => tracing::info!("Listening on http://{}{}", addr, route),
            Err(_) => tracing::info!("Listening..."),
        }
        let server_cancel = cancel.clone();
        let server_task = tracker.spawn(async move {
            let result = server::serve(listener, router, server_cancel.clone()).await;
            if let Err(err) = &result {
                tracing::error!("HTTP server error: {}", err);
            }
            server_cancel.cancel();
            result
        });
        tracker.close();

        tokio::select! {
            Some(signal) = signals.recv() => tracing::info!("Received signal: {}", signal),
            _ = cancel.cancelled() => tracing::warn!("A task stopped on its own, shutting down"),
        }
        cancel.cancel();

        let exit = tokio::select! {
            _ = tracker.wait() => Exit::Clean,
            _ = tokio::time::sleep(grace) => {
                tracing::warn!("Tasks still running after {:?}, forcing exit", grace);
                Exit::Forced
            }
            Some(signal) = signals.recv() => {
                tracing::warn!("Received second signal ({}), forcing exit", signal);
                Exit::Forced
            }
        };

        let exit = match exit {
            Exit::Clean => {
                let acquisition_ok = matches!(acquisition_task.await, Ok(Ok(())));
                let server_ok = matches!(server_task.await, Ok(Ok(())));
                if acquisition_ok && server_ok {
                    Exit::Clean
                } else {
                    Exit::Failed
                }
            }
            other => other,
        };

        if let Err(err) = controller.close() {
            tracing::warn!("Failed to close device: {}", err);
        }
        exit
    }
}
