//! `serve` and `check` subcommands.
//!
//! Loads the mapping file, starts the supervisor and the admin endpoint, and
//! turns SIGINT/SIGTERM into the shutdown signal. Returns once every forwarder
//! has stopped.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::admin;
use crate::cli::{CheckArgs, ServeArgs};
use crate::common::format_duration;
use crate::config::{FileStore, Mapping, MappingStore};
use crate::error::{Error, Result};
use crate::supervisor::{Supervisor, SupervisorOptions};

/// Runs the forwarder until a signal or the admin endpoint requests shutdown.
pub async fn run_server(args: &ServeArgs) -> Result<()> {
    let store = Arc::new(FileStore::new(&args.config));
    let mappings = store.load()?;

    let admin_listener = if args.no_admin {
        None
    } else {
        Some(admin::bind(&args.admin_listen).await?)
    };
    let admin_addr = admin_listener.as_ref().and_then(|l| l.local_addr().ok());

    print_startup_message(args, &mappings, admin_addr);

    let options = SupervisorOptions {
        drain_timeout: args.drain_timeout,
        connect_timeout: args.connect_timeout,
        buffer_size: args.buffer_size,
    };
    let shutdown = CancellationToken::new();
    let supervisor = Arc::new(Supervisor::new(store, options, shutdown.clone()));

    let signals = tokio::spawn(watch_signals(shutdown));

    let admin_task = match launch(&supervisor, mappings, admin_listener).await {
        Ok(task) => task,
        Err(e) => {
            signals.abort();
            return Err(e);
        }
    };

    supervisor.wait().await;
    signals.abort();

    if let Some(task) = admin_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "admin endpoint error"),
            Err(e) => tracing::error!(error = %e, "admin task panicked"),
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Applies the initial mappings, then starts serving the admin endpoint.
///
/// Admin requests are only served after the initial start, so a replace always
/// lands on top of the file's mappings.
async fn launch(
    supervisor: &Arc<Supervisor>,
    mappings: Vec<Mapping>,
    admin_listener: Option<TcpListener>,
) -> Result<Option<JoinHandle<Result<()>>>> {
    match supervisor.start(mappings).await {
        Ok(report) => tracing::info!(
            started = report.started.len(),
            failed = report.failed.len(),
            "forwarders started"
        ),
        Err(Error::ShuttingDown) => {
            tracing::info!("shutdown requested before forwarders started");
        }
        Err(e) => return Err(e),
    }

    Ok(admin_listener
        .map(|listener| tokio::spawn(admin::serve(listener, Arc::clone(supervisor)))))
}

/// Loads and validates a configuration file, printing its mappings.
pub fn run_check(args: &CheckArgs) -> Result<()> {
    let store = FileStore::new(&args.config);
    let mappings = store.load()?;

    println!("{}: {} mapping(s)", store.path().display(), mappings.len());
    for mapping in &mappings {
        println!("  {}", mapping);
    }
    Ok(())
}

/// Cancels `shutdown` on SIGINT or SIGTERM.
async fn watch_signals(shutdown: CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        received = wait_for_signal() => match received {
            Ok(name) => {
                tracing::info!("Received {}, initiating graceful shutdown...", name);
                shutdown.cancel();
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install signal handlers");
            }
        },
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        ctrl_c = tokio::signal::ctrl_c() => ctrl_c.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "Ctrl-C")
}

/// Prints the startup message.
fn print_startup_message(args: &ServeArgs, mappings: &[Mapping], admin_addr: Option<SocketAddr>) {
    eprintln!("Starting portfwd...");
    eprintln!("  Config: {}", args.config.display());
    match admin_addr {
        Some(addr) => eprintln!("  Admin: http://{}", addr),
        None => eprintln!("  Admin: disabled"),
    }
    eprintln!("  Drain Timeout: {}", format_duration(args.drain_timeout));
    if let Some(timeout) = args.connect_timeout {
        eprintln!("  Connect Timeout: {}", format_duration(timeout));
    }
    eprintln!("  Buffer Size: {}", args.buffer_size);
    eprintln!("  Mappings: {}", mappings.len());
    for mapping in mappings {
        eprintln!("    Port forwarding from {} to {}", mapping.remote, mapping.local);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigDocument;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn put_config(addr: SocketAddr, body: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "PUT /config HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8_lossy(&response).to_string()
    }

    #[tokio::test]
    async fn test_admin_replace_queued_before_launch_wins_over_file_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let initial = vec![Mapping::new("127.0.0.1:1000", "127.0.0.1:0")];
        let store = Arc::new(FileStore::new(&path));
        store.save(&initial).unwrap();

        let shutdown = CancellationToken::new();
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&store) as Arc<dyn MappingStore>,
            SupervisorOptions::default(),
            shutdown.clone(),
        ));

        let listener = admin::bind("127.0.0.1:0").await.unwrap();
        let admin_addr = listener.local_addr().unwrap();

        // the request sits in the accept backlog until the endpoint serves
        let replacement = Mapping::new("127.0.0.1:2000", "127.0.0.1:0");
        let body = serde_json::to_string(&ConfigDocument {
            mappings: vec![replacement.clone()],
        })
        .unwrap();
        let request = tokio::spawn(async move { put_config(admin_addr, &body).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let admin_task = launch(&supervisor, store.load().unwrap(), Some(listener))
            .await
            .unwrap()
            .unwrap();

        let response = request.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
        assert_eq!(&*supervisor.mappings(), &[replacement.clone()]);
        assert_eq!(store.load().unwrap(), vec![replacement]);

        supervisor.shutdown();
        supervisor.wait().await;
        admin_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_launch_after_shutdown_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path().join("config.yaml")));
        let shutdown = CancellationToken::new();
        let supervisor = Arc::new(Supervisor::new(
            store,
            SupervisorOptions::default(),
            shutdown.clone(),
        ));
        shutdown.cancel();

        let task = launch(
            &supervisor,
            vec![Mapping::new("127.0.0.1:1000", "127.0.0.1:0")],
            None,
        )
        .await
        .unwrap();
        assert!(task.is_none());
        assert!(supervisor.status().await.is_empty());
        supervisor.wait().await;
    }
}
