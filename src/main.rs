use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use logwell::buffer::{InsertBuffer, InsertBufferConfig};
use logwell::config::Config;
use logwell::journal::Journal;
use logwell::model::Envelope;
use logwell::processor::EnvelopeProcessor;
use logwell::rpc::RpcServer;
use logwell::store::{RetentionCleaner, Store, StoreConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("LOGWELL_LOG").unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().json())
        .init();

    let cfg = Config::parse();

    // Store
    let store = Arc::new(
        Store::open(StoreConfig {
            db_path: cfg.db_path_opt(),
            query_timeout: cfg.query_timeout(),
            max_concurrent_queries: cfg.max_concurrent_queries,
        })
        .await?,
    );

    // Journal: recover anything that missed the store before the last stop.
    let journal = if cfg.journal_path.is_empty() {
        None
    } else {
        let journal = Journal::open(&cfg.journal_path)?;
        replay_into_store(&journal, &store).await?;
        Some(journal)
    };

    // Ingest pipeline
    let buffer = Arc::new(InsertBuffer::new(
        store.clone(),
        InsertBufferConfig {
            batch_size: cfg.batch_size,
            flush_interval: cfg.flush_interval(),
            flush_queue_size: cfg.flush_queue_size,
            journal,
        },
    ));
    let processor = Arc::new(EnvelopeProcessor::new(
        &cfg.processor_mode,
        &cfg.default_source,
        &cfg.app,
        buffer.clone(),
    )?);

    // Ingest sources
    let (ingest_shutdown_tx, ingest_shutdown_rx) = watch::channel(false);
    let tcp = TcpListener::bind(&cfg.tcp_listen).await?;
    tracing::info!(addr = %cfg.tcp_listen, "tcp ingest listening");
    let tcp_task = tokio::spawn(tcp_ingest(
        tcp,
        processor.clone(),
        ingest_shutdown_rx.clone(),
    ));
    let stdin_task = cfg.stdin_ingest.then(|| {
        tokio::spawn(read_lines(
            tokio::io::stdin(),
            processor.clone(),
            ingest_shutdown_rx.clone(),
            "stdin",
        ))
    });

    // Read surface and housekeeping
    let cleaner = RetentionCleaner::spawn(store.clone(), cfg.retention_days);
    let rpc = RpcServer::start(store.clone(), &cfg.socket_path).await?;

    tracing::info!("logwell started");
    shutdown_signal().await;

    // Orderly stop: sources first, then the read surface, then the pipeline.
    let _ = ingest_shutdown_tx.send(true);
    let _ = tcp_task.await;
    if let Some(task) = stdin_task {
        let _ = task.await;
    }
    rpc.stop().await;
    if let Some(cleaner) = &cleaner {
        cleaner.stop().await;
    }
    buffer.stop().await;
    store.close().await;

    tracing::info!("logwell stopped");
    Ok(())
}

/// Insert uncommitted journal entries into the store, then advance the
/// committed pointer past them.
async fn replay_into_store(journal: &Journal, store: &Store) -> anyhow::Result<()> {
    let mut records = Vec::new();
    let mut max_seq = 0;
    journal.replay(|seq, record| {
        max_seq = seq;
        records.push(record);
        Ok(())
    })?;
    if records.is_empty() {
        return Ok(());
    }
    store.insert_log_batch(&records).await?;
    journal.commit(max_seq)?;
    tracing::info!(count = records.len(), "recovered journaled records");
    Ok(())
}

async fn tcp_ingest(
    listener: TcpListener,
    processor: Arc<EnvelopeProcessor>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(?peer, "ingest connection accepted");
                    tokio::spawn(read_lines(
                        stream,
                        processor.clone(),
                        shutdown_rx.clone(),
                        "tcp",
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "ingest accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn read_lines<R>(
    reader: R,
    processor: Arc<EnvelopeProcessor>,
    mut shutdown_rx: watch::Receiver<bool>,
    source: &'static str,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    processor
                        .process_envelope(Envelope {
                            source: source.to_string(),
                            line,
                        })
                        .await;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, source, "ingest read error");
                    break;
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
