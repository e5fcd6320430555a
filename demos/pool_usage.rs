//! Example demonstrating connection pool usage against a local echo server
//!
//! This example shows how to:
//! 1. Configure a pool with min/max bounds
//! 2. Share one pool between concurrent tasks
//! 3. Return connections with a guard or explicitly
//! 4. Monitor pool statistics
//!
//! Run with:
//! ```
//! RUST_LOG=duplex_pool=debug cargo run --example pool_usage
//! ```

use duplex_pool::{ConnectionPool, PoolConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

async fn run_echo_server(listener: TcpListener) {
    while let Ok((mut socket, _)) = listener.accept().await {
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        if socket.write_all(&buf[..n]).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("duplex_pool=info".parse()?))
        .init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(run_echo_server(listener));

    // Keep two connections warm, never open more than four
    let pool = ConnectionPool::tcp("127.0.0.1", port, PoolConfig::new(2, 4));

    // Eight workers share four connections
    let mut workers = Vec::new();
    for worker in 0..8 {
        let pool = pool.clone();
        workers.push(tokio::spawn(async move {
            for round in 0..5 {
                let mut conn = pool.get().await?;
                let msg = format!("worker {} round {}", worker, round);
                conn.write_all(msg.as_bytes()).await?;

                let mut reply = vec![0u8; msg.len()];
                conn.read_exact(&mut reply).await?;
                assert_eq!(reply, msg.as_bytes());
                // Guard drop puts the connection back
            }
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
        }));
    }

    for worker in workers {
        if let Err(e) = worker.await? {
            return Err(e.to_string().into());
        }
    }

    // Explicit checkout and release
    let conn = pool.acquire().await?;
    info!(id = %conn.id(), use_count = conn.use_count(), "Explicit checkout");
    pool.release(conn)?;

    let stats = pool.stats();
    info!(
        size = pool.size(),
        idle = stats.idle,
        created = stats.total_created,
        reused = stats.total_reused,
        stale = stats.stale_evicted,
        "Pool statistics"
    );

    pool.clear().await;
    info!(size = pool.size(), "Pool cleared");

    Ok(())
}
