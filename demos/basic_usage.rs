//! Basic usage example: a pool built from configuration
//!
//! Reads the endpoint from a YAML file when a path is given, otherwise from
//! POOL_* environment variables (a `.env` file is honoured).
//!
//! Run with:
//! ```
//! POOL_HOST=127.0.0.1 POOL_PORT=6379 cargo run --example basic_usage
//! cargo run --example basic_usage -- pool.yaml
//! ```

use duplex_pool::{config, ConnectionPool};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let path = std::env::args().nth(1);
    let config = config::load_config(path.as_deref())?;
    println!("Endpoint: {:?}", config.endpoint);

    let pool = ConnectionPool::from_config(&config);

    // Send one line and print the first line of the reply
    let mut conn = pool.get().await?;
    conn.write_all(b"PING\r\n").await?;

    let mut line = String::new();
    BufReader::new(&mut *conn).read_line(&mut line).await?;
    println!("Reply: {}", line.trim_end());
    drop(conn);

    println!("Pool size: {}", pool.size());
    pool.clear().await;

    Ok(())
}
