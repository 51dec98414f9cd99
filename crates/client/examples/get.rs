//! Fetches a few paths over one pipelined connection.
//!
//! ```text
//! cargo run --example get -- 127.0.0.1:8080 / /a /b
//! ```

use std::time::Duration;

use micro_client::handler::buffered;
use micro_client::protocol::RequestDescriptor;
use micro_client::{Client, ClientConfig, Dispatch, RetryDispatcher, RetryPolicy};
use tokio::net::TcpStream;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::DEBUG).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:8080".to_string());
    let mut paths: Vec<String> = args.collect();
    if paths.is_empty() {
        paths.push("/".to_string());
    }

    let config = ClientConfig::default().pipelining(paths.len()).headers_timeout(Duration::from_secs(10)).authority(&addr);
    let client = Client::connect(TcpStream::connect(addr.clone()), config);
    let retrying = RetryDispatcher::new(client.clone(), RetryPolicy::default().max_retries(2));

    let mut pending = Vec::new();
    for path in paths {
        let (handler, response) = buffered();
        match retrying.dispatch(RequestDescriptor::get(path.clone()), Box::new(handler)) {
            Ok(()) => pending.push((path, response)),
            Err(e) => error!(path, cause = %e, "request rejected"),
        }
    }

    for (path, response) in pending {
        match response.await {
            Ok(Ok(response)) => {
                info!(path, status = %response.head.status(), body_len = response.body.len(), "response received");
            }
            Ok(Err(e)) => error!(path, cause = %e, "request failed"),
            Err(_) => error!(path, "handler dropped without a result"),
        }
    }

    client.close();
    client.closed().await;
    info!(pipelining = client.pipelining(), "connection closed");
}
