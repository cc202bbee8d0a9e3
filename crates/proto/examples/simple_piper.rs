//! Simple SSH piper example
//!
//! Accepts SSH clients and pipes each one to an upstream chosen from the
//! downstream username: `<user>@<host>:<port>` routes to `host:port` and
//! authenticates as `user`; a bare username routes to the fallback upstream.
//!
//! Usage:
//!   cargo run --example simple_piper [bind_address] [fallback_upstream]
//!
//! Example:
//!   cargo run --example simple_piper 127.0.0.1:2222 127.0.0.1:22
//!
//! Then connect with any SSH client:
//!   ssh -p 2222 alice@127.0.0.1

use std::env;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use weir_platform::{WeirError, WeirResult};
use weir_proto::ssh::keys::Ed25519Keypair;
use weir_proto::ssh::piper::{ConnMetadata, PiperConfig, SshPiperConn, UpstreamProvider};

/// Routes `user@host:port` usernames; everything else goes to the fallback.
struct UserSuffixRouter {
    fallback: String,
}

#[async_trait::async_trait]
impl UpstreamProvider for UserSuffixRouter {
    async fn find_upstream(
        &self,
        conn: &ConnMetadata,
    ) -> WeirResult<(TcpStream, Option<String>)> {
        let (user, target) = match conn.user().split_once('@') {
            Some((user, host)) => (Some(user.to_string()), host.to_string()),
            None => (None, self.fallback.clone()),
        };

        println!("  routing {} -> {}", conn.user(), target);
        let socket = TcpStream::connect(&target).await.map_err(WeirError::Io)?;
        Ok((socket, user))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let bind_addr = args.get(1).map(String::as_str).unwrap_or("127.0.0.1:2222");
    let fallback = args.get(2).map(String::as_str).unwrap_or("127.0.0.1:22");

    let mut config = PiperConfig::new(Arc::new(UserSuffixRouter {
        fallback: fallback.to_string(),
    }));
    config.add_host_key(Arc::new(Ed25519Keypair::generate()));
    let config = Arc::new(config);

    let listener = TcpListener::bind(bind_addr).await?;
    println!("SSH piper listening on {}", bind_addr);
    println!("  fallback upstream: {}", fallback);

    loop {
        let (stream, peer) = listener.accept().await?;
        println!("connection from {}", peer);

        let config = config.clone();
        tokio::spawn(async move {
            match SshPiperConn::new(stream, &config).await {
                Ok(conn) => {
                    let cause = conn.wait().await;
                    println!("session from {} ended: {}", peer, cause);
                }
                Err(e) => {
                    println!("session from {} failed: {}", peer, e);
                }
            }
        });
    }
}
