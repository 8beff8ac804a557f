//! Watch connection command

use anyhow::{anyhow, Result};
use clap::{ArgMatches, Args, Command, FromArgMatches};
use futures_util::future::BoxFuture;
use std::time::{Duration, Instant};

use super::connect_watch;
use crate::cli::{CommandContext, ToolCommand};
use crate::error::ConnectionError;

#[derive(Args, Debug)]
struct ConnectArgs {
    /// Print raw traffic from the watch for this many seconds
    #[arg(short, long, default_value = "0")]
    listen: u64,

    /// Send raw bytes (hex) once connected
    #[arg(long)]
    send: Option<String>,
}

pub struct ConnectCommand;

impl ToolCommand for ConnectCommand {
    fn name(&self) -> &'static str {
        "connect"
    }

    fn about(&self) -> &'static str {
        "Connect to a watch and report the transport in use"
    }

    fn configure(&self, command: Command) -> Command {
        ConnectArgs::augment_args(command)
    }

    fn run<'a>(&'a self, ctx: &'a CommandContext, matches: &'a ArgMatches) -> BoxFuture<'a, Result<()>> {
        Box::pin(cmd_connect(ctx, matches))
    }
}

async fn cmd_connect(ctx: &CommandContext, matches: &ArgMatches) -> Result<()> {
    let args = ConnectArgs::from_arg_matches(matches)?;
    let mut connection = connect_watch(ctx).await?;

    println!("Connected to {}", connection.transport().describe());

    if let Some(hex_data) = &args.send {
        let data = hex::decode(hex_data.trim()).map_err(|e| anyhow!("Invalid hex: {}", e))?;
        connection.send(&data).await?;
        println!("Sent {} bytes", data.len());
    }

    if args.listen == 0 {
        return Ok(());
    }

    println!("Listening for traffic ({}s, Ctrl+C to stop)...\n", args.listen);

    let timeout = Duration::from_secs(args.listen);
    let start = Instant::now();

    while start.elapsed() < timeout {
        match connection.recv_timeout(Duration::from_millis(100)).await {
            Ok(Some(chunk)) => print_traffic(&chunk),
            Ok(None) => {}
            Err(ConnectionError::Closed) => {
                println!("Connection closed by the watch.");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }

    println!("Timeout reached.");
    Ok(())
}

fn print_traffic(chunk: &[u8]) {
    let timestamp = chrono::Local::now().format("%H:%M:%S");
    println!("[{}] Received {} bytes:", timestamp, chunk.len());
    println!("  Hex: {}", hex::encode(chunk));
    println!();
}
