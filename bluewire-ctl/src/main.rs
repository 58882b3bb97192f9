/*!
 * Bluewire Control
 * Command line front end for bluewired
 */

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

mod client;
mod output;

use client::{AdapterUpdate, BluewireClient, Decision, Request, Response, Visibility};

#[derive(Parser)]
#[command(name = "bluewire")]
#[command(about = "Bluewire Bluetooth Daemon Control")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Daemon socket path
    #[arg(short, long, default_value_t = client::default_socket_path())]
    socket: String,

    /// Print raw JSON responses
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show whether the Bluetooth services are online
    Status,
    /// List known devices
    Devices,
    /// Show one device by address
    Device { address: String },
    /// Start discovering devices
    Discover {
        /// Stop automatically after this many milliseconds, 0 runs until stopped
        #[arg(short, long, default_value_t = 10000)]
        timeout_ms: u32,
    },
    /// Stop discovering devices
    StopDiscovery,
    /// List adapters
    Adapters,
    /// Change adapter settings
    Adapter {
        /// Adapter path, e.g. /org/bluez/hci0
        ubi: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        powered: Option<bool>,
        #[arg(long, value_enum)]
        visibility: Option<VisibilityArg>,
        /// Minutes of temporary visibility
        #[arg(long, default_value_t = 3)]
        minutes: u32,
        /// Start from default settings instead of the current ones
        #[arg(long)]
        defaults: bool,
    },
    /// List OBEX sessions
    Sessions,
    /// List agent requests waiting for a decision
    Requests,
    /// Answer a pending agent request
    Resolve {
        id: Uuid,
        #[arg(value_enum)]
        decision: DecisionArg,
    },
    /// Show what can be done with a device
    Actions { address: String },
    /// Stop the daemon
    Shutdown,
}

#[derive(Clone, Copy, ValueEnum)]
enum VisibilityArg {
    Hidden,
    Always,
    Temporary,
}

#[derive(Clone, Copy, ValueEnum)]
enum DecisionArg {
    Deny,
    Accept,
    Trust,
}

impl From<DecisionArg> for Decision {
    fn from(arg: DecisionArg) -> Self {
        match arg {
            DecisionArg::Deny => Decision::Deny,
            DecisionArg::Accept => Decision::Accept,
            DecisionArg::Trust => Decision::AcceptAndTrust,
        }
    }
}

fn request_for(command: Commands) -> Request {
    match command {
        Commands::Status => Request::IsOnline,
        Commands::Devices => Request::AllDevices,
        Commands::Device { address } => Request::Device { address },
        Commands::Discover { timeout_ms } => Request::StartDiscovering { timeout_ms },
        Commands::StopDiscovery => Request::StopDiscovering,
        Commands::Adapters => Request::Adapters,
        Commands::Adapter {
            ubi,
            name,
            powered,
            visibility,
            minutes,
            defaults,
        } => Request::SetAdapter {
            ubi,
            update: AdapterUpdate {
                name,
                powered,
                visibility: visibility.map(|visibility| match visibility {
                    VisibilityArg::Hidden => Visibility::Hidden,
                    VisibilityArg::Always => Visibility::AlwaysVisible,
                    VisibilityArg::Temporary => Visibility::Temporary { minutes },
                }),
                defaults,
            },
        },
        Commands::Sessions => Request::Sessions,
        Commands::Requests => Request::PendingRequests,
        Commands::Resolve { id, decision } => Request::Resolve {
            id,
            decision: decision.into(),
        },
        Commands::Actions { address } => Request::Actions { address },
        Commands::Shutdown => Request::Shutdown,
    }
}

/// Text to print for a response, or the error to exit with when the daemon refused.
fn outcome(response: &Response, json: bool) -> Result<String> {
    if let Response::Error { message } = response {
        bail!("bluewired refused the request: {}", message);
    }
    if json {
        Ok(serde_json::to_string_pretty(response)?)
    } else {
        Ok(output::render(response))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = BluewireClient::new(cli.socket);

    let response = client.send_request(&request_for(cli.command)).await?;
    println!("{}", outcome(&response, cli.json)?);
    Ok(())
}
