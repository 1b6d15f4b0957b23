mod commands;
mod config;
mod ipam;
mod logging;
mod net;

use std::io::Read;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use commands::CmdArgs;
use net::NetResult;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Container network attach/detach agent", long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Attach a container to the bridge network
    Add {
        #[clap(long, help = "Path to the container's network namespace")]
        netns: String,

        #[clap(long, default_value = "eth0", help = "Interface name inside the container")]
        ifname: String,

        #[clap(long, help = "Container identifier")]
        container_id: String,

        #[clap(long, help = "Network config file (defaults to stdin)")]
        config: Option<PathBuf>,
    },
    /// Detach a container and release its allocation
    Del {
        #[clap(long, default_value = "", help = "Path to the container's network namespace")]
        netns: String,

        #[clap(long, default_value = "eth0", help = "Interface name inside the container")]
        ifname: String,

        #[clap(long, help = "Container identifier")]
        container_id: String,

        #[clap(long, help = "Network config file (defaults to stdin)")]
        config: Option<PathBuf>,
    },
}

fn read_raw_config(path: Option<&PathBuf>) -> NetResult<Vec<u8>> {
    match path {
        Some(path) => Ok(std::fs::read(path)?),
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            Ok(buf)
        }
    }
}

#[derive(serde::Serialize)]
struct ErrorReport<'a> {
    code: i32,
    msg: &'a str,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        let code = e.exit_code();
        let msg = e.to_string();
        let report = ErrorReport { code, msg: &msg };
        let json = serde_json::to_string(&report)
            .unwrap_or_else(|_| format!("{{\"code\": {}, \"msg\": \"error\"}}", code));
        eprintln!("{}", json);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> NetResult<()> {
    let (command, netns, ifname, container_id, config) = match cli.command {
        Commands::Add {
            netns,
            ifname,
            container_id,
            config,
        } => ("ADD", netns, ifname, container_id, config),
        Commands::Del {
            netns,
            ifname,
            container_id,
            config,
        } => ("DEL", netns, ifname, container_id, config),
    };

    let raw_config = read_raw_config(config.as_ref())?;
    let conf = config::load(&raw_config)?;
    logging::init(conf.log_to_file.as_deref())?;

    let args = CmdArgs {
        container_id,
        netns,
        if_name: ifname,
        raw_config,
    };

    info!(
        command,
        network = %conf.name,
        container_id = %args.container_id,
        netns = %args.netns,
        "invocation started"
    );

    match command {
        "ADD" => {
            let result = commands::add::cmd_add(&conf, &args).await.map_err(|e| {
                error!(error = %e, "attach failed");
                e
            })?;
            // stdout is the result channel
            let json = serde_json::to_string_pretty(&result)
                .map_err(|e| net::NetError::Config(format!("failed to encode result: {}", e)))?;
            println!("{}", json);
        }
        _ => {
            commands::del::cmd_del(&conf, &args).await.map_err(|e| {
                error!(error = %e, "detach failed");
                e
            })?;
        }
    }

    info!(command, container_id = %args.container_id, "invocation finished");
    Ok(())
}
