// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tokio::{runtime, signal};
use tracing::{error, info};
use wirehub::service::{upgrade_echo_registry, UpgradeEchoHandler};
use wirehub::{
    serve, setup_tracing, AppError, AppResult, ConnectionContext, OtelMetrics, ServerConfig,
};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// print the effective configuration and exit
    PrintConfig,
}

fn main() -> AppResult<()> {
    // load .env before the config reads WIREHUB_ overrides
    dotenv().ok();
    let commandline: CommandLine = CommandLine::parse();

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let config = ServerConfig::set_up_config(config_path)?;
    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let _otel_guard = rt.block_on(setup_tracing(commandline.verbose));

    rt.block_on(async move {
        let listen_address = format!("{}:{}", config.network.ip, config.network.port);
        let listener = TcpListener::bind(&listen_address).await.map_err(|err| {
            let error_msg = format!(
                "Failed to bind server to address: {} - Error: {}",
                listen_address, err
            );
            error!(error_msg);
            AppError::IllegalStateError(error_msg)
        })?;
        info!("echo service binding to {} for listening", listen_address);

        serve(
            listener,
            config,
            upgrade_echo_registry()?,
            |_ctx: &ConnectionContext| UpgradeEchoHandler::default(),
            Arc::new(OtelMetrics::new()),
            async {
                if let Err(err) = signal::ctrl_c().await {
                    error!("failed to listen for ctrl-c: {}", err);
                }
            },
        )
        .await
    })
}
