mod host;
mod plugin_commands;

use std::sync::Arc;

use {
    clap::{Parser, Subcommand},
    harbor_gateway::state::GatewayState,
    harbor_plugins::{AutoConfirm, ResourceResolver},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "harbor", about = "Harbor plugin host", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Address to bind to (overrides config value).
    #[arg(long, global = true)]
    bind: Option<String>,
    /// Port to listen on (overrides config value).
    #[arg(long, global = true)]
    port: Option<u16>,
    /// Custom config directory (overrides default ~/.config/harbor/).
    #[arg(long, global = true, env = "HARBOR_CONFIG_DIR")]
    config_dir: Option<std::path::PathBuf>,
    /// Custom data directory (overrides default data dir).
    #[arg(long, global = true, env = "HARBOR_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the plugin host server (default when no subcommand is provided).
    Serve,
    /// Plugin management.
    Plugins {
        #[command(subcommand)]
        action: plugin_commands::PluginAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "harbor starting");

    // Directory overrides must land before the config is located.
    if let Some(ref dir) = cli.config_dir {
        harbor_config::set_config_dir(dir.clone());
    }
    if let Some(ref dir) = cli.data_dir {
        harbor_config::set_data_dir(dir.clone());
    }
    let config = harbor_config::apply_env_overrides(harbor_config::discover_and_load());

    match cli.command {
        None | Some(Commands::Serve) => {
            let bind = cli.bind.unwrap_or_else(|| config.server.bind.clone());
            let port = cli.port.unwrap_or(config.server.port);

            // The presentation process confirms installs on its own side.
            let host = host::start_host(&config, Arc::new(AutoConfirm)).await?;
            let state = GatewayState::new(host.bridge, ResourceResolver::new(host.plugins_root));
            harbor_gateway::server::start_gateway(&bind, port, state).await
        },
        Some(Commands::Plugins { action }) => {
            plugin_commands::handle_plugins(action, &config).await
        },
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, plugin_commands::PluginAction};

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["harbor", "--port", "9000"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(9000));
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn install_takes_many_specifiers() {
        let cli =
            Cli::try_parse_from(["harbor", "plugins", "install", "-y", "a", "@s/b@1.0.0"]).unwrap();
        match cli.command {
            Some(Commands::Plugins {
                action: PluginAction::Install { specifiers, yes },
            }) => {
                assert!(yes);
                assert_eq!(specifiers, ["a", "@s/b@1.0.0"]);
            },
            _ => panic!("expected plugins install"),
        }
    }

    #[test]
    fn install_requires_a_specifier() {
        assert!(Cli::try_parse_from(["harbor", "plugins", "install"]).is_err());
    }
}
