//! CLI commands for plugin management.

use std::{
    io::{self, BufRead, Write},
    sync::Arc,
};

use {
    async_trait::async_trait,
    clap::Subcommand,
    harbor_config::HarborConfig,
    harbor_plugins::{
        AutoConfirm, BridgeEvent, InstallConfirmer, PluginBridge, PluginRecord, UpdateStatus,
    },
    harbor_protocol::events,
    tokio::sync::broadcast::{self, error::TryRecvError},
};

use crate::host::start_host;

#[derive(Subcommand)]
pub enum PluginAction {
    /// List registered plugins.
    List {
        /// Show only active plugins.
        #[arg(long)]
        active: bool,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Install plugins from the registry, a tarball URL, or a local `.tgz`.
    Install {
        /// Package specifiers (`name`, `@scope/name@1.2.0`, `https://…/x.tgz`, `/path/x.tgz`).
        #[arg(required = true)]
        specifiers: Vec<String>,
        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },
    /// Uninstall plugins.
    Remove {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Update plugins to the latest registry version (all when none given).
    Update { names: Vec<String> },
    /// Check for newer versions without downloading anything.
    Check {
        names: Vec<String>,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Activate a plugin.
    Enable { name: String },
    /// Deactivate a plugin.
    Disable { name: String },
}

/// Asks on the terminal before installing.
struct PromptConfirm;

#[async_trait]
impl InstallConfirmer for PromptConfirm {
    async fn confirm_install(&self, specifiers: &[String]) -> bool {
        let question = format!("Install {}? [y/N] ", specifiers.join(", "));
        tokio::task::spawn_blocking(move || {
            eprint!("{question}");
            let _ = io::stderr().flush();
            let mut answer = String::new();
            io::stdin().lock().read_line(&mut answer).is_ok() && is_yes(&answer)
        })
        .await
        .unwrap_or(false)
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn describe(record: &PluginRecord) -> String {
    let status = if record.active {
        "active"
    } else {
        "inactive"
    };
    let label = record.product_name.as_deref().unwrap_or(&record.name);
    let mut line = format!("  {label} ({}) {} [{status}]", record.name, record.version);
    if let Some(desc) = record.description.as_deref().filter(|d| !d.is_empty()) {
        line.push_str(&format!(" - {desc}"));
    }
    line
}

/// Print failure events the bridge emitted during a command; returns how many.
///
/// Events dropped because the receiver lagged count as failures.
fn report_failures(rx: &mut broadcast::Receiver<BridgeEvent>) -> usize {
    let mut failures: usize = 0;
    loop {
        let event = match rx.try_recv() {
            Ok(event) => event,
            Err(TryRecvError::Lagged(skipped)) => {
                let skipped = usize::try_from(skipped).unwrap_or(usize::MAX);
                eprintln!("  ✗ {skipped} plugin event(s) were dropped");
                failures = failures.saturating_add(skipped);
                continue;
            },
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        };
        if event.event == events::INSTALL_FAILED || event.event == events::OPERATION_FAILED {
            failures += 1;
            eprintln!(
                "  ✗ {} {}: {}",
                event.payload["operation"].as_str().unwrap_or("operation"),
                event.payload["item"].as_str().unwrap_or_default(),
                event.payload["message"].as_str().unwrap_or_default(),
            );
        }
    }
    failures
}

fn bail_on_failures(failures: usize) -> anyhow::Result<()> {
    if failures > 0 {
        anyhow::bail!("{failures} plugin operation(s) failed");
    }
    Ok(())
}

pub async fn handle_plugins(action: PluginAction, config: &HarborConfig) -> anyhow::Result<()> {
    let confirmer: Arc<dyn InstallConfirmer> = match &action {
        PluginAction::Install { yes: false, .. } if config.plugins.confirm_installs => {
            Arc::new(PromptConfirm)
        },
        _ => Arc::new(AutoConfirm),
    };
    let host = start_host(config, confirmer).await?;
    let bridge: &PluginBridge = &host.bridge;
    // Listing tolerates an unavailable host; everything else should say why.
    if !matches!(action, PluginAction::List { .. }) {
        bridge.store()?;
    }
    let mut rx = bridge.subscribe();

    match action {
        PluginAction::List { active, json } => {
            let records = if active {
                bridge.list_active()?
            } else {
                bridge.list_all()?
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No plugins installed.");
                println!("Plugins root: {}", host.plugins_root.display());
            } else {
                for record in &records {
                    println!("{}", describe(record));
                }
            }
        },
        PluginAction::Install { specifiers, .. } => {
            let installed = bridge.install(specifiers).await?;
            for record in &installed {
                println!("Installed {} {}", record.name, record.version);
            }
            bail_on_failures(report_failures(&mut rx))?;
        },
        PluginAction::Remove { names } => {
            bridge.uninstall(names.clone(), false).await?;
            let failures = report_failures(&mut rx);
            if failures < names.len() {
                println!("Removed {} plugin(s).", names.len() - failures);
            }
            bail_on_failures(failures)?;
        },
        PluginAction::Update { names } => {
            let names = if names.is_empty() {
                bridge.list_all()?.into_iter().map(|r| r.name).collect()
            } else {
                names
            };
            let updated = bridge.update(names, false).await?;
            if updated.is_empty() {
                println!("All plugins are up to date.");
            }
            for record in &updated {
                println!("Updated {} to {}", record.name, record.version);
            }
            bail_on_failures(report_failures(&mut rx))?;
        },
        PluginAction::Check { names, json } => {
            let names = (!names.is_empty()).then_some(names);
            let statuses = bridge.check_updates(names).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                for (name, status) in &statuses {
                    match status {
                        UpdateStatus::Available(info) => {
                            println!("  {name}: {} available", info.version)
                        },
                        UpdateStatus::UpToDate => println!("  {name}: up to date"),
                    }
                }
            }
            bail_on_failures(report_failures(&mut rx))?;
        },
        PluginAction::Enable { name } => {
            let record = bridge.set_active(&name, true).await?;
            println!("Enabled {}", record.name);
        },
        PluginAction::Disable { name } => {
            let record = bridge.set_active(&name, false).await?;
            println!("Disabled {}", record.name);
        },
    }
    Ok(())
}
