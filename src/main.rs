//! BugBridge - Bidirectional bug sync with external issue trackers
//!
//! Main entry point for the BugBridge CLI. The CLI manages integrations,
//! field mappings and links; pushes and pulls run inside the host platform,
//! which owns the bug store.

use anyhow::{bail, Context};
use bugbridge::config::{validate_config, BridgeConfig};
use bugbridge::domain::{BugId, ProviderType, Severity, Status, TenantId};
use bugbridge::integration::{IntegrationSummary, ProviderConfig, SyncDirection};
use bugbridge::ledger::ExternalLink;
use bugbridge::mapping::FieldMapping;
use bugbridge::providers::ConnectionCheck;
use bugbridge::sync::{DetachedBugStore, SyncCoordinator, TracingAuditSink};
use bugbridge::vault::SecretCipher;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

/// BugBridge - Link platform bugs to Jira, Trello and Azure DevOps
#[derive(Parser, Debug)]
#[command(name = "bugbridge")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/bugbridge/config.yaml)
    #[arg(short, long)]
    config: Option<String>,

    /// Tenant the command acts on
    #[arg(short, long, env = "BUGBRIDGE_TENANT", default_value = "default")]
    tenant: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file
    Init,

    /// Check the configuration file for errors
    Validate,

    /// Print a new base64 credential encryption key
    Keygen,

    /// Manage provider integrations
    #[command(subcommand)]
    Integrations(IntegrationCommands),

    /// List projects (boards) visible to an integration
    Projects {
        /// Provider (jira, trello, azure-devops)
        provider: ProviderType,
    },

    /// List issue types, lists or work item types of a project
    Categories {
        provider: ProviderType,
        project: String,
    },

    /// Manage status and severity mappings
    #[command(subcommand)]
    Mapping(MappingCommands),

    /// Show bug links
    Links {
        /// Only links of this bug
        #[arg(short, long)]
        bug: Option<String>,

        /// Only links to this provider
        #[arg(short, long)]
        provider: Option<ProviderType>,
    },

    /// Forget the link between a bug and its external item
    Unlink { bug: String, provider: ProviderType },
}

#[derive(Subcommand, Debug)]
enum IntegrationCommands {
    /// Show every provider's integration state
    List,

    /// Start an OAuth handshake and print the authorization URL
    Authorize {
        /// Target selectors as JSON, e.g. '{"provider":"issue_tracker","cloud_id":"..."}'
        #[arg(long)]
        target: String,

        /// Sync direction (push, pull, both)
        #[arg(short, long, default_value = "both")]
        direction: SyncDirection,

        /// Open the URL in a browser
        #[arg(long)]
        open: bool,
    },

    /// Finish an OAuth handshake with the callback's state and code
    Complete {
        #[arg(long)]
        state: String,
        #[arg(long)]
        code: String,
    },

    /// Connect a provider that uses a static API token (Trello)
    ConnectToken {
        #[arg(long)]
        target: String,

        #[arg(long, env = "BUGBRIDGE_PROVIDER_TOKEN", hide_env_values = true)]
        token: String,

        #[arg(short, long, default_value = "both")]
        direction: SyncDirection,
    },

    /// Change target selectors or sync direction
    Reconfigure {
        #[arg(long)]
        target: String,

        #[arg(short, long, default_value = "both")]
        direction: SyncDirection,
    },

    /// Resume syncing an integration
    Enable { provider: ProviderType },

    /// Pause syncing without deleting credentials
    Disable { provider: ProviderType },

    /// Delete an integration and its credentials
    Disconnect { provider: ProviderType },

    /// Check stored credentials against the provider
    Test { provider: ProviderType },
}

#[derive(Subcommand, Debug)]
enum MappingCommands {
    /// Show the current mapping
    Show { provider: ProviderType },

    /// Replace the mapping
    Set {
        provider: ProviderType,

        /// status=external pairs (e.g. open=list1), repeatable
        #[arg(long = "status", value_parser = parse_pair::<Status>)]
        statuses: Vec<(Status, String)>,

        /// severity=external pairs (e.g. high=2), repeatable
        #[arg(long = "severity", value_parser = parse_pair::<Severity>)]
        severities: Vec<(Severity, String)>,
    },
}

fn parse_pair<T>(s: &str) -> Result<(T, String), String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    let key = key.parse::<T>().map_err(|e| e.to_string())?;
    if value.trim().is_empty() {
        return Err(format!("empty external value for '{}'", s));
    }
    Ok((key, value.trim().to_string()))
}

#[tokio::main]
async fn main() {
    // Initialize logging
    if let Err(e) = bugbridge::logging::init() {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli
        .config
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(BridgeConfig::default_path);

    // Commands that don't need a loaded configuration
    match cli.command {
        Commands::Init => return handle_init_command(&config_path),
        Commands::Keygen => {
            println!("{}", SecretCipher::generate_key()?);
            return Ok(());
        }
        _ => {}
    }

    let config = BridgeConfig::load(&config_path).with_context(|| {
        format!(
            "No usable configuration at {}. Run 'bugbridge init' first.",
            config_path.display()
        )
    })?;

    if let Commands::Validate = cli.command {
        return handle_validate_command(&config);
    }

    let coordinator = SyncCoordinator::from_config(
        &config,
        Arc::new(DetachedBugStore),
        Arc::new(TracingAuditSink),
    )
    .context("Failed to start the sync engine")?;
    let tenant = TenantId::new(cli.tenant);

    match cli.command {
        Commands::Init | Commands::Keygen | Commands::Validate => Ok(()),
        Commands::Integrations(cmd) => handle_integration_command(cmd, &coordinator, &tenant).await,
        Commands::Projects { provider } => {
            let projects = coordinator.list_projects(&tenant, provider).await?;
            if projects.is_empty() {
                println!("No projects visible to the {} integration.", provider.display_name());
            }
            for project in projects {
                println!("{:<24} {}", project.id, project.name);
            }
            Ok(())
        }
        Commands::Categories { provider, project } => {
            for category in coordinator.list_categories(&tenant, provider, &project).await? {
                println!("{:<24} {}", category.id, category.name);
            }
            Ok(())
        }
        Commands::Mapping(cmd) => handle_mapping_command(cmd, &coordinator, &tenant),
        Commands::Links { bug, provider } => {
            let links = match bug {
                Some(bug) => {
                    let mut links = coordinator.links_for_bug(&tenant, &BugId::new(bug))?;
                    if let Some(provider) = provider {
                        links.retain(|l| l.provider_type == provider);
                    }
                    links
                }
                None => coordinator.ledger().list(&tenant, provider)?,
            };
            if links.is_empty() {
                println!("No links.");
            }
            for link in &links {
                print_link(link);
            }
            Ok(())
        }
        Commands::Unlink { bug, provider } => {
            if coordinator.unlink(&tenant, &BugId::new(bug.clone()), provider).await? {
                println!("Unlinked {} from {}.", bug, provider.display_name());
            } else {
                println!("{} has no {} link.", bug, provider.display_name());
            }
            Ok(())
        }
    }
}

fn handle_init_command(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        bail!("Configuration already exists at {}", path.display());
    }
    BridgeConfig::new().save(path)?;
    println!("Created {}", path.display());
    println!();
    println!("Next steps:");
    println!("  1. Generate an encryption key:  bugbridge keygen");
    println!("  2. Export it:                   export BUGBRIDGE_SECRET_KEY=<key>");
    println!("  3. Set OAuth client ids under providers.* in the config file");
    Ok(())
}

fn handle_validate_command(config: &BridgeConfig) -> anyhow::Result<()> {
    match validate_config(config) {
        Ok(()) => {
            println!("Configuration is valid.");
            Ok(())
        }
        Err(errors) => {
            for error in &errors {
                eprintln!("  - {}", error);
            }
            bail!("{} configuration error(s)", errors.len())
        }
    }
}

fn parse_target(json: &str) -> anyhow::Result<ProviderConfig> {
    serde_json::from_str(json).context("Invalid --target JSON")
}

async fn handle_integration_command(
    cmd: IntegrationCommands,
    coordinator: &SyncCoordinator,
    tenant: &TenantId,
) -> anyhow::Result<()> {
    let vault = coordinator.vault();

    match cmd {
        IntegrationCommands::List => {
            for summary in vault.list_integrations(tenant)? {
                print_summary(&summary);
            }
        }
        IntegrationCommands::Authorize {
            target,
            direction,
            open,
        } => {
            let request = vault.begin_authorization(tenant, parse_target(&target)?, direction)?;
            println!("Authorize at:");
            println!("  {}", request.url);
            println!();
            println!("Then run:");
            println!(
                "  bugbridge integrations complete --state {} --code <code>",
                request.state
            );
            if open {
                if let Err(e) = open::that(&request.url) {
                    tracing::warn!(error = %e, "Could not open a browser");
                }
            }
        }
        IntegrationCommands::Complete { state, code } => {
            let summary = vault.complete_authorization(&state, &code).await?;
            println!("Connected:");
            print_summary(&summary);
        }
        IntegrationCommands::ConnectToken {
            target,
            token,
            direction,
        } => {
            let config = parse_target(&target)?;
            let adapter = coordinator.adapters().get(config.provider_type())?;
            let summary = vault
                .connect_static_token(tenant, config, &token, direction, adapter.as_ref())
                .await?;
            println!("Connected:");
            print_summary(&summary);
        }
        IntegrationCommands::Reconfigure { target, direction } => {
            print_summary(&vault.reconfigure(tenant, parse_target(&target)?, direction)?);
        }
        IntegrationCommands::Enable { provider } => {
            print_summary(&vault.set_active(tenant, provider, true)?);
        }
        IntegrationCommands::Disable { provider } => {
            print_summary(&vault.set_active(tenant, provider, false)?);
        }
        IntegrationCommands::Disconnect { provider } => {
            if vault.disconnect(tenant, provider)? {
                println!("Disconnected {}. Existing links were kept.", provider.display_name());
            } else {
                println!("No {} integration to disconnect.", provider.display_name());
            }
        }
        IntegrationCommands::Test { provider } => {
            match coordinator.test_connection(tenant, provider).await? {
                ConnectionCheck::Ok { identity_label } => {
                    println!("✓ {} connected as {}", provider.display_name(), identity_label);
                }
                ConnectionCheck::Failed { error } => {
                    bail!("{} connection failed: {}", provider.display_name(), error);
                }
            }
        }
    }
    Ok(())
}

fn handle_mapping_command(
    cmd: MappingCommands,
    coordinator: &SyncCoordinator,
    tenant: &TenantId,
) -> anyhow::Result<()> {
    match cmd {
        MappingCommands::Show { provider } => {
            let mapping = coordinator.mappings().load(tenant, provider)?;
            print_mapping(provider, &mapping);
        }
        MappingCommands::Set {
            provider,
            statuses,
            severities,
        } => {
            if statuses.is_empty() && severities.is_empty() {
                bail!("Give at least one --status or --severity pair");
            }
            let mut mapping = FieldMapping::new();
            for (status, external) in statuses {
                mapping = mapping.with_status(status, external);
            }
            for (severity, external) in severities {
                mapping = mapping.with_severity(severity, external);
            }
            let version = coordinator.mappings().replace(tenant, provider, &mapping)?;
            println!("Saved {} mapping version {}.", provider.display_name(), version);
        }
    }
    Ok(())
}

fn print_summary(summary: &IntegrationSummary) {
    let active = if summary.is_active { "active" } else { "inactive" };
    println!(
        "{:<14} {:<14} {}",
        summary.provider_type.display_name(),
        summary.state.as_str(),
        active
    );
    if let Some(direction) = summary.sync_direction {
        println!("  direction: {}", direction);
    }
    if let Some(expires) = summary.token_expires_at {
        println!("  token expires: {}", expires.format("%Y-%m-%d %H:%M UTC"));
    }
}

fn print_mapping(provider: ProviderType, mapping: &FieldMapping) {
    println!("{} mapping (version {})", provider.display_name(), mapping.version);
    println!();
    println!("Status:");
    for status in Status::ALL {
        let external = mapping.status.forward(status).unwrap_or("-");
        println!("  {:<12} {}", status.as_str(), external);
    }
    println!();
    println!("Severity:");
    for severity in Severity::ALL {
        let external = mapping.severity.forward(severity).unwrap_or("-");
        println!("  {:<12} {}", severity.as_str(), external);
    }
}

fn print_link(link: &ExternalLink) {
    println!(
        "{:<16} {:<14} {:<16} {}",
        link.bug_id.as_str(),
        link.provider_type.display_name(),
        link.external_id,
        link.last_synced_at.format("%Y-%m-%d %H:%M")
    );
    if let Some(ref url) = link.external_url {
        println!("  {}", url);
    }
}
