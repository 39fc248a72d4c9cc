use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pipewright_core::{init_logging, AppDirs, Config, Connector, Manifest, ManifestEntry, Provisioner};
use pipewright_core::manifest::load_steps_file;
use pipewright_plugin::{LaunchConfig, RemoteConnector, RemoteProvisioner};
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "pipewright", version, about = "Drive CI/CD and infrastructure plugins")]
struct Cli {
    /// Plugin manifest path
    #[arg(long, global = true, default_value = "pipewright.yaml")]
    manifest: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect a repository to its CI/CD system
    Connect(ConnectorArgs),
    /// Create a trigger on the connected repository
    Trigger(ConnectorArgs),
    /// Generate the pipeline script for a steps file
    Generate(GenerateArgs),
    /// Parse configuration and materialize a provisioner plugin
    Setup(ProvisionerArgs),
    /// Print a provisioner plugin's output values
    Output(ProvisionerArgs),
    /// Tear a provisioner plugin down
    Destroy(ProvisionerArgs),
    /// Plugin management commands
    #[command(subcommand)]
    Plugins(PluginsCommand),
}

#[derive(Debug, Parser, Clone)]
struct ConnectorArgs {
    /// Plugin id from the manifest
    #[arg(long)]
    plugin: String,
    /// Steps file describing the pipeline
    #[arg(long)]
    steps: PathBuf,
}

#[derive(Debug, Parser, Clone)]
struct GenerateArgs {
    #[command(flatten)]
    connector: ConnectorArgs,
    /// Write the generated script here instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Parser, Clone)]
struct ProvisionerArgs {
    /// Plugin id from the manifest
    #[arg(long)]
    plugin: String,
}

#[derive(Debug, Subcommand)]
enum PluginsCommand {
    /// List plugins declared in the manifest
    List,
}

fn launch_config(entry: &ManifestEntry, config: &Config) -> LaunchConfig {
    let mut launch = LaunchConfig::new(&entry.executable);
    launch.args = entry.args.clone();
    launch.call_timeout = config.call_timeout();
    launch
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = AppDirs::discover()?;
    let config = Config::load_or_default(&dirs)?;
    let _logging = init_logging(&config.logging, &dirs)?;

    let manifest = Manifest::load(&cli.manifest)
        .with_context(|| format!("loading manifest {}", cli.manifest.display()))?;

    match cli.command {
        Command::Plugins(PluginsCommand::List) => {
            print_plugins(&manifest);
            Ok(())
        }
        Command::Connect(args) => {
            let (connector, steps) = launch_connector(&manifest, &config, &args)?;
            let outcome = connector.connect_repo(&steps)?;
            connector.stop();
            if outcome.is_pending() {
                println!("Action required before the connection is usable:");
                println!("  {}", outcome.action_url);
            } else {
                println!("Repository {} connected.", steps.repo_url);
            }
            Ok(())
        }
        Command::Trigger(args) => {
            let (connector, steps) = launch_connector(&manifest, &config, &args)?;
            connector.create_trigger(&steps)?;
            connector.stop();
            println!("Trigger created for {}.", steps.repo_url);
            Ok(())
        }
        Command::Generate(args) => {
            let (connector, steps) = launch_connector(&manifest, &config, &args.connector)?;
            let file = connector.generate_script(&steps)?;
            connector.stop();
            match args.out {
                Some(path) => {
                    std::fs::write(&path, file.as_bytes())
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Pipeline script written to {}.", path.display());
                }
                None => {
                    std::io::stdout().write_all(file.as_bytes())?;
                }
            }
            Ok(())
        }
        Command::Setup(args) => {
            let (provisioner, entry) = launch_provisioner(&manifest, &config, &args.plugin)?;
            provisioner.parse_config(&entry.plugin.config)?;
            provisioner.setup_plugin(&entry.descriptor())?;
            provisioner.stop();
            println!("Plugin {} set up.", entry.id);
            Ok(())
        }
        Command::Output(args) => {
            let (provisioner, entry) = launch_provisioner(&manifest, &config, &args.plugin)?;
            provisioner.parse_config(&entry.plugin.config)?;
            let output = provisioner.get_output(&entry.descriptor())?;
            provisioner.stop();
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Command::Destroy(args) => {
            let (provisioner, entry) = launch_provisioner(&manifest, &config, &args.plugin)?;
            provisioner.parse_config(&entry.plugin.config)?;
            provisioner.destroy(&entry.descriptor())?;
            provisioner.stop();
            println!("Plugin {} destroyed.", entry.id);
            Ok(())
        }
    }
}

fn launch_connector(
    manifest: &Manifest,
    config: &Config,
    args: &ConnectorArgs,
) -> Result<(RemoteConnector, pipewright_core::StepsFile)> {
    let entry = manifest.find(&args.plugin)?;
    let steps = load_steps_file(&args.steps)
        .with_context(|| format!("loading steps file {}", args.steps.display()))?;
    tracing::info!(plugin = %entry.id, executable = %entry.executable.display(), "launching connector");
    let connector = RemoteConnector::launch(launch_config(entry, config))
        .with_context(|| format!("launching plugin {}", entry.id))?;
    Ok((connector, steps))
}

fn launch_provisioner<'m>(
    manifest: &'m Manifest,
    config: &Config,
    plugin_id: &str,
) -> Result<(RemoteProvisioner, &'m ManifestEntry)> {
    let entry = manifest.find(plugin_id)?;
    tracing::info!(plugin = %entry.id, executable = %entry.executable.display(), "launching provisioner");
    let provisioner = RemoteProvisioner::launch(launch_config(entry, config))
        .with_context(|| format!("launching plugin {}", entry.id))?;
    Ok((provisioner, entry))
}

fn print_plugins(manifest: &Manifest) {
    if manifest.plugins.is_empty() {
        println!("No plugins declared. Add plugins to the manifest first.");
        return;
    }

    for entry in &manifest.plugins {
        println!(
            "{} {} ({}) -> {}",
            entry.id,
            entry.version,
            entry.repo_url,
            entry.executable.display()
        );
    }
}
