use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use masque::{Config, IdentifierKind, Runtime};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "masque-ctl")]
#[command(author, version, about = "Manage Masque profiles, identifiers and container redirection")]
struct Cli {
    /// Data directory (overrides MASQUE_ROOT and the config file)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Bundle id whose app-scoped identifiers and paths to operate on
    #[arg(short, long, global = true)]
    bundle: Option<String>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create, list, switch and delete profiles
    #[command(subcommand)]
    Profile(ProfileCommand),

    /// Inspect and manage spoofed identifiers of the current profile
    #[command(subcommand)]
    Id(IdCommand),

    /// Show how container paths are redirected
    #[command(subcommand)]
    Path(PathCommand),
}

#[derive(Subcommand, Debug)]
enum ProfileCommand {
    /// List all profiles
    List,

    /// Show the current profile
    Current,

    /// Create a profile with freshly generated identifiers
    Create {
        /// Human readable label
        label: String,

        /// Explicit profile id (a ULID is generated otherwise)
        #[arg(long)]
        id: Option<String>,
    },

    /// Make a profile current, creating it if it does not exist
    Switch { id: String },

    /// Delete a profile and all of its data
    Delete { id: String },
}

#[derive(Subcommand, Debug)]
enum IdCommand {
    /// Print the value the app sees for an identifier
    Get { kind: IdentifierKind },

    /// Store an explicit value for an identifier
    Set { kind: IdentifierKind, value: String },

    /// Start spoofing an identifier
    Enable { kind: IdentifierKind },

    /// Report the real value of an identifier
    Disable { kind: IdentifierKind },

    /// Enabled flag and stored value of every identifier
    Status,

    /// Generate new values for one identifier, or all enabled ones
    Regenerate { kind: Option<IdentifierKind> },
}

#[derive(Subcommand, Debug)]
enum PathCommand {
    /// Translate a container path under the current profile
    Translate { path: PathBuf },

    /// Whether a path would be redirected for the bundle
    Redirectable { path: PathBuf },

    /// Data directory of the bundle inside a profile
    Data {
        /// Profile to use (defaults to the current one)
        #[arg(long)]
        profile: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(root) = cli.root.clone() {
        config.root = root;
    }
    if let Some(bundle) = cli.bundle.clone() {
        config.bundle_id = bundle;
    }
    tracing::debug!("Using data directory {}", config.root.display());

    let runtime = Runtime::start(&config).context("Failed to open profile state")?;

    match cli.command {
        Commands::Profile(cmd) => profile_command(&runtime, cmd, cli.json),
        Commands::Id(cmd) => id_command(&runtime, cmd, cli.json),
        Commands::Path(cmd) => path_command(&runtime, cmd, cli.json),
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn current_profile(runtime: &Runtime) -> Result<String> {
    match runtime.current_profile_id() {
        Some(id) => Ok(id),
        None => bail!("No profile is active. Run `masque-ctl profile switch <id>` first."),
    }
}

fn profile_command(runtime: &Runtime, cmd: ProfileCommand, as_json: bool) -> Result<()> {
    match cmd {
        ProfileCommand::List => {
            let profiles = runtime.list_profiles()?;
            let current = runtime.current_profile_id();
            if as_json {
                return print_json(&json!({ "current": current, "profiles": profiles }));
            }
            if profiles.is_empty() {
                println!("No profiles");
            }
            for profile in profiles {
                let marker = if current.as_deref() == Some(profile.id.as_str()) { "*" } else { " " };
                println!(
                    "{} {}  {}  (created {})",
                    marker,
                    profile.id,
                    profile.label,
                    profile.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        ProfileCommand::Current => {
            let current = runtime.current_profile_id();
            if as_json {
                return print_json(&json!({ "current": current }));
            }
            match current {
                Some(id) => println!("{}", id),
                None => println!("No profile active"),
            }
        }
        ProfileCommand::Create { label, id } => {
            let profile = runtime
                .create_profile(&label, id.as_deref())
                .with_context(|| format!("Failed to create profile '{}'", label))?;
            if as_json {
                return print_json(&json!(profile));
            }
            println!("Created profile {} ({})", profile.id, profile.label);
        }
        ProfileCommand::Switch { id } => {
            let changed = runtime
                .profile_did_change(&id)
                .with_context(|| format!("Failed to switch to profile '{}'", id))?;
            if as_json {
                return print_json(&json!({ "current": id, "changed": changed }));
            }
            if changed {
                println!("Switched to profile {}", id);
            } else {
                println!("Profile {} is already current", id);
            }
        }
        ProfileCommand::Delete { id } => {
            runtime
                .delete_profile(&id)
                .with_context(|| format!("Failed to delete profile '{}'", id))?;
            if as_json {
                return print_json(&json!({ "deleted": id }));
            }
            println!("Deleted profile {}", id);
        }
    }
    Ok(())
}

fn id_command(runtime: &Runtime, cmd: IdCommand, as_json: bool) -> Result<()> {
    match cmd {
        IdCommand::Get { kind } => {
            let value = runtime.current_value_for_identifier(kind)?;
            if as_json {
                return print_json(&json!({ "kind": kind, "value": value }));
            }
            match value {
                Some(value) => println!("{}", value),
                None => println!("({} unavailable)", kind),
            }
        }
        IdCommand::Set { kind, value } => {
            let profile = current_profile(runtime)?;
            runtime
                .store()
                .set_value(kind, runtime.bundle_id(), &profile, &value)
                .with_context(|| format!("Failed to set {}", kind))?;
            if as_json {
                return print_json(&json!({ "kind": kind, "value": value }));
            }
            println!("{} = {}", kind, value);
        }
        IdCommand::Enable { kind } => set_enabled(runtime, kind, true, as_json)?,
        IdCommand::Disable { kind } => set_enabled(runtime, kind, false, as_json)?,
        IdCommand::Status => {
            let status = runtime.identifier_status()?;
            if as_json {
                return print_json(&json!(status));
            }
            for entry in status {
                println!(
                    "{:<22} {:<8} {}",
                    entry.kind.as_str(),
                    if entry.enabled { "on" } else { "off" },
                    entry.value.as_deref().unwrap_or("-")
                );
            }
        }
        IdCommand::Regenerate { kind: Some(kind) } => {
            let value = runtime.regenerate_identifier(kind)?;
            if as_json {
                return print_json(&json!({ "kind": kind, "value": value }));
            }
            println!("{} = {}", kind, value);
        }
        IdCommand::Regenerate { kind: None } => {
            let count = runtime.regenerate_all_enabled_identifiers()?;
            if as_json {
                return print_json(&json!({ "regenerated": count }));
            }
            println!("Regenerated {} identifiers", count);
        }
    }
    Ok(())
}

fn set_enabled(runtime: &Runtime, kind: IdentifierKind, enabled: bool, as_json: bool) -> Result<()> {
    runtime.set_identifier_enabled(kind, enabled)?;
    if as_json {
        return print_json(&json!({ "kind": kind, "enabled": enabled }));
    }
    println!("{} {}", kind, if enabled { "enabled" } else { "disabled" });
    Ok(())
}

fn path_command(runtime: &Runtime, cmd: PathCommand, as_json: bool) -> Result<()> {
    match cmd {
        PathCommand::Translate { path } => {
            let translated = runtime
                .translate_path(&path)
                .with_context(|| format!("Failed to translate {}", path.display()))?;
            if as_json {
                return print_json(&json!({ "path": path, "translated": translated }));
            }
            println!("{}", translated.display());
        }
        PathCommand::Redirectable { path } => {
            let redirectable = runtime.is_path_redirectable(&path, runtime.bundle_id());
            if as_json {
                return print_json(&json!({ "path": path, "redirectable": redirectable }));
            }
            println!("{}", if redirectable { "yes" } else { "no" });
        }
        PathCommand::Data { profile } => {
            let profile = match profile {
                Some(profile) => profile,
                None => current_profile(runtime)?,
            };
            let path = runtime.app_data_path(runtime.bundle_id(), &profile);
            if as_json {
                return print_json(&json!({ "profile": profile, "path": path }));
            }
            println!("{}", path.display());
        }
    }
    Ok(())
}
