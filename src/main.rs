//! sitedeploy - command-line front end of the deployment manager
//!
//! Usage:
//!   sitedeploy [--config <path>] routes <project> <routes.json>
//!   sitedeploy [--config <path>] deploy <project> [routes.json]
//!   sitedeploy [--config <path>] delete <project>
//!   sitedeploy [--config <path>] recover
//!   sitedeploy [--config <path>] status [project]

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sitedeploy::config::Config;
use sitedeploy::model::Route;
use sitedeploy::{DeployError, DeploymentService, ErrorCode, ErrorResponse, PKG_NAME, VERSION};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Config file looked up in the working directory
const LOCAL_CONFIG: &str = "sitedeploy.toml";

/// CLI command structure
#[derive(Debug)]
enum Command {
    Routes { project: String, file: PathBuf },
    Deploy { project: String, routes: Option<PathBuf> },
    Delete { project: String },
    Recover,
    Status { project: Option<String> },
    Help,
    Version,
}

#[derive(Debug)]
struct Invocation {
    config: Option<PathBuf>,
    command: Command,
}

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout carries the JSON result
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sitedeploy=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        let response = match e.downcast_ref::<DeployError>() {
            Some(deploy_error) => deploy_error.to_response(),
            None => ErrorResponse::new(ErrorCode::InvalidRequest, format!("{:#}", e)),
        };
        eprintln!("{}", response.to_json());
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let invocation = parse_args(&args)?;

    match invocation.command {
        Command::Help => {
            print_help();
            return Ok(());
        }
        Command::Version => {
            println!("{} {}", PKG_NAME, VERSION);
            return Ok(());
        }
        _ => {}
    }

    let config = load_config(invocation.config.as_deref())?;
    let service = DeploymentService::from_config(&config).map_err(DeployError::Store)?;

    match invocation.command {
        Command::Routes { project, file } => {
            let routes = read_routes(&file)?;
            let record = service.set_routes(&project, routes).await?;
            print_json(&record)
        }
        Command::Deploy { project, routes } => {
            if let Some(file) = routes {
                let routes = read_routes(&file)?;
                service.set_routes(&project, routes).await?;
            }
            let outcome = service.deploy(&project).await?;
            if !outcome.readiness.is_confirmed() {
                info!(project = %project, port = outcome.port, "Deployed, not yet confirmed healthy");
            }
            print_json(&outcome)
        }
        Command::Delete { project } => {
            let report = service.delete(&project).await?;
            print_json(&report)
        }
        Command::Recover => {
            let reports = service.recover().await?;
            print_json(&reports)
        }
        Command::Status { project } => {
            let statuses = service.status(project.as_deref()).await?;
            print_json(&statuses)
        }
        Command::Help | Command::Version => Ok(()),
    }
}

fn parse_args(args: &[String]) -> Result<Invocation> {
    let mut config = None;
    let mut rest = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = iter.next().context("--config requires a path")?;
                config = Some(PathBuf::from(path));
            }
            other => rest.push(other.to_string()),
        }
    }

    Ok(Invocation {
        config,
        command: parse_command(&rest)?,
    })
}

fn parse_command(args: &[String]) -> Result<Command> {
    let Some(name) = args.first() else {
        return Ok(Command::Help);
    };
    let project = || {
        args.get(1)
            .cloned()
            .with_context(|| format!("`{}` requires a project id", name))
    };

    let command = match name.as_str() {
        "help" | "--help" | "-h" => Command::Help,
        "version" | "--version" | "-V" => Command::Version,
        "routes" => Command::Routes {
            project: project()?,
            file: args
                .get(2)
                .map(PathBuf::from)
                .context("`routes` requires a routes JSON file")?,
        },
        "deploy" => Command::Deploy {
            project: project()?,
            routes: args.get(2).map(PathBuf::from),
        },
        "delete" | "rm" => Command::Delete { project: project()? },
        "recover" => Command::Recover,
        "status" | "ps" => Command::Status {
            project: args.get(1).cloned(),
        },
        other => bail!("unknown command `{}` (see `sitedeploy help`)", other),
    };
    Ok(command)
}

/// `--config`, then `$SITEDEPLOY_CONFIG`, then `./sitedeploy.toml`, then
/// `~/.sitedeploy/config.toml`, else built-in defaults
fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = env::var("SITEDEPLOY_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let local = PathBuf::from(LOCAL_CONFIG);
    if local.exists() {
        return Some(local);
    }
    dirs_next::home_dir()
        .map(|home| home.join(".sitedeploy").join("config.toml"))
        .filter(|path| path.exists())
}

fn load_config(explicit: Option<&Path>) -> Result<Config> {
    match config_path(explicit) {
        Some(path) => {
            let config = Config::load(&path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
            debug!(path = %path.display(), "Configuration loaded");
            Ok(config)
        }
        None => {
            debug!("No configuration file, using defaults");
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Accepts either a bare route array or `{"routes": [...]}`
fn read_routes(path: &Path) -> Result<Vec<Route>> {
    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum RoutesFile {
        Bare(Vec<Route>),
        Wrapped { routes: Vec<Route> },
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let parsed: RoutesFile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse routes in {}", path.display()))?;
    Ok(match parsed {
        RoutesFile::Bare(routes) | RoutesFile::Wrapped { routes } => routes,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_help() {
    println!(
        r#"
sitedeploy - deploy low-code sites as standalone web servers

USAGE:
    sitedeploy [--config <path>] <command> [args]

COMMANDS:
    routes <project> <routes.json>   Store the routes of a project
    deploy <project> [routes.json]   (Re)deploy a project, optionally updating its routes first
    delete <project>                 Stop a deployment and forget the project
    recover                          Restart deployments whose server is down
    status [project]                 Show deployment records and liveness

    help                             Show this help
    version                          Show version

CONFIGURATION:
    --config <path>, $SITEDEPLOY_CONFIG, ./sitedeploy.toml or ~/.sitedeploy/config.toml

ENVIRONMENT:
    RUST_LOG                         Log filter (default: sitedeploy=info)
"#
    );
}
