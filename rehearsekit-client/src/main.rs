//! RehearseKit command-line client
//!
//! Signs in against a RehearseKit backend, keeps the session alive and follows job progress over
//! the push channel.

use directories::ProjectDirs;
use std::env;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

mod app;

use app::{Command, RehearseApp};
use rehearsekit_shared::{ClientConfig, LoggingConfig};

const USAGE: &str = "\
Usage:
  rehearsekit --init [config.json]
  rehearsekit [--config <path>] login <access-token> <refresh-token>
  rehearsekit [--config <path>] whoami [--json]
  rehearsekit [--config <path>] logout
  rehearsekit [--config <path>] watch <job-id> [--origin <url>]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|arg| arg == "--init") {
        return init_config(&args);
    }

    let (config_path, rest) = match split_config_flag(&args[1..]) {
        Ok(split) => split,
        Err(message) => {
            eprintln!("Error: {}", message);
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    };

    let command = match Command::parse(&rest) {
        Ok(command) => command,
        Err(message) => {
            eprintln!("Error: {}", message);
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    };

    let config_path = config_path.or_else(default_config_path);
    let config = match ClientConfig::load_or_default(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            eprintln!(
                "Run `{} --init` to create a default configuration.",
                args[0]
            );
            std::process::exit(1);
        }
    };

    init_logging(&config.logging);
    match &config_path {
        Some(path) => info!("Configuration loaded from {}", path),
        None => info!("No configuration file found, using defaults"),
    }

    let app = RehearseApp::new(config);

    match app.run(command).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("Command failed: {}", e);
            Err(e)
        }
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries command output; diagnostics go to stderr
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let result = if config.format == "json" {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(
            builder.with_file(true).with_line_number(true).finish(),
        )
    };

    if let Err(e) = result {
        eprintln!("Failed to set global logging subscriber: {}", e);
    }
}

/// Pull `--config <path>` out of the argument list
fn split_config_flag(args: &[String]) -> Result<(Option<String>, Vec<String>), String> {
    let mut config_path = None;
    let mut rest = Vec::new();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let path = iter
                .next()
                .ok_or_else(|| "--config requires a path".to_string())?;
            config_path = Some(path.clone());
        } else {
            rest.push(arg.clone());
        }
    }

    Ok((config_path, rest))
}

/// Per-user configuration file, if one has been created there
fn default_config_path() -> Option<String> {
    let path = config_dir()?.join("config.json");
    if path.exists() {
        path.to_str().map(str::to_string)
    } else {
        None
    }
}

fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("uk", "rehearsekit", "rehearsekit").map(|dirs| dirs.config_dir().to_path_buf())
}

fn init_config(args: &[String]) -> anyhow::Result<()> {
    // Find the config path, skipping the --init flag
    let config_path = match args.iter().skip(1).find(|arg| *arg != "--init") {
        Some(path) => PathBuf::from(path),
        None => match config_dir() {
            Some(dir) => {
                std::fs::create_dir_all(&dir)?;
                dir.join("config.json")
            }
            None => PathBuf::from("config.json"),
        },
    };
    let display_path = config_path.display().to_string();

    if config_path.exists() {
        eprintln!("Configuration file '{}' already exists.", display_path);
        eprintln!("Remove it first if you want to create a new one.");
        std::process::exit(1);
    }

    let config = ClientConfig::default();

    match config.save(&display_path) {
        Ok(_) => {
            println!("Configuration file '{}' created successfully!", display_path);
            println!();
            println!("Default configuration includes:");
            println!("  • API at {} (override with api.api_url)", config.api.resolved_api_url());
            println!(
                "  • Progress channel at {} (override with progress.ws_url)",
                config.progress.resolved_ws_url()
            );
            println!("  • Credentials kept in the OS keyring");
            println!();
            println!("To sign in:");
            println!(
                "  {} --config {} login <access-token> <refresh-token>",
                args[0], display_path
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to create configuration file: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_config_flag_is_extracted_anywhere() {
        let (path, rest) =
            split_config_flag(&args(&["whoami", "--config", "/tmp/rk.json"])).unwrap();
        assert_eq!(path.as_deref(), Some("/tmp/rk.json"));
        assert_eq!(rest, args(&["whoami"]));

        let (path, rest) = split_config_flag(&args(&["logout"])).unwrap();
        assert!(path.is_none());
        assert_eq!(rest, args(&["logout"]));
    }

    #[test]
    fn test_config_flag_requires_value() {
        assert!(split_config_flag(&args(&["whoami", "--config"])).is_err());
    }
}
