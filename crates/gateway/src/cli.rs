//! Command-line interface: `edward [serve]`, `edward config validate`,
//! `edward config show`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use ed_domain::config::Config;

#[derive(Debug, Parser)]
#[command(name = "edward", about = "AI web-app generator backend")]
pub struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the API server (default).
    Serve,
    /// Config inspection.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Check the config file for problems.
    Validate,
    /// Print the effective config.
    Show,
}

/// Load config from the explicit path, the default locations, or fall
/// back to built-in defaults.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<(Config, Option<PathBuf>)> {
    let candidates: Vec<PathBuf> = match explicit {
        Some(path) => vec![path.to_path_buf()],
        None => vec![PathBuf::from("edward.toml"), PathBuf::from("config.toml")],
    };

    for path in candidates {
        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("read {}", path.display()))?;
            let config = Config::from_toml_str(&raw)
                .with_context(|| format!("parse {}", path.display()))?;
            return Ok((config, Some(path)));
        }
        if explicit.is_some() {
            anyhow::bail!("config file {} does not exist", path.display());
        }
    }
    Ok((Config::default(), None))
}

/// `config validate`: print findings, return whether the config is clean.
pub fn validate(config: &Config, path: Option<&Path>) -> bool {
    match path {
        Some(path) => println!("checking {}", path.display()),
        None => println!("checking built-in defaults (no config file found)"),
    }
    let findings = config.validate();
    if findings.is_empty() {
        println!("ok");
        return true;
    }
    for finding in &findings {
        println!("  - {finding}");
    }
    false
}

/// `config show`: print the effective config as TOML.
pub fn show(config: &Config) {
    match toml::to_string_pretty(config) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => println!("could not render config: {e}"),
    }
}
