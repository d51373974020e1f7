//! Rewrites swarm agent config and topology files for a concrete cluster.
//!
//! `apply` takes cluster values from a JSON file and substitutes the public
//! overlay address and node names. `set-public-ip` only updates the public
//! overlay address of a config map. Every rewritten file keeps its previous
//! content next to it as `<file>.bak`.

mod rewrite;

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use rewrite::ClusterValues;

#[derive(Debug, Parser)]
#[command(
    name = "swarm-config-rewrite",
    version,
    about = "Rewrite swarm agent config and topology files for a cluster"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Update a config file and a topology file from cluster values.
    Apply {
        /// JSON file with the cluster values.
        config_json: PathBuf,
        /// Agent config file (public IP and `config-*` tokens).
        config_file: PathBuf,
        /// Topology file (`tosca-*` tokens).
        tosca_file: PathBuf,
    },
    /// Set `p2p_public_ip` in a config map file.
    SetPublicIp {
        file: PathBuf,
        /// The resource authority's public IPv4 address.
        ip: Ipv4Addr,
    },
}

/// What `apply` changed.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ApplySummary {
    public_ip: String,
    public_ip_updated: bool,
    config_tokens: usize,
    tosca_tokens: usize,
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Move the current file to `<file>.bak`, then write `content`.
fn write_with_backup(path: &Path, content: &str) -> Result<PathBuf> {
    let backup = backup_path(path);
    if path.exists() {
        std::fs::rename(path, &backup).with_context(|| {
            format!("failed to back up {} to {}", path.display(), backup.display())
        })?;
    }
    std::fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(backup)
}

fn apply(config_json: &Path, config_file: &Path, tosca_file: &Path) -> Result<ApplySummary> {
    let raw = read_text(config_json)?;
    let json: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("invalid JSON: {}", config_json.display()))?;
    let values = ClusterValues::from_json(&json)
        .with_context(|| format!("invalid cluster values in {}", config_json.display()))?;

    let config_text = read_text(config_file)?;
    let (config_text, public_ip_updated) =
        match rewrite::update_json_public_ip(&config_text, &values.public_ip) {
            Some(updated) => (updated, true),
            None => {
                let (updated, n) =
                    rewrite::update_public_ip_assignments(&config_text, &values.public_ip);
                if n == 0 {
                    eprintln!(
                        "Warning: did not find a recognizable 'p2p_public_ip' assignment in {}",
                        config_file.display()
                    );
                }
                (updated, n > 0)
            }
        };
    let (config_text, config_tokens) =
        rewrite::replace_tokens(&config_text, &values.tokens("config"));
    let backup = write_with_backup(config_file, &config_text)?;
    println!(
        "Updated {} (backed up as {})",
        config_file.display(),
        backup.display()
    );

    let tosca_text = read_text(tosca_file)?;
    let (tosca_text, tosca_tokens) = rewrite::replace_tokens(&tosca_text, &values.tokens("tosca"));
    let backup = write_with_backup(tosca_file, &tosca_text)?;
    println!(
        "Updated {} (backed up as {})",
        tosca_file.display(),
        backup.display()
    );

    Ok(ApplySummary {
        public_ip: values.public_ip,
        public_ip_updated,
        config_tokens,
        tosca_tokens,
    })
}

fn set_public_ip(file: &Path, ip: Ipv4Addr) -> Result<usize> {
    let text = read_text(file)?;
    let (text, replaced) = rewrite::set_public_ip_lines(&text, &ip.to_string());
    let backup = write_with_backup(file, &text)?;
    println!("Backup saved to {}", backup.display());
    Ok(replaced)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Apply {
            config_json,
            config_file,
            tosca_file,
        } => {
            let summary = apply(&config_json, &config_file, &tosca_file)?;
            println!("Replaced {} 'config-*' tokens", summary.config_tokens);
            println!("Replaced {} 'tosca-*' tokens", summary.tosca_tokens);
            if summary.public_ip_updated {
                println!("Set p2p_public_ip = {}", summary.public_ip);
            }
        }
        Command::SetPublicIp { file, ip } => {
            let replaced = set_public_ip(&file, ip)?;
            println!(
                "Updated p2p_public_ip to {} in {} ({} lines)",
                ip,
                file.display(),
                replaced
            );
        }
    }

    Ok(())
}
