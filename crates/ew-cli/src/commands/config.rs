//! Config command implementations

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::node::{config_file, load_wallet_config};
use crate::output::{print_error, print_info, print_success, print_warning};
use ew_core::config::{save_config, WalletConfig};

/// Write a default configuration file
pub fn config_init(config_path: Option<&PathBuf>, force: bool) -> Result<()> {
    let path = config_file(config_path);

    if path.exists() && !force {
        print_error(&format!("Config file already exists: {:?}", path));
        print_info("Use --force to overwrite");
        return Ok(());
    }

    let mut defaults = WalletConfig::default();
    // Keys and store live next to a custom config file
    if let Some(dir) = config_path.and_then(|p| p.parent()) {
        defaults.wallet_key_path = dir.join("wallet.key");
        defaults.session_key_path = dir.join("session.key");
        defaults.store_path = dir.join("store.json");
    }

    save_config(&path, &defaults)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;
    print_success(&format!("Created configuration file: {:?}", path));

    if !defaults.wallet_key_path.exists() {
        print_info("Generate a wallet key with: event-wallet keygen");
    }

    Ok(())
}

/// Show the effective configuration, overrides included
pub fn config_show(config_path: Option<&PathBuf>) -> Result<()> {
    let path = config_file(config_path);

    if path.exists() {
        print_info(&format!("Configuration file: {:?}", path));
    } else {
        print_warning(&format!("No configuration file found at {:?}, showing defaults", path));
        print_info("Run 'event-wallet config init' to create one");
    }
    println!();

    let effective = load_wallet_config(config_path)?;
    println!("{}", toml::to_string_pretty(&effective)?);

    Ok(())
}

/// Print one value by dotted key (e.g. `reconnect.max_attempts`)
pub fn config_get(config_path: Option<&PathBuf>, key: &str) -> Result<()> {
    let effective = load_wallet_config(config_path)?;
    let mut current = toml::Value::try_from(&effective)?;

    for part in key.split('.') {
        current = match current {
            toml::Value::Table(mut table) => match table.remove(part) {
                Some(value) => value,
                None => anyhow::bail!("Key not found: {}", key),
            },
            _ => anyhow::bail!("Key not found: {}", key),
        };
    }

    match current {
        toml::Value::String(s) => println!("{}", s),
        toml::Value::Table(_) => println!("{}", toml::to_string_pretty(&current)?),
        other => println!("{}", other),
    }

    Ok(())
}

/// Print the config file path
pub fn config_path(config_path: Option<&PathBuf>) -> Result<()> {
    println!("{}", config_file(config_path).display());
    Ok(())
}
