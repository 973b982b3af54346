//! Key generation

use anyhow::{Context, Result};

use crate::output::{print_info, print_success};
use ew_core::config::WalletConfig;
use ew_core::KeyManager;

/// Create the wallet and session keys named by the configuration.
///
/// Existing keys are kept unless `force` is set.
pub fn keygen_command(config: &WalletConfig, force: bool) -> Result<()> {
    for (label, path) in [
        ("Wallet", &config.wallet_key_path),
        ("Session", &config.session_key_path),
    ] {
        if path.exists() && !force {
            let existing = KeyManager::load(path)
                .with_context(|| format!("Failed to read existing key {:?}", path))?;
            print_info(&format!("{} key exists: {} ({:?})", label, existing.address(), path));
            continue;
        }

        let key = KeyManager::generate();
        key.save(path)
            .with_context(|| format!("Failed to write key {:?}", path))?;
        print_success(&format!("{} key created: {} ({:?})", label, key.address(), path));
    }

    Ok(())
}
