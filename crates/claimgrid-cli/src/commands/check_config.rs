use std::path::Path;

use claimgrid_scheduler::CoordinatorConfig;

/// Validate a coordinator config file and print the effective settings.
pub fn check_config(path: &Path) -> anyhow::Result<()> {
    match CoordinatorConfig::from_file(path) {
        Ok(config) => {
            println!("✓ {} is valid", path.display());
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("Invalid config {}: {e}", path.display());
            Err(e)
        }
    }
}
