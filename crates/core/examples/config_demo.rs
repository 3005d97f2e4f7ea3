//! Example walking through the configuration file lifecycle
//!
//! Run with: cargo run --package patchbay-core --example config_demo

use patchbay_core::domain::config::{ConfigManager, PatchbayConfig};
use patchbay_core::domain::resolver::RoleTable;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("patchbay_core=debug,info")
        .init();

    let dir = tempfile::tempdir()?;
    let manager = ConfigManager::new(dir.path().to_path_buf());

    println!("=== patchbay configuration demo ===\n");

    // Missing file: defaults are written out
    let config = manager.load().await;
    println!("1. Loaded defaults, file created: {}", manager.exists());
    println!("{}", config.to_toml()?);

    // Edit and save
    let mut edited = config.clone();
    edited.routing.duplicate_to_monitor = true;
    edited.save_to_file(manager.config_path()).await?;
    let reloaded = manager.load().await;
    println!("2. duplicate_to_monitor after reload: {}", reloaded.routing.duplicate_to_monitor);

    println!("3. Port roles:");
    for (role, name) in RoleTable::from(&reloaded.routing).iter() {
        println!("   {role} -> {name}");
    }

    // Invalid configuration is rejected
    let mut invalid = reloaded.clone();
    invalid.routing.main_port_names.1 = invalid.routing.main_port_names.0.clone();
    match invalid.validate() {
        Ok(()) => println!("4. unexpectedly valid"),
        Err(e) => println!("4. Rejected: {e}"),
    }

    // A corrupt file is backed up and replaced by defaults
    tokio::fs::write(manager.config_path(), "routing = [").await?;
    let recovered: PatchbayConfig = manager.load().await;
    println!(
        "5. Recovered from corrupt file, target = {}",
        recovered.routing.target_device_name
    );

    Ok(())
}
