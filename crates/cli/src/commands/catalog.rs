use opsdesk_agent::tools::ToolCatalog;
use opsdesk_core::config::{AppConfig, LoadOptions};

use crate::commands::{load_settings, CommandResult};

const COMMAND: &str = "catalog";

pub fn run(profile: &str) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return CommandResult::failure(COMMAND, "config_validation", error.to_string(), 2),
    };

    let settings = match load_settings(&config) {
        Ok(settings) => settings,
        Err(error) => return CommandResult::failure(COMMAND, "settings_load", error, 3),
    };

    let http = match reqwest::Client::builder().build() {
        Ok(http) => http,
        Err(error) => return CommandResult::failure(COMMAND, "http_client", error.to_string(), 4),
    };
    let catalog = match ToolCatalog::from_settings(&settings, profile, &http) {
        Ok(catalog) => catalog,
        Err(error) => return CommandResult::failure(COMMAND, "catalog_build", error.to_string(), 4),
    };

    if catalog.is_empty() {
        return CommandResult::success(COMMAND, format!("profile `{profile}` has no tools"));
    }

    let mut lines = vec![format!("profile `{profile}` exposes {} tools:", catalog.len())];
    for descriptor in catalog.descriptors() {
        let access = if descriptor.write_access { "write" } else { "read" };
        lines.push(format!("- {} [{access}]: {}", descriptor.name, descriptor.description));
    }
    CommandResult::success(COMMAND, lines.join("\n"))
}
