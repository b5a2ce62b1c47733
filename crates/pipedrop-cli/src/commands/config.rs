//! Config command implementation.
//!
//! Keys are `section.field` paths into the TOML document, e.g.
//! `transfer.chunk_size` or `backpressure.max_wait`.

use anyhow::{anyhow, bail, Context, Result};
use pipedrop_core::config::Config;

use super::{ConfigAction, ConfigArgs};

/// Run the config command.
pub fn run(args: ConfigArgs) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let config = Config::load().context("Failed to load configuration")?;
            let text = toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!();
            println!("Pipedrop Configuration ({})", Config::config_path().display());
            println!("{}", "─".repeat(50));
            println!();
            println!("{}", text.trim_end());
            println!();
        }

        ConfigAction::Path => println!("{}", Config::config_path().display()),

        ConfigAction::Get { key } => {
            let config = Config::load().context("Failed to load configuration")?;
            match get_value(&config, &key)? {
                Some(value) => println!("{}: {}", key, value),
                None => println!("Unknown configuration key: {}", key),
            }
        }

        ConfigAction::Set { key, value } => {
            let config = Config::load().context("Failed to load configuration")?;
            let updated = set_value(&config, &key, &value)?;
            updated.save().context("Failed to save configuration")?;
            println!("Set {} = {}", key, value);
        }

        ConfigAction::Reset => {
            Config::default()
                .save()
                .context("Failed to save configuration")?;
            println!("Configuration reset to defaults.");
        }
    }

    Ok(())
}

fn split_key(key: &str) -> Result<(&str, &str)> {
    key.split_once('.')
        .ok_or_else(|| anyhow!("Keys look like 'section.field', got '{}'", key))
}

fn get_value(config: &Config, key: &str) -> Result<Option<toml::Value>> {
    let (section, field) = split_key(key)?;
    let document = toml::Value::try_from(config)?;
    Ok(document
        .get(section)
        .and_then(|s| s.get(field))
        .cloned())
}

fn set_value(config: &Config, key: &str, raw: &str) -> Result<Config> {
    let (section, field) = split_key(key)?;
    let mut document = toml::Table::try_from(config)?;

    let table = document
        .get_mut(section)
        .and_then(toml::Value::as_table_mut)
        .ok_or_else(|| anyhow!("Unknown configuration section: {}", section))?;
    let Some(current) = table.get(field) else {
        // Optional fields are absent from the document while unset.
        if section == "general" && field == "default_output" {
            table.insert(field.to_string(), toml::Value::String(raw.to_string()));
            return Ok(Config::from_toml(&toml::to_string(&document)?)?);
        }
        bail!("Unknown configuration key: {}", key);
    };

    // Values keep the type they already have; bare text becomes a string.
    let value = match toml::from_str::<toml::Table>(&format!("v = {raw}")) {
        Ok(mut parsed) => parsed.remove("v").unwrap_or_else(|| toml::Value::String(raw.to_string())),
        Err(_) => toml::Value::String(raw.to_string()),
    };
    let value = match (current, value) {
        (toml::Value::Float(_), toml::Value::Integer(i)) => toml::Value::Float(i as f64),
        (_, value) => value,
    };
    if current.type_str() != value.type_str() {
        bail!(
            "{} expects a {}, got '{}'",
            key,
            current.type_str(),
            raw
        );
    }
    table.insert(field.to_string(), value);

    Config::from_toml(&toml::to_string(&document)?)
        .with_context(|| format!("Invalid value for {}", key))
}
