//! Common CLI utilities.

use clap::ValueEnum as _;
use serde::Serialize;
use std::fmt;

/// Possible output formats.
#[derive(Copy, Clone, Debug, PartialEq, clap::ValueEnum)]
#[value(rename_all = "lower")]
pub enum OutputFormat {
    Yaml,
    Json,
    PrettyJson,
    Toml,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Yaml
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_possible_value() {
            Some(value) => f.write_str(value.get_name()),
            None => Ok(()),
        }
    }
}

/// Render an object in the specified format.
pub fn format_object<T: Serialize>(format: OutputFormat, value: &T) -> anyhow::Result<String> {
    let output = match format {
        OutputFormat::Yaml => serde_yaml::to_string(value)?,
        OutputFormat::Json => serde_json::to_string(value)?,
        OutputFormat::PrettyJson => serde_json::to_string_pretty(value)?,
        OutputFormat::Toml => toml::to_string(value)?,
    };
    Ok(output)
}

/// Prints an object in the specified format.
pub fn print_object<T: Serialize>(format: OutputFormat, value: &T) -> anyhow::Result<()> {
    println!("{}", format_object(format, value)?);
    Ok(())
}
