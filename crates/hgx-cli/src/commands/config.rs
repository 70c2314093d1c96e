//! Configuration inspection

use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;
use hgx_core::HgxConfig;

/// Configuration commands
#[derive(Debug, Clone, Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,

    /// Validate the configuration file and report the first problem
    Check,

    /// Print the built-in defaults as TOML
    Defaults,
}

pub fn run(action: ConfigAction, path: &Path) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = HgxConfig::load(Some(path))
                .with_context(|| format!("loading {}", path.display()))?;
            print!("{}", config.to_toml_string()?);
        }
        ConfigAction::Check => {
            let config = HgxConfig::load_from_file(path)
                .with_context(|| format!("reading {}", path.display()))?;
            config.validate()?;
            println!("{}: ok", path.display());
        }
        ConfigAction::Defaults => print!("{}", HgxConfig::default().to_toml_string()?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_check_rejects_zero_budget() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[healing]\nretry_budget = 0").unwrap();
        assert!(run(ConfigAction::Check, file.path()).is_err());
    }

    #[test]
    fn test_check_accepts_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[ratchet]\ndefault_legroom = 5").unwrap();
        assert!(run(ConfigAction::Check, file.path()).is_ok());
    }
}
