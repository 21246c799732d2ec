//! Config command implementation.

use std::path::Path;

use anyhow::{bail, Result};

use airlink_core::config::Config;

use super::{ConfigAction, ConfigArgs};

/// Run the config command.
pub fn run(args: ConfigArgs, config_path: Option<&Path>) -> Result<()> {
    let path = config_path.map_or_else(Config::config_path, Path::to_path_buf);

    match args.action {
        ConfigAction::Show => {
            let config = super::load_config(Some(&path))?.with_env_overrides()?;
            println!("# {}", path.display());
            print!("{}", config.to_toml()?);
        }

        ConfigAction::Path => {
            println!("{}", path.display());
        }

        ConfigAction::Init { force } => {
            if path.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save_to(&path)?;
            println!("Wrote default configuration to {}", path.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        run(ConfigArgs { action: ConfigAction::Init { force: false } }, Some(&path)).unwrap();
        assert!(path.exists());

        let again = run(ConfigArgs { action: ConfigAction::Init { force: false } }, Some(&path));
        assert!(again.is_err());

        run(ConfigArgs { action: ConfigAction::Init { force: true } }, Some(&path)).unwrap();
    }
}
