//! Prints the configuration.
use clap::Parser;
use dos_config::Config;
use std::path::PathBuf;

/// Print the configuration as TOML
#[derive(Debug, Parser)]
pub struct Command {
    /// The configuration file to print, the defaults are printed without one.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

impl Command {
    /// Execute `config` command
    pub fn execute(self) -> eyre::Result<()> {
        println!("{}", self.render()?);
        Ok(())
    }

    fn render(&self) -> eyre::Result<String> {
        let config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        Ok(config.to_toml()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prints_defaults() {
        let command = Command::try_parse_from(["config"]).unwrap();
        let rendered = command.render().unwrap();
        assert_eq!(toml_config(&rendered), Config::default());
    }

    #[test]
    fn prints_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dos.toml");
        std::fs::write(&path, "[sync]\nmode = \"light\"\n").unwrap();

        let command =
            Command::try_parse_from(["config", "--config", path.to_str().unwrap()]).unwrap();
        let rendered = command.render().unwrap();
        assert!(rendered.contains("mode = \"light\""));
    }

    fn toml_config(rendered: &str) -> Config {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rendered.toml");
        std::fs::write(&path, rendered).unwrap();
        Config::load(&path).unwrap()
    }
}
