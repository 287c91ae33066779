use anyhow::Result;

use super::Command;
use crate::config::DuoConfig;

pub struct ConfigCommand {
    config: DuoConfig,
}

impl ConfigCommand {
    pub fn new(config: DuoConfig) -> Self {
        Self { config }
    }
}

impl Command for ConfigCommand {
    async fn execute(&self) -> Result<()> {
        print!("{}", self.config.to_redacted_toml()?);
        Ok(())
    }
}
