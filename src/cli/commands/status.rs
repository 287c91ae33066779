use anyhow::Result;

use super::{blocking, print_json, Command};
use crate::coordinator::{Coordinator, PublishOutcome};

pub struct StatusCommand {
    coordinator: Coordinator,
    json: bool,
    publish: bool,
}

impl StatusCommand {
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            coordinator,
            json: false,
            publish: false,
        }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub fn with_publish(mut self, publish: bool) -> Self {
        self.publish = publish;
        self
    }
}

impl Command for StatusCommand {
    async fn execute(&self) -> Result<()> {
        let snapshot = blocking(&self.coordinator, |c| c.status()).await?;
        if self.json {
            print_json(&snapshot)?;
        } else {
            print!("{}", snapshot.to_text());
        }

        if self.publish {
            // Local status is already printed; a mirror failure only affects the thread.
            match self.coordinator.publish_status().await? {
                PublishOutcome::Created { remote_id } => {
                    eprintln!("💬 Status comment created ({remote_id})")
                }
                PublishOutcome::Updated { remote_id } => {
                    eprintln!("✏️  Status comment updated ({remote_id})")
                }
                PublishOutcome::Unchanged { remote_id } => {
                    eprintln!("Status comment already current ({remote_id})")
                }
            }
        }
        Ok(())
    }
}
