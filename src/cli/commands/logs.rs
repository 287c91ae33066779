use anyhow::Result;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::Command;
use crate::coordinator::Coordinator;
use crate::liveness::TailOptions;

pub struct LogsCommand {
    coordinator: Coordinator,
    agent: String,
    follow: bool,
    lines: usize,
}

impl LogsCommand {
    pub fn new(coordinator: Coordinator, agent: String, follow: bool, lines: usize) -> Self {
        Self {
            coordinator,
            agent,
            follow,
            lines,
        }
    }
}

impl Command for LogsCommand {
    async fn execute(&self) -> Result<()> {
        let cancel = CancellationToken::new();
        if self.follow {
            let on_ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_ctrl_c.cancel();
                }
            });
        }

        let options = TailOptions {
            follow: self.follow,
            last: Some(self.lines),
        };
        let lines = self.coordinator.tail_logs(&self.agent, options, cancel.clone())?;
        tokio::pin!(lines);

        while let Some(line) = lines.next().await {
            println!("{}", line?);
        }
        cancel.cancel();
        Ok(())
    }
}
