use anyhow::Result;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{blocking, print_json, Command};
use crate::coordinator::Coordinator;
use crate::error::DuoError;

/// Stage value the orchestrator writes once the review is finished.
pub const STAGE_DONE: &str = "done";

fn stage_name(stage: &str) -> Option<&'static str> {
    match stage {
        "1" => Some("parallel review"),
        "2" => Some("consensus check"),
        "3" => Some("cross-confirmation"),
        "4" => Some("fix and verify"),
        "5" => Some("summary"),
        _ => None,
    }
}

/// Progress line for a stage change, or `None` once the review is done.
pub fn stage_line(stage: &str) -> Option<String> {
    if stage == STAGE_DONE {
        return None;
    }
    Some(match stage_name(stage) {
        Some(name) => format!("⏳ Stage {stage}: {name}"),
        None => format!("⏳ Stage {stage}"),
    })
}

pub struct SetCommand {
    coordinator: Coordinator,
    key: String,
    value: String,
    actor: String,
}

impl SetCommand {
    pub fn new(coordinator: Coordinator, key: String, value: String, actor: String) -> Self {
        Self {
            coordinator,
            key,
            value,
            actor,
        }
    }
}

impl Command for SetCommand {
    async fn execute(&self) -> Result<()> {
        let (key, value, actor) = (self.key.clone(), self.value.clone(), self.actor.clone());
        let entry = blocking(&self.coordinator, move |c| c.set_state(&key, &value, &actor)).await?;
        println!("{}={}", entry.key, entry.value);
        Ok(())
    }
}

pub struct GetCommand {
    coordinator: Coordinator,
    key: String,
    json: bool,
}

impl GetCommand {
    pub fn new(coordinator: Coordinator, key: String) -> Self {
        Self {
            coordinator,
            key,
            json: false,
        }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

impl Command for GetCommand {
    async fn execute(&self) -> Result<()> {
        let key = self.key.clone();
        let entry = blocking(&self.coordinator, move |c| c.get_state(&key)).await?;
        if self.json {
            return print_json(&entry);
        }
        println!("{}", entry.value);
        Ok(())
    }
}

pub struct InitCommand {
    coordinator: Coordinator,
    actor: String,
    branch: Option<String>,
    base: Option<String>,
    runner: Option<String>,
    watch: bool,
}

impl InitCommand {
    pub fn new(coordinator: Coordinator, actor: String) -> Self {
        Self {
            coordinator,
            actor,
            branch: None,
            base: None,
            runner: None,
            watch: false,
        }
    }

    pub fn with_refs(
        mut self,
        branch: Option<String>,
        base: Option<String>,
        runner: Option<String>,
    ) -> Self {
        self.branch = branch;
        self.base = base;
        self.runner = runner;
        self
    }

    pub fn with_watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }

    /// Print each stage change until the review is done or Ctrl+C.
    async fn watch_progress(&self) -> Result<()> {
        let cancel = CancellationToken::new();
        let on_ctrl_c = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_ctrl_c.cancel();
            }
        });

        println!("📊 Watching progress (Ctrl+C to exit)...");
        let stages = self.coordinator.watch_state("stage", cancel.clone());
        tokio::pin!(stages);

        while let Some(entry) = stages.next().await {
            let entry = entry?;
            if let Some(line) = stage_line(&entry.value) {
                println!("{line}");
                continue;
            }

            let result = match blocking(&self.coordinator, |c| c.get_state("s2:result")).await {
                Ok(entry) => entry.value,
                Err(err) if matches!(err.downcast_ref::<DuoError>(), Some(DuoError::NotFound(_))) => {
                    String::new()
                }
                Err(err) => return Err(err),
            };
            let identity = self.coordinator.identity();
            println!("✅ Done: {result}");
            println!("   https://github.com/{}/pull/{}", identity.repo, identity.pr_number);
            cancel.cancel();
            return Ok(());
        }

        println!("⚠️  Stopped watching; the review keeps running");
        Ok(())
    }
}

impl Command for InitCommand {
    async fn execute(&self) -> Result<()> {
        let (branch, base, runner, actor) = (
            self.branch.clone(),
            self.base.clone(),
            self.runner.clone(),
            self.actor.clone(),
        );
        blocking(&self.coordinator, move |c| c.init_session(branch, base, runner, &actor)).await?;

        let identity = self.coordinator.identity();
        println!("🚀 Duo Review");
        match (&self.branch, &self.base) {
            (Some(branch), Some(base)) => {
                println!("   PR: #{} ({branch} → {base})", identity.pr_number)
            }
            _ => println!("   PR: #{}", identity.pr_number),
        }
        println!("   Repo: {}", identity.repo);
        if let Some(runner) = &self.runner {
            println!("   Runner: {runner}");
        }
        println!("   Ledger: {}", self.coordinator.ledger().dir().display());
        println!("✅ Initialized");

        if self.watch {
            println!();
            self.watch_progress().await?;
        }
        Ok(())
    }
}
