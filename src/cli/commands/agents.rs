use anyhow::Result;
use std::collections::BTreeMap;

use super::{blocking, print_json, Command};
use crate::coordinator::Coordinator;
use crate::error::DuoError;

pub struct AgentsCommand {
    coordinator: Coordinator,
    json: bool,
}

impl AgentsCommand {
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            coordinator,
            json: false,
        }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

impl Command for AgentsCommand {
    async fn execute(&self) -> Result<()> {
        let agents = blocking(&self.coordinator, |c| c.list_agents()).await?;
        if self.json {
            return print_json(&agents);
        }
        for agent in &agents {
            println!("{}", agent.name);
        }
        Ok(())
    }
}

pub struct AliveCommand {
    coordinator: Coordinator,
    agent: String,
    json: bool,
}

impl AliveCommand {
    pub fn new(coordinator: Coordinator, agent: String) -> Self {
        Self {
            coordinator,
            agent,
            json: false,
        }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

impl Command for AliveCommand {
    async fn execute(&self) -> Result<()> {
        let agent = self.agent.clone();
        let liveness = blocking(&self.coordinator, move |c| c.is_alive(&agent)).await?;

        if self.json {
            print_json(&liveness)?;
        } else {
            match (liveness.alive, liveness.pid) {
                (true, Some(pid)) => println!("alive (pid={pid})"),
                (false, Some(pid)) => println!("dead (was pid={pid})"),
                (_, None) => println!("dead (no process registered)"),
            }
        }

        if liveness.alive {
            Ok(())
        } else {
            Err(DuoError::AgentNotRunning {
                agent: liveness.agent,
                pid: liveness.pid,
            }
            .into())
        }
    }
}

pub struct InterruptCommand {
    coordinator: Coordinator,
    agent: String,
}

impl InterruptCommand {
    pub fn new(coordinator: Coordinator, agent: String) -> Self {
        Self { coordinator, agent }
    }
}

impl Command for InterruptCommand {
    async fn execute(&self) -> Result<()> {
        let agent = self.agent.clone();
        let pid = blocking(&self.coordinator, move |c| c.interrupt(&agent)).await?;
        println!("Interrupted {} (pid={pid})", self.agent);
        Ok(())
    }
}

pub struct SettingsCommand {
    coordinator: Coordinator,
    agent: String,
    options: BTreeMap<String, String>,
}

impl SettingsCommand {
    pub fn new(coordinator: Coordinator, agent: String, options: BTreeMap<String, String>) -> Self {
        Self {
            coordinator,
            agent,
            options,
        }
    }
}

impl Command for SettingsCommand {
    async fn execute(&self) -> Result<()> {
        let (agent, options) = (self.agent.clone(), self.options.clone());
        blocking(&self.coordinator, move |c| c.update_settings(&agent, &options)).await?;
        let parts: Vec<String> = self
            .options
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        println!("Updated {}: {}", self.agent, parts.join(", "));
        Ok(())
    }
}

pub struct RegisterCommand {
    coordinator: Coordinator,
    agent: String,
    pid: Option<u32>,
    settings: BTreeMap<String, String>,
}

impl RegisterCommand {
    pub fn new(
        coordinator: Coordinator,
        agent: String,
        pid: Option<u32>,
        settings: BTreeMap<String, String>,
    ) -> Self {
        Self {
            coordinator,
            agent,
            pid,
            settings,
        }
    }
}

impl Command for RegisterCommand {
    async fn execute(&self) -> Result<()> {
        let (agent, pid, settings) = (self.agent.clone(), self.pid, self.settings.clone());
        blocking(&self.coordinator, move |c| c.register_agent(&agent, pid, settings)).await?;
        match self.pid {
            Some(pid) => println!("Registered {} (pid={pid})", self.agent),
            None => println!("Registered {}", self.agent),
        }
        println!("   Log: {}", self.coordinator.log_path(&self.agent)?.display());
        Ok(())
    }
}
