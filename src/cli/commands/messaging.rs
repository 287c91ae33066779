use anyhow::Result;

use super::{blocking, preview, print_json, Command};
use crate::bus::HistoryFilter;
use crate::coordinator::Coordinator;
use crate::ledger::Message;

pub struct SendCommand {
    coordinator: Coordinator,
    from: String,
    to: String,
    body: String,
}

impl SendCommand {
    pub fn new(coordinator: Coordinator, from: String, to: String, body: String) -> Self {
        Self {
            coordinator,
            from,
            to,
            body,
        }
    }
}

impl Command for SendCommand {
    async fn execute(&self) -> Result<()> {
        let (from, to, body) = (self.from.clone(), self.to.clone(), self.body.clone());
        let seq = blocking(&self.coordinator, move |c| c.send(&from, &to, &body)).await?;
        println!("Sent to {} (#{seq})", self.to);
        Ok(())
    }
}

pub struct MessagesCommand {
    coordinator: Coordinator,
    filter: HistoryFilter,
    json: bool,
}

impl MessagesCommand {
    pub fn new(coordinator: Coordinator, agent: Option<String>, last: Option<usize>) -> Self {
        Self {
            coordinator,
            filter: HistoryFilter { agent, last },
            json: false,
        }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

impl Command for MessagesCommand {
    async fn execute(&self) -> Result<()> {
        let filter = self.filter.clone();
        let messages = blocking(&self.coordinator, move |c| c.history(&filter)).await?;
        if self.json {
            return print_json(&messages);
        }
        if messages.is_empty() {
            println!("No messages found");
            return Ok(());
        }
        for message in &messages {
            print_line(message);
        }
        Ok(())
    }
}

pub struct InboxCommand {
    coordinator: Coordinator,
    agent: String,
    since: u64,
    json: bool,
}

impl InboxCommand {
    pub fn new(coordinator: Coordinator, agent: String, since: u64) -> Self {
        Self {
            coordinator,
            agent,
            since,
            json: false,
        }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

impl Command for InboxCommand {
    async fn execute(&self) -> Result<()> {
        let (agent, since) = (self.agent.clone(), self.since);
        let messages: Vec<Message> = blocking(&self.coordinator, move |c| {
            c.inbox(&agent, since)?.collect()
        })
        .await?;
        if self.json {
            return print_json(&messages);
        }
        if messages.is_empty() {
            println!("No new messages for {}", self.agent);
            return Ok(());
        }
        for message in &messages {
            print_line(message);
        }
        Ok(())
    }
}

fn print_line(message: &Message) {
    println!(
        "#{} [{}] {} -> {}: {}",
        message.id,
        message.created_at.format("%H:%M:%S"),
        message.from,
        message.to,
        preview(&message.body, 80)
    );
}
