use anyhow::Result;
use std::io::{BufRead, Write};

use super::{print_json, read_body, Command};
use crate::cli::CommentCommands;
use crate::coordinator::Coordinator;

pub struct CommentCommand {
    coordinator: Coordinator,
    action: CommentCommands,
}

impl CommentCommand {
    pub fn new(coordinator: Coordinator, action: CommentCommands) -> Self {
        Self {
            coordinator,
            action,
        }
    }
}

impl Command for CommentCommand {
    async fn execute(&self) -> Result<()> {
        match &self.action {
            CommentCommands::List { json } => {
                let comments = self.coordinator.mirror_list().await?;
                if *json {
                    return print_json(&comments);
                }
                if comments.is_empty() {
                    println!("No duo comments found");
                    return Ok(());
                }
                for comment in &comments {
                    println!("{:20} {}", comment.marker, comment.remote_id);
                }
            }
            CommentCommands::Get { id } => {
                println!("{}", self.coordinator.mirror_get(id).await?);
            }
            CommentCommands::Post {
                body,
                stdin,
                marker,
            } => {
                let body = read_body(body.clone(), *stdin, "comment body")?;
                let id = self
                    .coordinator
                    .mirror_post(&body, marker.as_deref())
                    .await?;
                println!("{id}");
            }
            CommentCommands::Edit { id, body, stdin } => {
                let body = read_body(body.clone(), *stdin, "comment body")?;
                let remote_id = self.coordinator.mirror_edit(id, &body).await?;
                println!("Updated {remote_id}");
            }
            CommentCommands::Delete { id, yes } => {
                if !*yes && !confirm(&format!("Delete comment {id}?"))? {
                    println!("Aborted");
                    return Ok(());
                }
                let remote_id = self.coordinator.mirror_delete(id).await?;
                println!("Deleted {remote_id}");
            }
        }
        Ok(())
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt} [y/N] ");
    std::io::stderr().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}
