use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Read;

use crate::coordinator::Coordinator;
use crate::error::DuoError;

pub mod agents;
pub mod comment;
pub mod config;
pub mod logs;
pub mod messaging;
pub mod state;
pub mod status;

#[allow(async_fn_in_trait)]
pub trait Command {
    async fn execute(&self) -> Result<()>;
}

/// Run ledger work on the blocking pool; lock waits sleep the thread they run on.
pub async fn blocking<T, F>(coordinator: &Coordinator, work: F) -> Result<T>
where
    F: FnOnce(Coordinator) -> Result<T, DuoError> + Send + 'static,
    T: Send + 'static,
{
    let coordinator = coordinator.clone();
    Ok(tokio::task::spawn_blocking(move || work(coordinator)).await??)
}

/// Body text from the positional argument or, with `--stdin`, from standard input.
pub fn read_body(arg: Option<String>, stdin: bool, what: &str) -> Result<String, DuoError> {
    let body = if stdin {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(DuoError::storage("reading stdin"))?;
        Some(buf)
    } else {
        arg
    };

    body.filter(|text| !text.trim().is_empty()).ok_or_else(|| {
        DuoError::Configuration(format!("{what} required (use argument or --stdin)"))
    })
}

/// Parse repeated `key=value` options.
pub fn parse_key_values(raw: &[String]) -> Result<BTreeMap<String, String>, DuoError> {
    raw.iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.to_string()))
            }
            _ => Err(DuoError::Configuration(format!(
                "option '{pair}' must look like key=value"
            ))),
        })
        .collect()
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// First line of `text`, cut to `max` characters.
pub fn preview(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    let mut out: String = line.chars().take(max).collect();
    if line.chars().count() > max || text.lines().nth(1).is_some() {
        out.push('…');
    }
    out
}
