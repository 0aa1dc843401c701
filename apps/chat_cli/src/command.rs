use anyhow::{anyhow, Context, Result};
use shared::domain::{RoomId, UserId};

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Rooms,
    Open(RoomId),
    With(UserId),
    History,
    Typing,
    Quit,
    Send(String),
    Blank,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Self::Blank);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Self::Send(line.to_string()));
        };
        let mut parts = rest.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let arg = parts.next();
        match name {
            "rooms" => Ok(Self::Rooms),
            "open" => Ok(Self::Open(RoomId(parse_id(arg, "room id")?))),
            "with" => Ok(Self::With(UserId(parse_id(arg, "user id")?))),
            "history" => Ok(Self::History),
            "typing" => Ok(Self::Typing),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(anyhow!("unknown command '/{other}'")),
        }
    }
}

fn parse_id(arg: Option<&str>, what: &str) -> Result<i64> {
    let raw = arg.with_context(|| format!("missing {what}"))?;
    raw.parse()
        .with_context(|| format!("'{raw}' is not a valid {what}"))
}
