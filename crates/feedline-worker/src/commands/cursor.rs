//! `feedline-worker cursor` command implementation

use anyhow::{Context, Result};
use feedline_common::time::{format_timestamp, parse_timestamp};
use feedline_core::config::Config;
use feedline_core::cursor::{min_timestamp, CursorStore, PgCursorStore};
use tracing::info;

use crate::{services, CursorCommand};

pub async fn run(config: &Config, command: &CursorCommand) -> Result<()> {
    let pool = services::connect(config).await?;
    let cursors = PgCursorStore::new(pool);

    match command {
        CursorCommand::List => list(&cursors).await,
        CursorCommand::Get { name } => {
            let value = cursors.get_value(name).await?;
            println!("{}", describe(name, value));
            Ok(())
        },
        CursorCommand::Set { name, value } => {
            let value = parse_timestamp(value)
                .with_context(|| format!("Invalid value for cursor {}", name))?;
            let previous = cursors.get_value(name).await?;
            cursors.set_value(name, value).await?;

            info!(cursor = %name, from = %previous, to = %value, "Cursor set manually");
            println!("{}", describe(name, value));
            Ok(())
        },
        CursorCommand::Reset { name } => {
            cursors.reset_value(name).await?;

            info!(cursor = %name, "Cursor reset manually");
            println!("{}", describe(name, min_timestamp()));
            Ok(())
        },
    }
}

async fn list(cursors: &PgCursorStore) -> Result<()> {
    let names = cursors.get_all_names().await?;
    if names.is_empty() {
        println!("No cursors found.");
        return Ok(());
    }

    for name in names {
        let value = cursors.get_value(&name).await?;
        println!("{}", describe(&name, value));
    }
    Ok(())
}

fn describe(name: &str, value: chrono::DateTime<chrono::Utc>) -> String {
    if value == min_timestamp() {
        format!("{:<40} (not started)", name)
    } else {
        format!("{:<40} {}", name, format_timestamp(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_describe_unstarted_cursor() {
        assert!(describe("summaries", min_timestamp()).ends_with("(not started)"));
    }

    #[test]
    fn test_describe_formats_value() {
        let value = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let line = describe("summaries", value);
        assert!(line.starts_with("summaries "));
        assert!(line.ends_with(&format_timestamp(value)));
    }
}
