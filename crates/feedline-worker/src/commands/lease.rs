//! `feedline-worker lease` command implementation

use anyhow::Result;
use chrono::Utc;
use feedline_common::time::format_timestamp;
use feedline_core::config::Config;
use feedline_core::lease::LeaseRecord;
use tracing::warn;

use crate::{services, LeaseCommand};

pub async fn run(config: &Config, command: &LeaseCommand) -> Result<()> {
    let pool = services::connect(config).await?;
    let leases = services::lease_service(config, &pool).await?;

    match command {
        LeaseCommand::Show { name } => {
            match leases.get_or_null(name).await? {
                Some(record) => println!("{}", describe(&record)),
                None => println!("Lease {} does not exist.", name),
            }
            Ok(())
        },
        LeaseCommand::Break { name } => {
            leases.break_lease(name).await?;

            warn!(lease = %name, "Lease broken manually");
            println!("Lease {} is now available.", name);
            Ok(())
        },
    }
}

fn describe(record: &LeaseRecord) -> String {
    let state = match record.end {
        Some(end) if record.is_held_at(Utc::now()) => format!("held until {}", format_timestamp(end)),
        Some(end) => format!("expired at {}", format_timestamp(end)),
        None => "released".to_string(),
    };
    format!("{}: {} (token {})", record.name, state, record.token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn record(end: Option<chrono::DateTime<Utc>>) -> LeaseRecord {
        LeaseRecord {
            name: "feedline-singleton".to_string(),
            end,
            token: "abc".to_string(),
        }
    }

    #[test]
    fn test_describe_lease_states() {
        let later = Utc::now() + TimeDelta::hours(1);
        let earlier = Utc::now() - TimeDelta::hours(1);

        assert!(describe(&record(Some(later))).contains("held until"));
        assert!(describe(&record(Some(earlier))).contains("expired at"));
        assert_eq!(
            describe(&record(None)),
            "feedline-singleton: released (token abc)"
        );
    }
}
