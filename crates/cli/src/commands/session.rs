//! Session Commands

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use uuid::Uuid;

use crate::client::FarmClient;
use crate::generated::Session;
use crate::output::{print_item, print_list, print_success, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum SessionCommands {
    /// Reserve an available device
    Reserve {
        /// Mobile OS (android, ios)
        os: String,
    },

    /// Release a reserved device
    Release {
        /// Device serial or UDID
        device_id: String,

        /// Session returned by `reserve`
        session_id: Uuid,
    },

    /// List sessions
    List {
        /// Only sessions that have not been released
        #[arg(long)]
        open: bool,
    },
}

/// Reservation display wrapper for serialization
#[derive(Serialize)]
pub struct ReservationDisplay {
    pub device_id: String,
    pub session_id: String,
}

impl TableDisplay for ReservationDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Device", "Session"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.device_id.clone(), self.session_id.clone()]
    }
}

/// Session display wrapper for serialization
#[derive(Serialize)]
pub struct SessionDisplay {
    pub session_id: String,
    pub device_id: String,
    pub device_os: String,
    pub start_time: String,
    pub end_time: Option<String>,
}

impl From<Session> for SessionDisplay {
    fn from(session: Session) -> Self {
        Self {
            session_id: session.session_id,
            device_id: session.device_id,
            device_os: session.device_os,
            start_time: session.start_time,
            end_time: Some(session.end_time).filter(|t| !t.is_empty()),
        }
    }
}

impl TableDisplay for SessionDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Session", "Device", "OS", "Started", "Ended"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.session_id.clone(),
            self.device_id.clone(),
            self.device_os.clone(),
            self.start_time.clone(),
            self.end_time.clone().unwrap_or_else(|| "-".to_string()),
        ]
    }
}

pub async fn execute(
    cmd: SessionCommands,
    mut client: FarmClient,
    format: OutputFormat,
) -> Result<()> {
    match cmd {
        SessionCommands::Reserve { os } => {
            let os = super::parse_os(&os)?;
            let reservation = client.reserve_device(os).await?;
            print_item(
                &ReservationDisplay {
                    device_id: reservation.device_id,
                    session_id: reservation.session_id.to_string(),
                },
                format,
            );
        }

        SessionCommands::Release { device_id, session_id } => {
            client.release_device(&device_id, session_id).await?;
            print_success(&format!("Released {} (session {})", device_id, session_id));
        }

        SessionCommands::List { open } => {
            let sessions = client.list_sessions(open).await?;
            let displays: Vec<SessionDisplay> =
                sessions.into_iter().map(SessionDisplay::from).collect();
            print_list(&displays, format);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(end_time: &str) -> Session {
        Session {
            session_id: "6f1c2b1e-8a4d-4c3e-9a51-0d2f7b9e4a10".to_string(),
            device_id: "R58M1".to_string(),
            device_os: "android".to_string(),
            start_time: "2024-05-01T10:00:00+00:00".to_string(),
            end_time: end_time.to_string(),
        }
    }

    #[test]
    fn test_open_session_has_no_end() {
        let open = SessionDisplay::from(session(""));
        assert_eq!(open.end_time, None);
        assert_eq!(open.row()[4], "-");

        let closed = SessionDisplay::from(session("2024-05-01T10:05:00+00:00"));
        assert_eq!(closed.end_time.as_deref(), Some("2024-05-01T10:05:00+00:00"));
    }
}
