use std::time::SystemTime;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("could not determine the current user (none of USER, USERNAME, LOGNAME are set)")]
    UnknownUser,
}

/// Immutable identity of one recording run: who recorded, where, and when.
/// Created once per run and owned by the caller; the [crate::context::TraceContext]
/// that uses it only borrows it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceSession {
    pub size: u32,
    /// Constant placeholder by default. Callers running several concurrent
    /// sessions must supply distinct ids via [TraceSession::with_session_id];
    /// no uniqueness is assumed beyond "caller-provided and distinct".
    pub session_id: u64,
    pub machine_guid: String,
    pub sid: String,
    pub user_name: String,
    pub computer_name: String,
    pub domain_name: String,
    pub system_time: SystemTime,
}

impl TraceSession {
    pub const fn required_size() -> u32 {
        std::mem::size_of::<TraceSession>() as u32
    }

    /// Capture the machine/user identity of the current process.
    pub fn create() -> Result<TraceSession, SessionError> {
        let user_name = ["USER", "USERNAME", "LOGNAME"]
            .iter()
            .find_map(|x| std::env::var(x).ok())
            .ok_or(SessionError::UnknownUser)?;
        let computer_name = ["HOSTNAME", "COMPUTERNAME"]
            .iter()
            .find_map(|x| std::env::var(x).ok())
            .unwrap_or_else(|| "localhost".to_string());
        let domain_name = std::env::var("USERDOMAIN").unwrap_or_default();
        let machine_guid = std::fs::read_to_string("/etc/machine-id")
            .map(|x| x.trim().to_string())
            .unwrap_or_default();

        Ok(TraceSession {
            size: Self::required_size(),
            session_id: 1,
            machine_guid,
            sid: String::new(),
            user_name,
            computer_name,
            domain_name,
            system_time: SystemTime::now(),
        })
    }

    pub fn with_session_id(mut self, session_id: u64) -> TraceSession {
        self.session_id = session_id;
        self
    }
}
