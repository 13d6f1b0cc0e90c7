//! Session lifecycle.
//!
//! The engine itself refuses every operation except `OpenSession` while no session is
//! recorded, so this manager only has to drive the open/close exchanges and keep the recorded
//! state honest.

use std::sync::Arc;

use log::{info, warn};
use serde::Serialize;

use super::codes::{OperationCode, ResponseCode};
use super::engine::TransactionEngine;
use super::errors::PtpError;

/// The only session id this crate opens.
pub const SESSION_ID: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Closed,
    Open,
}

pub struct SessionManager {
    engine: Arc<TransactionEngine>,
}

impl SessionManager {
    pub fn new(engine: Arc<TransactionEngine>) -> Self {
        Self { engine }
    }

    pub fn state(&self) -> SessionState {
        if self.engine.is_session_open() {
            SessionState::Open
        } else {
            SessionState::Closed
        }
    }

    /// Opens the session. A no-op when one is already open.
    ///
    /// A device that still holds a session from an earlier host process answers
    /// `SessionAlreadyOpen`; that session is adopted.
    pub fn open(&self) -> Result<(), PtpError> {
        if self.engine.is_session_open() {
            return Ok(());
        }
        let response = self.engine.execute(OperationCode::OpenSession, &[SESSION_ID], None)?;
        match response.code {
            ResponseCode::Ok => info!("PTP session {SESSION_ID} opened"),
            ResponseCode::SessionAlreadyOpen => info!("PTP session {SESSION_ID} was already open on the device"),
            _ => {
                response.ok()?;
            }
        }
        self.engine.set_session(Some(SESSION_ID));
        Ok(())
    }

    /// Closes the session. Idempotent; local state is cleared even if the device rejects the
    /// close or the link is already gone.
    pub fn close(&self) {
        if !self.engine.is_session_open() {
            return;
        }
        match self.engine.execute(OperationCode::CloseSession, &[], None) {
            Ok(response) if response.is_ok() || response.code == ResponseCode::SessionNotOpen => {
                info!("PTP session {SESSION_ID} closed");
            }
            Ok(response) => warn!("CloseSession answered {}, dropping the session anyway", response.code),
            Err(e) => warn!("CloseSession failed ({e}), dropping the session anyway"),
        }
        self.engine.set_session(None);
    }
}
