//! Transaction engine: one command/data/response exchange at a time per device.
//!
//! Each call allocates the next transaction id, sends the command container, optionally sends
//! an outbound data phase (header and payload as separate transfers), then reads containers
//! until the response arrives. Inbound data containers for the same transaction are collected
//! as the call's payload. Any framing problem fails the call; nothing is retried here.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use log::{debug, warn};

use super::codes::{ContainerType, OperationCode, ResponseCode};
use super::container::{self, Container, HEADER_LEN, MAX_PARAMS};
use super::errors::PtpError;
use crate::ignore_poison::IgnorePoison;
use crate::stats::StorageStats;
use crate::transport::Transport;

/// Consecutive empty transfers tolerated while waiting for a container (zero-length packets).
const MAX_EMPTY_RECEIVES: u32 = 4;

/// Result of a completed exchange. The code may be any response code; use [`Response::ok`]
/// to turn a non-OK code into an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub operation: OperationCode,
    pub transaction_id: u32,
    pub code: ResponseCode,
    pub params: Vec<u32>,
    /// Inbound data phase, if the device sent one.
    pub data: Option<Bytes>,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    /// Converts a non-OK response into [`PtpError::Device`].
    pub fn ok(self) -> Result<Self, PtpError> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(PtpError::Device {
                operation: self.operation,
                code: self.code,
            })
        }
    }

    pub fn param(&self, index: usize) -> Option<u32> {
        self.params.get(index).copied()
    }

    /// The inbound data phase, or a framing error if the device skipped it.
    pub fn expect_data(&self) -> Result<&Bytes, PtpError> {
        self.data
            .as_ref()
            .ok_or_else(|| PtpError::framing(format!("{} returned no data phase", self.operation)))
    }
}

struct EngineState {
    transport: Box<dyn Transport>,
    next_transaction_id: u32,
    session_id: Option<u32>,
    /// Received bytes not yet consumed as a container.
    rx: Vec<u8>,
}

impl EngineState {
    fn allocate_transaction_id(&mut self) -> u32 {
        let id = self.next_transaction_id;
        // 0 and 0xFFFFFFFF are reserved by the protocol.
        self.next_transaction_id = match id.wrapping_add(1) {
            0 | u32::MAX => 1,
            next => next,
        };
        id
    }
}

pub struct TransactionEngine {
    state: Mutex<EngineState>,
    stats: Arc<StorageStats>,
    max_packet_size: usize,
}

impl TransactionEngine {
    pub fn new(transport: Box<dyn Transport>, stats: Arc<StorageStats>, max_packet_size: usize) -> Self {
        Self {
            state: Mutex::new(EngineState {
                transport,
                next_transaction_id: 1,
                session_id: None,
                rx: Vec::new(),
            }),
            stats,
            max_packet_size: max_packet_size.max(HEADER_LEN),
        }
    }

    pub fn stats(&self) -> &Arc<StorageStats> {
        &self.stats
    }

    pub fn session_id(&self) -> Option<u32> {
        self.state.lock_ignore_poison().session_id
    }

    pub fn is_session_open(&self) -> bool {
        self.session_id().is_some()
    }

    pub(crate) fn set_session(&self, session_id: Option<u32>) {
        self.state.lock_ignore_poison().session_id = session_id;
    }

    /// The id the next exchange will use.
    pub fn next_transaction_id(&self) -> u32 {
        self.state.lock_ignore_poison().next_transaction_id
    }

    /// Runs one transaction.
    ///
    /// Blocks until the response arrives or the transport fails. Concurrent callers queue on
    /// the engine lock, so at most one exchange is in flight per device.
    pub fn execute(
        &self,
        operation: OperationCode,
        params: &[u32],
        payload: Option<&[u8]>,
    ) -> Result<Response, PtpError> {
        self.exclusive().execute(operation, params, payload)
    }

    /// Like [`execute`](Self::execute), but a non-OK response code becomes an error.
    pub fn execute_ok(
        &self,
        operation: OperationCode,
        params: &[u32],
        payload: Option<&[u8]>,
    ) -> Result<Response, PtpError> {
        self.execute(operation, params, payload)?.ok()
    }

    /// Takes the engine lock for a run of exchanges that must reach the device back to back,
    /// such as the two halves of an upload. Every other caller, background tasks included,
    /// waits until the returned guard is dropped.
    pub fn exclusive(&self) -> ExclusiveEngine<'_> {
        ExclusiveEngine {
            engine: self,
            state: self.state.lock_ignore_poison(),
        }
    }

    fn exchange(
        &self,
        state: &mut EngineState,
        operation: OperationCode,
        transaction_id: u32,
        params: &[u32],
        payload: Option<&[u8]>,
    ) -> Result<Response, PtpError> {
        let command = Container::command(operation.code(), transaction_id, params).encode()?;
        state.transport.send(&command)?;

        if let Some(payload) = payload {
            let header = container::data_header(operation.code(), transaction_id, payload.len())?;
            state.transport.send(&header)?;
            if !payload.is_empty() {
                state.transport.send(payload)?;
            }
        }

        let mut data: Option<BytesMut> = None;
        loop {
            let incoming = self.read_container(state)?;
            if incoming.transaction_id != transaction_id {
                return Err(PtpError::framing(format!(
                    "{operation}: expected transaction id {transaction_id}, got {} in {} container",
                    incoming.transaction_id, incoming.kind
                )));
            }
            match incoming.kind {
                ContainerType::Data => match data.as_mut() {
                    Some(buf) => buf.extend_from_slice(&incoming.payload),
                    None => data = Some(BytesMut::from(incoming.payload.as_ref())),
                },
                ContainerType::Response => {
                    return Ok(Response {
                        operation,
                        transaction_id,
                        code: ResponseCode::from_code(incoming.code),
                        params: incoming.params,
                        data: data.map(BytesMut::freeze),
                    });
                }
                other => {
                    return Err(PtpError::framing(format!(
                        "{operation}: unexpected {other} container while waiting for the response"
                    )));
                }
            }
        }
    }

    /// Reassembles the next complete container from the transport.
    fn read_container(&self, state: &mut EngineState) -> Result<Container, PtpError> {
        let mut empty_receives = 0;
        loop {
            if let Some(length) = container::peek_length(&state.rx) {
                if length < HEADER_LEN {
                    return Err(PtpError::framing(format!("declared container length {length} is below the header size")));
                }
                if state.rx.len() >= length {
                    let frame: Vec<u8> = state.rx.drain(..length).collect();
                    return Container::decode(&frame);
                }
                let missing = length - state.rx.len();
                if state.rx.try_reserve(missing).is_err() {
                    return Err(PtpError::OutOfMemory { bytes: length });
                }
            }

            let chunk = state.transport.receive(self.max_packet_size)?;
            if chunk.is_empty() {
                empty_receives += 1;
                if empty_receives > MAX_EMPTY_RECEIVES {
                    return Err(PtpError::framing("transport keeps returning empty transfers"));
                }
                continue;
            }
            empty_receives = 0;
            state.rx.extend_from_slice(&chunk);
        }
    }
}

/// The engine with its lock held. See [`TransactionEngine::exclusive`].
pub struct ExclusiveEngine<'a> {
    engine: &'a TransactionEngine,
    state: MutexGuard<'a, EngineState>,
}

impl ExclusiveEngine<'_> {
    pub fn execute(
        &mut self,
        operation: OperationCode,
        params: &[u32],
        payload: Option<&[u8]>,
    ) -> Result<Response, PtpError> {
        if params.len() > MAX_PARAMS {
            return Err(PtpError::invalid_argument(format!(
                "{operation} given {} parameters, the limit is {MAX_PARAMS}",
                params.len()
            )));
        }
        if let Some(payload) = payload
            && HEADER_LEN.checked_add(payload.len()).is_none_or(|len| len > u32::MAX as usize)
        {
            return Err(PtpError::invalid_argument(format!(
                "{operation} payload of {} bytes does not fit a container",
                payload.len()
            )));
        }

        let engine = self.engine;
        let state = &mut *self.state;
        if operation != OperationCode::OpenSession && state.session_id.is_none() {
            debug!("PTP: rejecting {operation}, no session open");
            return Err(PtpError::NotConnected);
        }

        let transaction_id = state.allocate_transaction_id();
        let started = Instant::now();
        let result = engine.exchange(state, operation, transaction_id, params, payload);
        let elapsed = started.elapsed();

        match &result {
            Ok(response) => {
                debug!(
                    "PTP: {operation} tid={transaction_id} -> {} in {:?} (data={} bytes)",
                    response.code,
                    elapsed,
                    response.data.as_ref().map_or(0, |d| d.len())
                );
                engine.stats.record_exchange(elapsed, response.is_ok());
            }
            Err(e) => {
                if matches!(e, PtpError::Framing { .. }) {
                    warn!("PTP: {operation} tid={transaction_id} framing failure: {e}");
                } else {
                    debug!("PTP: {operation} tid={transaction_id} failed: {e}");
                }
                // The stream position is unknown after a failed exchange.
                state.rx.clear();
                engine.stats.record_exchange(elapsed, false);
            }
        }
        result
    }

    pub fn execute_ok(
        &mut self,
        operation: OperationCode,
        params: &[u32],
        payload: Option<&[u8]>,
    ) -> Result<Response, PtpError> {
        self.execute(operation, params, payload)?.ok()
    }
}
