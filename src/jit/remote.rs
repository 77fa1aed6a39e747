//! Out-of-process compilation
//!
//! The client ships a work item, its snapshot and the configuration to a
//! compile server; the server runs the pipeline up to encoding and answers
//! with bytes and an output record, or a failure code. The client allocates
//! executable memory, copies and finalizes locally. Messages are bincode and
//! travel over a byte channel, so any transport that moves `Vec<u8>` works.

use super::context::JitContext;
use super::encoder::EncodedFunction;
use super::output::OutputRecord;
use super::pipeline::Pipeline;
use super::queue::CompileBackend;
use super::snapshot::JitSnapshot;
use super::work_item::WorkItem;
use crate::config::JitConfig;
use crate::error::{Error, FailureCode, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileRequest {
    pub work_item: WorkItem,
    pub snapshot: JitSnapshot,
    pub config: JitConfig,
    /// Context cookie, so blinding keys match an in-process compile
    pub cookie: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CompileResponse {
    Compiled {
        code: Vec<u8>,
        record: OutputRecord,
        constants: Vec<String>,
    },
    Failed {
        code: FailureCode,
        message: String,
    },
}

impl CompileResponse {
    pub fn into_result(self) -> Result<EncodedFunction> {
        match self {
            CompileResponse::Compiled { code, record, constants } => Ok(EncodedFunction { code, record, constants }),
            CompileResponse::Failed { code, message } => Err(Error::from_failure(code, message)),
        }
    }
}

impl From<Result<EncodedFunction>> for CompileResponse {
    fn from(result: Result<EncodedFunction>) -> Self {
        match result {
            Ok(encoded) => CompileResponse::Compiled {
                code: encoded.code,
                record: encoded.record,
                constants: encoded.constants,
            },
            Err(e) => CompileResponse::Failed {
                code: e.failure_code(),
                message: e.to_string(),
            },
        }
    }
}

pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    bincode::serialize(message).map_err(|e| Error::SerializationError(e.to_string()))
}

pub fn decode_message<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::SerializationError(e.to_string()))
}

// ==================== Server ====================

/// Runs compile requests; never touches executable memory
#[derive(Debug, Default)]
pub struct JitServer {
    handled: u64,
}

impl JitServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handled(&self) -> u64 {
        self.handled
    }

    pub fn compile(&mut self, request: &CompileRequest) -> CompileResponse {
        self.handled += 1;
        let result = request
            .config
            .validate()
            .and_then(|()| Pipeline::new(&request.config, request.cookie).compile(&request.work_item, &request.snapshot));
        CompileResponse::from(result)
    }

    /// Decode one request and encode its response. A request that does not
    /// decode still gets an answer.
    pub fn handle(&mut self, bytes: &[u8]) -> Result<Vec<u8>> {
        let response = match decode_message::<CompileRequest>(bytes) {
            Ok(request) => {
                debug!(work = %request.work_item, "remote compile");
                self.compile(&request)
            }
            Err(e) => CompileResponse::Failed {
                code: e.failure_code(),
                message: e.to_string(),
            },
        };
        encode_message(&response)
    }

    /// Answer requests until the client hangs up
    pub fn serve(mut self, requests: Receiver<Vec<u8>>, responses: Sender<Vec<u8>>) {
        for bytes in requests {
            let reply = match self.handle(&bytes) {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(error = %e, "compile server cannot encode a response");
                    break;
                }
            };
            if responses.send(reply).is_err() {
                break;
            }
        }
        debug!(handled = self.handled, "compile server stopped");
    }
}

// ==================== Client ====================

struct Link {
    requests: Option<Sender<Vec<u8>>>,
    responses: Receiver<Vec<u8>>,
}

/// Client side of the compile server, which runs on its own thread
pub struct RemoteCompiler {
    link: Mutex<Link>,
    server: Option<JoinHandle<()>>,
}

impl RemoteCompiler {
    pub fn spawn() -> Result<Self> {
        let (request_tx, request_rx) = mpsc::channel::<Vec<u8>>();
        let (response_tx, response_rx) = mpsc::channel::<Vec<u8>>();
        let server = std::thread::Builder::new()
            .name("jit-server".into())
            .spawn(move || JitServer::new().serve(request_rx, response_tx))?;
        Ok(Self {
            link: Mutex::new(Link {
                requests: Some(request_tx),
                responses: response_rx,
            }),
            server: Some(server),
        })
    }

    /// Send one request and wait for its response
    pub fn request(&self, request: &CompileRequest) -> Result<EncodedFunction> {
        let bytes = encode_message(request)?;
        let link = self
            .link
            .lock()
            .map_err(|_| Error::internal("compile server link poisoned"))?;
        let sender = link
            .requests
            .as_ref()
            .ok_or_else(|| Error::internal("compile server is shut down"))?;
        sender
            .send(bytes)
            .map_err(|_| Error::internal("compile server hung up"))?;
        let reply = link
            .responses
            .recv()
            .map_err(|_| Error::internal("compile server hung up"))?;
        decode_message::<CompileResponse>(&reply)?.into_result()
    }
}

impl CompileBackend for RemoteCompiler {
    fn compile(&self, work: &WorkItem, snapshot: &JitSnapshot, context: &JitContext) -> Result<EncodedFunction> {
        self.request(&CompileRequest {
            work_item: work.clone(),
            snapshot: snapshot.clone(),
            config: context.config().clone(),
            cookie: context.cookie(),
        })
    }
}

impl Drop for RemoteCompiler {
    fn drop(&mut self) {
        if let Ok(mut link) = self.link.lock() {
            link.requests = None;
        }
        if let Some(server) = self.server.take() {
            let _ = server.join();
        }
    }
}
