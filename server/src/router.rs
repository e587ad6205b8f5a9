//! Request routing by op code
//!
//! Every dispatched request yields exactly one [`Response`]. Handlers run on
//! their own task so that a panicking handler is reported as
//! [`Status::Error`] instead of taking the dispatch loop down with it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use log::{debug, error, warn};
use shared::codec::{self, Decode, DecodeError};
use shared::{PeerId, ProfileError, Status};
use thiserror::Error;

use crate::extensions::Extensions;
use crate::BoxFuture;

/// An inbound request together with the connection it arrived on
#[derive(Debug, Clone)]
pub struct Request {
    pub peer: PeerId,
    pub op_code: u16,
    pub payload: Vec<u8>,
    pub extensions: Arc<Extensions>,
}

impl Request {
    pub fn new(peer: PeerId, op_code: u16, payload: Vec<u8>, extensions: Arc<Extensions>) -> Self {
        Self {
            peer,
            op_code,
            payload,
            extensions,
        }
    }

    /// Decodes the whole payload as a single value
    pub fn decode<T: Decode>(&self) -> Result<T, DecodeError> {
        codec::from_bytes(&self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub message: Option<String>,
    pub payload: Vec<u8>,
}

impl Response {
    pub fn success(payload: Vec<u8>) -> Self {
        Self {
            status: Status::Success,
            message: None,
            payload,
        }
    }

    pub fn with_status(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
            payload: Vec::new(),
        }
    }
}

/// Ways a handler can refuse a request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    /// Details are logged, never sent to the client
    #[error("internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    pub fn status(&self) -> Status {
        match self {
            HandlerError::Failed(_) => Status::Failed,
            HandlerError::Unauthorized(_) => Status::Unauthorized,
            HandlerError::NotFound(_) => Status::Default,
            HandlerError::Internal(_) => Status::Error,
        }
    }
}

impl From<DecodeError> for HandlerError {
    fn from(err: DecodeError) -> Self {
        HandlerError::Failed(format!("malformed request: {}", err))
    }
}

impl From<ProfileError> for HandlerError {
    fn from(err: ProfileError) -> Self {
        HandlerError::Internal(err.to_string())
    }
}

impl From<HandlerError> for Response {
    fn from(err: HandlerError) -> Self {
        let message = match &err {
            HandlerError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        };
        Response::with_status(err.status(), message)
    }
}

pub type HandlerResult = Result<Vec<u8>, HandlerError>;

type Handler = Arc<dyn Fn(Request) -> BoxFuture<HandlerResult> + Send + Sync>;

#[derive(Default)]
pub struct MessageRouter {
    handlers: HashMap<u16, Handler>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the handler for `op_code`, replacing any previous one
    pub fn register_handler<F, Fut>(&mut self, op_code: u16, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |request| Box::pin(handler(request)));
        if self.handlers.insert(op_code, handler).is_some() {
            warn!("Handler for op {} was replaced", op_code);
        }
    }

    pub fn has_handler(&self, op_code: u16) -> bool {
        self.handlers.contains_key(&op_code)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs the handler registered for the request's op code
    pub async fn dispatch(&self, request: Request) -> Response {
        let op_code = request.op_code;
        let peer = request.peer;

        let Some(handler) = self.handlers.get(&op_code).cloned() else {
            debug!("No handler for op {} from peer {}", op_code, peer);
            return Response::with_status(Status::Default, format!("unknown op code {}", op_code));
        };

        match tokio::spawn(handler(request)).await {
            Ok(Ok(payload)) => Response::success(payload),
            Ok(Err(err)) => {
                match &err {
                    HandlerError::Internal(reason) => {
                        error!("Op {} from peer {} failed: {}", op_code, peer, reason)
                    }
                    other => debug!("Op {} from peer {} refused: {}", op_code, peer, other),
                }
                err.into()
            }
            Err(join_err) => {
                error!(
                    "Handler for op {} panicked on request from peer {}: {}",
                    op_code, peer, join_err
                );
                Response::with_status(Status::Error, "internal server error")
            }
        }
    }
}
