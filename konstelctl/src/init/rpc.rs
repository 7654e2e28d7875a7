use crate::init::logbuf::LogBuffer;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use konstel_api::initproto;
use konstel_api::{InitRequest, InitResponse};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

#[cfg(test)]
use mockall::automock;

/* Largest single frame accepted from the bootstrapper. */
const MAX_FRAME_LENGTH: usize = 16 << 20;

/* How long to wait for the server to close the stream after the terminal frame. */
const CLOSE_GRACE: Duration = Duration::from_secs(10);

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DialError {
    #[error("connecting to bootstrapper: {0}")]
    Transport(String),

    /* the peer failed attestation, retrying cannot help */
    #[error("attestation of bootstrapper failed: {0}")]
    Attestation(String),
}

/*
 * Opens an attested, bidirectional byte stream to the bootstrapper.
 */
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InitDialer: Send + Sync {
    async fn dial(&self, endpoint: &str) -> Result<BoxedStream, DialError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
	Self{
	    attempts: 5,
	    initial: Duration::from_secs(1),
	    max: Duration::from_secs(16),
	}
    }
}

impl RetryPolicy {

    /* Backoff before retry number `retry` (0 based), doubling up to max. */
    pub fn delay(&self, retry: usize) -> Duration {
	let factor = 1u32.checked_shl(retry as u32).unwrap_or(u32::MAX);
	self.initial.saturating_mul(factor).min(self.max)
    }
}

/*
 * Dials with bounded exponential backoff. Transport errors are retried,
 * attestation failures are returned right away.
 */
pub async fn dial_with_retry(dialer: &dyn InitDialer, endpoint: &str, policy: &RetryPolicy) -> Result<BoxedStream, DialError> {
    let mut attempt = 0;
    loop {
	match dialer.dial(endpoint).await {
	    Ok(stream) => return Ok(stream),
	    Err(DialError::Attestation(msg)) => return Err(DialError::Attestation(msg)),
	    Err(err) => {
		attempt += 1;
		if attempt >= policy.attempts {
		    return Err(err);
		}
		let delay = policy.delay(attempt - 1);
		log::debug!("dialing {} failed (attempt {}/{}): {}, retrying in {:?}", endpoint, attempt, policy.attempts, err, delay);
		tokio::time::sleep(delay).await;
	    },
	}
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    #[error("stream broke: {0}")]
    Transport(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("bootstrapper reported failure: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitSuccess {
    pub owner_id: String,
    pub cluster_id: String,
    pub kubeconfig: Vec<u8>,
}

pub fn framed(stream: BoxedStream) -> Framed<BoxedStream, LengthDelimitedCodec> {
    LengthDelimitedCodec::builder()
	.max_frame_length(MAX_FRAME_LENGTH)
	.new_framed(stream)
}

/*
 * Sends the request and consumes the response stream. A background task
 * reads every frame, appending log lines to `logs` and handing the terminal
 * frame over; afterwards it keeps reading until the server closes the
 * stream so trailing frames are caught as protocol violations. Read errors
 * after the terminal frame only end the stream.
 */
pub async fn call(stream: BoxedStream, req: &InitRequest, logs: Arc<Mutex<LogBuffer>>) -> Result<InitSuccess, CallError> {
    let mut transport = framed(stream);

    let payload = initproto::encode(req).map_err(|e| CallError::Protocol(e.to_string()))?;
    transport.send(Bytes::from(payload)).await.map_err(|e| CallError::Transport(e.to_string()))?;

    let (terminal_tx, terminal_rx) = oneshot::channel::<Result<InitResponse, CallError>>();

    let consumer = tokio::spawn(async move {
	let mut terminal_tx = Some(terminal_tx);
	while let Some(frame) = transport.next().await {
	    let frame = match frame {
		Ok(frame) => frame,
		Err(err) => {
		    // the outcome is known once the terminal frame is in, a peer
		    // dropping the connection without a clean close changes nothing
		    match terminal_tx.take() {
			Some(tx) => { let _ = tx.send(Err(CallError::Transport(err.to_string()))); },
			None => log::debug!("bootstrapper stream broke after the terminal frame: {}", err),
		    }
		    return Ok(());
		},
	    };

	    let resp: InitResponse = match initproto::decode(&frame) {
		Ok(resp) => resp,
		Err(err) => {
		    let err = CallError::Protocol(format!("undecodable frame: {}", err));
		    return match terminal_tx.take() {
			Some(tx) => { let _ = tx.send(Err(err)); Ok(()) },
			None => Err(err),
		    };
		},
	    };

	    match (resp, terminal_tx.take()) {
		(InitResponse::Log{ line }, Some(tx)) => {
		    if let Ok(mut logs) = logs.lock() {
			logs.push(&line);
		    }
		    terminal_tx = Some(tx);
		},
		(InitResponse::Log{ .. }, None) => {
		    return Err(CallError::Protocol("log frame after terminal frame".to_string()));
		},
		(terminal, Some(tx)) => {
		    let _ = tx.send(Ok(terminal));
		},
		(_, None) => {
		    return Err(CallError::Protocol("more than one terminal frame".to_string()));
		},
	    }
	}

	if let Some(tx) = terminal_tx.take() {
	    let _ = tx.send(Err(CallError::Protocol("stream closed before the terminal frame".to_string())));
	}
	Ok(())
    });

    let terminal = match terminal_rx.await {
	Ok(terminal) => terminal?,
	Err(_) => return Err(CallError::Protocol("log consumer stopped unexpectedly".to_string())),
    };

    // rendezvous with the consumer on stream close
    match tokio::time::timeout(CLOSE_GRACE, consumer).await {
	Ok(Ok(Ok(()))) => {},
	Ok(Ok(Err(err))) => return Err(err),
	Ok(Err(join_err)) => return Err(CallError::Protocol(format!("log consumer failed: {}", join_err))),
	Err(_) => log::debug!("bootstrapper kept the stream open after the terminal frame"),
    }

    match terminal {
	InitResponse::Success{ owner_id, cluster_id, kubeconfig } => Ok(InitSuccess{
	    owner_id: owner_id,
	    cluster_id: cluster_id,
	    kubeconfig: kubeconfig,
	}),
	InitResponse::Failure{ error } => Err(CallError::Failed(error)),
	InitResponse::Log{ .. } => Err(CallError::Protocol("log frame taken for terminal frame".to_string())),
    }
}
