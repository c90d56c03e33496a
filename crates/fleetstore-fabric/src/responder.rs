//! Node side of a link
//!
//! A storage agent runs [`serve_link`] on every accepted link. Pings and
//! self-tests are answered here; block requests are dispatched to the
//! agent's [`RequestHandler`], each in its own task so a slow read does not
//! hold up other requests multiplexed on the same link.

use crate::error::FabricResult;
use crate::frame::{self, Envelope, FrameKind, Reassembler, split_message};
use crate::protocol::{self, NodeRequest, NodeResponse, RemoteError};
use crate::transport::Link;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

/// Executes node requests
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: NodeRequest) -> Result<NodeResponse, RemoteError>;
}

fn reply_frames(id: u64, result: Result<NodeResponse, RemoteError>, max_frame_payload: usize) -> Vec<Envelope> {
    let encoded = match &result {
        Ok(response) => protocol::encode(response).map(|body| (FrameKind::Response, body)),
        Err(error) => protocol::encode(error).map(|body| (FrameKind::Error, body)),
    };
    match encoded {
        Ok((kind, body)) => split_message(id, kind, body, max_frame_payload),
        Err(e) => {
            warn!(id, error = %e, "failed to encode reply");
            Vec::new()
        }
    }
}

/// Serve one link until the peer closes it
pub async fn serve_link(link: Link, handler: Arc<dyn RequestHandler>, max_frame_payload: usize) -> FabricResult<()> {
    let (reader, writer) = tokio::io::split(link);
    let mut frames = FramedRead::new(reader, frame::codec(max_frame_payload));
    let mut sink = FramedWrite::new(writer, frame::codec(max_frame_payload));

    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let writer_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let encoded = match envelope.encode() {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!(error = %e, "failed to encode frame");
                    continue;
                }
            };
            if let Err(e) = sink.send(encoded).await {
                debug!(error = %e, "link writer stopped");
                break;
            }
        }
    });

    let mut reassembler = Reassembler::new();
    while let Some(frame) = frames.next().await {
        let envelope = Envelope::decode(&frame?)?;
        match envelope.kind {
            FrameKind::Ping => {
                let _ = tx.send(Envelope::control(FrameKind::Pong, envelope.id));
                continue;
            }
            FrameKind::Close => break,
            FrameKind::Request => {}
            FrameKind::Pong | FrameKind::Response | FrameKind::Error => continue,
        }
        let Some(message) = reassembler.push(envelope)? else {
            continue;
        };
        let request = match protocol::decode::<NodeRequest>(&message.body) {
            Ok(request) => request,
            Err(e) => {
                for env in reply_frames(message.id, Err(RemoteError::bad_request(e.to_string())), max_frame_payload) {
                    let _ = tx.send(env);
                }
                continue;
            }
        };
        let tx = tx.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            let result = match request {
                NodeRequest::Ping => Ok(NodeResponse::Pong),
                NodeRequest::SelfTest { payload } => Ok(NodeResponse::SelfTest { payload }),
                request => handler.handle(request).await,
            };
            for env in reply_frames(message.id, result, max_frame_payload) {
                if tx.send(env).is_err() {
                    break;
                }
            }
        });
    }

    drop(tx);
    let _ = writer_task.await;
    Ok(())
}

/// Accept TCP links and serve each until the listener fails
pub async fn serve_listener(
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    max_frame_payload: usize,
) -> FabricResult<()> {
    loop {
        let (stream, remote) = listener.accept().await?;
        stream.set_nodelay(true)?;
        info!(remote = %remote, "accepted link");
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_link(Box::new(stream), handler, max_frame_payload).await {
                warn!(remote = %remote, error = %e, "link failed");
            }
        });
    }
}
