// src/core/failover/listener.rs

//! The standby RPC listener.
//!
//! A controller in standby answers only a small whitelist — `ping`,
//! `control-status`, `build-info`, `shutdown`, `takeover` — and rejects
//! everything else with "in standby mode" so clients retry against the
//! acting primary.

use crate::core::ControllerError;
use crate::core::failover::TAKEOVER_NOW;
use crate::core::protocol::MessageCodec;
use crate::core::protocol::message::{Body, ControlStatus, Message, ReturnCode};
use crate::core::rpc;
use crate::core::state::ControllerState;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{info, warn};

/// Runs the standby listener until shutdown is requested.
pub async fn run_listener(state: Arc<ControllerState>, listener: TcpListener) {
    info!("standby RPC listener started");
    loop {
        tokio::select! {
            _ = state.shutdown_notify.notified() => break,
            res = listener.accept() => {
                match res {
                    Ok((socket, addr)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(state, socket).await {
                                warn!(peer = %addr, error = %e, "standby connection error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "standby accept failed"),
                }
            }
        }
        if state.is_shutdown() {
            break;
        }
    }
    info!("standby RPC listener stopped");
}

async fn handle_connection(
    state: Arc<ControllerState>,
    socket: TcpStream,
) -> Result<(), ControllerError> {
    let mut framed = Framed::new(socket, MessageCodec);
    let Some(msg) = framed.next().await else {
        return Ok(());
    };
    let msg = msg?;
    let reply = process(&state, msg).await;
    framed.send(reply).await?;
    Ok(())
}

async fn process(state: &Arc<ControllerState>, msg: Message) -> Message {
    // Authentication first, exactly as on the primary path.
    let auth = match state.backends.auth.verify(&msg.header.auth_cred) {
        Ok(auth) => auth,
        Err(e) => return Message::new(Body::ReturnCode(ReturnCode { rc: e.wire_code() })),
    };

    match msg.body {
        Body::Ping => Message::new(Body::ReturnCode(ReturnCode { rc: 0 })),
        Body::ControlStatusRequest => Message::new(Body::ControlStatusResponse(ControlStatus {
            control_time: state.control_time.load(Ordering::SeqCst),
            backup_inx: state.backup_inx as u16,
        })),
        Body::BuildInfoRequest(req) => {
            match rpc::info::build_info(state, auth, req).await {
                Ok(body) => Message::new(body),
                Err(e) => Message::new(Body::ReturnCode(ReturnCode { rc: e.wire_code() })),
            }
        }
        Body::Shutdown(_) => {
            if auth.is_privileged() {
                info!("standby received shutdown request");
                state.request_shutdown();
                state.shutdown_notify.notify_waiters();
                Message::new(Body::ReturnCode(ReturnCode { rc: 0 }))
            } else {
                Message::new(Body::ReturnCode(ReturnCode {
                    rc: ControllerError::AccessDenied.wire_code(),
                }))
            }
        }
        Body::Takeover => {
            if auth.is_privileged() {
                warn!("takeover-now requested; will promote as soon as the primary is silent");
                TAKEOVER_NOW.store(true, Ordering::SeqCst);
                Message::new(Body::ReturnCode(ReturnCode { rc: 0 }))
            } else {
                Message::new(Body::ReturnCode(ReturnCode {
                    rc: ControllerError::AccessDenied.wire_code(),
                }))
            }
        }
        Body::Control => Message::new(Body::ReturnCode(ReturnCode {
            rc: ControllerError::Disabled.wire_code(),
        })),
        _ => Message::new(Body::ReturnCode(ReturnCode {
            rc: ControllerError::InStandbyMode.wire_code(),
        })),
    }
}
