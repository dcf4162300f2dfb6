// src/core/failover/client.rs

//! A minimal blocking client for controller-to-controller RPCs: the
//! standby's liveness pings and the takeover handshake.

use crate::core::ControllerError;
use crate::core::protocol::MessageCodec;
use crate::core::protocol::message::{Body, ControlStatus, Message};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

pub struct PeerClient {
    framed: Framed<TcpStream, MessageCodec>,
    auth_cred: Bytes,
}

impl PeerClient {
    /// Connects to a peer controller within `timeout`.
    pub async fn connect(
        addr: &str,
        auth_cred: Bytes,
        timeout: Duration,
    ) -> Result<Self, ControllerError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ControllerError::Protocol(format!("connect to {addr} timed out")))??;
        Ok(Self {
            framed: Framed::new(stream, MessageCodec),
            auth_cred,
        })
    }

    async fn exchange(
        &mut self,
        body: Body,
        timeout: Duration,
    ) -> Result<Body, ControllerError> {
        let mut msg = Message::new(body);
        msg.header.auth_cred = self.auth_cred.clone();
        let io = async {
            self.framed.send(msg).await?;
            match self.framed.next().await {
                Some(Ok(reply)) => Ok(reply.body),
                Some(Err(e)) => Err(e),
                None => Err(ControllerError::Protocol(
                    "peer closed connection before reply".to_string(),
                )),
            }
        };
        tokio::time::timeout(timeout, io)
            .await
            .map_err(|_| ControllerError::Protocol("peer rpc timed out".to_string()))?
    }

    /// `control-status`: who is primary over there, and since when.
    pub async fn control_status(
        &mut self,
        timeout: Duration,
    ) -> Result<ControlStatus, ControllerError> {
        match self.exchange(Body::ControlStatusRequest, timeout).await? {
            Body::ControlStatusResponse(status) => Ok(status),
            Body::ReturnCode(rc) => Err(ControllerError::from_wire(rc.rc)
                .unwrap_or(ControllerError::Protocol("unexpected success".to_string()))),
            other => Err(ControllerError::Protocol(format!(
                "unexpected control-status reply {}",
                other.msg_type()
            ))),
        }
    }

    /// Sends one of the shutdown-family verbs and awaits the ack.
    pub async fn send_simple(
        &mut self,
        body: Body,
        timeout: Duration,
    ) -> Result<u32, ControllerError> {
        match self.exchange(body, timeout).await? {
            Body::ReturnCode(rc) => Ok(rc.rc),
            other => Err(ControllerError::Protocol(format!(
                "unexpected reply {}",
                other.msg_type()
            ))),
        }
    }
}
