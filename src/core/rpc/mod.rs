// src/core/rpc/mod.rs

//! The RPC dispatch table.
//!
//! Every inbound message is authenticated, then routed to its handler.
//! Each handler declares and acquires exactly the lock vector it needs;
//! the dispatcher itself holds nothing. Handlers return a response body;
//! errors become a `ReturnCode` reply carrying the stable wire code.

pub mod admin;
pub mod info;
pub mod job;

use crate::core::ControllerError;
use crate::core::backends::auth::AuthInfo;
use crate::core::metrics;
use crate::core::protocol::message::{Body, Message, ReturnCode};
use crate::core::state::ControllerState;
use std::sync::Arc;
use tracing::{debug, warn};

/// Authenticates and dispatches one request, producing the reply message.
pub async fn dispatch(state: &Arc<ControllerState>, msg: Message) -> Message {
    let msg_type = msg.header.msg_type;
    metrics::RPC_REQUESTS_TOTAL
        .with_label_values(&[&msg_type.to_string()])
        .inc();

    let auth = match state.backends.auth.verify(&msg.header.auth_cred) {
        Ok(auth) => auth,
        Err(e) => {
            warn!(%msg_type, "request failed authentication");
            return error_reply(e);
        }
    };

    debug!(%msg_type, uid = auth.uid, "dispatching request");
    let result = route(state, auth, msg.body).await;
    match result {
        Ok(body) => Message::new(body),
        Err(e) => {
            metrics::RPC_ERRORS_TOTAL.inc();
            debug!(%msg_type, error = %e, "request failed");
            error_reply(e)
        }
    }
}

fn error_reply(e: ControllerError) -> Message {
    Message::new(Body::ReturnCode(ReturnCode { rc: e.wire_code() }))
}

async fn route(
    state: &Arc<ControllerState>,
    auth: AuthInfo,
    body: Body,
) -> Result<Body, ControllerError> {
    match body {
        Body::Ping | Body::PingWorker => Ok(Body::ReturnCode(ReturnCode { rc: 0 })),

        Body::BuildInfoRequest(req) => info::build_info(state, auth, req).await,
        Body::JobInfoRequest(req) => info::job_info(state, auth, req, None).await,
        Body::JobInfoSingleRequest(job_id) => {
            info::job_info(state, auth, Default::default(), Some(job_id)).await
        }
        Body::NodeInfoRequest(req) => info::node_info(state, auth, req).await,
        Body::PartInfoRequest(req) => info::partition_info(state, auth, req).await,

        Body::SubmitBatchJob(desc) => job::submit_batch_job(state, auth, *desc).await,
        Body::AllocateResources(desc) => job::allocate_resources(state, auth, *desc).await,
        Body::JobWillRun(desc) => job::job_will_run(state, auth, *desc).await,
        Body::CancelJobStep(req) => job::cancel_job_step(state, auth, req).await,
        Body::CompleteJobAllocation(req) => job::complete_job_allocation(state, auth, req).await,
        Body::CompleteBatchScript(req) => job::complete_batch_script(state, auth, req).await,
        Body::JobStepCreate(req) => job::job_step_create(state, auth, req).await,
        Body::StepComplete(req) => job::step_complete(state, auth, req).await,
        Body::EpilogComplete(req) => job::epilog_complete(state, auth, req).await,
        Body::RegisterNode(req) => admin::register_node(state, auth, req).await,

        Body::UpdateJob(req) => admin::update_job(state, auth, req).await,
        Body::UpdateNode(req) => admin::update_node(state, auth, req).await,
        Body::UpdatePartition(req) => admin::update_partition(state, auth, req).await,
        Body::Reconfigure => admin::reconfigure(state, auth).await,
        Body::Shutdown(req) => admin::shutdown(state, auth, req).await,
        Body::Control => admin::relinquish_control(state, auth).await,
        Body::Takeover => admin::takeover(state, auth).await,
        Body::ControlStatusRequest => admin::control_status(state).await,

        // Worker-bound bodies arriving inbound are a peer bug.
        other => Err(ControllerError::Protocol(format!(
            "message type {} is not servable by the controller",
            other.msg_type()
        ))),
    }
}
