// src/core/protocol/message.rs

//! Message types, header layout and body structures for the controller
//! protocol.
//!
//! Every connection exchanges length-prefixed messages. Opcode numbers are
//! stable on the wire and partitioned by family: 1xxx control, 2xxx info,
//! 3xxx administrative updates, 4xxx submission, 5xxx job/step lifecycle,
//! 6xxx worker-agent traffic, 8xxx generic responses.

use crate::core::ControllerError;
use crate::core::protocol::pack::{Packer, Unpacker};
use bytes::Bytes;

/// Protocol revision spoken by this controller.
pub const PROTOCOL_VERSION: u16 = 0x0900;

/// Sentinel for "no value" in optional `u32` fields.
pub const NO_VAL: u32 = u32::MAX;

/// Reserved step id naming the batch script itself.
pub const BATCH_SCRIPT_STEP_ID: u32 = 0xFFFF_FFFE;

/// Stable wire opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[repr(u16)]
pub enum MessageType {
    RequestPing = 1001,
    RequestReconfigure = 1003,
    RequestShutdown = 1005,
    RequestControl = 1007,
    RequestTakeover = 1009,
    RequestControlStatus = 1011,

    RequestBuildInfo = 2001,
    ResponseBuildInfo = 2002,
    RequestJobInfo = 2003,
    ResponseJobInfo = 2004,
    RequestJobInfoSingle = 2005,
    RequestNodeInfo = 2007,
    ResponseNodeInfo = 2008,
    RequestPartitionInfo = 2009,
    ResponsePartitionInfo = 2010,

    RequestUpdateJob = 3001,
    RequestUpdateNode = 3002,
    RequestUpdatePartition = 3003,

    RequestAllocateResources = 4001,
    ResponseAllocateResources = 4002,
    RequestSubmitBatchJob = 4003,
    ResponseSubmitBatchJob = 4004,
    RequestJobWillRun = 4005,
    ResponseJobWillRun = 4006,

    RequestJobStepCreate = 5001,
    ResponseJobStepCreate = 5002,
    RequestCancelJobStep = 5005,
    RequestCompleteJobAllocation = 5009,
    RequestCompleteBatchScript = 5011,
    RequestStepComplete = 5013,
    RequestEpilogComplete = 5015,

    RequestPingWorker = 6001,
    RequestTerminateJob = 6003,
    RequestKillTimelimit = 6005,
    RequestReconfigureWorker = 6007,
    RequestRegisterNode = 6011,

    ResponseReturnCode = 8001,
    ResponseControlStatus = 8003,
}

impl TryFrom<u16> for MessageType {
    type Error = ControllerError;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        use MessageType::*;
        Ok(match v {
            1001 => RequestPing,
            1003 => RequestReconfigure,
            1005 => RequestShutdown,
            1007 => RequestControl,
            1009 => RequestTakeover,
            1011 => RequestControlStatus,
            2001 => RequestBuildInfo,
            2002 => ResponseBuildInfo,
            2003 => RequestJobInfo,
            2004 => ResponseJobInfo,
            2005 => RequestJobInfoSingle,
            2007 => RequestNodeInfo,
            2008 => ResponseNodeInfo,
            2009 => RequestPartitionInfo,
            2010 => ResponsePartitionInfo,
            3001 => RequestUpdateJob,
            3002 => RequestUpdateNode,
            3003 => RequestUpdatePartition,
            4001 => RequestAllocateResources,
            4002 => ResponseAllocateResources,
            4003 => RequestSubmitBatchJob,
            4004 => ResponseSubmitBatchJob,
            4005 => RequestJobWillRun,
            4006 => ResponseJobWillRun,
            5001 => RequestJobStepCreate,
            5002 => ResponseJobStepCreate,
            5005 => RequestCancelJobStep,
            5009 => RequestCompleteJobAllocation,
            5011 => RequestCompleteBatchScript,
            5013 => RequestStepComplete,
            5015 => RequestEpilogComplete,
            6001 => RequestPingWorker,
            6003 => RequestTerminateJob,
            6005 => RequestKillTimelimit,
            6007 => RequestReconfigureWorker,
            6011 => RequestRegisterNode,
            8001 => ResponseReturnCode,
            8003 => ResponseControlStatus,
            other => {
                return Err(ControllerError::Protocol(format!(
                    "unknown message type {other}"
                )));
            }
        })
    }
}

/// Fan-out routing carried in every header. The controller itself never
/// forwards, but worker agents use the tree fields when relaying to peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardInfo {
    pub count: u16,
    pub list: String,
    pub timeout: u32,
    pub tree_width: u16,
}

impl ForwardInfo {
    fn pack(&self, p: &mut Packer) {
        p.u16(self.count);
        p.str(&self.list);
        p.u32(self.timeout);
        p.u16(self.tree_width);
    }

    fn unpack(u: &mut Unpacker) -> Result<Self, ControllerError> {
        Ok(Self {
            count: u.u16()?,
            list: u.str()?,
            timeout: u.u32()?,
            tree_width: u.u16()?,
        })
    }
}

/// The fixed message header. Wire order is exactly the field order here.
#[derive(Debug, Clone)]
pub struct Header {
    pub version: u16,
    pub flags: u16,
    pub msg_type: MessageType,
    pub body_length: u32,
    pub forward: ForwardInfo,
    pub auth_cred: Bytes,
}

impl Header {
    pub fn pack(&self, p: &mut Packer) {
        p.u16(self.version);
        p.u16(self.flags);
        p.u16(self.msg_type as u16);
        p.u32(self.body_length);
        self.forward.pack(p);
        p.bytes(&self.auth_cred);
    }

    pub fn unpack(u: &mut Unpacker) -> Result<Self, ControllerError> {
        let version = u.u16()?;
        if version != PROTOCOL_VERSION {
            return Err(ControllerError::ProtocolVersionMismatch);
        }
        Ok(Self {
            version,
            flags: u.u16()?,
            msg_type: MessageType::try_from(u.u16()?)?,
            body_length: u.u32()?,
            forward: ForwardInfo::unpack(u)?,
            auth_cred: u.bytes()?,
        })
    }
}

/// A complete decoded message.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: Header,
    pub body: Body,
}

impl Message {
    /// Builds an outbound message with an empty credential; callers that
    /// need authentication fill `header.auth_cred` before sending.
    pub fn new(body: Body) -> Self {
        Self {
            header: Header {
                version: PROTOCOL_VERSION,
                flags: 0,
                msg_type: body.msg_type(),
                body_length: 0,
                forward: ForwardInfo::default(),
                auth_cred: Bytes::new(),
            },
            body,
        }
    }
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

/// Everything a submit/allocate/will-run request says about the job it wants.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobDescriptor {
    pub user_id: u32,
    pub group_id: u32,
    pub name: Option<String>,
    pub partition: Option<String>,
    pub min_nodes: u32,
    pub min_cpus: u32,
    pub min_memory: u64,
    pub time_limit: u32,
    pub priority: u32,
    pub shared: SharedPref,
    pub immediate: bool,
    pub req_nodes: Option<String>,
    pub script: Option<String>,
    pub argv: Vec<String>,
    pub environment: Vec<String>,
    pub work_dir: Option<String>,
    pub std_in: Option<String>,
    pub std_out: Option<String>,
    pub std_err: Option<String>,
    pub dependency: Vec<u32>,
}

/// The caller's sharing preference for its allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SharedPref {
    /// Take whatever the partition policy says.
    #[default]
    PartitionDefault = 0,
    /// Request exclusive nodes.
    Exclusive = 1,
    /// Willing to share.
    Shared = 2,
}

impl SharedPref {
    pub fn from_u8(v: u8) -> Result<Self, ControllerError> {
        match v {
            0 => Ok(SharedPref::PartitionDefault),
            1 => Ok(SharedPref::Exclusive),
            2 => Ok(SharedPref::Shared),
            other => Err(ControllerError::Protocol(format!(
                "bad shared preference {other}"
            ))),
        }
    }
}

impl JobDescriptor {
    fn pack(&self, p: &mut Packer) {
        p.u32(self.user_id);
        p.u32(self.group_id);
        p.opt_str(self.name.as_deref());
        p.opt_str(self.partition.as_deref());
        p.u32(self.min_nodes);
        p.u32(self.min_cpus);
        p.u64(self.min_memory);
        p.u32(self.time_limit);
        p.u32(self.priority);
        p.u8(self.shared as u8);
        p.bool(self.immediate);
        p.opt_str(self.req_nodes.as_deref());
        p.opt_str(self.script.as_deref());
        p.count(self.argv.len());
        for a in &self.argv {
            p.str(a);
        }
        p.count(self.environment.len());
        for e in &self.environment {
            p.str(e);
        }
        p.opt_str(self.work_dir.as_deref());
        p.opt_str(self.std_in.as_deref());
        p.opt_str(self.std_out.as_deref());
        p.opt_str(self.std_err.as_deref());
        p.count(self.dependency.len());
        for d in &self.dependency {
            p.u32(*d);
        }
    }

    fn unpack(u: &mut Unpacker) -> Result<Self, ControllerError> {
        let user_id = u.u32()?;
        let group_id = u.u32()?;
        let name = u.opt_str()?;
        let partition = u.opt_str()?;
        let min_nodes = u.u32()?;
        let min_cpus = u.u32()?;
        let min_memory = u.u64()?;
        let time_limit = u.u32()?;
        let priority = u.u32()?;
        let shared = SharedPref::from_u8(u.u8()?)?;
        let immediate = u.bool()?;
        let req_nodes = u.opt_str()?;
        let script = u.opt_str()?;
        let mut argv = Vec::new();
        for _ in 0..u.count()? {
            argv.push(u.str()?);
        }
        let mut environment = Vec::new();
        for _ in 0..u.count()? {
            environment.push(u.str()?);
        }
        Ok(Self {
            user_id,
            group_id,
            name,
            partition,
            min_nodes,
            min_cpus,
            min_memory,
            time_limit,
            priority,
            shared,
            immediate,
            req_nodes,
            script,
            argv,
            environment,
            work_dir: u.opt_str()?,
            std_in: u.opt_str()?,
            std_out: u.opt_str()?,
            std_err: u.opt_str()?,
            dependency: {
                let mut deps = Vec::new();
                for _ in 0..u.count()? {
                    deps.push(u.u32()?);
                }
                deps
            },
        })
    }
}

/// Conditional info request: serialise only if newer than `last_update`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InfoRequest {
    pub last_update: i64,
    pub show_flags: u16,
}

impl InfoRequest {
    fn pack(&self, p: &mut Packer) {
        p.time(self.last_update);
        p.u16(self.show_flags);
    }

    fn unpack(u: &mut Unpacker) -> Result<Self, ControllerError> {
        Ok(Self {
            last_update: u.time()?,
            show_flags: u.u16()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelJobStep {
    pub job_id: u32,
    /// `NO_VAL` cancels the whole job.
    pub step_id: u32,
    pub signal: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompleteJobAllocation {
    pub job_id: u32,
    pub job_rc: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteBatchScript {
    pub job_id: u32,
    pub worker_rc: u32,
    pub job_rc: u32,
    pub node_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStepCreate {
    pub job_id: u32,
    pub user_id: u32,
    pub cpu_count: u32,
    pub task_count: u32,
    pub mem_per_task: u64,
    pub node_list: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepComplete {
    pub job_id: u32,
    pub step_id: u32,
    pub step_rc: u32,
    /// Lowest and highest allocation-relative node indices reporting done.
    pub range_first: u32,
    pub range_last: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpilogComplete {
    pub job_id: u32,
    pub node_name: String,
    pub epilog_rc: u32,
}

/// Administrative operation selector for `update-job`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum JobUpdateOp {
    #[default]
    None = 0,
    Hold = 1,
    Release = 2,
    Suspend = 3,
    Resume = 4,
}

impl JobUpdateOp {
    fn from_u16(v: u16) -> Result<Self, ControllerError> {
        match v {
            0 => Ok(JobUpdateOp::None),
            1 => Ok(JobUpdateOp::Hold),
            2 => Ok(JobUpdateOp::Release),
            3 => Ok(JobUpdateOp::Suspend),
            4 => Ok(JobUpdateOp::Resume),
            other => Err(ControllerError::Protocol(format!(
                "bad job update op {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateJob {
    pub job_id: u32,
    pub op: JobUpdateOp,
    /// `NO_VAL` leaves the field untouched.
    pub priority: u32,
    pub time_limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateNode {
    /// Host-range expression naming the nodes to update.
    pub node_names: String,
    /// Requested base state, `NO_VAL16` to leave unchanged.
    pub state: u16,
    pub reason: Option<String>,
}

/// Sentinel for "no value" in `u16` wire fields.
pub const NO_VAL16: u16 = u16::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePartition {
    pub name: String,
    /// 0 down, 1 up, `NO_VAL16` unchanged.
    pub state_up: u16,
    pub max_time: u32,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub nodes: Option<String>,
    pub allow_groups: Option<String>,
    /// 0/1, `NO_VAL16` unchanged.
    pub default_part: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterNode {
    pub node_name: String,
    pub cpus: u32,
    pub real_memory: u64,
    pub tmp_disk: u64,
    /// Job/step pairs the worker believes it is running.
    pub running_steps: Vec<(u32, u32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shutdown {
    /// 0 = orderly, 1 = immediate (skip final checkpoint).
    pub mode: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminateJob {
    pub job_id: u32,
    /// True when the kill is a time-limit enforcement.
    pub timelimit: bool,
}

// ---------------------------------------------------------------------------
// Response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnCode {
    pub rc: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlStatus {
    /// Seconds since epoch at which this controller took control; zero when
    /// it is not the acting primary.
    pub control_time: i64,
    /// This controller's position in the control-host list.
    pub backup_inx: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildInfo {
    pub version: String,
    pub control_hosts: Vec<String>,
    pub port: u16,
    pub state_save_location: String,
    pub auth_type: String,
    pub sched_type: String,
    pub select_type: String,
    pub heartbeat_interval: u32,
    pub controller_timeout: u32,
    pub worker_timeout: u32,
    pub batch_start_timeout: u32,
    pub msg_timeout: u32,
    pub tree_width: u16,
    pub first_job_id: u32,
    pub fast_schedule: bool,
    pub partitions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfoRecord {
    pub job_id: u32,
    pub user_id: u32,
    pub group_id: u32,
    pub name: Option<String>,
    pub state: u16,
    pub state_flags: u16,
    pub partition: String,
    pub nodes: Option<String>,
    pub node_cnt: u32,
    pub num_cpus: u32,
    pub time_limit: u32,
    pub priority: u32,
    pub submit_time: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub batch_flag: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfoRecord {
    pub name: String,
    pub state: u16,
    pub flags: u16,
    pub cpus: u32,
    pub real_memory: u64,
    pub tmp_disk: u64,
    pub weight: u32,
    pub features: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartInfoRecord {
    pub name: String,
    pub nodes: String,
    pub state_up: bool,
    pub default_part: bool,
    pub hidden: bool,
    pub root_only: bool,
    pub shared: u16,
    pub max_time: u32,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub total_nodes: u32,
    pub total_cpus: u32,
    pub allow_groups: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobInfoResponse {
    pub last_update: i64,
    pub jobs: Vec<JobInfoRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfoResponse {
    pub last_update: i64,
    pub nodes: Vec<NodeInfoRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartInfoResponse {
    pub last_update: i64,
    pub partitions: Vec<PartInfoRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResponse {
    pub job_id: u32,
    pub step_id: u32,
    pub rc: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationResponse {
    pub job_id: u32,
    pub node_list: Option<String>,
    pub node_cnt: u32,
    pub rc: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillRunResponse {
    pub runnable: bool,
    pub node_list: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCreateResponse {
    pub job_id: u32,
    pub step_id: u32,
    pub node_list: String,
    /// Signed step credential, opaque to the client, verified by workers.
    pub credential: Bytes,
}

// ---------------------------------------------------------------------------
// The body union
// ---------------------------------------------------------------------------

/// One variant per wire message. Empty-bodied messages carry unit variants.
#[derive(Debug, Clone)]
pub enum Body {
    Ping,
    Reconfigure,
    Shutdown(Shutdown),
    Control,
    Takeover,
    ControlStatusRequest,

    BuildInfoRequest(InfoRequest),
    BuildInfoResponse(Box<BuildInfo>),
    JobInfoRequest(InfoRequest),
    JobInfoResponse(JobInfoResponse),
    JobInfoSingleRequest(u32),
    NodeInfoRequest(InfoRequest),
    NodeInfoResponse(NodeInfoResponse),
    PartInfoRequest(InfoRequest),
    PartInfoResponse(PartInfoResponse),

    UpdateJob(UpdateJob),
    UpdateNode(UpdateNode),
    UpdatePartition(UpdatePartition),

    AllocateResources(Box<JobDescriptor>),
    AllocationResponse(AllocationResponse),
    SubmitBatchJob(Box<JobDescriptor>),
    SubmitResponse(SubmitResponse),
    JobWillRun(Box<JobDescriptor>),
    WillRunResponse(WillRunResponse),

    JobStepCreate(JobStepCreate),
    StepCreateResponse(StepCreateResponse),
    CancelJobStep(CancelJobStep),
    CompleteJobAllocation(CompleteJobAllocation),
    CompleteBatchScript(CompleteBatchScript),
    StepComplete(StepComplete),
    EpilogComplete(EpilogComplete),

    PingWorker,
    TerminateJob(TerminateJob),
    KillTimelimit(TerminateJob),
    ReconfigureWorker,
    RegisterNode(RegisterNode),

    ReturnCode(ReturnCode),
    ControlStatusResponse(ControlStatus),
}

impl Body {
    /// The opcode this body travels under.
    pub fn msg_type(&self) -> MessageType {
        use MessageType as T;
        match self {
            Body::Ping => T::RequestPing,
            Body::Reconfigure => T::RequestReconfigure,
            Body::Shutdown(_) => T::RequestShutdown,
            Body::Control => T::RequestControl,
            Body::Takeover => T::RequestTakeover,
            Body::ControlStatusRequest => T::RequestControlStatus,
            Body::BuildInfoRequest(_) => T::RequestBuildInfo,
            Body::BuildInfoResponse(_) => T::ResponseBuildInfo,
            Body::JobInfoRequest(_) => T::RequestJobInfo,
            Body::JobInfoResponse(_) => T::ResponseJobInfo,
            Body::JobInfoSingleRequest(_) => T::RequestJobInfoSingle,
            Body::NodeInfoRequest(_) => T::RequestNodeInfo,
            Body::NodeInfoResponse(_) => T::ResponseNodeInfo,
            Body::PartInfoRequest(_) => T::RequestPartitionInfo,
            Body::PartInfoResponse(_) => T::ResponsePartitionInfo,
            Body::UpdateJob(_) => T::RequestUpdateJob,
            Body::UpdateNode(_) => T::RequestUpdateNode,
            Body::UpdatePartition(_) => T::RequestUpdatePartition,
            Body::AllocateResources(_) => T::RequestAllocateResources,
            Body::AllocationResponse(_) => T::ResponseAllocateResources,
            Body::SubmitBatchJob(_) => T::RequestSubmitBatchJob,
            Body::SubmitResponse(_) => T::ResponseSubmitBatchJob,
            Body::JobWillRun(_) => T::RequestJobWillRun,
            Body::WillRunResponse(_) => T::ResponseJobWillRun,
            Body::JobStepCreate(_) => T::RequestJobStepCreate,
            Body::StepCreateResponse(_) => T::ResponseJobStepCreate,
            Body::CancelJobStep(_) => T::RequestCancelJobStep,
            Body::CompleteJobAllocation(_) => T::RequestCompleteJobAllocation,
            Body::CompleteBatchScript(_) => T::RequestCompleteBatchScript,
            Body::StepComplete(_) => T::RequestStepComplete,
            Body::EpilogComplete(_) => T::RequestEpilogComplete,
            Body::PingWorker => T::RequestPingWorker,
            Body::TerminateJob(_) => T::RequestTerminateJob,
            Body::KillTimelimit(_) => T::RequestKillTimelimit,
            Body::ReconfigureWorker => T::RequestReconfigureWorker,
            Body::RegisterNode(_) => T::RequestRegisterNode,
            Body::ReturnCode(_) => T::ResponseReturnCode,
            Body::ControlStatusResponse(_) => T::ResponseControlStatus,
        }
    }

    /// Packs the body into its wire form.
    pub fn pack(&self, p: &mut Packer) {
        match self {
            Body::Ping
            | Body::Reconfigure
            | Body::Control
            | Body::Takeover
            | Body::ControlStatusRequest
            | Body::PingWorker
            | Body::ReconfigureWorker => {}
            Body::Shutdown(b) => p.u16(b.mode),
            Body::BuildInfoRequest(b)
            | Body::JobInfoRequest(b)
            | Body::NodeInfoRequest(b)
            | Body::PartInfoRequest(b) => b.pack(p),
            Body::JobInfoSingleRequest(job_id) => p.u32(*job_id),
            Body::BuildInfoResponse(b) => {
                p.str(&b.version);
                p.count(b.control_hosts.len());
                for h in &b.control_hosts {
                    p.str(h);
                }
                p.u16(b.port);
                p.str(&b.state_save_location);
                p.str(&b.auth_type);
                p.str(&b.sched_type);
                p.str(&b.select_type);
                p.u32(b.heartbeat_interval);
                p.u32(b.controller_timeout);
                p.u32(b.worker_timeout);
                p.u32(b.batch_start_timeout);
                p.u32(b.msg_timeout);
                p.u16(b.tree_width);
                p.u32(b.first_job_id);
                p.bool(b.fast_schedule);
                p.count(b.partitions.len());
                for name in &b.partitions {
                    p.str(name);
                }
            }
            Body::JobInfoResponse(b) => {
                p.time(b.last_update);
                p.count(b.jobs.len());
                for j in &b.jobs {
                    j.pack(p);
                }
            }
            Body::NodeInfoResponse(b) => {
                p.time(b.last_update);
                p.count(b.nodes.len());
                for n in &b.nodes {
                    n.pack(p);
                }
            }
            Body::PartInfoResponse(b) => {
                p.time(b.last_update);
                p.count(b.partitions.len());
                for part in &b.partitions {
                    part.pack(p);
                }
            }
            Body::UpdateJob(b) => {
                p.u32(b.job_id);
                p.u16(b.op as u16);
                p.u32(b.priority);
                p.u32(b.time_limit);
            }
            Body::UpdateNode(b) => {
                p.str(&b.node_names);
                p.u16(b.state);
                p.opt_str(b.reason.as_deref());
            }
            Body::UpdatePartition(b) => {
                p.str(&b.name);
                p.u16(b.state_up);
                p.u32(b.max_time);
                p.u32(b.min_nodes);
                p.u32(b.max_nodes);
                p.opt_str(b.nodes.as_deref());
                p.opt_str(b.allow_groups.as_deref());
                p.u16(b.default_part);
            }
            Body::AllocateResources(d) | Body::SubmitBatchJob(d) | Body::JobWillRun(d) => d.pack(p),
            Body::AllocationResponse(b) => {
                p.u32(b.job_id);
                p.opt_str(b.node_list.as_deref());
                p.u32(b.node_cnt);
                p.u32(b.rc);
            }
            Body::SubmitResponse(b) => {
                p.u32(b.job_id);
                p.u32(b.step_id);
                p.u32(b.rc);
            }
            Body::WillRunResponse(b) => {
                p.bool(b.runnable);
                p.opt_str(b.node_list.as_deref());
            }
            Body::JobStepCreate(b) => {
                p.u32(b.job_id);
                p.u32(b.user_id);
                p.u32(b.cpu_count);
                p.u32(b.task_count);
                p.u64(b.mem_per_task);
                p.opt_str(b.node_list.as_deref());
            }
            Body::StepCreateResponse(b) => {
                p.u32(b.job_id);
                p.u32(b.step_id);
                p.str(&b.node_list);
                p.bytes(&b.credential);
            }
            Body::CancelJobStep(b) => {
                p.u32(b.job_id);
                p.u32(b.step_id);
                p.u16(b.signal);
            }
            Body::CompleteJobAllocation(b) => {
                p.u32(b.job_id);
                p.u32(b.job_rc);
            }
            Body::CompleteBatchScript(b) => {
                p.u32(b.job_id);
                p.u32(b.worker_rc);
                p.u32(b.job_rc);
                p.str(&b.node_name);
            }
            Body::StepComplete(b) => {
                p.u32(b.job_id);
                p.u32(b.step_id);
                p.u32(b.step_rc);
                p.u32(b.range_first);
                p.u32(b.range_last);
            }
            Body::EpilogComplete(b) => {
                p.u32(b.job_id);
                p.str(&b.node_name);
                p.u32(b.epilog_rc);
            }
            Body::TerminateJob(b) | Body::KillTimelimit(b) => {
                p.u32(b.job_id);
                p.bool(b.timelimit);
            }
            Body::RegisterNode(b) => {
                p.str(&b.node_name);
                p.u32(b.cpus);
                p.u64(b.real_memory);
                p.u64(b.tmp_disk);
                p.count(b.running_steps.len());
                for (job, step) in &b.running_steps {
                    p.u32(*job);
                    p.u32(*step);
                }
            }
            Body::ReturnCode(b) => p.u32(b.rc),
            Body::ControlStatusResponse(b) => {
                p.time(b.control_time);
                p.u16(b.backup_inx);
            }
        }
    }

    /// Unpacks a body of the given type from its wire form.
    pub fn unpack(msg_type: MessageType, u: &mut Unpacker) -> Result<Self, ControllerError> {
        use MessageType as T;
        Ok(match msg_type {
            T::RequestPing => Body::Ping,
            T::RequestReconfigure => Body::Reconfigure,
            T::RequestShutdown => Body::Shutdown(Shutdown { mode: u.u16()? }),
            T::RequestControl => Body::Control,
            T::RequestTakeover => Body::Takeover,
            T::RequestControlStatus => Body::ControlStatusRequest,
            T::RequestBuildInfo => Body::BuildInfoRequest(InfoRequest::unpack(u)?),
            T::RequestJobInfo => Body::JobInfoRequest(InfoRequest::unpack(u)?),
            T::RequestJobInfoSingle => Body::JobInfoSingleRequest(u.u32()?),
            T::RequestNodeInfo => Body::NodeInfoRequest(InfoRequest::unpack(u)?),
            T::RequestPartitionInfo => Body::PartInfoRequest(InfoRequest::unpack(u)?),
            T::ResponseBuildInfo => {
                let version = u.str()?;
                let mut control_hosts = Vec::new();
                for _ in 0..u.count()? {
                    control_hosts.push(u.str()?);
                }
                Body::BuildInfoResponse(Box::new(BuildInfo {
                    version,
                    control_hosts,
                    port: u.u16()?,
                    state_save_location: u.str()?,
                    auth_type: u.str()?,
                    sched_type: u.str()?,
                    select_type: u.str()?,
                    heartbeat_interval: u.u32()?,
                    controller_timeout: u.u32()?,
                    worker_timeout: u.u32()?,
                    batch_start_timeout: u.u32()?,
                    msg_timeout: u.u32()?,
                    tree_width: u.u16()?,
                    first_job_id: u.u32()?,
                    fast_schedule: u.bool()?,
                    partitions: {
                        let mut parts = Vec::new();
                        for _ in 0..u.count()? {
                            parts.push(u.str()?);
                        }
                        parts
                    },
                }))
            }
            T::ResponseJobInfo => {
                let last_update = u.time()?;
                let mut jobs = Vec::new();
                for _ in 0..u.count()? {
                    jobs.push(JobInfoRecord::unpack(u)?);
                }
                Body::JobInfoResponse(JobInfoResponse { last_update, jobs })
            }
            T::ResponseNodeInfo => {
                let last_update = u.time()?;
                let mut nodes = Vec::new();
                for _ in 0..u.count()? {
                    nodes.push(NodeInfoRecord::unpack(u)?);
                }
                Body::NodeInfoResponse(NodeInfoResponse { last_update, nodes })
            }
            T::ResponsePartitionInfo => {
                let last_update = u.time()?;
                let mut partitions = Vec::new();
                for _ in 0..u.count()? {
                    partitions.push(PartInfoRecord::unpack(u)?);
                }
                Body::PartInfoResponse(PartInfoResponse {
                    last_update,
                    partitions,
                })
            }
            T::RequestUpdateJob => Body::UpdateJob(UpdateJob {
                job_id: u.u32()?,
                op: JobUpdateOp::from_u16(u.u16()?)?,
                priority: u.u32()?,
                time_limit: u.u32()?,
            }),
            T::RequestUpdateNode => Body::UpdateNode(UpdateNode {
                node_names: u.str()?,
                state: u.u16()?,
                reason: u.opt_str()?,
            }),
            T::RequestUpdatePartition => Body::UpdatePartition(UpdatePartition {
                name: u.str()?,
                state_up: u.u16()?,
                max_time: u.u32()?,
                min_nodes: u.u32()?,
                max_nodes: u.u32()?,
                nodes: u.opt_str()?,
                allow_groups: u.opt_str()?,
                default_part: u.u16()?,
            }),
            T::RequestAllocateResources => {
                Body::AllocateResources(Box::new(JobDescriptor::unpack(u)?))
            }
            T::RequestSubmitBatchJob => Body::SubmitBatchJob(Box::new(JobDescriptor::unpack(u)?)),
            T::RequestJobWillRun => Body::JobWillRun(Box::new(JobDescriptor::unpack(u)?)),
            T::ResponseAllocateResources => Body::AllocationResponse(AllocationResponse {
                job_id: u.u32()?,
                node_list: u.opt_str()?,
                node_cnt: u.u32()?,
                rc: u.u32()?,
            }),
            T::ResponseSubmitBatchJob => Body::SubmitResponse(SubmitResponse {
                job_id: u.u32()?,
                step_id: u.u32()?,
                rc: u.u32()?,
            }),
            T::ResponseJobWillRun => Body::WillRunResponse(WillRunResponse {
                runnable: u.bool()?,
                node_list: u.opt_str()?,
            }),
            T::RequestJobStepCreate => Body::JobStepCreate(JobStepCreate {
                job_id: u.u32()?,
                user_id: u.u32()?,
                cpu_count: u.u32()?,
                task_count: u.u32()?,
                mem_per_task: u.u64()?,
                node_list: u.opt_str()?,
            }),
            T::ResponseJobStepCreate => Body::StepCreateResponse(StepCreateResponse {
                job_id: u.u32()?,
                step_id: u.u32()?,
                node_list: u.str()?,
                credential: u.bytes()?,
            }),
            T::RequestCancelJobStep => Body::CancelJobStep(CancelJobStep {
                job_id: u.u32()?,
                step_id: u.u32()?,
                signal: u.u16()?,
            }),
            T::RequestCompleteJobAllocation => Body::CompleteJobAllocation(CompleteJobAllocation {
                job_id: u.u32()?,
                job_rc: u.u32()?,
            }),
            T::RequestCompleteBatchScript => Body::CompleteBatchScript(CompleteBatchScript {
                job_id: u.u32()?,
                worker_rc: u.u32()?,
                job_rc: u.u32()?,
                node_name: u.str()?,
            }),
            T::RequestStepComplete => Body::StepComplete(StepComplete {
                job_id: u.u32()?,
                step_id: u.u32()?,
                step_rc: u.u32()?,
                range_first: u.u32()?,
                range_last: u.u32()?,
            }),
            T::RequestEpilogComplete => Body::EpilogComplete(EpilogComplete {
                job_id: u.u32()?,
                node_name: u.str()?,
                epilog_rc: u.u32()?,
            }),
            T::RequestPingWorker => Body::PingWorker,
            T::RequestTerminateJob => Body::TerminateJob(TerminateJob {
                job_id: u.u32()?,
                timelimit: u.bool()?,
            }),
            T::RequestKillTimelimit => Body::KillTimelimit(TerminateJob {
                job_id: u.u32()?,
                timelimit: u.bool()?,
            }),
            T::RequestReconfigureWorker => Body::ReconfigureWorker,
            T::RequestRegisterNode => {
                let node_name = u.str()?;
                let cpus = u.u32()?;
                let real_memory = u.u64()?;
                let tmp_disk = u.u64()?;
                let mut running_steps = Vec::new();
                for _ in 0..u.count()? {
                    running_steps.push((u.u32()?, u.u32()?));
                }
                Body::RegisterNode(RegisterNode {
                    node_name,
                    cpus,
                    real_memory,
                    tmp_disk,
                    running_steps,
                })
            }
            T::ResponseReturnCode => Body::ReturnCode(ReturnCode { rc: u.u32()? }),
            T::ResponseControlStatus => Body::ControlStatusResponse(ControlStatus {
                control_time: u.time()?,
                backup_inx: u.u16()?,
            }),
        })
    }
}

impl JobInfoRecord {
    fn pack(&self, p: &mut Packer) {
        p.u32(self.job_id);
        p.u32(self.user_id);
        p.u32(self.group_id);
        p.opt_str(self.name.as_deref());
        p.u16(self.state);
        p.u16(self.state_flags);
        p.str(&self.partition);
        p.opt_str(self.nodes.as_deref());
        p.u32(self.node_cnt);
        p.u32(self.num_cpus);
        p.u32(self.time_limit);
        p.u32(self.priority);
        p.time(self.submit_time);
        p.time(self.start_time);
        p.time(self.end_time);
        p.bool(self.batch_flag);
    }

    fn unpack(u: &mut Unpacker) -> Result<Self, ControllerError> {
        Ok(Self {
            job_id: u.u32()?,
            user_id: u.u32()?,
            group_id: u.u32()?,
            name: u.opt_str()?,
            state: u.u16()?,
            state_flags: u.u16()?,
            partition: u.str()?,
            nodes: u.opt_str()?,
            node_cnt: u.u32()?,
            num_cpus: u.u32()?,
            time_limit: u.u32()?,
            priority: u.u32()?,
            submit_time: u.time()?,
            start_time: u.time()?,
            end_time: u.time()?,
            batch_flag: u.bool()?,
        })
    }
}

impl NodeInfoRecord {
    fn pack(&self, p: &mut Packer) {
        p.str(&self.name);
        p.u16(self.state);
        p.u16(self.flags);
        p.u32(self.cpus);
        p.u64(self.real_memory);
        p.u64(self.tmp_disk);
        p.u32(self.weight);
        p.opt_str(self.features.as_deref());
        p.opt_str(self.reason.as_deref());
    }

    fn unpack(u: &mut Unpacker) -> Result<Self, ControllerError> {
        Ok(Self {
            name: u.str()?,
            state: u.u16()?,
            flags: u.u16()?,
            cpus: u.u32()?,
            real_memory: u.u64()?,
            tmp_disk: u.u64()?,
            weight: u.u32()?,
            features: u.opt_str()?,
            reason: u.opt_str()?,
        })
    }
}

impl PartInfoRecord {
    fn pack(&self, p: &mut Packer) {
        p.str(&self.name);
        p.str(&self.nodes);
        p.bool(self.state_up);
        p.bool(self.default_part);
        p.bool(self.hidden);
        p.bool(self.root_only);
        p.u16(self.shared);
        p.u32(self.max_time);
        p.u32(self.min_nodes);
        p.u32(self.max_nodes);
        p.u32(self.total_nodes);
        p.u32(self.total_cpus);
        p.opt_str(self.allow_groups.as_deref());
    }

    fn unpack(u: &mut Unpacker) -> Result<Self, ControllerError> {
        Ok(Self {
            name: u.str()?,
            nodes: u.str()?,
            state_up: u.bool()?,
            default_part: u.bool()?,
            hidden: u.bool()?,
            root_only: u.bool()?,
            shared: u.u16()?,
            max_time: u.u32()?,
            min_nodes: u.u32()?,
            max_nodes: u.u32()?,
            total_nodes: u.u32()?,
            total_cpus: u.u32()?,
            allow_groups: u.opt_str()?,
        })
    }
}
