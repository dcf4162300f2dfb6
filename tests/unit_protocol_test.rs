use beryld::core::ControllerError;
use beryld::core::protocol::message::{
    Body, ControlStatus, InfoRequest, JobDescriptor, Message, NodeInfoRecord, NodeInfoResponse,
    ReturnCode, SharedPref, UpdateNode,
};
use beryld::core::protocol::MessageCodec;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

fn round_trip(body: Body) -> Message {
    let mut msg = Message::new(body);
    msg.header.auth_cred = Bytes::from_static(b"credential");
    let mut codec = MessageCodec;
    let mut buf = BytesMut::new();
    codec.encode(msg, &mut buf).unwrap();
    codec.decode(&mut buf).unwrap().expect("one whole frame")
}

#[test]
fn test_ping_round_trip() {
    let decoded = round_trip(Body::Ping);
    assert!(matches!(decoded.body, Body::Ping));
    assert_eq!(decoded.header.auth_cred, Bytes::from_static(b"credential"));
}

#[test]
fn test_return_code_round_trip() {
    let decoded = round_trip(Body::ReturnCode(ReturnCode { rc: 1404 }));
    match decoded.body {
        Body::ReturnCode(rc) => assert_eq!(rc.rc, 1404),
        other => panic!("unexpected body {:?}", other),
    }
}

#[test]
fn test_job_descriptor_round_trip() {
    let desc = JobDescriptor {
        user_id: 1000,
        group_id: 1000,
        name: Some("nightly".to_string()),
        partition: Some("batch".to_string()),
        min_nodes: 2,
        min_cpus: 8,
        min_memory: 4096,
        time_limit: 120,
        priority: 0,
        shared: SharedPref::Exclusive,
        immediate: true,
        req_nodes: Some("n[1-2]".to_string()),
        script: Some("#!/bin/sh\nsleep 0\n".to_string()),
        argv: vec!["a.out".to_string(), "--fast".to_string()],
        environment: vec!["PATH=/bin".to_string()],
        work_dir: Some("/home/u".to_string()),
        std_in: None,
        std_out: Some("out.log".to_string()),
        std_err: None,
        dependency: vec![41, 42],
    };
    let decoded = round_trip(Body::SubmitBatchJob(Box::new(desc.clone())));
    match decoded.body {
        Body::SubmitBatchJob(got) => assert_eq!(*got, desc),
        other => panic!("unexpected body {:?}", other),
    }
}

#[test]
fn test_node_info_response_round_trip() {
    let response = NodeInfoResponse {
        last_update: 1_700_000_000,
        nodes: vec![NodeInfoRecord {
            name: "n1".to_string(),
            state: 1,
            flags: 2,
            cpus: 16,
            real_memory: 64_000,
            tmp_disk: 100_000,
            weight: 10,
            features: Some("gpu".to_string()),
            reason: None,
        }],
    };
    let decoded = round_trip(Body::NodeInfoResponse(response.clone()));
    match decoded.body {
        Body::NodeInfoResponse(got) => assert_eq!(got, response),
        other => panic!("unexpected body {:?}", other),
    }
}

#[test]
fn test_update_node_round_trip() {
    let update = UpdateNode {
        node_names: "n[1-8]".to_string(),
        state: 100,
        reason: Some("maintenance".to_string()),
    };
    let decoded = round_trip(Body::UpdateNode(update.clone()));
    match decoded.body {
        Body::UpdateNode(got) => assert_eq!(got, update),
        other => panic!("unexpected body {:?}", other),
    }
}

#[test]
fn test_control_status_round_trip() {
    let decoded = round_trip(Body::ControlStatusResponse(ControlStatus {
        control_time: 1_700_000_123,
        backup_inx: 1,
    }));
    match decoded.body {
        Body::ControlStatusResponse(got) => {
            assert_eq!(got.control_time, 1_700_000_123);
            assert_eq!(got.backup_inx, 1);
        }
        other => panic!("unexpected body {:?}", other),
    }
}

#[test]
fn test_partial_frame_waits_for_more_data() {
    let mut msg = Message::new(Body::BuildInfoRequest(InfoRequest::default()));
    msg.header.auth_cred = Bytes::new();
    let mut codec = MessageCodec;
    let mut buf = BytesMut::new();
    codec.encode(msg, &mut buf).unwrap();

    let mut partial = BytesMut::from(&buf[..buf.len() - 3]);
    assert!(codec.decode(&mut partial).unwrap().is_none());
}

#[test]
fn test_version_mismatch_is_rejected() {
    let mut msg = Message::new(Body::Ping);
    msg.header.auth_cred = Bytes::new();
    let mut codec = MessageCodec;
    let mut buf = BytesMut::new();
    codec.encode(msg, &mut buf).unwrap();

    // The version is the first header field, right after the length prefix.
    buf[4] = 0x00;
    buf[5] = 0x08;
    match codec.decode(&mut buf) {
        Err(ControllerError::ProtocolVersionMismatch) => {}
        other => panic!("expected version mismatch, got {:?}", other),
    }
}

#[test]
fn test_unknown_message_type_is_rejected() {
    let mut msg = Message::new(Body::Ping);
    msg.header.auth_cred = Bytes::new();
    let mut codec = MessageCodec;
    let mut buf = BytesMut::new();
    codec.encode(msg, &mut buf).unwrap();

    // Overwrite msg_type with a number outside the table.
    buf[8] = 0xFF;
    buf[9] = 0x7F;
    assert!(codec.decode(&mut buf).is_err());
}
