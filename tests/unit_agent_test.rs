use beryld::core::agent::{AgentQueue, AgentRequest, MAX_AGENT_RETRIES};
use beryld::core::protocol::message::Body;

fn make_request(node: &str) -> AgentRequest {
    AgentRequest::new(node.to_string(), format!("{node}:6818"), Body::PingWorker)
}

#[test]
fn test_enqueue_take_due_preserves_order() {
    let queue = AgentQueue::new();
    queue.enqueue(make_request("n1"));
    queue.enqueue(make_request("n2"));
    assert_eq!(queue.len(), 2);

    let due = queue.take_due(1000);
    assert_eq!(due.len(), 2);
    assert_eq!(due[0].node_name, "n1");
    assert_eq!(due[1].node_name, "n2");
    assert!(queue.is_empty());
}

#[test]
fn test_not_yet_due_requests_stay_queued() {
    let queue = AgentQueue::new();
    let mut req = make_request("n1");
    req.next_try = 2000;
    queue.enqueue(req);
    assert!(queue.take_due(1000).is_empty());
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.take_due(2000).len(), 1);
}

#[test]
fn test_retry_backs_off_into_the_future() {
    let queue = AgentQueue::new();
    let req = make_request("n1");
    assert!(queue.retry_later(req, 1000).is_none());
    let queued = queue.take_due(i64::MAX);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].attempts, 1);
    assert!(queued[0].next_try > 1000);
}

#[test]
fn test_retry_budget_exhaustion_returns_request() {
    let queue = AgentQueue::new();
    let mut req = make_request("n1");
    req.attempts = MAX_AGENT_RETRIES - 1;
    let failed = queue.retry_later(req, 1000);
    assert!(failed.is_some());
    assert!(queue.is_empty());
    assert_eq!(failed.unwrap().node_name, "n1");
}
