//! Classification of etcd server errors by sentinel message.
//!
//! The etcd server reports membership preconditions as gRPC status messages;
//! the client surfaces them as opaque errors, so matching on the sentinel
//! text is the stable contract.

const UNHEALTHY: &str = "unhealthy cluster";
const TOO_MANY_LEARNERS: &str = "too many learners";
const MEMBER_NOT_FOUND: &str = "member not found";
const LEARNER_NOT_READY: &str = "can only promote a learner member which is in sync with leader";

fn matches(err: &etcd_client::Error, sentinel: &str) -> bool {
    err.to_string().contains(sentinel)
}

/// etcdserver: unhealthy cluster
pub fn is_unhealthy(err: &etcd_client::Error) -> bool {
    matches(err, UNHEALTHY)
}

/// etcdserver: too many learner members in cluster
pub fn is_too_many_learners(err: &etcd_client::Error) -> bool {
    matches(err, TOO_MANY_LEARNERS)
}

/// etcdserver: member not found
pub fn is_member_not_found(err: &etcd_client::Error) -> bool {
    matches(err, MEMBER_NOT_FOUND)
}

/// etcdserver: learner is not yet in sync with the leader
pub fn is_learner_not_ready(err: &etcd_client::Error) -> bool {
    matches(err, LEARNER_NOT_READY)
}

/// Request ran past its deadline
pub fn is_deadline_exceeded(err: &etcd_client::Error) -> bool {
    let text = err.to_string();
    text.contains("DeadlineExceeded") || text.contains("deadline has elapsed")
}
