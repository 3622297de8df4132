//! Neighbor state machine
//!
//! Spark tracks each (interface, neighbor) pair through a five-state
//! machine. Transitions are table-driven; any (state, event) pair absent
//! from the table is a logged no-op, never a state change.

use crate::utils::StepDetector;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Neighbor FSM states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SparkNeighborState {
    /// Nothing heard yet
    Idle,
    /// Hellos seen, neighbor does not reflect us yet
    Warm,
    /// Mutual visibility; exchanging handshakes
    Negotiate,
    /// Adjacency formed
    Established,
    /// Peer announced a graceful restart
    Restart,
}

/// Neighbor FSM events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SparkNeighborEvent {
    /// Hello listing us among the sender's neighbors
    HelloRcvdInfo,
    /// Hello that does not list us
    HelloRcvdNoInfo,
    /// Hello carrying the restarting flag
    HelloRcvdRestart,
    /// Heartbeat received
    HeartbeatRcvd,
    /// Handshake received
    HandshakeRcvd,
    /// Heartbeat hold expired
    HeartbeatTimerExpire,
    /// Negotiation hold expired
    NegotiateTimerExpire,
    /// Graceful-restart hold expired
    GrTimerExpire,
}

/// Table-driven state transition
///
/// Returns `None` for pairs outside the table; the caller logs and stays.
pub fn next_state(
    state: SparkNeighborState,
    event: SparkNeighborEvent,
) -> Option<SparkNeighborState> {
    use SparkNeighborEvent::*;
    use SparkNeighborState::*;
    match (state, event) {
        (Idle, HelloRcvdInfo) => Some(Warm),
        (Idle, HelloRcvdNoInfo) => Some(Warm),
        (Warm, HelloRcvdInfo) => Some(Negotiate),
        (Negotiate, HandshakeRcvd) => Some(Established),
        (Negotiate, NegotiateTimerExpire) => Some(Warm),
        (Established, HelloRcvdNoInfo) => Some(Idle),
        (Established, HelloRcvdRestart) => Some(Restart),
        (Established, HeartbeatRcvd) => Some(Established),
        (Established, HeartbeatTimerExpire) => Some(Idle),
        (Restart, HelloRcvdInfo) => Some(Established),
        (Restart, GrTimerExpire) => Some(Idle),
        _ => None,
    }
}

/// Everything Spark knows about one neighbor on one interface
pub struct SparkNeighbor {
    /// Neighbor node name
    pub node_name: String,
    /// Neighbor's routing domain
    pub domain: String,
    /// Neighbor's interface on the far end
    pub remote_if_name: String,
    /// Area the adjacency forms in
    pub area: String,
    /// Current FSM state
    pub state: SparkNeighborState,
    /// Last hello sequence number seen
    pub seq_num: u64,
    /// Neighbor's IPv6 link-local transport address
    pub transport_address_v6: Option<IpAddr>,
    /// Neighbor's IPv4 transport address
    pub transport_address_v4: Option<IpAddr>,
    /// Neighbor's KvStore listener port
    pub kvstore_port: u16,
    /// Neighbor's control-plane port
    pub ctrl_port: u16,
    /// Neighbor's heartbeat hold time
    pub heartbeat_hold_time: Duration,
    /// Neighbor's graceful-restart hold time
    pub gr_hold_time: Duration,
    /// Neighbor participates in the flood-optimization overlay
    pub supports_flood_optimization: bool,
    /// Send timestamp of the neighbor's last hello (their clock, us)
    pub neighbor_timestamp_us: i64,
    /// Our receive timestamp of that hello (our clock, us)
    pub local_timestamp_us: i64,
    /// Smoothed RTT currently reported upward
    pub rtt_us: i64,
    /// Most recent raw RTT sample
    pub rtt_latest_us: i64,
    /// SR adjacency label toward this neighbor
    pub label: i32,
    /// Deadline for the negotiation hold
    pub negotiate_deadline: Option<Instant>,
    /// Deadline for the heartbeat hold
    pub heartbeat_deadline: Option<Instant>,
    /// Deadline for the graceful-restart hold
    pub gr_deadline: Option<Instant>,
    /// RTT step detector
    pub step_detector: StepDetector,
    rtt_last_sample_at: Option<Instant>,
}

impl SparkNeighbor {
    /// Track a freshly-heard neighbor in the Idle state
    pub fn new(
        node_name: impl Into<String>,
        domain: impl Into<String>,
        remote_if_name: impl Into<String>,
        seq_num: u64,
        label: i32,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            domain: domain.into(),
            remote_if_name: remote_if_name.into(),
            area: String::new(),
            state: SparkNeighborState::Idle,
            seq_num,
            transport_address_v6: None,
            transport_address_v4: None,
            kvstore_port: 0,
            ctrl_port: 0,
            heartbeat_hold_time: Duration::ZERO,
            gr_hold_time: Duration::ZERO,
            supports_flood_optimization: false,
            neighbor_timestamp_us: 0,
            local_timestamp_us: 0,
            rtt_us: 0,
            rtt_latest_us: 0,
            label,
            negotiate_deadline: None,
            heartbeat_deadline: None,
            gr_deadline: None,
            // 10% change over a 1s sampling window, 100us floor
            step_detector: StepDetector::new(Duration::from_secs(1), 10.0, 100.0),
            rtt_last_sample_at: None,
        }
    }

    /// Feed one raw RTT sample taken `since_last` after the previous one;
    /// returns the new smoothed value when the step detector reports a
    /// shift
    pub fn sample_rtt(&mut self, rtt_us: i64, since_last: Duration) -> Option<i64> {
        self.rtt_latest_us = rtt_us;
        self.rtt_last_sample_at = Some(Instant::now());
        let reported = self.step_detector.add_sample(rtt_us as f64, since_last)?;
        let reported = reported.round() as i64;
        self.rtt_us = reported;
        Some(reported)
    }

    /// Elapsed wall time since the previous RTT sample
    pub fn since_last_rtt_sample(&self) -> Duration {
        self.rtt_last_sample_at
            .map(|at| at.elapsed())
            .unwrap_or(Duration::from_secs(1))
    }

    /// Arm the heartbeat hold from now
    pub fn arm_heartbeat(&mut self, now: Instant) {
        if !self.heartbeat_hold_time.is_zero() {
            self.heartbeat_deadline = Some(now + self.heartbeat_hold_time);
        }
    }

    /// Drop every armed deadline (used when leaving Established)
    pub fn clear_deadlines(&mut self) {
        self.negotiate_deadline = None;
        self.heartbeat_deadline = None;
        self.gr_deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SparkNeighborEvent::*;
    use SparkNeighborState::*;

    #[test]
    fn test_happy_path_to_established() {
        let mut state = Idle;
        for (event, expected) in [
            (HelloRcvdNoInfo, Warm),
            (HelloRcvdInfo, Negotiate),
            (HandshakeRcvd, Established),
        ] {
            state = next_state(state, event).unwrap();
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn test_negotiate_timeout_falls_back_to_warm() {
        assert_eq!(next_state(Negotiate, NegotiateTimerExpire), Some(Warm));
    }

    #[test]
    fn test_established_down_paths() {
        assert_eq!(next_state(Established, HeartbeatTimerExpire), Some(Idle));
        assert_eq!(next_state(Established, HelloRcvdNoInfo), Some(Idle));
    }

    #[test]
    fn test_graceful_restart_cycle() {
        assert_eq!(next_state(Established, HelloRcvdRestart), Some(Restart));
        assert_eq!(next_state(Restart, HelloRcvdInfo), Some(Established));
        assert_eq!(next_state(Restart, GrTimerExpire), Some(Idle));
    }

    #[test]
    fn test_unlisted_pairs_are_no_ops() {
        // a sample of pairs deliberately outside the table
        assert_eq!(next_state(Idle, HandshakeRcvd), None);
        assert_eq!(next_state(Warm, HeartbeatRcvd), None);
        assert_eq!(next_state(Warm, HelloRcvdNoInfo), None);
        assert_eq!(next_state(Negotiate, HelloRcvdRestart), None);
        assert_eq!(next_state(Restart, HeartbeatTimerExpire), None);
    }

    #[test]
    fn test_heartbeat_keeps_established() {
        assert_eq!(next_state(Established, HeartbeatRcvd), Some(Established));
    }

    #[test]
    fn test_rtt_step_detection() {
        let window = Duration::from_secs(1);
        let mut neighbor = SparkNeighbor::new("node2", "default", "eth1", 1, 50001);
        // first full window reports
        let reported = neighbor.sample_rtt(1_000, window);
        assert_eq!(reported, Some(1_000));
        assert_eq!(neighbor.rtt_us, 1_000);
        // small jitter is suppressed
        assert_eq!(neighbor.sample_rtt(1_040, window), None);
        assert_eq!(neighbor.rtt_us, 1_000);
        assert_eq!(neighbor.rtt_latest_us, 1_040);
        // a real shift reports
        let reported = neighbor.sample_rtt(2_000, window);
        assert_eq!(reported, Some(2_000));
    }
}
