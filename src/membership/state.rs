use std::{collections::BTreeMap, fmt, time::Duration};

use tracing::{debug, info, trace, warn};

use crate::common::{clock::Timestamp, id::ProcessorId};

use super::{
    config::{HeartbeatPolicy, ProcessorConfig},
    message::{Message, Payload},
    view::Membership,
};

/*
    Join: a processor that starts a group at local time t broadcasts
    new-group(V) with V = t + δ + ε. Since a broadcast reaches every correct
    processor within δ real time, and clocks differ by at most ε, every
    correct processor receives it before its own clock passes V. A
    new-group(V) received after V is therefore stale.

    Once joined, a member heartbeats at V + kP on its own clock, starting
    from the first k whose tick is no earlier than V + δ + ε, when every
    present reply of the join round has landed. Each heartbeat round is
    identified by its tick time T_k, which every member computes from the
    same V, so rounds line up across members even though their clocks do not.
    Heartbeats of consecutive rounds may be in flight at once when P < δ + ε,
    so a member's check-in is recorded whichever round it carries.
*/

/// Tokio timers resolve at millisecond granularity. Deadlines that must
/// observe every delivery bounded by some delay are placed one tick later.
pub(crate) const TIMER_GRANULARITY: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Status {
    #[default]
    Normal,
    Crashed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Normal => write!(f, "NORMAL"),
            Status::Crashed => write!(f, "CRASHED"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) enum TimerKind {
    Heartbeat,
    MembershipCheck,
    AttendanceTimeout,
}

impl TimerKind {
    /// Whether scheduling this kind replaces a pending timer of the same kind.
    /// Checks and attendance timeouts of consecutive rounds may overlap.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, TimerKind::Heartbeat)
    }
}

/// A scheduled timer. `generation` identifies the schedule it belongs to so
/// a fire that raced a cancellation is recognised and ignored; `epoch` is the
/// heartbeat round the timer acts on.
#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) struct Timer {
    pub kind: TimerKind,
    pub generation: u64,
    pub epoch: Timestamp,
}

/// Side effects requested by the state machine, executed by the processor task.
#[derive(Clone, PartialEq, Debug)]
pub(crate) enum Action {
    Broadcast(Payload),
    Send { to: ProcessorId, payload: Payload },
    SetTimer { timer: Timer, after: Duration },
    CancelTimers,
}

/// Protocol state of a single processor.
///
/// Every handler takes the processor's local clock reading and returns the
/// actions to perform; nothing here touches the network or a runtime.
#[derive(Debug)]
pub(crate) struct ProcessorState {
    id: ProcessorId,
    config: ProcessorConfig,
    broadcast_delay_bound: Duration,
    datagram_delay_bound: Duration,
    status: Status,
    membership: Membership,
    epoch: Option<Timestamp>,
    // Latest heartbeat round each peer was heard from.
    check_ins: BTreeMap<ProcessorId, Timestamp>,
    // Latest round whose attendance token visited us.
    attendance: Option<Timestamp>,
    // Present replies for a join round whose new-group has not arrived yet.
    early_replies: Option<(Timestamp, Membership)>,
    generation: u64,
    rounds: u64,
}

impl ProcessorState {
    pub fn new(
        id: ProcessorId,
        config: ProcessorConfig,
        broadcast_delay_bound: Duration,
        datagram_delay_bound: Duration,
    ) -> Self {
        ProcessorState {
            id,
            config,
            broadcast_delay_bound,
            datagram_delay_bound,
            status: Status::Normal,
            membership: Membership::new(),
            epoch: None,
            check_ins: BTreeMap::new(),
            attendance: None,
            early_replies: None,
            generation: 0,
            rounds: 0,
        }
    }

    pub fn id(&self) -> ProcessorId {
        self.id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn epoch(&self) -> Option<Timestamp> {
        self.epoch
    }

    /// Join rounds this processor has entered, own or peer-initiated.
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    fn is_crashed(&self) -> bool {
        self.status == Status::Crashed
    }

    fn join_window(&self) -> Duration {
        self.broadcast_delay_bound + self.config.max_clock_sync_error
    }

    fn supersede(&mut self) -> Action {
        self.generation += 1;
        Action::CancelTimers
    }

    fn enter_round(&mut self, deadline: Timestamp, membership: Membership) {
        self.membership = membership;
        self.epoch = Some(deadline);
        self.check_ins.clear();
        self.attendance = None;
        self.early_replies = None;
        self.rounds += 1;
    }

    /// First tick V + kP at or after V + δ + ε.
    fn first_tick(&self, deadline: Timestamp) -> Timestamp {
        let period = self.config.check_in_period;
        let window = self.join_window();
        if period.is_zero() {
            return deadline + window;
        }
        let periods = window.as_nanos().div_ceil(period.as_nanos()).max(1);
        deadline + period.saturating_mul(u32::try_from(periods).unwrap_or(u32::MAX))
    }

    fn schedule_heartbeat(&self, tick: Timestamp, now: Timestamp) -> Action {
        Action::SetTimer {
            timer: Timer {
                kind: TimerKind::Heartbeat,
                generation: self.generation,
                epoch: tick,
            },
            after: now.saturating_duration_until(tick),
        }
    }

    pub fn init_join(&mut self, now: Timestamp) -> Vec<Action> {
        if self.is_crashed() {
            return Vec::new();
        }

        let mut deadline = now + self.join_window();
        if let Some(current) = self.epoch {
            deadline = deadline.max(current);
        }

        let cancel = self.supersede();
        self.enter_round(deadline, Membership::singleton(self.id));
        info!(processor = %self.id, %deadline, "initiating join");

        vec![
            cancel,
            Action::Broadcast(Payload::NewGroup { deadline }),
            self.schedule_heartbeat(self.first_tick(deadline), now),
        ]
    }

    pub fn handle_message(&mut self, message: &Message, now: Timestamp) -> Vec<Action> {
        if self.is_crashed() {
            return Vec::new();
        }

        match message.payload() {
            Payload::NewGroup { deadline } => self.handle_new_group(message.sender(), *deadline, now),
            Payload::Present { deadline, members } => {
                self.handle_present(message.sender(), *deadline, members, now);
                Vec::new()
            }
            Payload::AttendanceList { epoch } => self.handle_attendance(message.sender(), *epoch),
        }
    }

    fn handle_new_group(&mut self, sender: ProcessorId, deadline: Timestamp, now: Timestamp) -> Vec<Action> {
        if now > deadline {
            debug!(processor = %self.id, %sender, %deadline, %now, "discarding stale new-group");
            return Vec::new();
        }
        if self.epoch.is_some_and(|current| deadline < current) {
            debug!(processor = %self.id, %sender, %deadline, "discarding superseded new-group");
            return Vec::new();
        }

        let mut membership = Membership::from_iter([self.id, sender]);
        if let Some((round, replies)) = &self.early_replies {
            if *round == deadline {
                membership = membership.union(replies);
            }
        }

        let cancel = self.supersede();
        self.enter_round(deadline, membership);
        self.check_ins.insert(sender, deadline);
        info!(processor = %self.id, %sender, %deadline, members = %self.membership, "joined group");

        vec![
            cancel,
            Action::Broadcast(Payload::Present {
                deadline,
                members: self.membership.clone(),
            }),
            self.schedule_heartbeat(self.first_tick(deadline), now),
        ]
    }

    fn handle_present(&mut self, sender: ProcessorId, deadline: Timestamp, remote: &Membership, now: Timestamp) {
        let Some(current) = self.epoch else {
            // Reply to a join round whose new-group is still on its way to us.
            if now <= deadline {
                self.remember_early_reply(deadline, remote);
            }
            return;
        };

        // A present proves the sender alive for its round, even one our own
        // ticks have already moved past.
        let round = self.check_ins.entry(sender).or_insert(deadline);
        *round = round.max(deadline);

        if deadline < current {
            trace!(processor = %self.id, %sender, %deadline, "present from an earlier round, check-in only");
            return;
        }

        let adopted = if deadline > current {
            self.remember_early_reply(deadline, remote);
            remote.with(self.id)
        } else {
            self.membership.union(remote)
        };
        self.epoch = Some(deadline);

        if adopted != self.membership {
            info!(processor = %self.id, %sender, %deadline, members = %adopted, "adopting membership view");
            self.membership = adopted;
        }
    }

    fn remember_early_reply(&mut self, deadline: Timestamp, remote: &Membership) {
        match &mut self.early_replies {
            Some((round, replies)) if *round == deadline => *replies = replies.union(remote),
            _ => self.early_replies = Some((deadline, remote.clone())),
        }
    }

    fn handle_attendance(&mut self, sender: ProcessorId, epoch: Timestamp) -> Vec<Action> {
        if self.epoch.is_none() {
            return Vec::new();
        }

        self.attendance = Some(self.attendance.map_or(epoch, |seen| seen.max(epoch)));

        if self.membership.originator() == Some(self.id) {
            debug!(processor = %self.id, %sender, %epoch, "attendance circuit complete");
            return Vec::new();
        }

        match self.membership.successor(self.id) {
            Some(next) if next != self.id => {
                trace!(processor = %self.id, %next, %epoch, "forwarding attendance list");
                vec![Action::Send {
                    to: next,
                    payload: Payload::AttendanceList { epoch },
                }]
            }
            _ => Vec::new(),
        }
    }

    pub fn handle_timer(&mut self, timer: Timer, now: Timestamp) -> Vec<Action> {
        if self.is_crashed() || timer.generation != self.generation {
            trace!(processor = %self.id, ?timer, "ignoring superseded timer");
            return Vec::new();
        }

        match timer.kind {
            TimerKind::Heartbeat => self.heartbeat(timer.epoch, now),
            TimerKind::MembershipCheck => self.check_membership(timer.epoch, now),
            TimerKind::AttendanceTimeout => self.check_attendance(timer.epoch, now),
        }
    }

    fn heartbeat(&mut self, tick: Timestamp, now: Timestamp) -> Vec<Action> {
        self.epoch = Some(self.epoch.map_or(tick, |current| current.max(tick)));

        match self.config.policy {
            HeartbeatPolicy::PeriodicBroadcast => {
                debug!(processor = %self.id, %tick, members = %self.membership, "heartbeat");
                vec![
                    Action::Broadcast(Payload::Present {
                        deadline: tick,
                        members: self.membership.clone(),
                    }),
                    Action::SetTimer {
                        timer: Timer {
                            kind: TimerKind::MembershipCheck,
                            generation: self.generation,
                            epoch: tick,
                        },
                        after: self.join_window() + TIMER_GRANULARITY,
                    },
                    self.schedule_heartbeat(tick + self.config.check_in_period, now),
                ]
            }
            HeartbeatPolicy::AttendanceList => {
                let mut actions = Vec::new();
                let ring_len = self.membership.len();

                if let (Some(position), true) = (self.membership.position(self.id), ring_len > 1) {
                    if position == 0 {
                        if let Some(next) = self.membership.successor(self.id) {
                            debug!(processor = %self.id, %next, %tick, "originating attendance list");
                            actions.push(Action::Send {
                                to: next,
                                payload: Payload::AttendanceList { epoch: tick },
                            });
                        }
                    }

                    // The originator waits for the whole circuit, everyone
                    // else for the hops between the originator and them.
                    let hops = if position == 0 { ring_len } else { position };
                    let timeout = self
                        .datagram_delay_bound
                        .saturating_mul(u32::try_from(hops).unwrap_or(u32::MAX))
                        .saturating_add(self.config.max_clock_sync_error)
                        .saturating_add(TIMER_GRANULARITY);
                    actions.push(Action::SetTimer {
                        timer: Timer {
                            kind: TimerKind::AttendanceTimeout,
                            generation: self.generation,
                            epoch: tick,
                        },
                        after: timeout,
                    });
                }

                actions.push(self.schedule_heartbeat(tick + self.config.check_in_period, now));
                actions
            }
        }
    }

    fn check_membership(&mut self, epoch: Timestamp, now: Timestamp) -> Vec<Action> {
        let missing: Vec<ProcessorId> = self
            .membership
            .iter()
            .filter(|member| *member != self.id)
            .filter(|member| !self.check_ins.get(member).is_some_and(|round| *round >= epoch))
            .collect();

        if missing.is_empty() {
            trace!(processor = %self.id, %epoch, "all members checked in");
            return Vec::new();
        }

        warn!(processor = %self.id, %epoch, ?missing, "missed check-in, re-joining");
        self.init_join(now)
    }

    fn check_attendance(&mut self, epoch: Timestamp, now: Timestamp) -> Vec<Action> {
        if self.attendance.is_some_and(|seen| seen >= epoch) {
            trace!(processor = %self.id, %epoch, "attendance observed");
            return Vec::new();
        }

        warn!(processor = %self.id, %epoch, "attendance list never arrived, re-joining");
        self.init_join(now)
    }

    pub fn crash(&mut self) -> Vec<Action> {
        if self.is_crashed() {
            return Vec::new();
        }

        self.status = Status::Crashed;
        self.membership = Membership::new();
        self.epoch = None;
        self.check_ins.clear();
        self.attendance = None;
        self.early_replies = None;
        vec![self.supersede()]
    }
}
