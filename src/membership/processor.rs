use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::{
    common::{
        clock::{Clock, Timestamp},
        error::{ChannelError, ConfigError},
        id::ProcessorId,
    },
    network::channel::{Channel, WeakChannel},
};

use super::{
    config::{HeartbeatPolicy, ProcessorConfig},
    message::Message,
    state::{Action, ProcessorState, Status, Timer},
    timers::TimerManager,
    view::Membership,
};

/*
    Every input a processor reacts to (a join request, a delivered message,
    a timer, a crash) is queued as an event and applied by a single task
    that owns the protocol state. Handlers for the same processor therefore
    never interleave, whatever order the network and the timers produce
    them in.
*/

#[derive(Debug)]
pub(crate) enum Event {
    InitJoin,
    Deliver(Message),
    Timer(Timer),
    Crash,
}

/// What a processor currently reports to the outside world.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct ProcessorView {
    pub status: Status,
    pub members: Membership,
    pub epoch: Option<Timestamp>,
    /// Join rounds entered so far, own or peer-initiated.
    pub rounds: u64,
}

impl ProcessorView {
    fn of(state: &ProcessorState) -> Self {
        ProcessorView {
            status: state.status(),
            members: state.membership().clone(),
            epoch: state.epoch(),
            rounds: state.rounds(),
        }
    }

    fn crashed(&self) -> Self {
        ProcessorView {
            status: Status::Crashed,
            members: Membership::new(),
            epoch: None,
            rounds: self.rounds,
        }
    }
}

/// Handle to a processor. Cheap to clone; all clones drive the same task,
/// which stops once the last handle is gone.
#[derive(Clone)]
pub struct Processor {
    inner: Arc<Shared>,
}

struct Shared {
    id: ProcessorId,
    config: ProcessorConfig,
    channel: WeakChannel,
    crashed: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<Event>,
    view: watch::Receiver<ProcessorView>,
}

impl Processor {
    /// Creates a processor on `channel` and starts its task. The processor
    /// still has to be registered before it can send or receive.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(channel: &Channel, config: ProcessorConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let id = channel.next_processor_id();
        let clock = channel.clock(config.max_clock_sync_error);
        let bounds = channel.config();
        if config.overlaps_rounds(bounds.broadcast_delay_bound) {
            warn!(
                processor = %id,
                check_in_period = ?config.check_in_period,
                broadcast_delay_bound = ?bounds.broadcast_delay_bound,
                max_clock_sync_error = ?config.max_clock_sync_error,
                "check-in period does not exceed broadcast delay plus clock error, heartbeat rounds will overlap"
            );
        }

        let state = ProcessorState::new(id, config, bounds.broadcast_delay_bound, bounds.datagram_delay_bound);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(ProcessorView::of(&state));
        let crashed = Arc::new(AtomicBool::new(false));

        debug!(processor = %id, clock_offset = clock.offset(), policy = ?config.policy, "created processor");

        let task = ProcessorTask {
            state,
            clock,
            channel: channel.downgrade(),
            crashed: crashed.clone(),
            timers: TimerManager::new(event_tx.downgrade()),
            view: view_tx,
        };
        tokio::spawn(async move {
            task.run(event_rx).await;
        });

        Ok(Processor {
            inner: Arc::new(Shared {
                id,
                config,
                channel: channel.downgrade(),
                crashed,
                events: event_tx,
                view: view_rx,
            }),
        })
    }

    pub fn id(&self) -> ProcessorId {
        self.inner.id
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.inner.config
    }

    pub fn policy(&self) -> HeartbeatPolicy {
        self.inner.config.policy
    }

    pub fn status(&self) -> Status {
        if self.is_crashed() {
            Status::Crashed
        } else {
            Status::Normal
        }
    }

    pub fn is_crashed(&self) -> bool {
        self.inner.crashed.load(Ordering::SeqCst)
    }

    /// Snapshot of the processor's membership view, in ascending id order.
    pub fn members(&self) -> Vec<ProcessorId> {
        self.view().members.to_vec()
    }

    pub fn epoch(&self) -> Option<Timestamp> {
        self.view().epoch
    }

    pub fn view(&self) -> ProcessorView {
        let view = self.inner.view.borrow().clone();
        if self.is_crashed() {
            view.crashed()
        } else {
            view
        }
    }

    /// Watches the views the processor publishes after each event.
    pub fn subscribe(&self) -> watch::Receiver<ProcessorView> {
        self.inner.view.clone()
    }

    /// Starts a new join round from this processor.
    pub fn init_join(&self) {
        if self.is_crashed() {
            debug!(processor = %self.id(), "ignoring join on crashed processor");
            return;
        }
        self.enqueue(Event::InitJoin);
    }

    /// Fail-stop crash. Irrevocable.
    pub fn crash(&self) {
        if self.inner.crashed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(processor = %self.id(), "crashed");
        self.enqueue(Event::Crash);
    }

    pub(crate) fn deliver(&self, message: Message) {
        self.enqueue(Event::Deliver(message));
    }

    pub(crate) fn belongs_to(&self, channel: &Channel) -> bool {
        self.inner.channel.points_to(channel)
    }

    fn enqueue(&self, event: Event) {
        if let Err(err) = self.inner.events.send(event) {
            trace!(processor = %self.id(), event = ?err.0, "processor task has stopped");
        }
    }
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Processor")
            .field("id", &self.id())
            .field("view", &self.view())
            .finish()
    }
}

impl fmt::Display for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let view = self.view();
        write!(f, "Processor {} [{}] members={}", self.id(), view.status, view.members)
    }
}

struct ProcessorTask {
    state: ProcessorState,
    clock: Clock,
    channel: WeakChannel,
    crashed: Arc<AtomicBool>,
    timers: TimerManager,
    view: watch::Sender<ProcessorView>,
}

impl ProcessorTask {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            let now = self.clock.now();
            let actions = match event {
                Event::Crash => {
                    self.shutdown();
                    break;
                }
                _ if self.crashed.load(Ordering::SeqCst) => continue,
                Event::InitJoin => self.state.init_join(now),
                Event::Deliver(message) => {
                    trace!(processor = %self.state.id(), message = %message.id(), kind = ?message.kind(), "received");
                    self.state.handle_message(&message, now)
                }
                Event::Timer(timer) => self.state.handle_timer(timer, now),
            };

            let Some(channel) = self.channel.upgrade() else {
                debug!(processor = %self.state.id(), "channel dropped, stopping processor");
                break;
            };
            self.execute(&channel, actions);
            self.view.send_replace(ProcessorView::of(&self.state));
        }
        self.timers.cancel_all();
    }

    fn execute(&mut self, channel: &Channel, actions: Vec<Action>) {
        let id = self.state.id();
        for action in actions {
            let outcome: Result<(), ChannelError> = match action {
                Action::Broadcast(payload) => channel
                    .create_message(id, payload)
                    .and_then(|message| channel.broadcast(message)),
                Action::Send { to, payload } => channel
                    .create_message(id, payload)
                    .and_then(|message| channel.send_message(message.with_receiver(to))),
                Action::SetTimer { timer, after } => {
                    self.timers.set_timer(timer, after);
                    Ok(())
                }
                Action::CancelTimers => {
                    self.timers.cancel_all();
                    Ok(())
                }
            };

            if let Err(err) = outcome {
                error!(processor = %id, %err, "dropping action");
            }
        }
    }

    fn shutdown(&mut self) {
        let cancelled = self.timers.pending();
        self.state.crash();
        self.timers.cancel_all();
        self.view.send_replace(ProcessorView::of(&self.state));
        debug!(processor = %self.state.id(), cancelled, "processor stopped");
    }
}
