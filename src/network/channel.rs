use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::{
    common::{
        clock::Clock,
        error::ChannelError,
        id::{MessageId, ProcessorId},
    },
    membership::{
        message::{Message, Payload},
        processor::Processor,
    },
};

use super::config::ChannelConfig;

/// The simulated network connecting a set of processors.
///
/// Messages to live processors are delivered after a random delay below the
/// configured bound, each on its own task, so deliveries may overtake one
/// another. Messages from or to a crashed processor are silently dropped.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    config: ChannelConfig,
    origin: Instant,
    registry: RwLock<Vec<Processor>>,
    next_processor_id: AtomicU64,
    next_message_id: AtomicU64,
    rng: Mutex<ChaCha8Rng>,
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// Non-owning reference held by processors, so the registry and its
/// processors do not keep each other alive.
#[derive(Clone)]
pub(crate) struct WeakChannel(Weak<ChannelInner>);

impl WeakChannel {
    pub fn upgrade(&self) -> Option<Channel> {
        self.0.upgrade().map(|inner| Channel { inner })
    }

    pub fn points_to(&self, channel: &Channel) -> bool {
        std::ptr::eq(self.0.as_ptr(), Arc::as_ptr(&channel.inner))
    }
}

impl Channel {
    pub fn new(config: ChannelConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };

        Channel {
            inner: Arc::new(ChannelInner {
                config,
                origin: Instant::now(),
                registry: RwLock::new(Vec::new()),
                next_processor_id: AtomicU64::new(1),
                next_message_id: AtomicU64::new(1),
                rng: Mutex::new(rng),
                closed: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn with_bounds(broadcast_delay_bound: Duration, datagram_delay_bound: Duration) -> Self {
        Channel::new(ChannelConfig::new(broadcast_delay_bound, datagram_delay_bound))
    }

    pub fn config(&self) -> ChannelConfig {
        self.inner.config
    }

    pub fn register_processor(&self, processor: &Processor) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        if !processor.belongs_to(self) {
            return Err(ChannelError::ForeignProcessor(processor.id()));
        }

        let mut registry = self.inner.registry.write();
        if registry.iter().any(|registered| registered.id() == processor.id()) {
            return Err(ChannelError::AlreadyRegistered(processor.id()));
        }
        registry.push(processor.clone());
        debug!(processor = %processor.id(), registered = registry.len(), "registered processor");
        Ok(())
    }

    pub fn find_processor(&self, id: ProcessorId) -> Option<Processor> {
        self.inner
            .registry
            .read()
            .iter()
            .find(|processor| processor.id() == id)
            .cloned()
    }

    /// Registered processors in registration order.
    pub fn processors(&self) -> Vec<Processor> {
        self.inner.registry.read().clone()
    }

    pub fn create_message(&self, sender: ProcessorId, payload: Payload) -> Result<Message, ChannelError> {
        if self.find_processor(sender).is_none() {
            return Err(ChannelError::UnregisteredProcessor(sender));
        }
        let id = MessageId(self.inner.next_message_id.fetch_add(1, Ordering::SeqCst));
        Ok(Message::new(id, sender, payload))
    }

    /// Unicast to `message.receiver()`.
    pub fn send_message(&self, message: Message) -> Result<(), ChannelError> {
        let receiver_id = message
            .receiver()
            .ok_or(ChannelError::MissingReceiver(message.id()))?;
        let sender = self
            .find_processor(message.sender())
            .ok_or(ChannelError::UnregisteredProcessor(message.sender()))?;
        let receiver = self
            .find_processor(receiver_id)
            .ok_or(ChannelError::UnregisteredProcessor(receiver_id))?;

        if sender.is_crashed() || receiver.is_crashed() {
            self.drop_message(&message, receiver_id);
            return Ok(());
        }

        let delay = self.sample_delay(self.inner.config.datagram_delay_bound);
        self.schedule_delivery(receiver, message, delay);
        Ok(())
    }

    /// Delivers a copy of `message` to every other live processor.
    pub fn broadcast(&self, message: Message) -> Result<(), ChannelError> {
        let sender = self
            .find_processor(message.sender())
            .ok_or(ChannelError::UnregisteredProcessor(message.sender()))?;

        if sender.is_crashed() {
            trace!(message = %message.id(), sender = %sender.id(), "dropping broadcast from crashed processor");
            self.inner.dropped.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }

        let recipients: Vec<Processor> = self
            .processors()
            .into_iter()
            .filter(|processor| processor.id() != sender.id())
            .collect();

        for recipient in recipients {
            if recipient.is_crashed() {
                self.drop_message(&message, recipient.id());
                continue;
            }
            let delay = self.sample_delay(self.inner.config.broadcast_delay_bound);
            let copy = message.addressed_to(recipient.id());
            self.schedule_delivery(recipient, copy, delay);
        }
        Ok(())
    }

    /// Crashes every registered processor and retires the channel.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let processors = self.processors();
        for processor in &processors {
            processor.crash();
        }
        info!(processors = processors.len(), "channel closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Deliveries discarded because the sender or the receiver had crashed.
    pub fn dropped_messages(&self) -> u64 {
        self.inner.dropped.load(Ordering::SeqCst)
    }

    pub(crate) fn next_processor_id(&self) -> ProcessorId {
        ProcessorId(self.inner.next_processor_id.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn clock(&self, max_clock_sync_error: Duration) -> Clock {
        let mut rng = self.inner.rng.lock();
        Clock::with_skew(self.inner.origin, max_clock_sync_error, &mut *rng)
    }

    pub(crate) fn downgrade(&self) -> WeakChannel {
        WeakChannel(Arc::downgrade(&self.inner))
    }

    /// Whole milliseconds strictly below `bound`, so a delivery lands on a
    /// timer tick no later than `bound - 1ms` after it was sent.
    fn sample_delay(&self, bound: Duration) -> Duration {
        let millis = u64::try_from(bound.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.inner.rng.lock().gen_range(0..millis))
    }

    fn drop_message(&self, message: &Message, receiver: ProcessorId) {
        trace!(message = %message.id(), sender = %message.sender(), %receiver, "dropping message to or from crashed processor");
        self.inner.dropped.fetch_add(1, Ordering::SeqCst);
    }

    fn schedule_delivery(&self, receiver: Processor, message: Message, delay: Duration) {
        trace!(message = %message.id(), kind = ?message.kind(), to = %receiver.id(), ?delay, "scheduling delivery");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            receiver.deliver(message);
        });
    }
}
