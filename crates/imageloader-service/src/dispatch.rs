//! Delivering load outcomes to consumers.
//!
//! A consumer is a boxed callback receiving one [`Delivery`]. The [`ResultDispatcher`] decides
//! on which execution context it runs: [`ImmediateDispatcher`] calls it right on the worker that
//! finished the load, [`QueueDispatcher`] hands it to a [`DispatchQueue`] drained by the
//! consumer's own thread, typically a UI thread.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::LoadError;
use crate::types::{LoadedFrom, Request};

/// A successfully loaded image.
#[derive(Debug)]
pub struct Loaded<I> {
    pub image: Arc<I>,
    /// The layer that produced the image.
    pub from: LoadedFrom,
}

impl<I> Clone for Loaded<I> {
    fn clone(&self) -> Self {
        Self {
            image: Arc::clone(&self.image),
            from: self.from,
        }
    }
}

/// The outcome of one load, as handed to its consumer.
#[derive(Debug)]
pub struct Delivery<I> {
    pub request: Arc<Request>,
    pub result: Result<Loaded<I>, LoadError>,
}

/// The callback receiving a [`Delivery`].
pub type Consumer<I> = Box<dyn FnOnce(Delivery<I>) + Send + 'static>;

/// Delivers outcomes to consumers on the appropriate execution context.
pub trait ResultDispatcher<I>: Send + Sync + 'static {
    fn dispatch(&self, consumer: Consumer<I>, delivery: Delivery<I>);
}

/// Calls the consumer on the worker that finished the load.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateDispatcher;

impl<I> ResultDispatcher<I> for ImmediateDispatcher {
    fn dispatch(&self, consumer: Consumer<I>, delivery: Delivery<I>) {
        consumer(delivery)
    }
}

struct PendingDelivery<I> {
    consumer: Consumer<I>,
    delivery: Delivery<I>,
}

/// Queues deliveries for a [`DispatchQueue`].
pub struct QueueDispatcher<I> {
    sender: mpsc::UnboundedSender<PendingDelivery<I>>,
}

impl<I> fmt::Debug for QueueDispatcher<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueDispatcher")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl<I> Clone for QueueDispatcher<I> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<I: Send + Sync + 'static> ResultDispatcher<I> for QueueDispatcher<I> {
    fn dispatch(&self, consumer: Consumer<I>, delivery: Delivery<I>) {
        let pending = PendingDelivery { consumer, delivery };
        if let Err(mpsc::error::SendError(pending)) = self.sender.send(pending) {
            tracing::debug!(
                "Dropping delivery for `{}`, the dispatch queue is gone",
                pending.delivery.request.name()
            );
        }
    }
}

/// The receiving end of a [`QueueDispatcher`].
///
/// Consumers run on whichever thread drains the queue.
pub struct DispatchQueue<I> {
    receiver: mpsc::UnboundedReceiver<PendingDelivery<I>>,
}

impl<I> fmt::Debug for DispatchQueue<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("pending", &self.receiver.len())
            .finish()
    }
}

impl<I> DispatchQueue<I> {
    /// Runs all consumers that are queued right now and returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(pending) = self.receiver.try_recv() {
            (pending.consumer)(pending.delivery);
            ran += 1;
        }
        ran
    }

    /// Waits for the next delivery and runs its consumer.
    ///
    /// Returns `false` once all dispatchers are gone and the queue is empty.
    pub async fn run_next(&mut self) -> bool {
        match self.receiver.recv().await {
            Some(pending) => {
                (pending.consumer)(pending.delivery);
                true
            }
            None => false,
        }
    }
}

/// Creates a connected [`QueueDispatcher`] and [`DispatchQueue`].
pub fn dispatch_queue<I>() -> (QueueDispatcher<I>, DispatchQueue<I>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (QueueDispatcher { sender }, DispatchQueue { receiver })
}
