pub struct ScopeGuard<F: FnOnce()> {
    dropfn: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub fn defuse(mut self) {
        self.dropfn = None;
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(dropfn) = self.dropfn.take() {
            dropfn();
        }
    }
}

/// Runs `dropfn` when the returned guard is dropped, unless it is defused first.
pub fn defer<F: FnOnce()>(dropfn: F) -> ScopeGuard<F> {
    ScopeGuard {
        dropfn: Some(dropfn),
    }
}

/// A broadcast sender that never blocks and stays open without receivers.
///
/// When the channel is full the oldest event is dropped, and the receiver that missed it sees
/// an overflow on its next `recv`.
pub struct EventSender<T> {
    sender: async_broadcast::Sender<T>,
    _keep_alive: async_broadcast::InactiveReceiver<T>,
}

pub type EventReceiver<T> = async_broadcast::Receiver<T>;

impl<T: Clone> EventSender<T> {
    pub fn new(cap: usize) -> Self {
        let (mut sender, receiver) = async_broadcast::broadcast(cap.max(1));
        sender.set_overflow(true);
        Self {
            sender,
            _keep_alive: receiver.deactivate(),
        }
    }

    pub fn send(&self, event: T) {
        let _ = self.sender.try_broadcast(event);
    }

    pub fn subscribe(&self) -> EventReceiver<T> {
        self.sender.new_receiver()
    }
}
