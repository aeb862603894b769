//! Multicast channel with history
//!
//! A [`Replay`] buffers the values sent through it (bounded or unbounded)
//! together with an optional terminal signal. A subscriber attaching at any
//! point first receives the buffered backlog, then live values, then the
//! terminal signal exactly once.
//!
//! Sending and subscribing both happen under the same lock, so a value is
//! either part of a new subscriber's backlog or delivered to it live, never
//! both and never neither.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Item delivered to subscribers
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signal<T> {
    Value(T),
    Completed,
    Failed(String),
}

impl<T> Signal<T> {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Signal::Value(_))
    }
}

#[derive(Clone, Debug)]
enum Terminal {
    Completed,
    Failed(String),
}

impl Terminal {
    fn signal<T>(&self) -> Signal<T> {
        match self {
            Terminal::Completed => Signal::Completed,
            Terminal::Failed(msg) => Signal::Failed(msg.clone()),
        }
    }
}

struct Inner<T> {
    /// 0 = unlimited
    max_values: usize,
    backlog: VecDeque<T>,
    terminal: Option<Terminal>,
    subscribers: Vec<mpsc::UnboundedSender<Signal<T>>>,
}

/// Broadcast channel that replays its history to late subscribers
pub struct Replay<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Replay<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Replay<T> {
    /// Create a replay buffer keeping the last `max_values` values
    /// (0 keeps everything)
    pub fn new(max_values: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                max_values,
                backlog: VecDeque::new(),
                terminal: None,
                subscribers: Vec::new(),
            })),
        }
    }

    /// Publish a value. Returns `false` once the stream has terminated.
    pub fn send(&self, value: T) -> bool {
        let mut inner = self.inner.lock();
        if inner.terminal.is_some() {
            return false;
        }

        inner
            .subscribers
            .retain(|tx| tx.send(Signal::Value(value.clone())).is_ok());

        inner.backlog.push_back(value);
        if inner.max_values > 0 {
            while inner.backlog.len() > inner.max_values {
                inner.backlog.pop_front();
            }
        }
        true
    }

    /// Terminate successfully. Only the first terminal signal is recorded;
    /// later calls return `false` and deliver nothing.
    pub fn complete(&self) -> bool {
        self.terminate(Terminal::Completed)
    }

    /// Terminate with an error message
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.terminate(Terminal::Failed(message.into()))
    }

    fn terminate(&self, terminal: Terminal) -> bool {
        let mut inner = self.inner.lock();
        if inner.terminal.is_some() {
            return false;
        }

        for tx in inner.subscribers.drain(..) {
            let _ = tx.send(terminal.signal());
        }
        inner.terminal = Some(terminal);
        true
    }

    /// Attach a new subscriber
    pub fn subscribe(&self) -> ReplayReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        for value in inner.backlog.iter() {
            let _ = tx.send(Signal::Value(value.clone()));
        }

        match &inner.terminal {
            Some(terminal) => {
                let _ = tx.send(terminal.signal());
            }
            None => inner.subscribers.push(tx),
        }

        ReplayReceiver { rx }
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.lock().terminal.is_some()
    }

    /// Values currently held for replay
    pub fn backlog(&self) -> Vec<T> {
        self.inner.lock().backlog.iter().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|tx| !tx.is_closed());
        inner.subscribers.len()
    }
}

/// Receiving half handed out by [`Replay::subscribe`]
pub struct ReplayReceiver<T> {
    rx: mpsc::UnboundedReceiver<Signal<T>>,
}

impl<T> ReplayReceiver<T> {
    /// Next signal; `None` after the terminal signal has been delivered
    pub async fn recv(&mut self) -> Option<Signal<T>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Signal<T>> {
        self.rx.try_recv().ok()
    }

    /// Collect values until the stream terminates
    pub async fn collect_values(mut self) -> (Vec<T>, Option<Signal<T>>) {
        let mut values = Vec::new();
        while let Some(signal) = self.rx.recv().await {
            match signal {
                Signal::Value(v) => values.push(v),
                terminal => return (values, Some(terminal)),
            }
        }
        (values, None)
    }
}
