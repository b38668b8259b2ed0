//! Structured log events.
//!
//! Every significant adapter transition is reported as a [`LogEvent`]: a stable
//! numeric id, a severity, and a formatted message. Events go to an
//! [`EventSink`]; the default sink forwards them to `tracing`.

use std::fmt;

use parking_lot::Mutex;

/// Severity of a [`LogEvent`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Message catalog ids.
///
/// The numeric values are part of the logging contract and must not be
/// renumbered.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventId {
    /// A mailbox command issued with the poll mode did not finish in time.
    MboxPollTimeout = 310,
    /// A NOWAIT mailbox command hit its timeout.
    MboxTimeout = 311,
    /// A mailbox attention arrived with no command active.
    StrayMboxInterrupt = 304,
    /// The device echoed a mailbox opcode the driver does not know.
    UnknownMboxCommand = 323,
    /// A queued mailbox command was failed by a flush.
    MboxFlushed = 318,
    /// A command ring had no free slot.
    RingFull = 312,
    /// A previously full or gated ring was drained again.
    RingResumed = 313,
    /// The device reported an index outside the ring.
    RingIndexInvalid = 315,
    /// A response referenced an iotag that is not in flight.
    UnmatchedCompletion = 322,
    /// A response carried an opcode the driver does not classify.
    UnknownIocb = 321,
    /// An unsolicited frame had no handler.
    UnhandledUnsolicited = 320,
    /// An abort request was sent to the device.
    AbortIssued = 327,
    /// An abort was escalated to a local completion.
    AbortEscalated = 328,
    /// An abort acknowledgement matched nothing.
    AbortAckDiscarded = 329,
    /// The adapter raised error attention.
    ErrorAttention = 457,
    /// Link attention was handled.
    LinkAttention = 1300,
    /// A target reported queue full and the command was retried.
    QueueFullRetry = 710,
    /// Queue full retries were exhausted.
    QueueFullExhausted = 711,
    /// A throttled LUN had its queue depth restored.
    QueueDepthRestored = 712,
}

impl EventId {
    pub fn number(self) -> u32 {
        self as u32
    }
}

/// A single structured log event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEvent {
    pub id: EventId,
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}: {}", self.id.number(), self.message)
    }
}

/// Receives structured events.
pub trait EventSink: Send + Sync {
    fn log(&self, event: &LogEvent);
}

/// Forwards events to `tracing` at the matching level.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn log(&self, event: &LogEvent) {
        let id = event.id.number();
        match event.severity {
            Severity::Info => tracing::info!(id, "{}", event.message),
            Severity::Warning => tracing::warn!(id, "{}", event.message),
            Severity::Error => tracing::error!(id, "{}", event.message),
        }
    }
}

/// Keeps every event it receives, and forwards to `tracing` as well.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<LogEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events with the given id.
    pub fn count(&self, id: EventId) -> usize {
        self.events.lock().iter().filter(|e| e.id == id).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingSink {
    fn log(&self, event: &LogEvent) {
        TracingSink.log(event);
        self.events.lock().push(event.clone());
    }
}

/// Formats and emits a [`LogEvent`] to the sink of an adapter.
///
/// ```ignore
/// log_event!(hba.events(), EventId::RingFull, Warning, "ring {} full", ringno);
/// ```
#[macro_export]
macro_rules! log_event {
    ($sink:expr, $id:expr, $severity:ident, $($arg:tt)+) => {
        $sink.log(&$crate::event::LogEvent {
            id: $id,
            severity: $crate::event::Severity::$severity,
            message: format!($($arg)+),
        })
    };
}
