use std::pin::Pin;
use std::task::{Context, Poll};

use futures_channel::oneshot;
use gatt::{
    BluetoothUuid, CharacteristicDescriptor, CharacteristicId, ServiceDescriptor, WriteType,
};

use crate::error::{Error, ErrorKind, Result};

/// A request against one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Disconnect,
    DiscoverServices,
    DiscoverCharacteristics(BluetoothUuid),
    Read(CharacteristicId),
    Write {
        characteristic: CharacteristicId,
        value: Vec<u8>,
        write_type: WriteType,
    },
    SetNotify {
        characteristic: CharacteristicId,
        enabled: bool,
    },
    ReadRssi,
}

impl Operation {
    /// The characteristic this operation targets, if any.
    pub fn characteristic(&self) -> Option<&CharacteristicId> {
        match self {
            Operation::Read(characteristic)
            | Operation::Write { characteristic, .. }
            | Operation::SetNotify { characteristic, .. } => Some(characteristic),
            _ => None,
        }
    }

    /// The error kind used when the transport rejects this operation.
    pub(crate) fn failure_kind(&self) -> ErrorKind {
        match self {
            Operation::Connect => ErrorKind::Connect,
            Operation::DiscoverServices | Operation::DiscoverCharacteristics(_) => {
                ErrorKind::Discovery
            }
            _ => ErrorKind::Operation,
        }
    }
}

/// The successful result of an [`Operation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutput {
    Connected,
    Disconnected,
    Services(Vec<ServiceDescriptor>),
    Characteristics(Vec<CharacteristicDescriptor>),
    Value(Vec<u8>),
    Written,
    /// The notification state after a `SetNotify`.
    Notifying(bool),
    Rssi(i16),
}

/// A future that resolves once the operation it was returned for completes.
///
/// Every operation resolves exactly once, with its output, its failure, or a cancellation
/// marker. Dropping a `Completion` does not cancel the operation.
#[derive(Debug)]
#[must_use = "the operation still runs, but its result is lost"]
pub struct Completion {
    seq: u64,
    receiver: oneshot::Receiver<Result<OperationOutput>>,
}

impl Completion {
    /// The sequence number the operation was assigned on submission.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Future for Completion {
    type Output = Result<OperationOutput>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|res| res.map_err(Error::from).and_then(|res| res))
    }
}

/// The sending half of a [`Completion`].
#[derive(Debug)]
pub(crate) struct Responder {
    sender: oneshot::Sender<Result<OperationOutput>>,
}

impl Responder {
    pub fn resolve(self, result: Result<OperationOutput>) {
        let _ = self.sender.send(result);
    }
}

/// An operation owned by a session's queue.
#[derive(Debug)]
pub(crate) struct PendingOperation {
    pub seq: u64,
    pub operation: Operation,
    pub responder: Option<Responder>,
    /// Lifecycle operations drive connection and discovery and may run before the session is
    /// ready.
    pub lifecycle: bool,
}

impl PendingOperation {
    /// Creates an operation with a caller-visible completion.
    pub fn new(seq: u64, operation: Operation, lifecycle: bool) -> (Self, Completion) {
        let (sender, receiver) = oneshot::channel();
        let pending = PendingOperation {
            seq,
            operation,
            responder: Some(Responder { sender }),
            lifecycle,
        };
        (pending, Completion { seq, receiver })
    }

    /// Creates an operation issued by the session itself, with nobody waiting on it.
    pub fn internal(seq: u64, operation: Operation, lifecycle: bool) -> Self {
        PendingOperation {
            seq,
            operation,
            responder: None,
            lifecycle,
        }
    }

    pub fn resolve(self, result: Result<OperationOutput>) {
        if let Some(responder) = self.responder {
            responder.resolve(result);
        }
    }

    pub fn fail(self, kind: ErrorKind) {
        self.resolve(Err(kind.into()));
    }
}
