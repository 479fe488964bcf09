//! The DirectStore synchronization state machine.
//!
//! Transitions are a pure function from `(state, event)` to the next state
//! and the effects the worker must carry out. Nothing here performs I/O.

use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum StoreState {
    /// Nothing in flight.
    #[default]
    Idle,
    /// A send to the driver is in flight.
    AwaitingResponse,
    /// A send is in flight and the model changed again since it started.
    AwaitingResponseDirty,
    /// The driver rejected a send; waiting for its authoritative model.
    AwaitingDriverModel,
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreState::Idle => "Idle",
            StoreState::AwaitingResponse => "AwaitingResponse",
            StoreState::AwaitingResponseDirty => "AwaitingResponseDirty",
            StoreState::AwaitingDriverModel => "AwaitingDriverModel",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    /// A proxy change was applied to the local model.
    LocalChange,
    /// The driver accepted the in-flight send.
    SendAcknowledged,
    /// The driver rejected the in-flight send.
    SendRejected,
    /// A model pushed by the driver was merged. `driver_side_changes` is set
    /// when the driver is now behind the local model.
    DriverModelMerged { driver_side_changes: bool },
    /// A model pushed by the driver could not be merged with the local one.
    DriverModelDiverged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEffect {
    /// Send the current model to the driver at the next version.
    SendToDriver,
    /// Merge driver models buffered while a send was in flight.
    ApplyPendingDriverModels,
}

/// Compute the next state and the effects to run.
///
/// Pairs with no defined transition leave the state as it is.
pub fn transition(state: StoreState, event: StoreEvent) -> (StoreState, Vec<StoreEffect>) {
    use StoreEffect::*;
    use StoreEvent::*;
    use StoreState::*;

    match (state, event) {
        (Idle, LocalChange) => (AwaitingResponse, vec![SendToDriver]),
        (Idle, DriverModelMerged { driver_side_changes: true }) => {
            (AwaitingResponse, vec![SendToDriver])
        }
        (Idle, DriverModelMerged { driver_side_changes: false }) => (Idle, vec![]),

        (AwaitingResponse, LocalChange) => (AwaitingResponseDirty, vec![]),
        (AwaitingResponse, SendAcknowledged) => (Idle, vec![ApplyPendingDriverModels]),
        (AwaitingResponse | AwaitingResponseDirty, SendRejected) => {
            (AwaitingDriverModel, vec![ApplyPendingDriverModels])
        }

        (AwaitingResponseDirty, LocalChange) => (AwaitingResponseDirty, vec![]),
        (AwaitingResponseDirty, SendAcknowledged) => (AwaitingResponse, vec![SendToDriver]),

        (AwaitingDriverModel, LocalChange) => (AwaitingDriverModel, vec![]),
        (AwaitingDriverModel, DriverModelMerged { driver_side_changes: true }) => {
            (AwaitingResponse, vec![SendToDriver])
        }
        (AwaitingDriverModel, DriverModelMerged { driver_side_changes: false }) => (Idle, vec![]),
        (Idle | AwaitingDriverModel, DriverModelDiverged) => (Idle, vec![]),

        (state, _) => (state, vec![]),
    }
}

impl StoreState {
    /// Whether a driver-pushed model can be merged now rather than buffered.
    pub fn accepts_driver_models(&self) -> bool {
        matches!(self, StoreState::Idle | StoreState::AwaitingDriverModel)
    }
}
