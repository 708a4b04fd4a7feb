//! Explicit state machine for one watched table's sync lifecycle.
//!
//! `rust_fsm::state_machine!` only expresses a flat transition table, but
//! the lifecycle this drives is hierarchical (`Active` has sub-phases,
//! `PassiveSync`/`LiveSync` each have their own). Flatten the hierarchy into
//! one enum, naming nested states with their parent as a prefix
//! (`PassiveSyncDlRunning`, `LiveSyncUlFiber`, ...), then recover the parent
//! groupings with `is_*` helper methods the way `auth_fsm::AuthState` groups
//! its own flat states with `is_transient()`.

use rust_fsm::state_machine;

state_machine! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub table_machine(Inactive)

    Inactive => {
        Start => ActiveInit
    },
    ActiveInit => {
        DataReady => PassiveSyncDlRunning,
        SyncReady => LiveSyncLsActive,
        DelTable => ActiveDelTable,
        NetError => NetworkError,
        ErrorEvent => Error,
        Stop => Inactive
    },
    ActiveDelTable => {
        DelTableDone => Inactive,
        ErrorEvent => Error,
        Stop => Inactive
    },
    PassiveSyncDlRunning => {
        DlReady => PassiveSyncProcRunning,
        NetError => NetworkError,
        ErrorEvent => Error,
        ForceSync => ActiveInit,
        Stop => Inactive
    },
    PassiveSyncProcRunning => {
        ProcReady => PassiveSyncUploading,
        ProcContinue => PassiveSyncDlRunning,
        ErrorEvent => Error,
        ForceSync => ActiveInit,
        Stop => Inactive
    },
    PassiveSyncUploading => {
        UlContinue => PassiveSyncUploading,
        TriggerUpload => PassiveSyncUploading,
        SyncReady => LiveSyncLsActive,
        NetError => NetworkError,
        ErrorEvent => Error,
        ForceSync => ActiveInit,
        Stop => Inactive
    },
    LiveSyncLsActive => {
        DataReady => LiveSyncUlFiber,
        TriggerUpload => LiveSyncUlFiber,
        TriggerSync => PassiveSyncDlRunning,
        SyncReady => Synchronized,
        GoOffline => Offline,
        NetError => NetworkError,
        ErrorEvent => Error,
        ForceSync => ActiveInit,
        Stop => Inactive
    },
    LiveSyncUlFiber => {
        UlContinue => LiveSyncUlFiber,
        SyncReady => LiveSyncLsActive,
        NetError => NetworkError,
        ErrorEvent => Error,
        ForceSync => ActiveInit,
        Stop => Inactive
    },
    Synchronized => {
        TriggerSync => PassiveSyncDlRunning,
        TriggerUpload => LiveSyncUlFiber,
        DataReady => LiveSyncUlFiber,
        GoOffline => Offline,
        ForceSync => ActiveInit,
        ErrorEvent => Error,
        Stop => Inactive
    },
    Offline => {
        GoOnline => ActiveInit,
        Stop => Inactive
    },
    NetworkError => {
        TriggerSync => ActiveInit,
        GoOffline => Offline,
        ForceSync => ActiveInit,
        Stop => Inactive
    },
    Error => {
        Stop => Inactive
    }
}

pub use table_machine::Input as TableInput;
pub use table_machine::State as TableMachineState;
pub use table_machine::StateMachine as TableMachine;

/// Simplified view of the flat machine state, grouping nested phases back
/// under the parent category spec'd for this table's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    Inactive,
    ActiveInit,
    ActiveDelTable,
    PassiveSyncDlRunning,
    PassiveSyncProcRunning,
    PassiveSyncUploading,
    LiveSyncLsActive,
    LiveSyncUlFiber,
    Synchronized,
    Offline,
    NetworkError,
    Error,
}

impl From<&TableMachineState> for TableState {
    fn from(state: &TableMachineState) -> Self {
        match state {
            TableMachineState::Inactive => TableState::Inactive,
            TableMachineState::ActiveInit => TableState::ActiveInit,
            TableMachineState::ActiveDelTable => TableState::ActiveDelTable,
            TableMachineState::PassiveSyncDlRunning => TableState::PassiveSyncDlRunning,
            TableMachineState::PassiveSyncProcRunning => TableState::PassiveSyncProcRunning,
            TableMachineState::PassiveSyncUploading => TableState::PassiveSyncUploading,
            TableMachineState::LiveSyncLsActive => TableState::LiveSyncLsActive,
            TableMachineState::LiveSyncUlFiber => TableState::LiveSyncUlFiber,
            TableMachineState::Synchronized => TableState::Synchronized,
            TableMachineState::Offline => TableState::Offline,
            TableMachineState::NetworkError => TableState::NetworkError,
            TableMachineState::Error => TableState::Error,
        }
    }
}

impl TableState {
    pub fn is_active(&self) -> bool {
        !matches!(self, TableState::Inactive | TableState::Offline | TableState::Error)
    }

    pub fn is_passive_sync(&self) -> bool {
        matches!(
            self,
            TableState::PassiveSyncDlRunning | TableState::PassiveSyncProcRunning | TableState::PassiveSyncUploading
        )
    }

    pub fn is_downloading(&self) -> bool {
        matches!(self, TableState::PassiveSyncDlRunning | TableState::PassiveSyncProcRunning)
    }

    pub fn is_live_sync(&self) -> bool {
        matches!(self, TableState::LiveSyncLsActive | TableState::LiveSyncUlFiber)
    }

    /// Mid-operation states where a `forceSync` cancellation actually
    /// interrupts in-flight work, as opposed to idle states where it's just
    /// a fast-path restart.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TableState::ActiveInit
                | TableState::ActiveDelTable
                | TableState::PassiveSyncDlRunning
                | TableState::PassiveSyncProcRunning
                | TableState::PassiveSyncUploading
                | TableState::LiveSyncUlFiber
        )
    }

    /// Terminal for this table until the embedding engine calls `start`
    /// again.
    pub fn is_terminal_error(&self) -> bool {
        matches!(self, TableState::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_inactive() {
        let machine = TableMachine::new();
        assert_eq!(*machine.state(), TableMachineState::Inactive);
    }

    #[test]
    fn start_enters_active_init() {
        let mut machine = TableMachine::new();
        machine.consume(&TableInput::Start).unwrap();
        assert_eq!(*machine.state(), TableMachineState::ActiveInit);
    }

    #[test]
    fn catch_up_then_drain_then_live_sync() {
        let mut machine = TableMachine::new();
        machine.consume(&TableInput::Start).unwrap();
        machine.consume(&TableInput::DataReady).unwrap();
        assert_eq!(*machine.state(), TableMachineState::PassiveSyncDlRunning);

        machine.consume(&TableInput::DlReady).unwrap();
        assert_eq!(*machine.state(), TableMachineState::PassiveSyncProcRunning);

        machine.consume(&TableInput::ProcContinue).unwrap();
        assert_eq!(*machine.state(), TableMachineState::PassiveSyncDlRunning);

        machine.consume(&TableInput::DlReady).unwrap();
        machine.consume(&TableInput::ProcReady).unwrap();
        assert_eq!(*machine.state(), TableMachineState::PassiveSyncUploading);

        machine.consume(&TableInput::SyncReady).unwrap();
        assert_eq!(*machine.state(), TableMachineState::LiveSyncLsActive);
    }

    #[test]
    fn force_sync_cancels_back_to_init_from_any_transient_state() {
        let mut machine = TableMachine::new();
        machine.consume(&TableInput::Start).unwrap();
        machine.consume(&TableInput::DataReady).unwrap();
        machine.consume(&TableInput::DlReady).unwrap();
        assert_eq!(*machine.state(), TableMachineState::PassiveSyncProcRunning);

        machine.consume(&TableInput::ForceSync).unwrap();
        assert_eq!(*machine.state(), TableMachineState::ActiveInit);
    }

    #[test]
    fn stop_always_returns_to_inactive() {
        let mut machine = TableMachine::new();
        machine.consume(&TableInput::Start).unwrap();
        machine.consume(&TableInput::DataReady).unwrap();
        machine.consume(&TableInput::Stop).unwrap();
        assert_eq!(*machine.state(), TableMachineState::Inactive);
    }

    #[test]
    fn error_is_terminal_until_stop() {
        let mut machine = TableMachine::new();
        machine.consume(&TableInput::Start).unwrap();
        machine.consume(&TableInput::ErrorEvent).unwrap();
        assert_eq!(*machine.state(), TableMachineState::Error);
        assert!(machine.consume(&TableInput::DataReady).is_err());
        machine.consume(&TableInput::Stop).unwrap();
        assert_eq!(*machine.state(), TableMachineState::Inactive);
    }

    #[test]
    fn grouping_helpers_classify_nested_states() {
        assert!(TableState::PassiveSyncDlRunning.is_passive_sync());
        assert!(TableState::PassiveSyncDlRunning.is_downloading());
        assert!(!TableState::PassiveSyncUploading.is_downloading());
        assert!(TableState::LiveSyncUlFiber.is_live_sync());
        assert!(!TableState::Synchronized.is_transient());
        assert!(TableState::Error.is_terminal_error());
    }
}
