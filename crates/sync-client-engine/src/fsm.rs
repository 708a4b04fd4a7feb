//! The engine's own lifecycle, already flat (unlike the per-table machine),
//! so this is a direct `rust_fsm::state_machine!` with no wrapper enum —
//! the same declarative shape `ymir::auth_fsm` uses for `AuthMachine`.

use rust_fsm::state_machine;

state_machine! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub engine_machine(Inactive)

    Inactive => {
        SignIn => SigningIn
    },
    SigningIn => {
        SignInSuccess => TableSync,
        SignInFailed => Error
    },
    TableSync => {
        Stop => Stopping,
        DeleteAccount => DeletingAcc,
        Fault => Error
    },
    Stopping => {
        StopComplete => Inactive
    },
    DeletingAcc => {
        DeleteComplete => Inactive,
        DeleteFailed => Error
    },
    Error => {
        Stop => Inactive
    }
}

pub use engine_machine::Input as EngineInput;
pub use engine_machine::State as EngineState;
pub use engine_machine::StateMachine as EngineMachine;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_inactive() {
        let machine = EngineMachine::new();
        assert_eq!(*machine.state(), EngineState::Inactive);
    }

    #[test]
    fn happy_path_sign_in_then_stop() {
        let mut machine = EngineMachine::new();
        machine.consume(&EngineInput::SignIn).unwrap();
        assert_eq!(*machine.state(), EngineState::SigningIn);

        machine.consume(&EngineInput::SignInSuccess).unwrap();
        assert_eq!(*machine.state(), EngineState::TableSync);

        machine.consume(&EngineInput::Stop).unwrap();
        assert_eq!(*machine.state(), EngineState::Stopping);

        machine.consume(&EngineInput::StopComplete).unwrap();
        assert_eq!(*machine.state(), EngineState::Inactive);
    }

    #[test]
    fn delete_account_path() {
        let mut machine = EngineMachine::new();
        machine.consume(&EngineInput::SignIn).unwrap();
        machine.consume(&EngineInput::SignInSuccess).unwrap();
        machine.consume(&EngineInput::DeleteAccount).unwrap();
        assert_eq!(*machine.state(), EngineState::DeletingAcc);
        machine.consume(&EngineInput::DeleteComplete).unwrap();
        assert_eq!(*machine.state(), EngineState::Inactive);
    }

    #[test]
    fn sign_in_failure_enters_error_and_stop_recovers() {
        let mut machine = EngineMachine::new();
        machine.consume(&EngineInput::SignIn).unwrap();
        machine.consume(&EngineInput::SignInFailed).unwrap();
        assert_eq!(*machine.state(), EngineState::Error);
        assert!(machine.consume(&EngineInput::SignInSuccess).is_err());
        machine.consume(&EngineInput::Stop).unwrap();
        assert_eq!(*machine.state(), EngineState::Inactive);
    }

    #[test]
    fn fault_from_table_sync_enters_error() {
        let mut machine = EngineMachine::new();
        machine.consume(&EngineInput::SignIn).unwrap();
        machine.consume(&EngineInput::SignInSuccess).unwrap();
        machine.consume(&EngineInput::Fault).unwrap();
        assert_eq!(*machine.state(), EngineState::Error);
    }
}
