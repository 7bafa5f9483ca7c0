//! Step machine definitions, one fixed table per operation type.
//!
//! Each table lists the steps in execution order (the first is the initial
//! step), the forward edges, the steps allowed to poll (self-loop), and the
//! degrade edges taken when an optional sub-operation fails. The Runner never
//! moves an action along an edge that is not in its table.

use crate::error::{EngineError, Result};

use super::action::{OperationType, Step, StepData};
use super::executor::StepOutcome;

/// Where a finished step leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Step(Step),
    Complete,
}

/// A step outcome mapped onto the machine: the transition the Runner applies.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Advance { next: Step, data: StepData },
    Stay { detail: String },
    Complete { data: StepData },
    Degrade {
        next: Step,
        reason: String,
        data: StepData,
    },
    Fail { message: String },
    Retry { message: String },
}

#[derive(Debug)]
pub struct Machine {
    pub operation: OperationType,
    steps: &'static [Step],
    edges: &'static [(Step, Next)],
    polls: &'static [Step],
    degrade: &'static [(Step, Step)],
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

static START: Machine = Machine {
    operation: OperationType::Start,
    steps: &[Step::CallStart, Step::WaitRunning],
    edges: &[
        (Step::CallStart, Next::Step(Step::WaitRunning)),
        (Step::WaitRunning, Next::Complete),
    ],
    polls: &[Step::WaitRunning],
    degrade: &[],
};

static STOP: Machine = Machine {
    operation: OperationType::Stop,
    steps: &[Step::CallStop],
    edges: &[(Step::CallStop, Next::Complete)],
    polls: &[],
    degrade: &[],
};

static RESTART: Machine = Machine {
    operation: OperationType::Restart,
    steps: &[
        Step::CallStop,
        Step::WaitStopped,
        Step::CallStart,
        Step::WaitRunning,
    ],
    edges: &[
        (Step::CallStop, Next::Step(Step::WaitStopped)),
        (Step::WaitStopped, Next::Step(Step::CallStart)),
        (Step::CallStart, Next::Step(Step::WaitRunning)),
        (Step::WaitRunning, Next::Complete),
    ],
    polls: &[Step::WaitStopped, Step::WaitRunning],
    degrade: &[],
};

static DEPLOY: Machine = Machine {
    operation: OperationType::Deploy,
    steps: &[
        Step::CreatePackage,
        Step::WaitPackageBuild,
        Step::TransportPackage,
        Step::StopEnvironment,
        Step::WaitEnvironmentStopped,
        Step::CreateBackup,
        Step::WaitBackupComplete,
        Step::StartEnvironment,
        Step::WaitEnvironmentRunning,
    ],
    edges: &[
        (Step::CreatePackage, Next::Step(Step::WaitPackageBuild)),
        (Step::WaitPackageBuild, Next::Step(Step::TransportPackage)),
        (Step::TransportPackage, Next::Step(Step::StopEnvironment)),
        (Step::StopEnvironment, Next::Step(Step::WaitEnvironmentStopped)),
        (Step::WaitEnvironmentStopped, Next::Step(Step::CreateBackup)),
        (Step::CreateBackup, Next::Step(Step::WaitBackupComplete)),
        (Step::WaitBackupComplete, Next::Step(Step::StartEnvironment)),
        (Step::StartEnvironment, Next::Step(Step::WaitEnvironmentRunning)),
        (Step::WaitEnvironmentRunning, Next::Complete),
    ],
    polls: &[
        Step::WaitPackageBuild,
        Step::WaitEnvironmentStopped,
        Step::WaitBackupComplete,
        Step::WaitEnvironmentRunning,
    ],
    // A failed backup must not block an otherwise healthy deployment.
    degrade: &[
        (Step::CreateBackup, Step::StartEnvironment),
        (Step::WaitBackupComplete, Step::StartEnvironment),
    ],
};

static TRANSPORT: Machine = Machine {
    operation: OperationType::Transport,
    steps: &[Step::RetrieveSourcePackage, Step::TransportPackage],
    edges: &[
        (Step::RetrieveSourcePackage, Next::Step(Step::TransportPackage)),
        (Step::TransportPackage, Next::Complete),
    ],
    polls: &[],
    degrade: &[],
};

impl OperationType {
    pub fn machine(self) -> &'static Machine {
        match self {
            Self::Start => &START,
            Self::Stop => &STOP,
            Self::Restart => &RESTART,
            Self::Deploy => &DEPLOY,
            Self::Transport => &TRANSPORT,
        }
    }
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

impl Machine {
    /// The step a fresh action starts on.
    pub fn initial(&self) -> Step {
        // Every table is non-empty.
        self.steps.first().copied().unwrap_or(Step::CallStart)
    }

    pub fn steps(&self) -> &'static [Step] {
        self.steps
    }

    pub fn contains(&self, step: Step) -> bool {
        self.steps.contains(&step)
    }

    pub fn next(&self, step: Step) -> Option<Next> {
        self.edges
            .iter()
            .find(|(from, _)| *from == step)
            .map(|(_, to)| *to)
    }

    pub fn is_poll(&self, step: Step) -> bool {
        self.polls.contains(&step)
    }

    pub fn degrade_target(&self, step: Step) -> Option<Step> {
        self.degrade
            .iter()
            .find(|(from, _)| *from == step)
            .map(|(_, to)| *to)
    }

    /// The step to execute for an action positioned at `current`.
    pub fn resume_at(&self, current: Option<Step>) -> Result<Step> {
        match current {
            None => Ok(self.initial()),
            Some(step) if self.contains(step) => Ok(step),
            Some(step) => Err(self.invalid(step, "resume")),
        }
    }

    /// Map an executor outcome for `step` onto this machine.
    pub fn resolve(&self, step: Step, outcome: StepOutcome) -> Result<Resolution> {
        if !self.contains(step) {
            return Err(self.invalid(step, "execute"));
        }
        match outcome {
            StepOutcome::Done(data) => match self.next(step) {
                Some(Next::Step(next)) => Ok(Resolution::Advance { next, data }),
                Some(Next::Complete) => Ok(Resolution::Complete { data }),
                None => Err(self.invalid(step, "advance")),
            },
            StepOutcome::Poll(detail) => {
                if self.is_poll(step) {
                    Ok(Resolution::Stay { detail })
                } else {
                    Err(self.invalid(step, step.as_str()))
                }
            }
            StepOutcome::Degraded { reason, data } => match self.degrade_target(step) {
                Some(next) => Ok(Resolution::Degrade { next, reason, data }),
                // A step without a fallback edge cannot degrade; its failure
                // is a real failure.
                None => Ok(Resolution::Fail { message: reason }),
            },
            StepOutcome::Fatal(message) => Ok(Resolution::Fail { message }),
            StepOutcome::Retryable(message) => Ok(Resolution::Retry { message }),
        }
    }

    fn invalid(&self, from: Step, to: &str) -> EngineError {
        EngineError::InvalidTransition {
            operation: self.operation.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Follow forward edges from the initial step to completion.
    fn happy_path(op: OperationType) -> Vec<Step> {
        let m = op.machine();
        let mut path = vec![m.initial()];
        loop {
            let last = *path.last().unwrap();
            match m.next(last).unwrap() {
                Next::Step(s) => {
                    assert!(!path.contains(&s), "{op}: cycle at {s}");
                    path.push(s);
                }
                Next::Complete => break,
            }
        }
        path
    }

    #[test]
    fn start_sequence() {
        assert_eq!(
            happy_path(OperationType::Start),
            vec![Step::CallStart, Step::WaitRunning]
        );
    }

    #[test]
    fn stop_sequence() {
        assert_eq!(happy_path(OperationType::Stop), vec![Step::CallStop]);
    }

    #[test]
    fn restart_sequence() {
        assert_eq!(
            happy_path(OperationType::Restart),
            vec![
                Step::CallStop,
                Step::WaitStopped,
                Step::CallStart,
                Step::WaitRunning
            ]
        );
    }

    #[test]
    fn deploy_sequence() {
        assert_eq!(
            happy_path(OperationType::Deploy),
            vec![
                Step::CreatePackage,
                Step::WaitPackageBuild,
                Step::TransportPackage,
                Step::StopEnvironment,
                Step::WaitEnvironmentStopped,
                Step::CreateBackup,
                Step::WaitBackupComplete,
                Step::StartEnvironment,
                Step::WaitEnvironmentRunning,
            ]
        );
    }

    #[test]
    fn transport_sequence() {
        assert_eq!(
            happy_path(OperationType::Transport),
            vec![Step::RetrieveSourcePackage, Step::TransportPackage]
        );
    }

    #[test]
    fn every_table_is_internally_consistent() {
        for op in OperationType::ALL {
            let m = op.machine();
            assert_eq!(m.operation, op);
            // The happy path visits every declared step exactly once.
            assert_eq!(happy_path(op), m.steps().to_vec(), "{op}");
            for step in m.steps() {
                assert!(m.next(*step).is_some(), "{op}: {step} has no edge");
            }
            for poll in m.polls {
                assert!(m.contains(*poll), "{op}: poll step {poll} not in table");
            }
            for (from, to) in m.degrade {
                assert!(m.contains(*from) && m.contains(*to), "{op}: bad degrade edge");
            }
        }
    }

    #[test]
    fn only_deploy_backup_steps_degrade() {
        let deploy = OperationType::Deploy.machine();
        assert_eq!(
            deploy.degrade_target(Step::CreateBackup),
            Some(Step::StartEnvironment)
        );
        assert_eq!(
            deploy.degrade_target(Step::WaitBackupComplete),
            Some(Step::StartEnvironment)
        );
        assert_eq!(deploy.degrade_target(Step::CreatePackage), None);
        for op in [
            OperationType::Start,
            OperationType::Stop,
            OperationType::Restart,
            OperationType::Transport,
        ] {
            for step in op.machine().steps() {
                assert_eq!(op.machine().degrade_target(*step), None);
            }
        }
    }

    #[test]
    fn same_step_name_leads_differently_per_operation() {
        assert_eq!(
            OperationType::Stop.machine().next(Step::CallStop),
            Some(Next::Complete)
        );
        assert_eq!(
            OperationType::Restart.machine().next(Step::CallStop),
            Some(Next::Step(Step::WaitStopped))
        );
        assert_eq!(
            OperationType::Deploy.machine().next(Step::TransportPackage),
            Some(Next::Step(Step::StopEnvironment))
        );
        assert_eq!(
            OperationType::Transport.machine().next(Step::TransportPackage),
            Some(Next::Complete)
        );
    }

    #[test]
    fn resume_defaults_to_initial_and_rejects_foreign_steps() {
        let m = OperationType::Restart.machine();
        assert_eq!(m.resume_at(None).unwrap(), Step::CallStop);
        assert_eq!(
            m.resume_at(Some(Step::WaitRunning)).unwrap(),
            Step::WaitRunning
        );
        assert!(matches!(
            m.resume_at(Some(Step::CreateBackup)),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn resolve_poll_only_on_poll_steps() {
        let m = OperationType::Start.machine();
        assert_eq!(
            m.resolve(Step::WaitRunning, StepOutcome::Poll("starting".into()))
                .unwrap(),
            Resolution::Stay {
                detail: "starting".into()
            }
        );
        assert!(m
            .resolve(Step::CallStart, StepOutcome::Poll("?".into()))
            .is_err());
    }

    #[test]
    fn resolve_done_on_last_step_completes() {
        let m = OperationType::Start.machine();
        assert_eq!(
            m.resolve(Step::WaitRunning, StepOutcome::Done(StepData::new()))
                .unwrap(),
            Resolution::Complete {
                data: StepData::new()
            }
        );
    }

    #[test]
    fn resolve_degrade_without_edge_fails() {
        let m = OperationType::Start.machine();
        assert_eq!(
            m.resolve(
                Step::CallStart,
                StepOutcome::Degraded {
                    reason: "x".into(),
                    data: StepData::new()
                }
            )
            .unwrap(),
            Resolution::Fail {
                message: "x".into()
            }
        );
        let deploy = OperationType::Deploy.machine();
        assert_eq!(
            deploy
                .resolve(
                    Step::CreateBackup,
                    StepOutcome::Degraded {
                        reason: "quota".into(),
                        data: StepData::new()
                    }
                )
                .unwrap(),
            Resolution::Degrade {
                next: Step::StartEnvironment,
                reason: "quota".into(),
                data: StepData::new()
            }
        );
    }

    #[test]
    fn resolve_rejects_step_outside_machine() {
        let m = OperationType::Stop.machine();
        assert!(m
            .resolve(Step::WaitRunning, StepOutcome::Done(StepData::new()))
            .is_err());
    }
}
