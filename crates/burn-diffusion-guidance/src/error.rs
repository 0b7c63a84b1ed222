use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuidanceError {
    #[error("conditioning schedule is empty")]
    EmptySchedule,

    #[error("step {step} is outside the conditioning schedule ({len} steps)")]
    StepOutOfRange { step: usize, len: usize },
}
