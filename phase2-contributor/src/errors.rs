use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContributeError {
    #[error("Not logged in. Run the login subcommand first")]
    MissingTokenError,
    #[error(
        "Your GitHub account does not meet the reputation thresholds: at least {repos} public \
         repositories, {followers} followers and {following} followed accounts are required"
    )]
    ReputationTooLowError {
        repos: u64,
        followers: u64,
        following: u64,
    },
    #[error("You cannot participate in ceremony {0}")]
    CannotParticipateError(String),
    #[error("Document {0}/{1} has no data")]
    MissingDocumentDataError(String, String),
    #[error("Circuit at sequence position {0} is missing from the ceremony")]
    MissingCircuitError(u64),
    #[error("No contribution record for circuit # {0}")]
    MissingContributionError(u64),
    #[error("Expected exactly one active timeout, found {0}")]
    UnexpectedTimeoutCountError(usize),
    #[error("zkey computation failed: {0}")]
    ComputeError(String),
    #[error("Scratch zkey {0} is missing, cannot resume from this step")]
    MissingScratchFileError(String),
    #[error("Object storage did not return an ETag for part {0}")]
    MissingEtagError(u32),
    #[error("Object storage returned {0} presigned urls for {1} parts")]
    PresignedUrlCountError(usize, usize),
    #[error("The participant subscription closed unexpectedly")]
    SubscriptionClosedError,
}
