// src/error.rs

use crate::genome::TournamentId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunerError {
    #[error("Tournament {0} is not finished yet")]
    TournamentNotFinished(TournamentId),

    #[error("Generation {0} is not finished yet")]
    GenerationNotFinished(u32),

    #[error(
        "Racing cancelled {cancelled} participant(s) of tournament {tournament}, \
         but at most {allowed} may be cancelled"
    )]
    RacingBoundViolated {
        tournament: TournamentId,
        cancelled: usize,
        allowed: usize,
    },

    #[error("Generation {0} has no participants")]
    NoParticipants(u32),

    #[error("No instances were supplied for generation {0}")]
    NoInstances(u32),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Serde error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TunerError>;
