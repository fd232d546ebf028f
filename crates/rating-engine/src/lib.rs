mod engine;

pub use engine::{DEFAULT_K_FACTOR, EloRatingEngine, MatchOutcome, RatingUpdate};
