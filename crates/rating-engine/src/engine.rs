use battle_domain::RatingRecord;
use serde::{Deserialize, Serialize};

/// Maximum rating swing for a single game.
pub const DEFAULT_K_FACTOR: f64 = 32.0;

const LOGISTIC_SCALE: f64 = 400.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOutcome {
    AWins,
    BWins,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingUpdate {
    pub new_rating_a: i32,
    pub new_rating_b: i32,
    pub delta_a: i32,
    pub delta_b: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EloRatingEngine {
    k_factor: f64,
}

impl Default for EloRatingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EloRatingEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            k_factor: DEFAULT_K_FACTOR,
        }
    }

    #[must_use]
    pub fn with_k_factor(k_factor: f64) -> Self {
        Self { k_factor }
    }

    #[must_use]
    pub fn k_factor(&self) -> f64 {
        self.k_factor
    }

    /// Logistic expectation of `rating` scoring against `opponent`.
    #[must_use]
    pub fn expected_score(rating: i32, opponent: i32) -> f64 {
        let diff = f64::from(opponent) - f64::from(rating);
        1.0 / (1.0 + 10_f64.powf(diff / LOGISTIC_SCALE))
    }

    /// Rounded adjustment for one side given its actual score (1.0 win, 0.0 loss).
    #[must_use]
    pub fn delta(&self, rating: i32, opponent: i32, score: f64) -> i32 {
        let raw = self.k_factor * (score - Self::expected_score(rating, opponent));
        // |raw| <= k_factor, well inside i32.
        raw.round() as i32
    }

    /// Each side is rounded on its own expectation, so `delta_a + delta_b` is not forced to zero.
    #[must_use]
    pub fn rate(&self, rating_a: i32, rating_b: i32, outcome: MatchOutcome) -> RatingUpdate {
        let (score_a, score_b) = match outcome {
            MatchOutcome::AWins => (1.0, 0.0),
            MatchOutcome::BWins => (0.0, 1.0),
        };
        let delta_a = self.delta(rating_a, rating_b, score_a);
        let delta_b = self.delta(rating_b, rating_a, score_b);
        RatingUpdate {
            new_rating_a: rating_a.saturating_add(delta_a),
            new_rating_b: rating_b.saturating_add(delta_b),
            delta_a,
            delta_b,
        }
    }

    /// Rates a decided game and folds the result into both records.
    pub fn apply(&self, winner: &mut RatingRecord, loser: &mut RatingRecord) -> RatingUpdate {
        let update = self.rate(winner.rating, loser.rating, MatchOutcome::AWins);
        winner.record_result(update.new_rating_a, true);
        loser.record_result(update.new_rating_b, false);
        update
    }
}
