pub mod battle;
pub mod errors;
pub mod events;
pub mod ids;
pub mod money;
pub mod records;

pub use battle::{
    Battle, BattleCompletion, BattleMode, BattleStatus, EscrowReference, ModeConfig,
    replay_checksum,
};
pub use errors::DomainError;
pub use events::{SettlementEvent, SettlementEventKind};
pub use ids::{
    BattleId, PlayerId, TraceId, addresses_equal, normalize_address, normalize_tx_hash,
};
pub use money::{MoneyError, TOKEN_DECIMALS, TokenAmount};
pub use records::{BattleHistoryEntry, DEFAULT_RATING, RatingRecord, RevenueDistribution};

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;

    fn ranked() -> Battle {
        Battle::new_ranked(PlayerId::new("0xAAA1"), PlayerId::new("0xbbb2"), Utc::now())
            .expect("ranked battle")
    }

    #[test]
    fn battle_mode_and_status_serialize_as_screaming_snake_case() {
        assert_eq!(
            serde_json::to_value(BattleMode::Wager).expect("serialize"),
            json!("WAGER")
        );
        assert_eq!(
            serde_json::to_value(BattleStatus::InProgress).expect("serialize"),
            json!("IN_PROGRESS")
        );
        assert_eq!("ranked".parse::<BattleMode>().expect("parse"), BattleMode::Ranked);
    }

    #[test]
    fn player_id_equality_ignores_address_case() {
        assert_eq!(PlayerId::new("0xABCDEF"), PlayerId::new("0xabcdef"));
        assert!(addresses_equal("0xABCDEF01", "0xabcdef01"));
    }

    #[test]
    fn complete_sets_winner_checksum_and_timestamp_together() {
        let mut battle = ranked();
        assert!(battle.replay_checksum.is_none());
        let now = Utc::now();
        let completion = battle
            .complete(PlayerId::new("0xaaa1"), b"replay".to_vec(), now)
            .expect("complete");

        assert_eq!(battle.status, BattleStatus::Completed);
        assert_eq!(battle.winner.as_ref(), Some(&completion.winner));
        assert_eq!(battle.completed_at, Some(now));
        assert_eq!(completion.replay_checksum, replay_checksum(b"replay"));
        assert!(battle.replay_matches(b"replay"));
        assert!(!battle.replay_matches(b"tampered"));
    }

    #[test]
    fn complete_twice_fails_with_invalid_state_and_keeps_first_result() {
        let mut battle = ranked();
        battle
            .complete(PlayerId::new("0xaaa1"), b"first".to_vec(), Utc::now())
            .expect("first");
        let err = battle
            .complete(PlayerId::new("0xbbb2"), b"second".to_vec(), Utc::now())
            .expect_err("second completion");
        assert!(matches!(err, DomainError::InvalidBattleState { .. }));
        assert_eq!(battle.winner, Some(PlayerId::new("0xaaa1")));
        assert!(battle.replay_matches(b"first"));
    }

    #[test]
    fn non_participant_winner_is_rejected_without_mutation() {
        let mut battle = ranked();
        let err = battle
            .complete(PlayerId::new("0xccc3"), b"r".to_vec(), Utc::now())
            .expect_err("outsider");
        assert!(matches!(err, DomainError::WinnerNotParticipant(_)));
        assert_eq!(battle.status, BattleStatus::InProgress);
        assert!(battle.winner.is_none());
        assert!(battle.replay_checksum.is_none());
    }

    #[test]
    fn free_battle_only_accepts_player1_as_winner() {
        let battle = Battle::new_free(PlayerId::new("0xaaa1"), Utc::now());
        assert!(battle.ensure_winner_eligible(&PlayerId::new("0xAAA1")).is_ok());
        assert!(battle.ensure_winner_eligible(&PlayerId::new("0xbbb2")).is_err());
        assert_eq!(battle.opponent_of(&PlayerId::new("0xaaa1")), None);
    }

    #[test]
    fn self_battle_is_rejected() {
        let err = Battle::new_ranked(PlayerId::new("0xAB"), PlayerId::new("0xab"), Utc::now())
            .expect_err("self battle");
        assert_eq!(err, DomainError::SelfBattle);
    }

    #[test]
    fn token_amount_parses_and_displays_decimal_strings() {
        let amount: TokenAmount = "100.005".parse().expect("parse");
        assert_eq!(amount.as_base_units(), 100_005_000_000_000_000_000);
        assert_eq!(amount.to_string(), "100.005");
        assert_eq!(TokenAmount::from_whole_tokens(1000).to_string(), "1000");
        assert_eq!("0.5".parse::<TokenAmount>().expect("half").to_string(), "0.5");
        assert!("1.2.3".parse::<TokenAmount>().is_err());
        assert!("-1".parse::<TokenAmount>().is_err());
        assert!("0.0000000000000000001".parse::<TokenAmount>().is_err());
    }

    #[test]
    fn tx_hashes_normalize_to_trimmed_lowercase() {
        assert_eq!(normalize_tx_hash("  0xAbC123\n"), "0xabc123");
        assert_eq!(normalize_tx_hash("0xabc123"), normalize_tx_hash("0XABC123"));
    }

    #[test]
    fn token_amount_serializes_as_decimal_string_beyond_u64() {
        let amount = TokenAmount::from_whole_tokens(1_000);
        let encoded = serde_json::to_value(amount).expect("serialize");
        assert_eq!(encoded, json!("1000"));
        let decoded: TokenAmount = serde_json::from_value(encoded).expect("deserialize");
        assert_eq!(decoded, amount);

        let fractional: TokenAmount =
            serde_json::from_value(json!("100.005")).expect("fractional");
        assert_eq!(fractional.as_base_units(), 100_005_000_000_000_000_000);
        assert!(serde_json::from_value::<TokenAmount>(json!("1.2.3")).is_err());
    }

    #[test]
    fn rating_record_tracks_streak_and_monotonic_peak() {
        let mut record = RatingRecord::initial(PlayerId::new("0xaaa1"));
        record.record_result(1216, true);
        record.record_result(1232, true);
        assert_eq!(record.win_streak, 2);
        record.record_result(1210, false);
        assert_eq!(record.win_streak, 0);
        assert_eq!(record.highest_rating, 1232);
        assert_eq!(record.games_played, 3);
        assert_eq!((record.wins, record.losses), (2, 1));
    }

    #[test]
    fn settlement_event_kind_variant_names_are_stable_snake_case() {
        let ev = SettlementEvent {
            battle_id: Some(BattleId::new()),
            trace_id: TraceId::new(),
            occurred_at: Utc::now(),
            kind: SettlementEventKind::TransferRejected {
                tx_hash: "0xabc".to_string(),
                purpose: "wager_escrow".to_string(),
                reason: "amount_mismatch".to_string(),
                from: None,
                to: None,
                amount: None,
                block_number: Some(7),
            },
        };
        let value = serde_json::to_value(&ev).expect("serialize");
        assert_eq!(value["kind"]["transfer_rejected"]["tx_hash"], json!("0xabc"));
        assert_eq!(ev.kind.name(), "transfer_rejected");
        assert_eq!(ev.kind.severity(), "error");
    }
}
