// Battle state manager: owns read/modify access to one battle's mutable
// fields, with the paired log append as its primary contract.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::{Battle, Database};
use crate::error::AppError;
use crate::gateway::{ChatMessage, ChatRole};

/// Who wrote a log entry. The legacy labels "agent" and "model" normalize to
/// `Ai` on deserialization; serialization always emits the canonical pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Creator {
    User,
    #[serde(alias = "agent", alias = "model")]
    Ai,
}

/// One immutable battle log entry. The message index is the entry's position
/// in the log array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub creator: Creator,
    pub message: String,
    pub timestamp: String,
}

/// Retries for the optimistic length check in `append_turn`.
const APPEND_MAX_RETRIES: usize = 5;

/// A battle row decoded for the lifetime of one request: scalars plus the
/// parsed log and armies.
#[derive(Debug)]
pub struct BattleState {
    battle: Battle,
    log: Vec<LogEntry>,
    player_army: Value,
    opponent_army: Option<Value>,
}

impl BattleState {
    /// Load the battle with the given id, failing with `NotFound` when no
    /// row matches.
    pub async fn load(db: &Database, battle_id: &str) -> Result<Self, AppError> {
        let battle = db
            .get_battle(battle_id)
            .await?
            .ok_or(AppError::NotFound("battle"))?;
        Self::from_row(battle)
    }

    /// Decode an already-fetched battle row.
    pub fn from_row(battle: Battle) -> Result<Self, AppError> {
        let log = parse_log(&battle.battle_log)?;
        let player_army = parse_army(&battle.player_army)?;
        let opponent_army = match &battle.opponent_army {
            Some(raw) => Some(parse_army(raw)?),
            None => None,
        };
        Ok(Self {
            battle,
            log,
            player_army,
            opponent_army,
        })
    }

    pub fn id(&self) -> &str {
        &self.battle.id
    }

    pub fn owner_id(&self) -> &str {
        &self.battle.user_id
    }

    /// The ordered log, possibly empty.
    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    /// The normalized army descriptors: (player, opponent).
    pub fn armies(&self) -> (&Value, Option<&Value>) {
        (&self.player_army, self.opponent_army.as_ref())
    }

    /// Atomically append the paired (user, ai) entries at the next two
    /// sequential indices and persist the updated log. The persist is a
    /// single length-guarded UPDATE, so no reader can ever observe only one
    /// of the two entries, and a lost race refreshes the log and retries.
    pub async fn append_turn(
        &mut self,
        db: &Database,
        user_message: &str,
        assistant_response: &str,
    ) -> Result<&[LogEntry], AppError> {
        for _ in 0..APPEND_MAX_RETRIES {
            let expected_len = self.log.len();
            let timestamp = chrono::Utc::now().to_rfc3339();
            let mut next = self.log.clone();
            next.push(LogEntry {
                creator: Creator::User,
                message: user_message.to_string(),
                timestamp: timestamp.clone(),
            });
            next.push(LogEntry {
                creator: Creator::Ai,
                message: assistant_response.to_string(),
                timestamp,
            });

            let log_json = serde_json::to_string(&next)
                .map_err(|e| AppError::Persistence(format!("failed to encode battle log: {e}")))?;

            if db
                .commit_battle_log(&self.battle.id, expected_len as i64, &log_json)
                .await?
            {
                self.log = next;
                return Ok(&self.log);
            }

            // The length check missed: someone else appended first, or the
            // battle vanished. Refresh and try again from the new tail.
            let raw = db
                .fetch_battle_log(&self.battle.id)
                .await?
                .ok_or(AppError::NotFound("battle"))?;
            self.log = parse_log(&raw)?;
        }

        Err(AppError::Persistence(format!(
            "battle log append for {} lost the race {APPEND_MAX_RETRIES} times",
            self.battle.id
        )))
    }

    /// The log rendered as role/text pairs for the model, in index order.
    pub fn formatted_history(&self) -> Vec<ChatMessage> {
        self.log
            .iter()
            .map(|entry| ChatMessage {
                role: match entry.creator {
                    Creator::User => ChatRole::User,
                    Creator::Ai => ChatRole::Model,
                },
                text: entry.message.clone(),
            })
            .collect()
    }

    /// The client-facing view of this battle.
    pub fn view(&self) -> BattleView {
        BattleView {
            id: self.battle.id.clone(),
            user_id: self.battle.user_id.clone(),
            battle_name: self.battle.battle_name.clone(),
            width: self.battle.width,
            height: self.battle.height,
            player_army: self.player_army.clone(),
            opponent_army: self.opponent_army.clone(),
            battle_round: self.battle.battle_round,
            army_turn: self.battle.army_turn,
            player_score: self.battle.player_score,
            opponent_score: self.battle.opponent_score,
            archived: self.battle.archived,
            battle_log: self.log.clone(),
            created_at: self.battle.created_at.clone(),
        }
    }
}

/// A battle as returned to API clients: armies and log in structured form.
#[derive(Debug, Clone, Serialize)]
pub struct BattleView {
    pub id: String,
    pub user_id: String,
    pub battle_name: String,
    pub width: i64,
    pub height: i64,
    pub player_army: Value,
    pub opponent_army: Option<Value>,
    pub battle_round: i64,
    pub army_turn: i64,
    pub player_score: i64,
    pub opponent_score: i64,
    pub archived: bool,
    pub battle_log: Vec<LogEntry>,
    pub created_at: String,
}

fn parse_log(raw: &str) -> Result<Vec<LogEntry>, AppError> {
    serde_json::from_str(raw)
        .map_err(|e| AppError::Persistence(format!("corrupt battle log: {e}")))
}

fn parse_army(raw: &str) -> Result<Value, AppError> {
    serde_json::from_str(raw)
        .map_err(|e| AppError::Persistence(format!("corrupt army descriptor: {e}")))
}

/// Normalize an incoming army descriptor to the single stored shape. A
/// string that itself holds JSON is parsed; any other value is kept as-is.
/// Reads never have to deal with a second encoding.
pub fn normalize_army(value: Value) -> Value {
    match value {
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(parsed) => parsed,
            Err(_) => Value::String(s),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    async fn test_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    async fn test_battle(db: &Database) -> String {
        let user = db.create_user("player", None, None, None).await.unwrap();
        let battle = db
            .create_battle(
                &user.id,
                "Practice",
                44,
                60,
                "\"Black Templars\"",
                Some("\"Tau\""),
            )
            .await
            .unwrap();
        battle.id
    }

    #[test]
    fn test_creator_canonical_serialization() {
        assert_eq!(serde_json::to_string(&Creator::User).unwrap(), "\"user\"");
        assert_eq!(serde_json::to_string(&Creator::Ai).unwrap(), "\"ai\"");
    }

    #[test]
    fn test_creator_normalizes_aliases() {
        for label in ["\"ai\"", "\"agent\"", "\"model\""] {
            let creator: Creator = serde_json::from_str(label).unwrap();
            assert_eq!(creator, Creator::Ai);
        }
        let creator: Creator = serde_json::from_str("\"user\"").unwrap();
        assert_eq!(creator, Creator::User);
        assert!(serde_json::from_str::<Creator>("\"narrator\"").is_err());
    }

    #[test]
    fn test_normalize_army() {
        // Plain string stays a string
        assert_eq!(
            normalize_army(json!("Black Templars")),
            json!("Black Templars")
        );
        // A string holding JSON is parsed
        assert_eq!(
            normalize_army(json!("{\"faction\":\"Tau\",\"points\":2000}")),
            json!({"faction": "Tau", "points": 2000})
        );
        // Structured input passes through
        assert_eq!(
            normalize_army(json!({"faction": "Orks"})),
            json!({"faction": "Orks"})
        );
    }

    #[test]
    fn test_from_row_rejects_corrupt_log() {
        let battle = Battle {
            id: "b".into(),
            user_id: "u".into(),
            battle_name: "B".into(),
            width: 44,
            height: 60,
            player_army: "\"Orks\"".into(),
            opponent_army: None,
            battle_round: 0,
            army_turn: 0,
            player_score: 0,
            opponent_score: 0,
            archived: false,
            battle_log: "{not json".into(),
            created_at: "t".into(),
        };
        let err = BattleState::from_row(battle).unwrap_err();
        assert!(matches!(err, AppError::Persistence(_)));
    }

    #[tokio::test]
    async fn test_load_missing_battle() {
        let db = test_db().await;
        let err = BattleState::load(&db, "nonexistent-id").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_append_turn_pairs_entries() {
        let db = test_db().await;
        let battle_id = test_battle(&db).await;

        let mut state = BattleState::load(&db, &battle_id).await.unwrap();
        assert!(state.log().is_empty());

        let log = state
            .append_turn(&db, "I deploy my troops", "The Tau forces advance.")
            .await
            .unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].creator, Creator::User);
        assert_eq!(log[0].message, "I deploy my troops");
        assert_eq!(log[1].creator, Creator::Ai);
        assert_eq!(log[1].message, "The Tau forces advance.");

        let log = state
            .append_turn(&db, "I advance on the left flank", "Fire warriors hold.")
            .await
            .unwrap();
        assert_eq!(log.len(), 4);
        assert_eq!(log[2].creator, Creator::User);
        assert_eq!(log[3].creator, Creator::Ai);

        // Persisted shape matches the in-memory log
        let reloaded = BattleState::load(&db, &battle_id).await.unwrap();
        assert_eq!(reloaded.log(), state.log());
    }

    #[tokio::test]
    async fn test_append_turn_recovers_from_lost_race() {
        let db = test_db().await;
        let battle_id = test_battle(&db).await;

        let mut state = BattleState::load(&db, &battle_id).await.unwrap();

        // Another writer commits a turn behind this handle's back
        let mut rival = BattleState::load(&db, &battle_id).await.unwrap();
        rival.append_turn(&db, "first", "reply one").await.unwrap();

        // The stale handle refreshes and appends after the rival's entries
        let log = state.append_turn(&db, "second", "reply two").await.unwrap();
        assert_eq!(log.len(), 4);
        assert_eq!(log[0].message, "first");
        assert_eq!(log[2].message, "second");
    }

    #[tokio::test]
    async fn test_append_turn_missing_battle() {
        let db = test_db().await;
        let battle_id = test_battle(&db).await;
        let mut state = BattleState::load(&db, &battle_id).await.unwrap();

        db.delete_battle_for_tests(&battle_id).await.unwrap();

        let err = state.append_turn(&db, "msg", "reply").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_formatted_history_roles_and_order() {
        let db = test_db().await;
        let battle_id = test_battle(&db).await;
        let mut state = BattleState::load(&db, &battle_id).await.unwrap();

        state.append_turn(&db, "one", "two").await.unwrap();
        state.append_turn(&db, "three", "four").await.unwrap();

        let history = state.formatted_history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].role, ChatRole::User);
        assert_eq!(history[0].text, "one");
        assert_eq!(history[1].role, ChatRole::Model);
        assert_eq!(history[1].text, "two");
        assert_eq!(history[2].role, ChatRole::User);
        assert_eq!(history[3].role, ChatRole::Model);
    }

    #[tokio::test]
    async fn test_armies_are_structured() {
        let db = test_db().await;
        let battle_id = test_battle(&db).await;
        let state = BattleState::load(&db, &battle_id).await.unwrap();

        let (player, opponent) = state.armies();
        assert_eq!(player, &json!("Black Templars"));
        assert_eq!(opponent, Some(&json!("Tau")));
    }
}
