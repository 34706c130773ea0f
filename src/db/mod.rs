// Database access layer (SQLite via sqlx).

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use uuid::Uuid;

use crate::config;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub password_hash: Option<String>,
    pub profile_picture: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Battle {
    pub id: String,
    pub user_id: String,
    pub battle_name: String,
    pub width: i64,
    pub height: i64,
    pub player_army: String,
    pub opponent_army: Option<String>,
    pub battle_round: i64,
    pub army_turn: i64,
    pub player_score: i64,
    pub opponent_score: i64,
    pub archived: bool,
    pub battle_log: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Interaction {
    pub id: String,
    pub user_id: String,
    pub battle_id: Option<String>,
    pub kind: String,
    pub user_input: Option<String>,
    pub llm_output: Option<String>,
    pub context: Option<String>,
    pub created_at: String,
}

/// Audit record category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionKind {
    Initial,
    Text,
    Image,
}

impl InteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionKind::Initial => "initial",
            InteractionKind::Text => "text",
            InteractionKind::Image => "image",
        }
    }
}

impl std::fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scalar battle fields the update endpoint may change. The battle log is
/// never writable through this path.
#[derive(Debug, Default, Clone)]
pub struct BattleFieldUpdate {
    pub battle_round: Option<i64>,
    pub army_turn: Option<i64>,
    pub player_score: Option<i64>,
    pub opponent_score: Option<i64>,
    pub archived: Option<bool>,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        // An in-memory SQLite database exists per connection; a pool of one
        // keeps all callers on the same database.
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect(database_url)
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                email TEXT UNIQUE,
                password_hash TEXT,
                profile_picture TEXT,
                created_at TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS battles (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id),
                battle_name TEXT NOT NULL,
                width INTEGER NOT NULL,
                height INTEGER NOT NULL,
                player_army TEXT NOT NULL,
                opponent_army TEXT,
                battle_round INTEGER NOT NULL DEFAULT 0,
                army_turn INTEGER NOT NULL DEFAULT 0,
                player_score INTEGER NOT NULL DEFAULT 0,
                opponent_score INTEGER NOT NULL DEFAULT 0,
                archived INTEGER NOT NULL DEFAULT 0,
                battle_log TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS interactions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                battle_id TEXT,
                kind TEXT NOT NULL,
                user_input TEXT,
                llm_output TEXT,
                context TEXT,
                created_at TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_battles_user ON battles(user_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_interactions_user ON interactions(user_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ── User CRUD ─────────────────────────────────────────────────────

    pub async fn create_user(
        &self,
        username: &str,
        email: Option<&str>,
        password_hash: Option<&str>,
        profile_picture: Option<&str>,
    ) -> Result<User, sqlx::Error> {
        let row = sqlx::query_as::<_, User>(
            "INSERT INTO users (id, username, email, password_hash, profile_picture, created_at) VALUES (?, ?, ?, ?, ?, ?) RETURNING id, username, email, password_hash, profile_picture, created_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(username)
        .bind(email)
        .bind(password_hash)
        .bind(profile_picture)
        .bind(now_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>, sqlx::Error> {
        let row = sqlx::query_as::<_, User>(
            "SELECT id, username, email, password_hash, profile_picture, created_at FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, sqlx::Error> {
        let row = sqlx::query_as::<_, User>(
            "SELECT id, username, email, password_hash, profile_picture, created_at FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn update_user(
        &self,
        id: &str,
        username: Option<&str>,
        email: Option<&str>,
        profile_picture: Option<&str>,
    ) -> Result<Option<User>, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE users SET username = COALESCE(?, username), email = COALESCE(?, email), profile_picture = COALESCE(?, profile_picture) WHERE id = ?",
        )
        .bind(username)
        .bind(email)
        .bind(profile_picture)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.get_user(id).await
    }

    /// Create the fixed local-mode user if it does not exist yet.
    pub async fn ensure_local_user(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT OR IGNORE INTO users (id, username, email, password_hash, profile_picture, created_at) VALUES (?, ?, NULL, NULL, NULL, ?)",
        )
        .bind(config::LOCAL_USER_ID)
        .bind(config::LOCAL_USERNAME)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Battle CRUD ───────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_battle(
        &self,
        user_id: &str,
        battle_name: &str,
        width: i64,
        height: i64,
        player_army: &str,
        opponent_army: Option<&str>,
    ) -> Result<Battle, sqlx::Error> {
        let row = sqlx::query_as::<_, Battle>(
            "INSERT INTO battles (id, user_id, battle_name, width, height, player_army, opponent_army, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id, user_id, battle_name, width, height, player_army, opponent_army, battle_round, army_turn, player_score, opponent_score, archived, battle_log, created_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(battle_name)
        .bind(width)
        .bind(height)
        .bind(player_army)
        .bind(opponent_army)
        .bind(now_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_battle(&self, id: &str) -> Result<Option<Battle>, sqlx::Error> {
        let row = sqlx::query_as::<_, Battle>(
            "SELECT id, user_id, battle_name, width, height, player_army, opponent_army, battle_round, army_turn, player_score, opponent_score, archived, battle_log, created_at FROM battles WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_battles_for_user(&self, user_id: &str) -> Result<Vec<Battle>, sqlx::Error> {
        let rows = sqlx::query_as::<_, Battle>(
            "SELECT id, user_id, battle_name, width, height, player_army, opponent_army, battle_round, army_turn, player_score, opponent_score, archived, battle_log, created_at FROM battles WHERE user_id = ? ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn update_battle_fields(
        &self,
        id: &str,
        update: &BattleFieldUpdate,
    ) -> Result<Option<Battle>, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE battles SET battle_round = COALESCE(?, battle_round), army_turn = COALESCE(?, army_turn), player_score = COALESCE(?, player_score), opponent_score = COALESCE(?, opponent_score), archived = COALESCE(?, archived) WHERE id = ?",
        )
        .bind(update.battle_round)
        .bind(update.army_turn)
        .bind(update.player_score)
        .bind(update.opponent_score)
        .bind(update.archived)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.get_battle(id).await
    }

    // ── Battle log ────────────────────────────────────────────────────

    /// Replace the battle log if and only if its current length matches
    /// `expected_len`. Both paired entries land in this single statement, so
    /// a failure leaves the row exactly as it was. Returns false when the
    /// length check missed (a concurrent append won the race, or the battle
    /// no longer exists).
    pub async fn commit_battle_log(
        &self,
        battle_id: &str,
        expected_len: i64,
        log_json: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE battles SET battle_log = ? WHERE id = ? AND json_array_length(battle_log) = ?",
        )
        .bind(log_json)
        .bind(battle_id)
        .bind(expected_len)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn fetch_battle_log(&self, battle_id: &str) -> Result<Option<String>, sqlx::Error> {
        let row: Option<String> =
            sqlx::query_scalar("SELECT battle_log FROM battles WHERE id = ?")
                .bind(battle_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    // ── Interactions ──────────────────────────────────────────────────

    /// Insert an audit row with a caller-assigned id (the id is handed to
    /// the client before the asynchronous write happens).
    #[allow(clippy::too_many_arguments)]
    pub async fn create_interaction(
        &self,
        id: &str,
        user_id: &str,
        battle_id: Option<&str>,
        kind: InteractionKind,
        user_input: Option<&str>,
        llm_output: Option<&str>,
        context: Option<&str>,
    ) -> Result<Interaction, sqlx::Error> {
        let row = sqlx::query_as::<_, Interaction>(
            "INSERT INTO interactions (id, user_id, battle_id, kind, user_input, llm_output, context, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id, user_id, battle_id, kind, user_input, llm_output, context, created_at",
        )
        .bind(id)
        .bind(user_id)
        .bind(battle_id)
        .bind(kind.as_str())
        .bind(user_input)
        .bind(llm_output)
        .bind(context)
        .bind(now_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_interactions_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<Interaction>, sqlx::Error> {
        let rows = sqlx::query_as::<_, Interaction>(
            "SELECT id, user_id, battle_id, kind, user_input, llm_output, context, created_at FROM interactions WHERE user_id = ? ORDER BY created_at DESC, id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
impl Database {
    /// Hard delete for tests that need a battle to vanish mid-flight; the
    /// production design only ever soft-deletes via `archived`.
    pub async fn delete_battle_for_tests(&self, id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM battles WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get_user() {
        let db = test_db().await;

        let user = db
            .create_user("marneus", Some("marneus@macragge.example"), None, None)
            .await
            .unwrap();
        assert_eq!(user.username, "marneus");
        assert_eq!(user.email.as_deref(), Some("marneus@macragge.example"));

        let fetched = db.get_user(&user.id).await.unwrap();
        assert!(fetched.is_some());
        assert_eq!(fetched.unwrap().username, "marneus");

        let by_name = db.get_user_by_username("marneus").await.unwrap();
        assert!(by_name.is_some());

        let missing = db.get_user("does-not-exist").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_username_uniqueness() {
        let db = test_db().await;

        db.create_user("ghazghkull", None, None, None).await.unwrap();
        let err = db
            .create_user("ghazghkull", None, None, None)
            .await
            .unwrap_err();
        assert!(crate::error::is_unique_violation(&err));
    }

    #[tokio::test]
    async fn test_update_user() {
        let db = test_db().await;

        let user = db.create_user("old-name", None, None, None).await.unwrap();
        let updated = db
            .update_user(&user.id, Some("new-name"), Some("new@example.com"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.username, "new-name");
        assert_eq!(updated.email.as_deref(), Some("new@example.com"));

        let not_found = db
            .update_user("missing", Some("x"), None, None)
            .await
            .unwrap();
        assert!(not_found.is_none());
    }

    #[tokio::test]
    async fn test_ensure_local_user_idempotent() {
        let db = test_db().await;

        db.ensure_local_user().await.unwrap();
        db.ensure_local_user().await.unwrap();

        let user = db.get_user(config::LOCAL_USER_ID).await.unwrap().unwrap();
        assert_eq!(user.username, config::LOCAL_USERNAME);
    }

    #[tokio::test]
    async fn test_create_battle_defaults() {
        let db = test_db().await;

        let user = db.create_user("player", None, None, None).await.unwrap();
        let battle = db
            .create_battle(
                &user.id,
                "First Blood",
                44,
                60,
                "\"Black Templars\"",
                Some("\"Tau\""),
            )
            .await
            .unwrap();

        assert_eq!(battle.battle_name, "First Blood");
        assert_eq!(battle.width, 44);
        assert_eq!(battle.height, 60);
        assert_eq!(battle.battle_round, 0);
        assert_eq!(battle.army_turn, 0);
        assert_eq!(battle.player_score, 0);
        assert_eq!(battle.opponent_score, 0);
        assert!(!battle.archived);
        assert_eq!(battle.battle_log, "[]");
    }

    #[tokio::test]
    async fn test_list_battles_for_user() {
        let db = test_db().await;

        let alice = db.create_user("alice", None, None, None).await.unwrap();
        let bob = db.create_user("bob", None, None, None).await.unwrap();
        db.create_battle(&alice.id, "A1", 44, 60, "\"Orks\"", None)
            .await
            .unwrap();
        db.create_battle(&bob.id, "B1", 44, 60, "\"Eldar\"", None)
            .await
            .unwrap();

        let battles = db.list_battles_for_user(&alice.id).await.unwrap();
        assert_eq!(battles.len(), 1);
        assert_eq!(battles[0].battle_name, "A1");
    }

    #[tokio::test]
    async fn test_update_battle_fields() {
        let db = test_db().await;

        let user = db.create_user("player", None, None, None).await.unwrap();
        let battle = db
            .create_battle(&user.id, "B", 44, 60, "\"Orks\"", None)
            .await
            .unwrap();

        let update = BattleFieldUpdate {
            battle_round: Some(2),
            player_score: Some(15),
            archived: Some(true),
            ..Default::default()
        };
        let updated = db
            .update_battle_fields(&battle.id, &update)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.battle_round, 2);
        assert_eq!(updated.player_score, 15);
        assert!(updated.archived);
        // Untouched fields keep their values
        assert_eq!(updated.army_turn, 0);
        assert_eq!(updated.opponent_score, 0);

        let missing = db
            .update_battle_fields("missing", &BattleFieldUpdate::default())
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_commit_battle_log_cas() {
        let db = test_db().await;

        let user = db.create_user("player", None, None, None).await.unwrap();
        let battle = db
            .create_battle(&user.id, "B", 44, 60, "\"Orks\"", None)
            .await
            .unwrap();

        let two_entries = r#"[{"creator":"user","message":"a","timestamp":"t"},{"creator":"ai","message":"b","timestamp":"t"}]"#;

        // Matching expected length commits
        assert!(db.commit_battle_log(&battle.id, 0, two_entries).await.unwrap());
        assert_eq!(
            db.fetch_battle_log(&battle.id).await.unwrap().unwrap(),
            two_entries
        );

        // Stale expected length is rejected and leaves the log unchanged
        assert!(!db.commit_battle_log(&battle.id, 0, "[]").await.unwrap());
        assert_eq!(
            db.fetch_battle_log(&battle.id).await.unwrap().unwrap(),
            two_entries
        );

        // Unknown battle is a miss, not an error
        assert!(!db.commit_battle_log("missing", 0, "[]").await.unwrap());
        assert!(db.fetch_battle_log("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_interactions() {
        let db = test_db().await;

        let user = db.create_user("player", None, None, None).await.unwrap();
        let id = Uuid::new_v4().to_string();
        let row = db
            .create_interaction(
                &id,
                &user.id,
                None,
                InteractionKind::Text,
                Some("I deploy my troops"),
                Some("The Tau forces advance."),
                None,
            )
            .await
            .unwrap();
        assert_eq!(row.id, id);
        assert_eq!(row.kind, "text");

        let rows = db.list_interactions_for_user(&user.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_input.as_deref(), Some("I deploy my troops"));
    }
}
