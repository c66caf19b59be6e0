//! SQLite datastore — migrations plus the [`Datastore`] implementation the
//! engine drives.
//!
//! Timestamps are stored as unix seconds, statuses as their short string
//! identifiers, and repair tasks as JSON payloads alongside a `kind`
//! discriminant so manual-review rows can be excluded from the worker feed
//! without deserializing.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use escrow_engine::condition::Fulfillment;
use escrow_engine::errors::{EngineError, Result as EngineResult};
use escrow_engine::model::{
    EscrowRecord, Goal, GoalId, GoalStatus, Milestone, MilestoneId, MilestoneStatus,
};
use escrow_engine::store::{Datastore, NewGoal, RepairTask, StoredRepair};

use crate::errors::Result;

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

fn db(e: sqlx::Error) -> EngineError {
    EngineError::Persistence(e.to_string())
}

fn from_unix(secs: i64) -> EngineResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| EngineError::Persistence(format!("timestamp {secs} out of range")))
}

// ─────────────────────────────────────────────────────────
// Row shapes
// ─────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct GoalRow {
    id: i64,
    created_at: i64,
    title: String,
    description: String,
    total_budget: i64,
    status: String,
    creator_id: String,
    creator_wallet: String,
    sponsor_id: Option<String>,
    funding_account: Option<String>,
}

impl GoalRow {
    fn into_goal(self) -> EngineResult<Goal> {
        Ok(Goal {
            id: self.id,
            created_at: from_unix(self.created_at)?,
            title: self.title,
            description: self.description,
            total_budget: self.total_budget,
            status: GoalStatus::from_str(&self.status)?,
            creator_id: self.creator_id,
            creator_wallet: self.creator_wallet,
            sponsor_id: self.sponsor_id,
            funding_account: self.funding_account,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MilestoneRow {
    id: i64,
    goal_id: i64,
    title: String,
    description: Option<String>,
    reward_amount: i64,
    deadline: Option<i64>,
    status: String,
}

impl MilestoneRow {
    fn into_milestone(self) -> EngineResult<Milestone> {
        Ok(Milestone {
            id: self.id,
            goal_id: self.goal_id,
            title: self.title,
            description: self.description,
            reward_amount: self.reward_amount,
            deadline: self.deadline.map(from_unix).transpose()?,
            status: MilestoneStatus::from_str(&self.status)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EscrowRow {
    milestone_id: i64,
    owner: String,
    sequence: i64,
    condition: String,
    fulfillment: String,
    cancel_after: i64,
    created_at: i64,
}

impl EscrowRow {
    fn into_record(self) -> EngineResult<EscrowRecord> {
        Ok(EscrowRecord {
            milestone_id: self.milestone_id,
            owner: self.owner,
            sequence: self.sequence as u32,
            condition: self.condition,
            fulfillment: Fulfillment::from_hex(&self.fulfillment)?,
            cancel_after: self.cancel_after,
            created_at: from_unix(self.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RepairRow {
    id: i64,
    attempts: i64,
    payload: String,
}

// ─────────────────────────────────────────────────────────
// Datastore implementation
// ─────────────────────────────────────────────────────────

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Datastore for SqliteStore {
    async fn insert_goal(&self, goal: NewGoal) -> EngineResult<Goal> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(db)?;

        let goal_id = sqlx::query(
            r#"
            INSERT INTO goals (created_at, title, description, total_budget, status,
                               creator_id, creator_wallet)
            VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6)
            "#,
        )
        .bind(now)
        .bind(&goal.title)
        .bind(&goal.description)
        .bind(goal.total_budget)
        .bind(&goal.creator_id)
        .bind(&goal.creator_wallet)
        .execute(&mut *tx)
        .await
        .map_err(db)?
        .last_insert_rowid();

        for m in &goal.milestones {
            sqlx::query(
                r#"
                INSERT INTO milestones (goal_id, title, description, reward_amount, deadline, status)
                VALUES (?1, ?2, ?3, ?4, ?5, 'todo')
                "#,
            )
            .bind(goal_id)
            .bind(&m.title)
            .bind(&m.description)
            .bind(m.reward_amount)
            .bind(m.deadline.map(|d| d.timestamp()))
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }

        tx.commit().await.map_err(db)?;

        self.goal(goal_id)
            .await?
            .ok_or_else(|| EngineError::Persistence(format!("goal {goal_id} vanished after insert")))
    }

    async fn goal(&self, id: GoalId) -> EngineResult<Option<Goal>> {
        let row: Option<GoalRow> = sqlx::query_as(
            r#"
            SELECT id, created_at, title, description, total_budget, status,
                   creator_id, creator_wallet, sponsor_id, funding_account
            FROM   goals
            WHERE  id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.map(GoalRow::into_goal).transpose()
    }

    async fn milestones(&self, goal_id: GoalId) -> EngineResult<Vec<Milestone>> {
        let rows: Vec<MilestoneRow> = sqlx::query_as(
            r#"
            SELECT id, goal_id, title, description, reward_amount, deadline, status
            FROM   milestones
            WHERE  goal_id = ?1
            ORDER  BY id ASC
            "#,
        )
        .bind(goal_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.into_iter().map(MilestoneRow::into_milestone).collect()
    }

    async fn milestone(&self, id: MilestoneId) -> EngineResult<Option<Milestone>> {
        let row: Option<MilestoneRow> = sqlx::query_as(
            r#"
            SELECT id, goal_id, title, description, reward_amount, deadline, status
            FROM   milestones
            WHERE  id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.map(MilestoneRow::into_milestone).transpose()
    }

    async fn goals_with_status(&self, status: GoalStatus) -> EngineResult<Vec<Goal>> {
        let rows: Vec<GoalRow> = sqlx::query_as(
            r#"
            SELECT id, created_at, title, description, total_budget, status,
                   creator_id, creator_wallet, sponsor_id, funding_account
            FROM   goals
            WHERE  status = ?1
            ORDER  BY id ASC
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.into_iter().map(GoalRow::into_goal).collect()
    }

    async fn update_goal_meta(
        &self,
        id: GoalId,
        creator_id: &str,
        title: &str,
        description: &str,
    ) -> EngineResult<bool> {
        let affected = sqlx::query(
            "UPDATE goals SET title = ?1, description = ?2 WHERE id = ?3 AND creator_id = ?4",
        )
        .bind(title)
        .bind(description)
        .bind(id)
        .bind(creator_id)
        .execute(&self.pool)
        .await
        .map_err(db)?
        .rows_affected();
        Ok(affected > 0)
    }

    async fn reprice_milestone(
        &self,
        goal_id: GoalId,
        milestone_id: MilestoneId,
        new_reward: i64,
        new_budget: i64,
    ) -> EngineResult<()> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        sqlx::query("UPDATE milestones SET reward_amount = ?1 WHERE id = ?2 AND goal_id = ?3")
            .bind(new_reward)
            .bind(milestone_id)
            .bind(goal_id)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        sqlx::query("UPDATE goals SET total_budget = ?1 WHERE id = ?2")
            .bind(new_budget)
            .bind(goal_id)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        tx.commit().await.map_err(db)
    }

    async fn delete_goal(&self, id: GoalId, creator_id: &str) -> EngineResult<bool> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        let affected = sqlx::query("DELETE FROM goals WHERE id = ?1 AND creator_id = ?2")
            .bind(id)
            .bind(creator_id)
            .execute(&mut *tx)
            .await
            .map_err(db)?
            .rows_affected();
        if affected == 0 {
            tx.rollback().await.map_err(db)?;
            return Ok(false);
        }
        sqlx::query(
            r#"
            DELETE FROM milestone_escrows
            WHERE  milestone_id IN (SELECT id FROM milestones WHERE goal_id = ?1)
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db)?;
        sqlx::query("DELETE FROM milestones WHERE goal_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(true)
    }

    async fn set_goal_status(&self, id: GoalId, status: GoalStatus) -> EngineResult<()> {
        sqlx::query("UPDATE goals SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    async fn set_goal_sponsor(
        &self,
        id: GoalId,
        sponsor_id: &str,
        funding_account: &str,
    ) -> EngineResult<()> {
        sqlx::query("UPDATE goals SET sponsor_id = ?1, funding_account = ?2 WHERE id = ?3")
            .bind(sponsor_id)
            .bind(funding_account)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    async fn set_milestone_status(
        &self,
        id: MilestoneId,
        status: MilestoneStatus,
    ) -> EngineResult<()> {
        sqlx::query("UPDATE milestones SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    async fn insert_escrow(&self, record: &EscrowRecord) -> EngineResult<()> {
        // milestone_id is the primary key — a second insert for the same
        // milestone fails, keeping the record exactly-once.
        sqlx::query(
            r#"
            INSERT INTO milestone_escrows
                (milestone_id, owner, sequence, condition, fulfillment, cancel_after, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(record.milestone_id)
        .bind(&record.owner)
        .bind(record.sequence as i64)
        .bind(&record.condition)
        .bind(record.fulfillment.to_hex())
        .bind(record.cancel_after)
        .bind(record.created_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn escrow_for_milestone(
        &self,
        milestone_id: MilestoneId,
    ) -> EngineResult<Option<EscrowRecord>> {
        let row: Option<EscrowRow> = sqlx::query_as(
            r#"
            SELECT milestone_id, owner, sequence, condition, fulfillment, cancel_after, created_at
            FROM   milestone_escrows
            WHERE  milestone_id = ?1
            "#,
        )
        .bind(milestone_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.map(EscrowRow::into_record).transpose()
    }

    async fn enqueue_repair(&self, task: &RepairTask) -> EngineResult<i64> {
        let payload = serde_json::to_string(task)?;
        let id = sqlx::query(
            "INSERT INTO repair_queue (kind, payload, attempts, created_at) VALUES (?1, ?2, 0, ?3)",
        )
        .bind(task.kind())
        .bind(payload)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(db)?
        .last_insert_rowid();
        Ok(id)
    }

    async fn pending_repairs_for_goal(&self, goal_id: GoalId) -> EngineResult<u32> {
        // The queue stays small; decode and filter in process rather than
        // depending on JSON operators in SQL.
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT payload FROM repair_queue WHERE kind != 'manual_review'")
                .fetch_all(&self.pool)
                .await
                .map_err(db)?;
        let mut count = 0u32;
        for (payload,) in rows {
            let task: RepairTask = serde_json::from_str(&payload)?;
            if task.goal_id() == Some(goal_id) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn due_repairs(&self, limit: u32) -> EngineResult<Vec<StoredRepair>> {
        let rows: Vec<RepairRow> = sqlx::query_as(
            r#"
            SELECT id, attempts, payload
            FROM   repair_queue
            WHERE  kind != 'manual_review'
            ORDER  BY id ASC
            LIMIT  ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.into_iter()
            .map(|r| {
                Ok(StoredRepair {
                    id: r.id,
                    attempts: r.attempts,
                    task: serde_json::from_str(&r.payload)?,
                })
            })
            .collect()
    }

    async fn bump_repair(&self, id: i64) -> EngineResult<()> {
        sqlx::query("UPDATE repair_queue SET attempts = attempts + 1 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    async fn resolve_repair(&self, id: i64) -> EngineResult<()> {
        sqlx::query("DELETE FROM repair_queue WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
