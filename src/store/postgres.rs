//! Postgres store via direct SQLx.
//!
//! Conditional writes are single `UPDATE … WHERE` statements; the row count
//! is the compare-and-set result. Labels are guarded the same way on their
//! generation, and revisions on the unique `(item_id, seq)` key. No
//! statement spans two tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use super::{ItemCondition, ItemTransition, LeaseQuery, Store};
use crate::error::{Error, Result};
use crate::model::*;

const ITEM_COLUMNS: &str = "id, image_ref, property_id, status, holder, lease_deadline, flagged, qa_status, qa_feedback, ingested_at, updated_at, completed_at";
const LABEL_COLUMNS: &str = "item_id, payload, schema_version, author, generation, created_at, updated_at";
const REQUESTER_COLUMNS: &str = "id, enabled, role, current_lease, completed_count, last_completed_item, last_completed_at";

/// Postgres-backed store. Owns the connection pool.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Round-trip a `SELECT 1`.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_item(&self, item: &Item) -> Result<()> {
        let inserted = sqlx::query(
            "INSERT INTO items (id, image_ref, property_id, status, holder, lease_deadline, flagged, qa_status, ingested_at, updated_at, completed_at)
             VALUES ($1, $2, $3, $4, NULL, NULL, $5, $6, $7, $8, NULL)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(item.id.as_str())
        .bind(&item.image_ref)
        .bind(&item.property_id)
        .bind(item.status.to_string())
        .bind(item.flagged)
        .bind(item.qa_status.to_string())
        .bind(item.ingested_at)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(Error::Conflict(format!("item {} already exists", item.id)));
        }
        Ok(())
    }

    async fn get_item(&self, id: &ItemId) -> Result<Option<Item>> {
        let row: Option<ItemRow> =
            sqlx::query_as(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = $1"))
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        row.map(ItemRow::try_into_item).transpose()
    }

    async fn list_items(&self, status: ItemStatus, limit: i64) -> Result<Vec<Item>> {
        let rows: Vec<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE status = $1
             ORDER BY ingested_at ASC, id ASC LIMIT $2"
        ))
        .bind(status.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ItemRow::try_into_item).collect()
    }

    async fn list_leases(&self, query: &LeaseQuery) -> Result<Vec<Item>> {
        let rows: Vec<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM items
             WHERE status = 'leased'
             AND ($1::timestamptz IS NULL OR lease_deadline < $1)
             AND ($2::text IS NULL OR holder = $2)
             ORDER BY lease_deadline ASC, id ASC LIMIT $3"
        ))
        .bind(query.cutoff)
        .bind(query.holder.as_ref().map(|h| h.as_str()))
        .bind(query.limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ItemRow::try_into_item).collect()
    }

    async fn find_lease_held_by(&self, holder: &RequesterId) -> Result<Option<Item>> {
        let row: Option<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE status = 'leased' AND holder = $1
             ORDER BY lease_deadline ASC, id ASC LIMIT 1"
        ))
        .bind(holder.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(ItemRow::try_into_item).transpose()
    }

    async fn list_flagged(&self, limit: i64) -> Result<Vec<Item>> {
        let rows: Vec<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE flagged ORDER BY id ASC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ItemRow::try_into_item).collect()
    }

    async fn list_by_qa(&self, qa_status: QaStatus, limit: i64) -> Result<Vec<Item>> {
        let rows: Vec<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE status = 'done' AND qa_status = $1
             ORDER BY completed_at DESC NULLS LAST, id ASC LIMIT $2"
        ))
        .bind(qa_status.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ItemRow::try_into_item).collect()
    }

    async fn transition_item(
        &self,
        id: &ItemId,
        condition: &ItemCondition,
        transition: &ItemTransition,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let (expect_status, expect_holder, expect_deadline) = condition.parts();
        let patch = transition.patch();
        let (set_lease, holder, deadline) = match &patch.lease {
            Some(Some((holder, deadline))) => (true, Some(holder.as_str()), Some(*deadline)),
            Some(None) => (true, None, None),
            None => (false, None, None),
        };

        let rows_affected = sqlx::query(
            "UPDATE items SET
                status = COALESCE($2::text, status),
                holder = CASE WHEN $3 THEN $4::text ELSE holder END,
                lease_deadline = CASE WHEN $3 THEN $5::timestamptz ELSE lease_deadline END,
                qa_status = COALESCE($6::text, qa_status),
                flagged = COALESCE($7::boolean, flagged),
                completed_at = CASE WHEN $8 THEN $9 ELSE completed_at END,
                updated_at = $9,
                qa_feedback = CASE WHEN $13 THEN $14::text ELSE qa_feedback END
             WHERE id = $1
             AND ($10::text IS NULL OR status = $10)
             AND ($11::text IS NULL OR holder = $11)
             AND ($12::timestamptz IS NULL OR lease_deadline = $12)",
        )
        .bind(id.as_str())
        .bind(patch.status.map(|s| s.to_string()))
        .bind(set_lease)
        .bind(holder)
        .bind(deadline)
        .bind(patch.qa_status.map(|q| q.to_string()))
        .bind(patch.flagged)
        .bind(patch.completed)
        .bind(now)
        .bind(expect_status.map(|s| s.to_string()))
        .bind(expect_holder.map(|h| h.as_str()))
        .bind(expect_deadline)
        .bind(patch.qa_feedback.is_some())
        .bind(patch.qa_feedback.clone().flatten())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected == 1)
    }

    async fn get_label(&self, id: &ItemId) -> Result<Option<Label>> {
        let row: Option<LabelRow> =
            sqlx::query_as(&format!("SELECT {LABEL_COLUMNS} FROM labels WHERE item_id = $1"))
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        row.map(LabelRow::try_into_label).transpose()
    }

    async fn put_label(&self, label: &Label, expected: Option<u64>) -> Result<bool> {
        let query = match expected {
            None => bind_label(
                sqlx::query(
                    "INSERT INTO labels (item_id, payload, schema_version, author, generation, created_at, updated_at)
                     VALUES ($1, $2, $3, $4, $5, $6, $7)
                     ON CONFLICT (item_id) DO NOTHING",
                ),
                label,
            ),
            Some(generation) => bind_label(
                sqlx::query(
                    "UPDATE labels SET
                        payload = $2,
                        schema_version = $3,
                        author = $4,
                        generation = $5,
                        created_at = $6,
                        updated_at = $7
                     WHERE item_id = $1 AND generation = $8",
                ),
                label,
            )
            .bind(generation as i64),
        };
        let rows_affected = query.execute(&self.pool).await?.rows_affected();
        Ok(rows_affected == 1)
    }

    async fn delete_label(&self, id: &ItemId, generation: u64) -> Result<bool> {
        let rows_affected = sqlx::query("DELETE FROM labels WHERE item_id = $1 AND generation = $2")
            .bind(id.as_str())
            .bind(generation as i64)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows_affected == 1)
    }

    async fn append_revision(
        &self,
        label: &Label,
        edited_by: &RequesterId,
        at: DateTime<Utc>,
    ) -> Result<Revision> {
        let id = Uuid::new_v4();
        let seq = label.generation + 1;
        let rows_affected = sqlx::query(
            "INSERT INTO label_revisions (id, item_id, seq, label, edited_by, edited_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (item_id, seq) DO NOTHING",
        )
        .bind(id)
        .bind(label.item_id.as_str())
        .bind(seq as i64)
        .bind(Json(label))
        .bind(edited_by.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected != 1 {
            return Err(Error::Conflict(format!(
                "revision {seq} of {} already written",
                label.item_id
            )));
        }

        Ok(Revision {
            id,
            item_id: label.item_id.clone(),
            seq,
            label: label.clone(),
            edited_by: edited_by.clone(),
            edited_at: at,
        })
    }

    async fn retract_revision(&self, id: &ItemId, seq: u64) -> Result<bool> {
        let rows_affected =
            sqlx::query("DELETE FROM label_revisions WHERE item_id = $1 AND seq = $2")
                .bind(id.as_str())
                .bind(seq as i64)
                .execute(&self.pool)
                .await?
                .rows_affected();
        Ok(rows_affected == 1)
    }

    async fn list_revisions(&self, id: &ItemId) -> Result<Vec<Revision>> {
        let rows: Vec<RevisionRow> = sqlx::query_as(
            "SELECT id, item_id, seq, label, edited_by, edited_at
             FROM label_revisions WHERE item_id = $1 ORDER BY seq ASC",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RevisionRow::into_revision).collect())
    }

    async fn labels_by_author(&self, author: &RequesterId, limit: i64) -> Result<Vec<Label>> {
        let rows: Vec<LabelRow> = sqlx::query_as(&format!(
            "SELECT {LABEL_COLUMNS} FROM labels WHERE author = $1
             ORDER BY updated_at DESC, item_id ASC LIMIT $2"
        ))
        .bind(author.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LabelRow::try_into_label).collect()
    }

    async fn count_commits_by(&self, author: &RequesterId) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT (SELECT COUNT(*) FROM labels WHERE author = $1)
                  + (SELECT COUNT(*) FROM label_revisions WHERE label->>'author' = $1)",
        )
        .bind(author.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn get_requester(&self, id: &RequesterId) -> Result<Option<Requester>> {
        let row: Option<RequesterRow> = sqlx::query_as(&format!(
            "SELECT {REQUESTER_COLUMNS} FROM requesters WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(RequesterRow::into_requester))
    }

    async fn upsert_requester(&self, requester: &Requester) -> Result<()> {
        sqlx::query(
            "INSERT INTO requesters (id, enabled, role) VALUES ($1, $2, $3)
             ON CONFLICT (id) DO UPDATE SET enabled = EXCLUDED.enabled, role = EXCLUDED.role",
        )
        .bind(requester.id.as_str())
        .bind(requester.enabled)
        .bind(&requester.role)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_current_lease(&self, id: &RequesterId, item: Option<&ItemId>) -> Result<()> {
        sqlx::query(
            "INSERT INTO requesters (id, current_lease) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET current_lease = EXCLUDED.current_lease",
        )
        .bind(id.as_str())
        .bind(item.map(|i| i.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_completion(
        &self,
        id: &RequesterId,
        item: &ItemId,
        at: DateTime<Utc>,
    ) -> Result<Requester> {
        let row: RequesterRow = sqlx::query_as(&format!(
            "INSERT INTO requesters (id, completed_count, last_completed_item, last_completed_at)
             VALUES ($1, 1, $2, $3)
             ON CONFLICT (id) DO UPDATE SET
                completed_count = requesters.completed_count + 1,
                last_completed_item = EXCLUDED.last_completed_item,
                last_completed_at = EXCLUDED.last_completed_at,
                current_lease = NULL
             RETURNING {REQUESTER_COLUMNS}"
        ))
        .bind(id.as_str())
        .bind(item.as_str())
        .bind(at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into_requester())
    }

    async fn raise_completed_count(&self, id: &RequesterId, at_least: u64) -> Result<Requester> {
        let row: Option<RequesterRow> = sqlx::query_as(&format!(
            "UPDATE requesters SET completed_count = GREATEST(completed_count, $2)
             WHERE id = $1 RETURNING {REQUESTER_COLUMNS}"
        ))
        .bind(id.as_str())
        .bind(at_least as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RequesterRow::into_requester)
            .ok_or_else(|| Error::NotFound(format!("requester {id}")))
    }

    async fn list_requesters(&self) -> Result<Vec<Requester>> {
        let rows: Vec<RequesterRow> = sqlx::query_as(&format!(
            "SELECT {REQUESTER_COLUMNS} FROM requesters ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RequesterRow::into_requester).collect())
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct ItemRow {
    id: String,
    image_ref: String,
    property_id: Option<String>,
    status: String,
    holder: Option<String>,
    lease_deadline: Option<DateTime<Utc>>,
    flagged: bool,
    qa_status: String,
    qa_feedback: Option<String>,
    ingested_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl ItemRow {
    fn try_into_item(self) -> Result<Item> {
        Ok(Item {
            id: ItemId(self.id),
            image_ref: self.image_ref,
            property_id: self.property_id,
            status: self.status.parse()?,
            holder: self.holder.map(RequesterId),
            lease_deadline: self.lease_deadline,
            flagged: self.flagged,
            qa_status: self.qa_status.parse()?,
            qa_feedback: self.qa_feedback,
            ingested_at: self.ingested_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}

/// Binds `$1..$7` in `LABEL_COLUMNS` order.
fn bind_label<'q>(
    query: Query<'q, Postgres, PgArguments>,
    label: &'q Label,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(label.item_id.as_str())
        .bind(Json(&label.payload))
        .bind(label.schema_version as i32)
        .bind(label.author.as_str())
        .bind(label.generation as i64)
        .bind(label.created_at)
        .bind(label.updated_at)
}

#[derive(sqlx::FromRow)]
struct LabelRow {
    item_id: String,
    payload: Json<LabelPayload>,
    schema_version: i32,
    author: String,
    generation: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl LabelRow {
    fn try_into_label(self) -> Result<Label> {
        let schema_version = u32::try_from(self.schema_version).map_err(|_| {
            Error::Other(format!(
                "label {} has negative schema_version {}",
                self.item_id, self.schema_version
            ))
        })?;
        Ok(Label {
            item_id: ItemId(self.item_id),
            payload: self.payload.0,
            schema_version,
            author: RequesterId(self.author),
            generation: self.generation.max(0) as u64,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RevisionRow {
    id: Uuid,
    item_id: String,
    seq: i64,
    label: Json<Label>,
    edited_by: String,
    edited_at: DateTime<Utc>,
}

impl RevisionRow {
    fn into_revision(self) -> Revision {
        Revision {
            id: self.id,
            item_id: ItemId(self.item_id),
            seq: self.seq as u64,
            label: self.label.0,
            edited_by: RequesterId(self.edited_by),
            edited_at: self.edited_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RequesterRow {
    id: String,
    enabled: bool,
    role: String,
    current_lease: Option<String>,
    completed_count: i64,
    last_completed_item: Option<String>,
    last_completed_at: Option<DateTime<Utc>>,
}

impl RequesterRow {
    fn into_requester(self) -> Requester {
        Requester {
            id: RequesterId(self.id),
            enabled: self.enabled,
            role: self.role,
            current_lease: self.current_lease.map(ItemId),
            completed_count: self.completed_count.max(0) as u64,
            last_completed_item: self.last_completed_item.map(ItemId),
            last_completed_at: self.last_completed_at,
        }
    }
}
