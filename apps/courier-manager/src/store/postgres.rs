use async_trait::async_trait;
use courier_proto::{
    Command, CommandResult, CommandState, CommandType, ConnectionStatus, ModeratorId,
};
use sqlx::{postgres::PgPoolOptions, types::Json, FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{
    AcquireOutcome, AdvanceOutcome, CommandRecord, CourierStore, DeviceRecord, EndedLease,
    LeaseEnd, LeaseEvent, LeaseEventKind, LeaseRecord, LeaseStatus, PairingCodeRecord,
    StoreError, StoreResult,
};

const LEASE_COLUMNS: &str = "lease_id, device_id, device_name, moderator_id, token_hash, \
     issued_at_ms, expires_at_ms, status, ended_by, ended_at_ms, observed_status, current_url";
const COMMAND_COLUMNS: &str = "seq, command_id, lease_id, moderator_id, command_type, payload, \
     created_at_ms, state, result, discarded, updated_at_ms";
const DEVICE_COLUMNS: &str = "device_id, moderator_id, device_name, client_version, \
     credential_hash, revoked, paired_at_ms, revoked_at_ms";

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn end_lease_tx(
        tx: &mut Transaction<'_, Postgres>,
        lease_id: Uuid,
        end: LeaseEnd,
        now_ms: i64,
    ) -> StoreResult<Option<EndedLease>> {
        let sql = format!(
            "UPDATE device_lease SET status = $2, ended_by = $3, ended_at_ms = $4 \
             WHERE lease_id = $1 AND status = 'active' RETURNING {LEASE_COLUMNS}"
        );
        let row: Option<LeaseRow> = sqlx::query_as(&sql)
            .bind(lease_id)
            .bind(end.status().as_str())
            .bind(end.as_str())
            .bind(now_ms)
            .fetch_optional(tx.as_mut())
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let sql = format!(
            "UPDATE lease_command SET discarded = TRUE, updated_at_ms = $2 \
             WHERE lease_id = $1 AND discarded = FALSE AND state <> 'completed' \
             RETURNING {COMMAND_COLUMNS}"
        );
        let mut rows: Vec<CommandRow> = sqlx::query_as(&sql)
            .bind(lease_id)
            .bind(now_ms)
            .fetch_all(tx.as_mut())
            .await?;
        rows.sort_by_key(|row| row.seq);

        Ok(Some(EndedLease {
            lease: row.try_into()?,
            discarded: rows
                .into_iter()
                .map(CommandRecord::try_from)
                .collect::<StoreResult<_>>()?,
        }))
    }
}

#[derive(Debug, FromRow)]
struct DeviceRow {
    device_id: String,
    moderator_id: i64,
    device_name: String,
    client_version: String,
    credential_hash: String,
    revoked: bool,
    paired_at_ms: i64,
    revoked_at_ms: Option<i64>,
}

impl From<DeviceRow> for DeviceRecord {
    fn from(row: DeviceRow) -> Self {
        DeviceRecord {
            device_id: row.device_id,
            moderator_id: row.moderator_id,
            device_name: row.device_name,
            client_version: row.client_version,
            credential_hash: row.credential_hash,
            revoked: row.revoked,
            paired_at_ms: row.paired_at_ms,
            revoked_at_ms: row.revoked_at_ms,
        }
    }
}

#[derive(Debug, FromRow)]
struct LeaseRow {
    lease_id: Uuid,
    device_id: String,
    device_name: String,
    moderator_id: i64,
    token_hash: String,
    issued_at_ms: i64,
    expires_at_ms: i64,
    status: String,
    ended_by: Option<String>,
    ended_at_ms: Option<i64>,
    observed_status: String,
    current_url: Option<String>,
}

impl TryFrom<LeaseRow> for LeaseRecord {
    type Error = StoreError;

    fn try_from(row: LeaseRow) -> Result<Self, Self::Error> {
        let status = LeaseStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("lease status {}", row.status)))?;
        let ended_by = match row.ended_by.as_deref() {
            Some(value) => Some(
                LeaseEnd::parse(value)
                    .ok_or_else(|| StoreError::Corrupt(format!("lease end {value}")))?,
            ),
            None => None,
        };
        Ok(LeaseRecord {
            lease_id: row.lease_id,
            device_id: row.device_id,
            device_name: row.device_name,
            moderator_id: row.moderator_id,
            token_hash: row.token_hash,
            issued_at_ms: row.issued_at_ms,
            expires_at_ms: row.expires_at_ms,
            status,
            ended_by,
            ended_at_ms: row.ended_at_ms,
            observed_status: decode_label(&row.observed_status)?,
            current_url: row.current_url,
        })
    }
}

#[derive(Debug, FromRow)]
struct CommandRow {
    seq: i64,
    command_id: Uuid,
    lease_id: Uuid,
    moderator_id: i64,
    command_type: String,
    payload: Json<serde_json::Value>,
    created_at_ms: i64,
    state: String,
    result: Option<Json<CommandResult>>,
    discarded: bool,
    updated_at_ms: i64,
}

impl TryFrom<CommandRow> for CommandRecord {
    type Error = StoreError;

    fn try_from(row: CommandRow) -> Result<Self, Self::Error> {
        let command_type: CommandType = decode_label(&row.command_type)?;
        let state = CommandState::parse(&row.state)
            .ok_or_else(|| StoreError::Corrupt(format!("command state {}", row.state)))?;
        Ok(CommandRecord {
            command: Command {
                id: row.command_id,
                lease_id: row.lease_id,
                command_type,
                payload: row.payload.0,
                created_at_ms: row.created_at_ms,
            },
            moderator_id: row.moderator_id,
            state,
            result: row.result.map(|Json(result)| result),
            discarded: row.discarded,
            updated_at_ms: row.updated_at_ms,
        })
    }
}

#[derive(Debug, FromRow)]
struct EventRow {
    id: Uuid,
    moderator_id: i64,
    lease_id: Uuid,
    device_id: String,
    kind: String,
    detail: Option<String>,
    at_ms: i64,
}

impl TryFrom<EventRow> for LeaseEvent {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let kind = LeaseEventKind::parse(&row.kind)
            .ok_or_else(|| StoreError::Corrupt(format!("event kind {}", row.kind)))?;
        Ok(LeaseEvent {
            id: row.id,
            moderator_id: row.moderator_id,
            lease_id: row.lease_id,
            device_id: row.device_id,
            kind,
            detail: row.detail,
            at_ms: row.at_ms,
        })
    }
}

/// Decodes a snake_case enum label stored as plain text.
fn decode_label<T: serde::de::DeserializeOwned>(label: &str) -> StoreResult<T> {
    Ok(serde_json::from_value(serde_json::Value::String(
        label.to_string(),
    ))?)
}

fn states_before(to: CommandState) -> Vec<String> {
    [
        CommandState::Created,
        CommandState::Dispatched,
        CommandState::Acked,
        CommandState::Completed,
    ]
    .into_iter()
    .filter(|state| *state < to)
    .map(|state| state.as_str().to_string())
    .collect()
}

#[async_trait]
impl CourierStore for PostgresStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn upsert_device(&self, device: DeviceRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO device_identity
                (device_id, moderator_id, device_name, client_version, credential_hash,
                 revoked, paired_at_ms, revoked_at_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (device_id) DO UPDATE SET
                moderator_id = EXCLUDED.moderator_id,
                device_name = EXCLUDED.device_name,
                client_version = EXCLUDED.client_version,
                credential_hash = EXCLUDED.credential_hash,
                revoked = EXCLUDED.revoked,
                paired_at_ms = EXCLUDED.paired_at_ms,
                revoked_at_ms = EXCLUDED.revoked_at_ms
            "#,
        )
        .bind(&device.device_id)
        .bind(device.moderator_id)
        .bind(&device.device_name)
        .bind(&device.client_version)
        .bind(&device.credential_hash)
        .bind(device.revoked)
        .bind(device.paired_at_ms)
        .bind(device.revoked_at_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn device(&self, device_id: &str) -> StoreResult<Option<DeviceRecord>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM device_identity WHERE device_id = $1");
        let row: Option<DeviceRow> = sqlx::query_as(&sql)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(DeviceRecord::from))
    }

    async fn device_by_credential(
        &self,
        credential_hash: &str,
    ) -> StoreResult<Option<DeviceRecord>> {
        let sql =
            format!("SELECT {DEVICE_COLUMNS} FROM device_identity WHERE credential_hash = $1");
        let row: Option<DeviceRow> = sqlx::query_as(&sql)
            .bind(credential_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(DeviceRecord::from))
    }

    async fn revoke_device(
        &self,
        device_id: &str,
        now_ms: i64,
    ) -> StoreResult<Option<DeviceRecord>> {
        let sql = format!(
            "UPDATE device_identity SET revoked = TRUE, \
             revoked_at_ms = COALESCE(revoked_at_ms, $2) \
             WHERE device_id = $1 RETURNING {DEVICE_COLUMNS}"
        );
        let row: Option<DeviceRow> = sqlx::query_as(&sql)
            .bind(device_id)
            .bind(now_ms)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(DeviceRecord::from))
    }

    async fn devices_for_moderator(
        &self,
        moderator_id: ModeratorId,
    ) -> StoreResult<Vec<DeviceRecord>> {
        let sql = format!(
            "SELECT {DEVICE_COLUMNS} FROM device_identity WHERE moderator_id = $1 \
             ORDER BY paired_at_ms ASC"
        );
        let rows: Vec<DeviceRow> = sqlx::query_as(&sql)
            .bind(moderator_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(DeviceRecord::from).collect())
    }

    async fn insert_pairing_code(&self, code: PairingCodeRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO pairing_code (code_hash, moderator_id, expires_at_ms) VALUES ($1, $2, $3)",
        )
        .bind(&code.code_hash)
        .bind(code.moderator_id)
        .bind(code.expires_at_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consume_pairing_code(
        &self,
        code_hash: &str,
        now_ms: i64,
    ) -> StoreResult<Option<PairingCodeRecord>> {
        let row: Option<(String, i64, i64)> = sqlx::query_as(
            "DELETE FROM pairing_code WHERE code_hash = $1 \
             RETURNING code_hash, moderator_id, expires_at_ms",
        )
        .bind(code_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .map(|(code_hash, moderator_id, expires_at_ms)| PairingCodeRecord {
                code_hash,
                moderator_id,
                expires_at_ms,
            })
            .filter(|code| now_ms < code.expires_at_ms))
    }

    async fn acquire_lease(
        &self,
        candidate: LeaseRecord,
        force_takeover: bool,
        now_ms: i64,
    ) -> StoreResult<AcquireOutcome> {
        let mut tx = self.pool.begin().await?;
        // Serialises acquisitions for one moderator, including the no-holder case.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(candidate.moderator_id)
            .execute(tx.as_mut())
            .await?;

        let sql = format!(
            "SELECT {LEASE_COLUMNS} FROM device_lease \
             WHERE moderator_id = $1 AND status = 'active' FOR UPDATE"
        );
        let current: Option<LeaseRow> = sqlx::query_as(&sql)
            .bind(candidate.moderator_id)
            .fetch_optional(tx.as_mut())
            .await?;

        let replaced = match current.map(LeaseRecord::try_from).transpose()? {
            Some(holder) if holder.is_live(now_ms) => {
                if !force_takeover && holder.device_id != candidate.device_id {
                    tx.rollback().await?;
                    return Ok(AcquireOutcome::Conflict { holder });
                }
                Self::end_lease_tx(&mut tx, holder.lease_id, LeaseEnd::TakenOver, now_ms).await?
            }
            Some(stale) => {
                Self::end_lease_tx(&mut tx, stale.lease_id, LeaseEnd::Expired, now_ms).await?
            }
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO device_lease
                (lease_id, device_id, device_name, moderator_id, token_hash, issued_at_ms,
                 expires_at_ms, status, observed_status, current_url)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'active', $8, $9)
            "#,
        )
        .bind(candidate.lease_id)
        .bind(&candidate.device_id)
        .bind(&candidate.device_name)
        .bind(candidate.moderator_id)
        .bind(&candidate.token_hash)
        .bind(candidate.issued_at_ms)
        .bind(candidate.expires_at_ms)
        .bind(candidate.observed_status.as_str())
        .bind(&candidate.current_url)
        .execute(tx.as_mut())
        .await?;
        tx.commit().await?;

        Ok(AcquireOutcome::Granted {
            lease: candidate,
            replaced,
        })
    }

    async fn lease(&self, lease_id: Uuid) -> StoreResult<Option<LeaseRecord>> {
        let sql = format!("SELECT {LEASE_COLUMNS} FROM device_lease WHERE lease_id = $1");
        let row: Option<LeaseRow> = sqlx::query_as(&sql)
            .bind(lease_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(LeaseRecord::try_from).transpose()
    }

    async fn lease_by_token(&self, token_hash: &str) -> StoreResult<Option<LeaseRecord>> {
        let sql = format!("SELECT {LEASE_COLUMNS} FROM device_lease WHERE token_hash = $1");
        let row: Option<LeaseRow> = sqlx::query_as(&sql)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.map(LeaseRecord::try_from).transpose()
    }

    async fn live_lease_for_moderator(
        &self,
        moderator_id: ModeratorId,
        now_ms: i64,
    ) -> StoreResult<Option<LeaseRecord>> {
        let sql = format!(
            "SELECT {LEASE_COLUMNS} FROM device_lease \
             WHERE moderator_id = $1 AND status = 'active' AND expires_at_ms > $2"
        );
        let row: Option<LeaseRow> = sqlx::query_as(&sql)
            .bind(moderator_id)
            .bind(now_ms)
            .fetch_optional(&self.pool)
            .await?;
        row.map(LeaseRecord::try_from).transpose()
    }

    async fn active_lease_for_device(&self, device_id: &str) -> StoreResult<Option<LeaseRecord>> {
        let sql = format!(
            "SELECT {LEASE_COLUMNS} FROM device_lease WHERE device_id = $1 AND status = 'active'"
        );
        let row: Option<LeaseRow> = sqlx::query_as(&sql)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(LeaseRecord::try_from).transpose()
    }

    async fn renew_lease(
        &self,
        lease_id: Uuid,
        expires_at_ms: i64,
        observed_status: ConnectionStatus,
        current_url: Option<String>,
        now_ms: i64,
    ) -> StoreResult<Option<LeaseRecord>> {
        let sql = format!(
            "UPDATE device_lease SET expires_at_ms = $2, observed_status = $3, current_url = $4 \
             WHERE lease_id = $1 AND status = 'active' AND expires_at_ms > $5 \
             RETURNING {LEASE_COLUMNS}"
        );
        let row: Option<LeaseRow> = sqlx::query_as(&sql)
            .bind(lease_id)
            .bind(expires_at_ms)
            .bind(observed_status.as_str())
            .bind(current_url)
            .bind(now_ms)
            .fetch_optional(&self.pool)
            .await?;
        row.map(LeaseRecord::try_from).transpose()
    }

    async fn end_lease(
        &self,
        lease_id: Uuid,
        end: LeaseEnd,
        now_ms: i64,
    ) -> StoreResult<Option<EndedLease>> {
        let mut tx = self.pool.begin().await?;
        let ended = Self::end_lease_tx(&mut tx, lease_id, end, now_ms).await?;
        tx.commit().await?;
        Ok(ended)
    }

    async fn leases_past_expiry(&self, now_ms: i64) -> StoreResult<Vec<LeaseRecord>> {
        let sql = format!(
            "SELECT {LEASE_COLUMNS} FROM device_lease \
             WHERE status = 'active' AND expires_at_ms <= $1"
        );
        let rows: Vec<LeaseRow> = sqlx::query_as(&sql)
            .bind(now_ms)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(LeaseRecord::try_from).collect()
    }

    async fn insert_command(&self, record: CommandRecord, now_ms: i64) -> StoreResult<bool> {
        // FOR SHARE serializes against end_lease's row update, so a command either lands
        // before the discard sweep or not at all.
        let inserted = sqlx::query(
            r#"
            INSERT INTO lease_command
                (command_id, lease_id, moderator_id, command_type, payload, created_at_ms,
                 state, result, discarded, updated_at_ms)
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10
            FROM device_lease
            WHERE lease_id = $2 AND status = 'active' AND expires_at_ms > $11
            FOR SHARE
            "#,
        )
        .bind(record.command.id)
        .bind(record.command.lease_id)
        .bind(record.moderator_id)
        .bind(record.command.command_type.as_str())
        .bind(Json(&record.command.payload))
        .bind(record.command.created_at_ms)
        .bind(record.state.as_str())
        .bind(record.result.as_ref().map(Json))
        .bind(record.discarded)
        .bind(record.updated_at_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(inserted == 1)
    }

    async fn command(&self, command_id: Uuid) -> StoreResult<Option<CommandRecord>> {
        let sql = format!("SELECT {COMMAND_COLUMNS} FROM lease_command WHERE command_id = $1");
        let row: Option<CommandRow> = sqlx::query_as(&sql)
            .bind(command_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(CommandRecord::try_from).transpose()
    }

    async fn pending_commands(&self, lease_id: Uuid) -> StoreResult<Vec<CommandRecord>> {
        let sql = format!(
            "SELECT {COMMAND_COLUMNS} FROM lease_command \
             WHERE lease_id = $1 AND discarded = FALSE AND state IN ('created', 'dispatched') \
             ORDER BY seq ASC"
        );
        let rows: Vec<CommandRow> = sqlx::query_as(&sql)
            .bind(lease_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(CommandRecord::try_from).collect()
    }

    async fn advance_command(
        &self,
        command_id: Uuid,
        to: CommandState,
        result: Option<CommandResult>,
        now_ms: i64,
    ) -> StoreResult<AdvanceOutcome> {
        let sql = format!(
            "UPDATE lease_command SET state = $2, result = COALESCE(result, $3), \
             updated_at_ms = $4 WHERE command_id = $1 AND state = ANY($5) AND discarded = FALSE \
             RETURNING {COMMAND_COLUMNS}"
        );
        let row: Option<CommandRow> = sqlx::query_as(&sql)
            .bind(command_id)
            .bind(to.as_str())
            .bind(result.as_ref().map(Json))
            .bind(now_ms)
            .bind(states_before(to))
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = row {
            return Ok(AdvanceOutcome::Advanced(row.try_into()?));
        }
        Ok(match self.command(command_id).await? {
            Some(current) => AdvanceOutcome::Unchanged(current),
            None => AdvanceOutcome::NotFound,
        })
    }

    async fn append_event(&self, event: LeaseEvent) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO lease_event (id, moderator_id, lease_id, device_id, kind, detail, at_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id)
        .bind(event.moderator_id)
        .bind(event.lease_id)
        .bind(&event.device_id)
        .bind(event.kind.as_str())
        .bind(&event.detail)
        .bind(event.at_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn lease_events(
        &self,
        moderator_id: ModeratorId,
        limit: usize,
    ) -> StoreResult<Vec<LeaseEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT id, moderator_id, lease_id, device_id, kind, detail, at_ms
            FROM lease_event
            WHERE moderator_id = $1
            ORDER BY seq DESC
            LIMIT $2
            "#,
        )
        .bind(moderator_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LeaseEvent::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_before_excludes_target_and_later() {
        assert_eq!(states_before(CommandState::Acked), vec!["created", "dispatched"]);
        assert!(states_before(CommandState::Created).is_empty());
    }

    #[test]
    fn labels_decode_through_serde() {
        let status: ConnectionStatus = decode_label("qr_pending").unwrap();
        assert_eq!(status, ConnectionStatus::QrPending);
        let kind: CommandType = decode_label("check_whatsapp_number").unwrap();
        assert_eq!(kind, CommandType::CheckWhatsAppNumber);
        assert!(decode_label::<CommandType>("teleport").is_err());
    }

    // Requires a reachable database: DATABASE_URL=postgres://... cargo test -- --ignored
    #[tokio::test]
    #[ignore]
    async fn postgres_enforces_single_active_lease() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
        let store = PostgresStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        let moderator_id: ModeratorId = rand::random::<u32>() as i64;
        for device in ["pg-a", "pg-b"] {
            store
                .upsert_device(DeviceRecord {
                    device_id: format!("{device}-{moderator_id}"),
                    moderator_id,
                    device_name: device.into(),
                    client_version: "test".into(),
                    credential_hash: format!("{device}-{moderator_id}-hash"),
                    revoked: false,
                    paired_at_ms: 0,
                    revoked_at_ms: None,
                })
                .await
                .unwrap();
        }
        let lease = |device: &str| LeaseRecord {
            lease_id: Uuid::new_v4(),
            device_id: format!("{device}-{moderator_id}"),
            device_name: device.into(),
            moderator_id,
            token_hash: "t".into(),
            issued_at_ms: 0,
            expires_at_ms: i64::MAX,
            status: LeaseStatus::Active,
            ended_by: None,
            ended_at_ms: None,
            observed_status: ConnectionStatus::Unknown,
            current_url: None,
        };
        store.acquire_lease(lease("pg-a"), false, 1).await.unwrap();
        let outcome = store.acquire_lease(lease("pg-b"), false, 2).await.unwrap();
        assert!(matches!(outcome, AcquireOutcome::Conflict { .. }));
        let outcome = store.acquire_lease(lease("pg-b"), true, 3).await.unwrap();
        assert!(matches!(outcome, AcquireOutcome::Granted { replaced: Some(_), .. }));
    }
}
