//! Postgres-backed journal store.
//!
//! ## Locking
//!
//! Each commit runs in one transaction that row-locks exactly the balance
//! rows it touches (`SELECT … FOR UPDATE`, ordered by account code). Two
//! commits on the same account serialise; commits on disjoint accounts run in
//! parallel. Ordering the locks by code keeps concurrent commits from
//! deadlocking each other.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JournalStoreError |
//! |------------|----------------------|-------------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (serialization failure) | `40001` | `Conflict` |
//! | Database (deadlock detected) | `40P01` | `Conflict` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / RowNotFound / other | N/A | `Storage` |
//!
//! Business rejections (unbalanced entry, unknown account, receivable floor,
//! reversal rules) surface as `JournalStoreError::Ledger` and roll the
//! transaction back.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use vikoba_accounting::{
    Account, AccountKey, Balances, ChartOfAccounts, CommittedEntry, JournalEntry, JournalEntryId, JournalLine,
    JournalSnapshot, LedgerError, OrphanedLine, Side, SourceRef,
};
use vikoba_core::{DomainError, GroupId, MemberId, Money};

use super::{JournalStore, JournalStoreError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS ledger_members (
        group_id      UUID NOT NULL,
        member_id     UUID NOT NULL,
        registered_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (group_id, member_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ledger_accounts (
        group_id   UUID NOT NULL,
        code       TEXT NOT NULL,
        name       TEXT NOT NULL,
        category   TEXT NOT NULL,
        member_id  UUID NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (group_id, code)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ledger_account_balances (
        group_id   UUID NOT NULL,
        code       TEXT NOT NULL,
        balance    BIGINT NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (group_id, code),
        FOREIGN KEY (group_id, code) REFERENCES ledger_accounts (group_id, code)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS journal_entries (
        sequence_number BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
        entry_id        UUID NOT NULL UNIQUE,
        commit_id       UUID NOT NULL,
        group_id        UUID NOT NULL,
        occurred_at     TIMESTAMPTZ NOT NULL,
        source_kind     TEXT NOT NULL,
        source_id       TEXT NOT NULL,
        member_id       UUID NULL,
        memo            TEXT NOT NULL,
        reverses        UUID NULL UNIQUE,
        committed_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS journal_entries_group_seq
        ON journal_entries (group_id, sequence_number)
    "#,
    // No foreign key to journal_entries: migrated lines are loaded in bulk and
    // lines without an entry are reported by the integrity sweep.
    r#"
    CREATE TABLE IF NOT EXISTS journal_lines (
        entry_id     UUID NOT NULL,
        line_no      INT NOT NULL,
        group_id     UUID NOT NULL,
        account_code TEXT NOT NULL,
        side         TEXT NOT NULL CHECK (side IN ('debit', 'credit')),
        amount       BIGINT NOT NULL CHECK (amount > 0),
        PRIMARY KEY (entry_id, line_no)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS journal_lines_group_account
        ON journal_lines (group_id, account_code)
    "#,
];

/// Postgres-backed journal store.
///
/// `Send + Sync`; all operations go through the SQLx connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJournalStore {
    pool: Arc<PgPool>,
}

impl PostgresJournalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Connect to `database_url` and make sure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self, JournalStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Create tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JournalStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(group_id = %group_id, member_id = %member), err)]
    pub async fn register(&self, group_id: GroupId, member: MemberId) -> Result<(), JournalStoreError> {
        sqlx::query(
            r#"
            INSERT INTO ledger_members (group_id, member_id)
            VALUES ($1, $2)
            ON CONFLICT (group_id, member_id) DO NOTHING
            "#,
        )
        .bind(group_id.as_uuid())
        .bind(member.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("register_member", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(group_id = %group_id, account = %key), err)]
    pub async fn resolve(&self, group_id: GroupId, key: AccountKey) -> Result<Account, JournalStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        if let Err(err) = provision_account(&mut tx, group_id, key).await {
            return Err(rollback(tx, err).await);
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Account::for_key(key))
    }

    /// Validate and append an entry.
    ///
    /// 1. Structural validation (before any IO)
    /// 2. Provision touched accounts (`ON CONFLICT DO NOTHING`)
    /// 3. Reversal rules, locking the original entry
    /// 4. Lock touched balance rows in code order and check floors
    /// 5. Insert entry and lines, update balances, commit
    #[instrument(
        skip(self, entry),
        fields(
            group_id = %entry.group_id,
            entry_id = %entry.id,
            line_count = entry.lines.len(),
            sequence = tracing::field::Empty
        ),
        err
    )]
    pub async fn commit_entry(&self, entry: JournalEntry) -> Result<CommittedEntry, JournalStoreError> {
        entry.validate()?;

        let span = Span::current();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let commit_id = Uuid::now_v7();
        match write_entry(&mut tx, commit_id, &entry).await {
            Ok(sequence) => {
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("commit_transaction", e))?;
                span.record("sequence", sequence);
                tracing::debug!(sequence, "journal entry committed");
                Ok(CommittedEntry {
                    commit_id,
                    sequence,
                    entry,
                })
            }
            Err(err) => Err(rollback(tx, err).await),
        }
    }

    #[instrument(skip(self), fields(group_id = %group_id, entry_id = %id), err)]
    pub async fn load_entry(
        &self,
        group_id: GroupId,
        id: JournalEntryId,
    ) -> Result<Option<JournalEntry>, JournalStoreError> {
        let row = sqlx::query(
            r#"
            SELECT entry_id, occurred_at, source_kind, source_id, member_id, memo, reverses
            FROM journal_entries
            WHERE group_id = $1 AND entry_id = $2
            "#,
        )
        .bind(group_id.as_uuid())
        .bind(id.0.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_entry", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let line_rows = sqlx::query(
            r#"
            SELECT account_code, side, amount
            FROM journal_lines
            WHERE entry_id = $1
            ORDER BY line_no ASC
            "#,
        )
        .bind(id.0.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_lines", e))?;

        let lines = line_rows.iter().map(line_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(Some(entry_from_row(&row, group_id, lines)?))
    }

    #[instrument(skip(self), fields(group_id = %group_id, account = %key), err)]
    pub async fn load_balance(
        &self,
        group_id: GroupId,
        key: AccountKey,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Money, JournalStoreError> {
        let code = key.to_string();
        let Some(as_of) = as_of else {
            let balance: Option<i64> = sqlx::query_scalar(
                "SELECT balance FROM ledger_account_balances WHERE group_id = $1 AND code = $2",
            )
            .bind(group_id.as_uuid())
            .bind(&code)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_balance", e))?;
            return Ok(Money::from_minor(balance.unwrap_or(0)));
        };

        let net_debit: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(CASE WHEN l.side = 'debit' THEN l.amount ELSE -l.amount END), 0)::BIGINT
            FROM journal_lines l
            JOIN journal_entries e ON e.entry_id = l.entry_id
            WHERE e.group_id = $1 AND l.account_code = $2 AND e.occurred_at <= $3
            "#,
        )
        .bind(group_id.as_uuid())
        .bind(&code)
        .bind(as_of)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_balance_as_of", e))?;

        Ok(match key.category().normal_side() {
            Side::Debit => Money::from_minor(net_debit),
            Side::Credit => Money::from_minor(-net_debit),
        })
    }

    /// Read the whole journal in one `REPEATABLE READ READ ONLY` transaction.
    #[instrument(
        skip(self),
        fields(group_id = %group_id, entry_count = tracing::field::Empty),
        err
    )]
    pub async fn load_snapshot(&self, group_id: GroupId) -> Result<JournalSnapshot, JournalStoreError> {
        let span = Span::current();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_isolation", e))?;

        let snapshot = read_snapshot(&mut tx, group_id).await;
        // Read-only; ending the transaction either way releases the snapshot.
        tx.rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))?;

        let snapshot = snapshot?;
        span.record("entry_count", snapshot.entries.len());
        Ok(snapshot)
    }
}

#[async_trait]
impl JournalStore for PostgresJournalStore {
    async fn register_member(&self, group_id: GroupId, member: MemberId) -> Result<(), JournalStoreError> {
        self.register(group_id, member).await
    }

    async fn resolve_account(&self, group_id: GroupId, key: AccountKey) -> Result<Account, JournalStoreError> {
        self.resolve(group_id, key).await
    }

    async fn commit(&self, entry: JournalEntry) -> Result<CommittedEntry, JournalStoreError> {
        self.commit_entry(entry).await
    }

    async fn entry(
        &self,
        group_id: GroupId,
        id: JournalEntryId,
    ) -> Result<Option<JournalEntry>, JournalStoreError> {
        self.load_entry(group_id, id).await
    }

    async fn balance_of(
        &self,
        group_id: GroupId,
        key: AccountKey,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Money, JournalStoreError> {
        self.load_balance(group_id, key, as_of).await
    }

    async fn snapshot(&self, group_id: GroupId) -> Result<JournalSnapshot, JournalStoreError> {
        self.load_snapshot(group_id).await
    }
}

async fn rollback(tx: Transaction<'_, Postgres>, err: JournalStoreError) -> JournalStoreError {
    if let Err(rollback_err) = tx.rollback().await {
        tracing::error!(error = %rollback_err, "rollback failed");
    }
    if let JournalStoreError::Ledger(ledger_err) = &err {
        tracing::warn!(error = %ledger_err, "journal entry rejected");
    }
    err
}

/// Provision `key` for `group_id` inside `tx`. Member accounts require the
/// member to be registered.
async fn provision_account(
    tx: &mut Transaction<'_, Postgres>,
    group_id: GroupId,
    key: AccountKey,
) -> Result<(), JournalStoreError> {
    if let Some(member) = key.member_id() {
        let registered: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM ledger_members WHERE group_id = $1 AND member_id = $2",
        )
        .bind(group_id.as_uuid())
        .bind(member.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("check_member", e))?;
        if registered.is_none() {
            return Err(LedgerError::UnknownAccount(key).into());
        }
    }

    let account = Account::for_key(key);
    sqlx::query(
        r#"
        INSERT INTO ledger_accounts (group_id, code, name, category, member_id)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (group_id, code) DO NOTHING
        "#,
    )
    .bind(group_id.as_uuid())
    .bind(&account.code)
    .bind(&account.name)
    .bind(account.category.as_str())
    .bind(key.member_id().map(|m| *m.as_uuid()))
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("provision_account", e))?;

    sqlx::query(
        r#"
        INSERT INTO ledger_account_balances (group_id, code, balance)
        VALUES ($1, $2, 0)
        ON CONFLICT (group_id, code) DO NOTHING
        "#,
    )
    .bind(group_id.as_uuid())
    .bind(&account.code)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("provision_balance", e))?;

    Ok(())
}

async fn check_reversal(
    tx: &mut Transaction<'_, Postgres>,
    group_id: GroupId,
    original: JournalEntryId,
) -> Result<(), JournalStoreError> {
    let row = sqlx::query(
        "SELECT reverses FROM journal_entries WHERE group_id = $1 AND entry_id = $2 FOR UPDATE",
    )
    .bind(group_id.as_uuid())
    .bind(original.0.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_original", e))?;

    let Some(row) = row else {
        return Err(DomainError::not_found().into());
    };
    let reverses: Option<Uuid> = row.try_get("reverses").map_err(corrupt)?;
    if reverses.is_some() {
        return Err(DomainError::conflict("a reversal cannot itself be reversed").into());
    }

    let existing: Option<Uuid> =
        sqlx::query_scalar("SELECT entry_id FROM journal_entries WHERE reverses = $1")
            .bind(original.0.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("check_reversed", e))?;
    if existing.is_some() {
        return Err(DomainError::conflict(format!("journal entry {original} already reversed")).into());
    }
    Ok(())
}

/// Everything a commit writes. Returns the assigned sequence number.
async fn write_entry(
    tx: &mut Transaction<'_, Postgres>,
    commit_id: Uuid,
    entry: &JournalEntry,
) -> Result<u64, JournalStoreError> {
    let group_id = entry.group_id;
    let keys: BTreeSet<AccountKey> = entry.lines.iter().map(|l| l.account).collect();
    let mut touched: Vec<(String, AccountKey)> = keys.into_iter().map(|k| (k.to_string(), k)).collect();
    touched.sort();
    let codes: Vec<String> = touched.iter().map(|(code, _)| code.clone()).collect();

    for (_, key) in &touched {
        provision_account(tx, group_id, *key).await?;
    }

    if let Some(original) = entry.reverses {
        check_reversal(tx, group_id, original).await?;
    }

    let rows = sqlx::query(
        r#"
        SELECT code, balance
        FROM ledger_account_balances
        WHERE group_id = $1 AND code = ANY($2)
        ORDER BY code
        FOR UPDATE
        "#,
    )
    .bind(group_id.as_uuid())
    .bind(&codes)
    .fetch_all(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_balances", e))?;

    let mut current = Balances::new();
    for row in &rows {
        let code: String = row.try_get("code").map_err(corrupt)?;
        let balance: i64 = row.try_get("balance").map_err(corrupt)?;
        current.set(parse_key(&code)?, Money::from_minor(balance));
    }
    let next = current.preview(entry)?;

    let sequence: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO journal_entries (
            entry_id, commit_id, group_id, occurred_at, source_kind, source_id, member_id, memo, reverses
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING sequence_number
        "#,
    )
    .bind(entry.id.0.as_uuid())
    .bind(commit_id)
    .bind(group_id.as_uuid())
    .bind(entry.occurred_at)
    .bind(entry.source.kind())
    .bind(entry.source.id_string())
    .bind(entry.member.map(|m| *m.as_uuid()))
    .bind(&entry.memo)
    .bind(entry.reverses.map(|r| *r.0.as_uuid()))
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            JournalStoreError::from(DomainError::conflict(format!(
                "journal entry {} already committed",
                entry.id
            )))
        } else {
            map_sqlx_error("insert_entry", e)
        }
    })?;

    for (line_no, line) in entry.lines.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO journal_lines (entry_id, line_no, group_id, account_code, side, amount)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id.0.as_uuid())
        .bind(line_no as i32)
        .bind(group_id.as_uuid())
        .bind(line.account.to_string())
        .bind(line.side.as_str())
        .bind(line.amount.minor())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_line", e))?;
    }

    for (key, balance) in next {
        sqlx::query(
            r#"
            UPDATE ledger_account_balances
            SET balance = $3, updated_at = NOW()
            WHERE group_id = $1 AND code = $2
            "#,
        )
        .bind(group_id.as_uuid())
        .bind(key.to_string())
        .bind(balance.minor())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update_balance", e))?;
    }

    Ok(sequence as u64)
}

async fn read_snapshot(
    tx: &mut Transaction<'_, Postgres>,
    group_id: GroupId,
) -> Result<JournalSnapshot, JournalStoreError> {
    let mut chart = ChartOfAccounts::standard(group_id);

    let members: Vec<Uuid> =
        sqlx::query_scalar("SELECT member_id FROM ledger_members WHERE group_id = $1 ORDER BY member_id")
            .bind(group_id.as_uuid())
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("load_members", e))?;
    for member in members {
        chart.register_member(MemberId::from_uuid(member));
    }

    let codes: Vec<String> =
        sqlx::query_scalar("SELECT code FROM ledger_accounts WHERE group_id = $1 ORDER BY code")
            .bind(group_id.as_uuid())
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("load_accounts", e))?;
    for code in codes {
        let key = parse_key(&code)?;
        if chart.resolve_or_provision(&key).is_err() {
            tracing::warn!(account = %code, "account row for unregistered member");
        }
    }

    let line_rows = sqlx::query(
        r#"
        SELECT entry_id, account_code, side, amount
        FROM journal_lines
        WHERE group_id = $1
        ORDER BY entry_id, line_no
        "#,
    )
    .bind(group_id.as_uuid())
    .fetch_all(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("load_lines", e))?;

    let mut lines: HashMap<Uuid, Vec<JournalLine>> = HashMap::new();
    for row in &line_rows {
        let entry_id: Uuid = row.try_get("entry_id").map_err(corrupt)?;
        lines.entry(entry_id).or_default().push(line_from_row(row)?);
    }

    let entry_rows = sqlx::query(
        r#"
        SELECT sequence_number, commit_id, entry_id, occurred_at, source_kind, source_id,
               member_id, memo, reverses
        FROM journal_entries
        WHERE group_id = $1
        ORDER BY sequence_number ASC
        "#,
    )
    .bind(group_id.as_uuid())
    .fetch_all(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("load_entries", e))?;

    let mut entries = Vec::with_capacity(entry_rows.len());
    let mut last_sequence = 0u64;
    for row in &entry_rows {
        let entry_id: Uuid = row.try_get("entry_id").map_err(corrupt)?;
        let sequence: i64 = row.try_get("sequence_number").map_err(corrupt)?;
        let commit_id: Uuid = row.try_get("commit_id").map_err(corrupt)?;
        let entry = entry_from_row(row, group_id, lines.remove(&entry_id).unwrap_or_default())?;
        last_sequence = sequence as u64;
        entries.push(CommittedEntry {
            commit_id,
            sequence: last_sequence,
            entry,
        });
    }

    let mut orphaned_lines: Vec<OrphanedLine> = lines
        .into_iter()
        .flat_map(|(entry_id, lines)| lines.into_iter().map(move |line| OrphanedLine { entry_id, line }))
        .collect();
    orphaned_lines.sort_by(|a, b| (a.entry_id, a.line.account).cmp(&(b.entry_id, b.line.account)));

    let balance_rows = sqlx::query("SELECT code, balance FROM ledger_account_balances WHERE group_id = $1")
        .bind(group_id.as_uuid())
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("load_balances", e))?;
    let mut cached_balances = Balances::new();
    for row in &balance_rows {
        let code: String = row.try_get("code").map_err(corrupt)?;
        let balance: i64 = row.try_get("balance").map_err(corrupt)?;
        cached_balances.set(parse_key(&code)?, Money::from_minor(balance));
    }

    Ok(JournalSnapshot {
        group_id,
        taken_at: Utc::now(),
        last_sequence,
        chart,
        entries,
        cached_balances,
        orphaned_lines,
    })
}

fn entry_from_row(
    row: &PgRow,
    group_id: GroupId,
    lines: Vec<JournalLine>,
) -> Result<JournalEntry, JournalStoreError> {
    let entry_id: Uuid = row.try_get("entry_id").map_err(corrupt)?;
    let occurred_at: DateTime<Utc> = row.try_get("occurred_at").map_err(corrupt)?;
    let source_kind: String = row.try_get("source_kind").map_err(corrupt)?;
    let source_id: String = row.try_get("source_id").map_err(corrupt)?;
    let member_id: Option<Uuid> = row.try_get("member_id").map_err(corrupt)?;
    let memo: String = row.try_get("memo").map_err(corrupt)?;
    let reverses: Option<Uuid> = row.try_get("reverses").map_err(corrupt)?;

    let source = SourceRef::from_parts(&source_kind, &source_id).map_err(corrupt)?;
    Ok(JournalEntry {
        id: JournalEntryId(entry_id.into()),
        group_id,
        occurred_at,
        source,
        member: member_id.map(MemberId::from_uuid),
        memo,
        lines,
        reverses: reverses.map(|r| JournalEntryId(r.into())),
    })
}

fn line_from_row(row: &PgRow) -> Result<JournalLine, JournalStoreError> {
    let code: String = row.try_get("account_code").map_err(corrupt)?;
    let side: String = row.try_get("side").map_err(corrupt)?;
    let amount: i64 = row.try_get("amount").map_err(corrupt)?;
    Ok(JournalLine {
        account: parse_key(&code)?,
        side: side.parse::<Side>().map_err(corrupt)?,
        amount: Money::from_minor(amount),
    })
}

fn parse_key(code: &str) -> Result<AccountKey, JournalStoreError> {
    code.parse::<AccountKey>().map_err(corrupt)
}

fn corrupt(err: impl core::fmt::Display) -> JournalStoreError {
    JournalStoreError::Corrupt(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// Map SQLx errors to JournalStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JournalStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Unique violation, serialization failure, deadlock
                Some("23505") | Some("40001") | Some("40P01") => JournalStoreError::Conflict(msg),
                _ => JournalStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JournalStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            JournalStoreError::Storage(format!("unexpected row not found in {}", operation))
        }
        _ => JournalStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_statements_are_idempotent() {
        for statement in SCHEMA {
            assert!(statement.contains("IF NOT EXISTS"), "{statement}");
        }
    }

    #[test]
    fn closed_pool_maps_to_storage() {
        let err = map_sqlx_error("insert_entry", sqlx::Error::PoolClosed);
        assert!(matches!(err, JournalStoreError::Storage(_)));
    }
}
