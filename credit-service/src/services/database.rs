//! PostgreSQL ledger store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use super::metrics::DB_QUERY_DURATION;
use super::store::LedgerStore;
use crate::models::{
    AccountFlags, CloudAccount, Coupon, CouponRedemption, CreditGrant, EnrollAccount, Instance,
    InvalidMeteringRecord, InvalidRecordFilter, NotificationState, RedeemOutcome, UsageEntry,
    account::generate_account_id,
};

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

// =============================================================================
// Rows
// =============================================================================

#[derive(sqlx::FromRow)]
struct AccountRow {
    cloud_account_id: String,
    account_type: String,
    country_code: String,
    paid_services_allowed: bool,
    low_credits: bool,
    terminate_paid_services: bool,
    credits_depleted: DateTime<Utc>,
    created_utc: DateTime<Utc>,
}

impl TryFrom<AccountRow> for CloudAccount {
    type Error = AppError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.cloud_account_id,
            account_type: row.account_type.parse().map_err(AppError::DatabaseError)?,
            country_code: row.country_code,
            flags: AccountFlags {
                paid_services_allowed: row.paid_services_allowed,
                low_credits: row.low_credits,
                terminate_paid_services: row.terminate_paid_services,
                credits_depleted: row.credits_depleted,
            },
            created_at: row.created_utc,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LatchRow {
    threshold80_sent: bool,
    threshold100_sent: bool,
    expired_notified_through: DateTime<Utc>,
}

impl From<LatchRow> for NotificationState {
    fn from(row: LatchRow) -> Self {
        Self {
            threshold80_sent: row.threshold80_sent,
            threshold100_sent: row.threshold100_sent,
            expired_notified_through: row.expired_notified_through,
        }
    }
}

#[derive(sqlx::FromRow)]
struct GrantRow {
    grant_id: Uuid,
    cloud_account_id: String,
    reason: String,
    coupon_code: Option<String>,
    original_amount: Decimal,
    unlimited: bool,
    created_utc: DateTime<Utc>,
    expires_utc: DateTime<Utc>,
}

impl TryFrom<GrantRow> for CreditGrant {
    type Error = AppError;

    fn try_from(row: GrantRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.grant_id,
            cloud_account_id: row.cloud_account_id,
            reason: row.reason.parse().map_err(AppError::DatabaseError)?,
            coupon_code: row.coupon_code,
            original_amount: row.original_amount,
            unlimited: row.unlimited,
            created_at: row.created_utc,
            expires_at: row.expires_utc,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CouponRow {
    code: String,
    amount: Decimal,
    creator: String,
    created_utc: DateTime<Utc>,
    start_utc: DateTime<Utc>,
    expires_utc: DateTime<Utc>,
    num_uses: i32,
    num_redeemed: i32,
    is_standard: bool,
    disabled: bool,
}

impl From<CouponRow> for Coupon {
    fn from(row: CouponRow) -> Self {
        Self {
            code: row.code,
            amount: row.amount,
            creator: row.creator,
            created_at: row.created_utc,
            start: row.start_utc,
            expires: row.expires_utc,
            num_uses: row.num_uses.max(0) as u32,
            num_redeemed: row.num_redeemed.max(0) as u32,
            is_standard: row.is_standard,
            disabled: row.disabled,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RedemptionRow {
    code: String,
    cloud_account_id: String,
    grant_id: Uuid,
    redeemed_utc: DateTime<Utc>,
}

impl From<RedemptionRow> for CouponRedemption {
    fn from(row: RedemptionRow) -> Self {
        Self {
            code: row.code,
            cloud_account_id: row.cloud_account_id,
            grant_id: row.grant_id,
            redeemed_at: row.redeemed_utc,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UsageRow {
    usage_id: Uuid,
    cloud_account_id: String,
    transaction_id: String,
    resource_id: String,
    product_id: String,
    product_type: String,
    usage_utc: DateTime<Utc>,
    running_seconds: Decimal,
    rate: Decimal,
    amount: Decimal,
}

impl From<UsageRow> for UsageEntry {
    fn from(row: UsageRow) -> Self {
        Self {
            id: row.usage_id,
            cloud_account_id: row.cloud_account_id,
            transaction_id: row.transaction_id,
            resource_id: row.resource_id,
            product_id: row.product_id,
            product_type: row.product_type,
            timestamp: row.usage_utc,
            running_seconds: row.running_seconds,
            rate: row.rate,
            amount: row.amount,
        }
    }
}

#[derive(sqlx::FromRow)]
struct InvalidRecordRow {
    record_id: Uuid,
    transaction_id: Option<String>,
    resource_id: Option<String>,
    cloud_account_id: Option<String>,
    product_id: Option<String>,
    quantity: Option<String>,
    record_utc: Option<DateTime<Utc>>,
    invalidity_reason: String,
    recorded_utc: DateTime<Utc>,
}

impl TryFrom<InvalidRecordRow> for InvalidMeteringRecord {
    type Error = AppError;

    fn try_from(row: InvalidRecordRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.record_id,
            transaction_id: row.transaction_id,
            resource_id: row.resource_id,
            cloud_account_id: row.cloud_account_id,
            product_id: row.product_id,
            quantity: row.quantity,
            timestamp: row.record_utc,
            reason: row
                .invalidity_reason
                .parse()
                .map_err(AppError::DatabaseError)?,
            recorded_at: row.recorded_utc,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    instance_id: String,
    cloud_account_id: String,
    product_id: String,
    paid: bool,
    state: String,
    created_utc: DateTime<Utc>,
    terminated_utc: Option<DateTime<Utc>>,
}

impl TryFrom<InstanceRow> for Instance {
    type Error = AppError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.instance_id,
            cloud_account_id: row.cloud_account_id,
            product_id: row.product_id,
            paid: row.paid,
            state: row.state.parse().map_err(AppError::DatabaseError)?,
            created_at: row.created_utc,
            terminated_at: row.terminated_utc,
        })
    }
}

const ACCOUNT_COLUMNS: &str = "cloud_account_id, account_type, country_code, paid_services_allowed, low_credits, terminate_paid_services, credits_depleted, created_utc";
const GRANT_COLUMNS: &str = "grant_id, cloud_account_id, reason, coupon_code, original_amount, unlimited, created_utc, expires_utc";
const COUPON_COLUMNS: &str = "code, amount, creator, created_utc, start_utc, expires_utc, num_uses, num_redeemed, is_standard, disabled";
const USAGE_COLUMNS: &str = "usage_id, cloud_account_id, transaction_id, resource_id, product_id, product_type, usage_utc, running_seconds, rate, amount";
const INSTANCE_COLUMNS: &str = "instance_id, cloud_account_id, product_id, paid, state, created_utc, terminated_utc";

fn into_domain<R, T>(rows: Vec<R>) -> Result<Vec<T>, AppError>
where
    T: TryFrom<R, Error = AppError>,
{
    rows.into_iter().map(T::try_from).collect()
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "credit-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Account Operations
    // =========================================================================

    #[instrument(skip(self, input))]
    async fn enroll_account(
        &self,
        input: &EnrollAccount,
        now: DateTime<Utc>,
    ) -> Result<CloudAccount, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["enroll_account"])
            .start_timer();

        let id = input.id.clone().unwrap_or_else(generate_account_id);
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        sqlx::query(
            r#"
            INSERT INTO cloud_accounts (cloud_account_id, account_type, country_code, created_utc)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (cloud_account_id) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(input.account_type.as_str())
        .bind(&input.country_code)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to enroll account: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO notification_states (cloud_account_id, threshold80_sent, threshold100_sent, expired_notified_through)
            VALUES ($1, FALSE, FALSE, $2)
            ON CONFLICT (cloud_account_id) DO UPDATE
            SET threshold80_sent = FALSE, threshold100_sent = FALSE, expired_notified_through = EXCLUDED.expired_notified_through
            "#,
        )
        .bind(&id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to reset notification state: {}", e))
        })?;

        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {} FROM cloud_accounts WHERE cloud_account_id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(&id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load account: {}", e)))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit enrollment: {}", e))
        })?;

        timer.observe_duration();
        info!(cloud_account_id = %id, "Cloud account enrolled");

        row.try_into()
    }

    #[instrument(skip(self))]
    async fn get_account(&self, id: &str) -> Result<Option<CloudAccount>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_account"])
            .start_timer();

        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {} FROM cloud_accounts WHERE cloud_account_id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get account: {}", e)))?;

        timer.observe_duration();
        row.map(CloudAccount::try_from).transpose()
    }

    #[instrument(skip(self, flags))]
    async fn update_account_flags(&self, id: &str, flags: &AccountFlags) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_account_flags"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE cloud_accounts
            SET paid_services_allowed = $2, low_credits = $3, terminate_paid_services = $4, credits_depleted = $5
            WHERE cloud_account_id = $1
            "#,
        )
        .bind(id)
        .bind(flags.paid_services_allowed)
        .bind(flags.low_credits)
        .bind(flags.terminate_paid_services)
        .bind(flags.credits_depleted)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update flags: {}", e)))?;

        timer.observe_duration();
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Cloud account {} not found",
                id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_ledger_accounts(&self) -> Result<Vec<String>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_ledger_accounts"])
            .start_timer();

        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT cloud_account_id FROM credit_grants
            UNION
            SELECT cloud_account_id FROM usage_entries
            ORDER BY cloud_account_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list ledger accounts: {}", e))
        })?;

        timer.observe_duration();
        Ok(ids)
    }

    #[instrument(skip(self))]
    async fn get_notification_state(
        &self,
        id: &str,
    ) -> Result<Option<NotificationState>, AppError> {
        let row = sqlx::query_as::<_, LatchRow>(
            r#"
            SELECT threshold80_sent, threshold100_sent, expired_notified_through
            FROM notification_states WHERE cloud_account_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get notification state: {}", e))
        })?;

        Ok(row.map(NotificationState::from))
    }

    #[instrument(skip(self, state))]
    async fn save_notification_state(
        &self,
        id: &str,
        state: &NotificationState,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_notification_state"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO notification_states (cloud_account_id, threshold80_sent, threshold100_sent, expired_notified_through)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (cloud_account_id) DO UPDATE
            SET threshold80_sent = EXCLUDED.threshold80_sent,
                threshold100_sent = EXCLUDED.threshold100_sent,
                expired_notified_through = EXCLUDED.expired_notified_through
            "#,
        )
        .bind(id)
        .bind(state.threshold80_sent)
        .bind(state.threshold100_sent)
        .bind(state.expired_notified_through)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to save notification state: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Grant Operations
    // =========================================================================

    #[instrument(skip(self, grant), fields(grant_id = %grant.id))]
    async fn insert_grant(&self, grant: &CreditGrant) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_grant"])
            .start_timer();

        insert_grant_with(&self.pool, grant).await?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_grants(&self, cloud_account_id: &str) -> Result<Vec<CreditGrant>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_grants"])
            .start_timer();

        let rows = sqlx::query_as::<_, GrantRow>(&format!(
            "SELECT {} FROM credit_grants WHERE cloud_account_id = $1 ORDER BY expires_utc, created_utc, grant_id",
            GRANT_COLUMNS
        ))
        .bind(cloud_account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list grants: {}", e)))?;

        timer.observe_duration();
        into_domain(rows)
    }

    // =========================================================================
    // Coupon Operations
    // =========================================================================

    #[instrument(skip(self, coupon), fields(code = %coupon.code))]
    async fn insert_coupon(&self, coupon: &Coupon) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_coupon"])
            .start_timer();

        let result = sqlx::query(
            r#"
            INSERT INTO coupons (code, amount, creator, created_utc, start_utc, expires_utc, num_uses, num_redeemed, is_standard, disabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (code) DO NOTHING
            "#,
        )
        .bind(&coupon.code)
        .bind(coupon.amount)
        .bind(&coupon.creator)
        .bind(coupon.created_at)
        .bind(coupon.start)
        .bind(coupon.expires)
        .bind(coupon.num_uses as i32)
        .bind(coupon.num_redeemed as i32)
        .bind(coupon.is_standard)
        .bind(coupon.disabled)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create coupon: {}", e)))?;

        timer.observe_duration();
        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Coupon {} already exists",
                coupon.code
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_coupon(&self, code: &str) -> Result<Option<Coupon>, AppError> {
        let row = sqlx::query_as::<_, CouponRow>(&format!(
            "SELECT {} FROM coupons WHERE code = $1",
            COUPON_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get coupon: {}", e)))?;

        Ok(row.map(Coupon::from))
    }

    #[instrument(skip(self))]
    async fn set_coupon_disabled(&self, code: &str, disabled: bool) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE coupons SET disabled = $2 WHERE code = $1")
            .bind(code)
            .bind(disabled)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to update coupon: {}", e))
            })?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn list_redemptions(&self, code: &str) -> Result<Vec<CouponRedemption>, AppError> {
        let rows = sqlx::query_as::<_, RedemptionRow>(
            r#"
            SELECT code, cloud_account_id, grant_id, redeemed_utc
            FROM coupon_redemptions WHERE code = $1
            ORDER BY redeemed_utc
            "#,
        )
        .bind(code)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list redemptions: {}", e))
        })?;

        Ok(rows.into_iter().map(CouponRedemption::from).collect())
    }

    #[instrument(skip(self, grant), fields(cloud_account_id = %grant.cloud_account_id))]
    async fn redeem_coupon(
        &self,
        code: &str,
        grant: &CreditGrant,
        now: DateTime<Utc>,
    ) -> Result<RedeemOutcome, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["redeem_coupon"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let counts = sqlx::query_as::<_, (i32, i32)>(
            "SELECT num_uses, num_redeemed FROM coupons WHERE code = $1 FOR UPDATE",
        )
        .bind(code)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock coupon: {}", e)))?;

        let Some((num_uses, num_redeemed)) = counts else {
            return Ok(RedeemOutcome::UnknownCoupon);
        };

        let already = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM coupon_redemptions WHERE code = $1 AND cloud_account_id = $2)",
        )
        .bind(code)
        .bind(&grant.cloud_account_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to check redemption: {}", e))
        })?;

        if already {
            return Ok(RedeemOutcome::AlreadyRedeemed);
        }
        if num_redeemed >= num_uses {
            return Ok(RedeemOutcome::Exhausted);
        }

        sqlx::query("UPDATE coupons SET num_redeemed = num_redeemed + 1 WHERE code = $1")
            .bind(code)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to update coupon: {}", e))
            })?;

        insert_grant_with(&mut *tx, grant).await?;

        sqlx::query(
            r#"
            INSERT INTO coupon_redemptions (code, cloud_account_id, grant_id, redeemed_utc)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(code)
        .bind(&grant.cloud_account_id)
        .bind(grant.id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to record redemption: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit redemption: {}", e))
        })?;

        timer.observe_duration();
        info!(code = %code, grant_id = %grant.id, "Coupon redeemed");

        Ok(RedeemOutcome::Redeemed)
    }

    // =========================================================================
    // Metering Operations
    // =========================================================================

    #[instrument(skip(self, entry), fields(transaction_id = %entry.transaction_id))]
    async fn insert_usage_if_absent(&self, entry: &UsageEntry) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_usage"])
            .start_timer();

        let result = sqlx::query(
            r#"
            INSERT INTO usage_entries (usage_id, cloud_account_id, transaction_id, resource_id, product_id, product_type, usage_utc, running_seconds, rate, amount)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (resource_id, transaction_id) DO NOTHING
            "#,
        )
        .bind(entry.id)
        .bind(&entry.cloud_account_id)
        .bind(&entry.transaction_id)
        .bind(&entry.resource_id)
        .bind(&entry.product_id)
        .bind(&entry.product_type)
        .bind(entry.timestamp)
        .bind(entry.running_seconds)
        .bind(entry.rate)
        .bind(entry.amount)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to record usage: {}", e)))?;

        timer.observe_duration();
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn has_transaction(
        &self,
        resource_id: &str,
        transaction_id: &str,
    ) -> Result<bool, AppError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM usage_entries WHERE resource_id = $1 AND transaction_id = $2)",
        )
        .bind(resource_id)
        .bind(transaction_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to check transaction: {}", e)))
    }

    #[instrument(skip(self))]
    async fn list_usage(&self, cloud_account_id: &str) -> Result<Vec<UsageEntry>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_usage"])
            .start_timer();

        let rows = sqlx::query_as::<_, UsageRow>(&format!(
            "SELECT {} FROM usage_entries WHERE cloud_account_id = $1 ORDER BY usage_utc, usage_id",
            USAGE_COLUMNS
        ))
        .bind(cloud_account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list usage: {}", e)))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(UsageEntry::from).collect())
    }

    #[instrument(skip(self, record), fields(reason = %record.reason))]
    async fn insert_invalid_record(&self, record: &InvalidMeteringRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO invalid_metering_records (record_id, transaction_id, resource_id, cloud_account_id, product_id, quantity, record_utc, invalidity_reason, recorded_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id)
        .bind(&record.transaction_id)
        .bind(&record.resource_id)
        .bind(&record.cloud_account_id)
        .bind(&record.product_id)
        .bind(&record.quantity)
        .bind(record.timestamp)
        .bind(record.reason.as_str())
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to record invalid metering record: {}", e))
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_invalid_records(
        &self,
        filter: &InvalidRecordFilter,
    ) -> Result<Vec<InvalidMeteringRecord>, AppError> {
        let rows = sqlx::query_as::<_, InvalidRecordRow>(
            r#"
            SELECT record_id, transaction_id, resource_id, cloud_account_id, product_id, quantity, record_utc, invalidity_reason, recorded_utc
            FROM invalid_metering_records
            WHERE ($1::VARCHAR IS NULL OR cloud_account_id = $1)
              AND ($2::VARCHAR IS NULL OR transaction_id = $2)
            ORDER BY recorded_utc
            "#,
        )
        .bind(&filter.cloud_account_id)
        .bind(&filter.transaction_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list invalid records: {}", e))
        })?;

        into_domain(rows)
    }

    // =========================================================================
    // Instance Operations
    // =========================================================================

    #[instrument(skip(self, instance), fields(instance_id = %instance.id))]
    async fn upsert_instance(&self, instance: &Instance) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO instances (instance_id, cloud_account_id, product_id, paid, state, created_utc, terminated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (instance_id) DO UPDATE
            SET product_id = EXCLUDED.product_id, paid = EXCLUDED.paid, state = EXCLUDED.state, terminated_utc = EXCLUDED.terminated_utc
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.cloud_account_id)
        .bind(&instance.product_id)
        .bind(instance.paid)
        .bind(instance.state.as_str())
        .bind(instance.created_at)
        .bind(instance.terminated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to save instance: {}", e)))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_instances(&self, cloud_account_id: &str) -> Result<Vec<Instance>, AppError> {
        let rows = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {} FROM instances WHERE cloud_account_id = $1 ORDER BY created_utc, instance_id",
            INSTANCE_COLUMNS
        ))
        .bind(cloud_account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list instances: {}", e)))?;

        into_domain(rows)
    }

    #[instrument(skip(self))]
    async fn list_running_paid_instances(&self) -> Result<Vec<Instance>, AppError> {
        let rows = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {} FROM instances WHERE state = 'running' AND paid ORDER BY created_utc, instance_id",
            INSTANCE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list instances: {}", e)))?;

        into_domain(rows)
    }

    #[instrument(skip(self))]
    async fn mark_instance_terminated(
        &self,
        instance_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE instances SET state = 'terminated', terminated_utc = $2
            WHERE instance_id = $1 AND state <> 'terminated'
            "#,
        )
        .bind(instance_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to mark instance terminated: {}", e))
        })?;

        Ok(())
    }
}

async fn insert_grant_with<'e, E>(executor: E, grant: &CreditGrant) -> Result<(), AppError>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO credit_grants (grant_id, cloud_account_id, reason, coupon_code, original_amount, unlimited, created_utc, expires_utc)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(grant.id)
    .bind(&grant.cloud_account_id)
    .bind(grant.reason.as_str())
    .bind(&grant.coupon_code)
    .bind(grant.original_amount)
    .bind(grant.unlimited)
    .bind(grant.created_at)
    .bind(grant.expires_at)
    .execute(executor)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to insert grant: {}", e)))?;

    Ok(())
}
