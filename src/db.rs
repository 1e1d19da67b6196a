use std::future::Future;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{Sqlite, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{FromRow, Row};
use tracing::field::Empty;
use tracing::Span;
use tracing_futures::Instrument;

use crate::error::PersistenceError;
use crate::telemetry::{record_exception, RequestContext};

const INSERT_TIMEKEEPING: &str =
    "INSERT INTO Timekeeping (EmployeeId, ProjectId, WeekClosingDate, HoursWorked) VALUES (?, ?, ?, ?)";
const SELECT_TIMEKEEPING: &str =
    "SELECT EmployeeId, ProjectId, WeekClosingDate, HoursWorked FROM Timekeeping WHERE EmployeeId = ?";
const INSERT_PAYROLL: &str = "INSERT INTO Payroll (EmployeeId, PayRateInUSD) VALUES (?, ?)";
const SELECT_PAYROLL: &str = "SELECT EmployeeId, PayRateInUSD FROM Payroll WHERE EmployeeId = ?";

pub type Connection = PoolConnection<Sqlite>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TimekeepingEntry {
    #[sqlx(rename = "EmployeeId")]
    pub employee_id: i32,
    #[sqlx(rename = "ProjectId")]
    pub project_id: i32,
    #[sqlx(rename = "WeekClosingDate")]
    pub week_closing_date: NaiveDate,
    #[sqlx(rename = "HoursWorked")]
    pub hours_worked: i32,
}

/// The pay rate keeps every digit the caller sent: it travels as an exact
/// JSON number and is stored as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayrollEntry {
    #[serde(rename = "employeeId")]
    pub employee_id: i32,
    #[serde(rename = "payRateInUSD")]
    pub pay_rate_in_usd: Decimal,
}

impl<'r> FromRow<'r, SqliteRow> for PayrollEntry {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let raw_rate: String = row.try_get("PayRateInUSD")?;
        let pay_rate_in_usd = raw_rate.parse::<Decimal>().map_err(|e| sqlx::Error::ColumnDecode {
            index: "PayRateInUSD".to_string(),
            source: Box::new(e),
        })?;

        Ok(PayrollEntry {
            employee_id: row.try_get("EmployeeId")?,
            pay_rate_in_usd,
        })
    }
}

pub async fn setup_pool(db_url: &str) -> Result<SqlitePool, PersistenceError> {
    Ok(SqlitePoolOptions::new().connect(db_url).await?)
}

/// Checks a connection out of the pool for one request. It goes back to the
/// pool when the returned value is dropped.
pub async fn acquire(ctx: &RequestContext, pool: &SqlitePool) -> Result<Connection, PersistenceError> {
    let span = tracing::debug_span!(
        parent: ctx.span(),
        "db.acquire",
        otel.kind = "client",
        db.system = "sqlite",
        otel.status_code = Empty,
        exception.message = Empty,
    );
    traced(span, pool.acquire()).await
}

pub async fn insert_timekeeping(
    ctx: &RequestContext,
    conn: &mut SqliteConnection,
    entry: &TimekeepingEntry,
) -> Result<(), PersistenceError> {
    let query = sqlx::query(INSERT_TIMEKEEPING)
        .bind(entry.employee_id)
        .bind(entry.project_id)
        .bind(entry.week_closing_date)
        .bind(entry.hours_worked)
        .execute(conn);

    traced(statement_span(ctx, "INSERT", "Timekeeping", INSERT_TIMEKEEPING), query).await?;

    Ok(())
}

pub async fn query_timekeeping_by_employee(
    ctx: &RequestContext,
    conn: &mut SqliteConnection,
    employee_id: i32,
) -> Result<Vec<TimekeepingEntry>, PersistenceError> {
    let query = sqlx::query_as::<_, TimekeepingEntry>(SELECT_TIMEKEEPING)
        .bind(employee_id)
        .fetch_all(conn);

    traced(statement_span(ctx, "SELECT", "Timekeeping", SELECT_TIMEKEEPING), query).await
}

pub async fn insert_payroll(
    ctx: &RequestContext,
    conn: &mut SqliteConnection,
    entry: &PayrollEntry,
) -> Result<(), PersistenceError> {
    let query = sqlx::query(INSERT_PAYROLL)
        .bind(entry.employee_id)
        .bind(entry.pay_rate_in_usd.to_string())
        .execute(conn);

    traced(statement_span(ctx, "INSERT", "Payroll", INSERT_PAYROLL), query).await?;

    Ok(())
}

pub async fn query_payroll_by_employee(
    ctx: &RequestContext,
    conn: &mut SqliteConnection,
    employee_id: i32,
) -> Result<Vec<PayrollEntry>, PersistenceError> {
    let query = sqlx::query_as::<_, PayrollEntry>(SELECT_PAYROLL)
        .bind(employee_id)
        .fetch_all(conn);

    traced(statement_span(ctx, "SELECT", "Payroll", SELECT_PAYROLL), query).await
}

fn statement_span(ctx: &RequestContext, operation: &str, table: &str, statement: &str) -> Span {
    tracing::info_span!(
        parent: ctx.span(),
        "db.statement",
        otel.name = %format!("{} {}", operation, table),
        otel.kind = "client",
        otel.status_code = Empty,
        db.system = "sqlite",
        "db.type" = "sql",
        db.operation = operation,
        db.sql.table = table,
        db.statement = statement,
        exception.message = Empty,
    )
}

async fn traced<T, F>(span: Span, fut: F) -> Result<T, PersistenceError>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match fut.instrument(span.clone()).await {
        Ok(value) => Ok(value),
        Err(e) => {
            let err = PersistenceError::from(e);
            record_exception(&span, &err);
            Err(err)
        }
    }
}
