use std::convert::Infallible;

use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use tracing::field::Empty;
use tracing_futures::Instrument;
use warp::filters::body::BodyDeserializeError;
use warp::reply::{Reply, Response};
use warp::{http, reject, Filter};

use crate::db::{self, PayrollEntry, TimekeepingEntry};
use crate::error::PersistenceError;
use crate::telemetry::{self, record_exception, RequestContext};

fn json_body_timekeeping() -> impl Filter<Extract = (TimekeepingEntry,), Error = warp::Rejection> + Clone {
    warp::body::content_length_limit(1024 * 16).and(warp::body::json())
}

fn json_body_payroll() -> impl Filter<Extract = (PayrollEntry,), Error = warp::Rejection> + Clone {
    warp::body::content_length_limit(1024 * 16).and(warp::body::json())
}

fn with_pool(pool: SqlitePool) -> impl Filter<Extract = (SqlitePool,), Error = Infallible> + Clone {
    warp::any().map(move || pool.clone())
}

// Captures the span the request is being served under.
fn with_context() -> impl Filter<Extract = (RequestContext,), Error = Infallible> + Clone {
    warp::any().map(RequestContext::current)
}

/// All endpoints, each request wrapped in an HTTP span.
pub fn routes(pool: SqlitePool) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    post_billing(pool.clone())
        .or(get_billing(pool.clone()))
        .unify()
        .or(post_payroll(pool.clone()))
        .unify()
        .or(get_payroll(pool))
        .unify()
        .recover(handle_rejection)
        .unify()
        .map(telemetry::record_response)
        .with(warp::trace(telemetry::request_span))
}

// Turns rejections into plain status replies so the request span sees them too.
async fn handle_rejection(err: warp::Rejection) -> Result<Response, Infallible> {
    let status = if err.is_not_found() {
        http::StatusCode::NOT_FOUND
    } else if err.find::<BodyDeserializeError>().is_some() {
        http::StatusCode::BAD_REQUEST
    } else if err.find::<reject::PayloadTooLarge>().is_some() {
        http::StatusCode::PAYLOAD_TOO_LARGE
    } else if err.find::<reject::LengthRequired>().is_some() {
        http::StatusCode::LENGTH_REQUIRED
    } else if err.find::<reject::UnsupportedMediaType>().is_some() {
        http::StatusCode::UNSUPPORTED_MEDIA_TYPE
    } else if err.find::<reject::MethodNotAllowed>().is_some() {
        http::StatusCode::METHOD_NOT_ALLOWED
    } else {
        tracing::warn!(rejection = ?err, "unhandled rejection");
        http::StatusCode::INTERNAL_SERVER_ERROR
    };

    Ok(status.into_response())
}

// Filters
pub fn post_billing(pool: SqlitePool) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone {
    warp::path!("ems" / "billing")
        .and(warp::post())
        .and(json_body_timekeeping())
        .and(with_context())
        .and(with_pool(pool))
        .and_then(record_project_work)
}

pub fn get_billing(pool: SqlitePool) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone {
    warp::path!("ems" / "billing" / i32)
        .and(warp::get())
        .and(with_context())
        .and(with_pool(pool))
        .and_then(get_billing_details)
}

pub fn post_payroll(pool: SqlitePool) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone {
    warp::path!("ems" / "payroll" / "add")
        .and(warp::post())
        .and(json_body_payroll())
        .and(with_context())
        .and(with_pool(pool))
        .and_then(add_employee_to_payroll)
}

pub fn get_payroll(pool: SqlitePool) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone {
    warp::path!("ems" / "payroll" / i32)
        .and(warp::get())
        .and(with_context())
        .and(with_pool(pool))
        .and_then(get_employee_payroll)
}

// Handlers
async fn record_project_work(
    entry: TimekeepingEntry,
    ctx: RequestContext,
    pool: SqlitePool,
) -> Result<Response, Infallible> {
    let span = tracing::info_span!(
        parent: ctx.span(),
        "Record project work",
        otel.status_code = Empty,
        exception.message = Empty,
        employee_id = entry.employee_id,
        project_id = entry.project_id,
        week_closing_date = %entry.week_closing_date,
    );
    tracing::info!(parent: &span, "work recorded");
    let ctx = RequestContext::new(span.clone());

    let result = async {
        let mut conn = db::acquire(&ctx, &pool).await?;
        db::insert_timekeeping(&ctx, &mut conn, &entry).await
    }
    .instrument(span)
    .await;

    Ok(match result {
        Ok(()) => created(format!("/ems/billing/{}", entry.employee_id), &entry),
        Err(e) => server_error(&ctx, e),
    })
}

async fn get_billing_details(
    employee_id: i32,
    ctx: RequestContext,
    pool: SqlitePool,
) -> Result<Response, Infallible> {
    let span = tracing::info_span!(
        parent: ctx.span(),
        "Fetch projects for employee",
        otel.status_code = Empty,
        exception.message = Empty,
        employee_id = employee_id,
        records = Empty,
    );
    let ctx = RequestContext::new(span.clone());

    let result = async {
        let mut conn = db::acquire(&ctx, &pool).await?;
        db::query_timekeeping_by_employee(&ctx, &mut conn, employee_id).await
    }
    .instrument(span)
    .await;

    Ok(match result {
        Ok(entries) => found(&ctx, &entries),
        Err(e) => server_error(&ctx, e),
    })
}

async fn add_employee_to_payroll(
    entry: PayrollEntry,
    ctx: RequestContext,
    pool: SqlitePool,
) -> Result<Response, Infallible> {
    let span = tracing::info_span!(
        parent: ctx.span(),
        "Add employee to payroll",
        otel.status_code = Empty,
        exception.message = Empty,
        employee_id = entry.employee_id,
    );
    let ctx = RequestContext::new(span.clone());

    let result = async {
        let mut conn = db::acquire(&ctx, &pool).await?;
        db::insert_payroll(&ctx, &mut conn, &entry).await
    }
    .instrument(span)
    .await;

    Ok(match result {
        Ok(()) => created(format!("/ems/payroll/{}", entry.employee_id), &entry),
        Err(e) => server_error(&ctx, e),
    })
}

async fn get_employee_payroll(
    employee_id: i32,
    ctx: RequestContext,
    pool: SqlitePool,
) -> Result<Response, Infallible> {
    let span = tracing::info_span!(
        parent: ctx.span(),
        "Fetch employee payroll",
        otel.status_code = Empty,
        exception.message = Empty,
        employee_id = employee_id,
        records = Empty,
    );
    let ctx = RequestContext::new(span.clone());

    let result = async {
        let mut conn = db::acquire(&ctx, &pool).await?;
        db::query_payroll_by_employee(&ctx, &mut conn, employee_id).await
    }
    .instrument(span)
    .await;

    Ok(match result {
        Ok(entries) => found(&ctx, &entries),
        Err(e) => server_error(&ctx, e),
    })
}

fn created<T: Serialize>(location: String, body: &T) -> Response {
    let reply = warp::reply::with_status(warp::reply::json(body), http::StatusCode::CREATED);
    warp::reply::with_header(reply, http::header::LOCATION, location).into_response()
}

// No rows reads as not found, whether or not the employee exists.
fn found<T: Serialize>(ctx: &RequestContext, entries: &[T]) -> Response {
    ctx.span().record("records", entries.len());
    if entries.is_empty() {
        return http::StatusCode::NOT_FOUND.into_response();
    }
    warp::reply::json(&entries).into_response()
}

fn server_error(ctx: &RequestContext, err: PersistenceError) -> Response {
    record_exception(ctx.span(), &err);
    http::StatusCode::INTERNAL_SERVER_ERROR.into_response()
}
