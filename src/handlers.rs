use crate::errors::AppError;
use crate::models::{
    date_key, AdjustRequest, CounterField, StatusResponse, TeamQuery, TeamResponse, TodayResponse,
};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{Local, NaiveDate};

pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        date: date_key(today()),
        persistent: state.counters.is_persistent(),
    })
}

pub async fn get_today(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<TodayResponse>, AppError> {
    let user_id = validate_user(&user_id)?;
    let date = today();
    let stats = state.counters.get(user_id, date).await;

    Ok(Json(TodayResponse {
        user_id: user_id.to_string(),
        date: date_key(date),
        stats,
        persistent: state.counters.is_persistent(),
    }))
}

pub async fn adjust(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(payload): Json<AdjustRequest>,
) -> Result<Json<TodayResponse>, AppError> {
    let user_id = validate_user(&user_id)?;
    let field: CounterField = payload.field.trim().parse()?;
    let date = today();
    let stats = state
        .counters
        .adjust(user_id, date, field, payload.delta)
        .await;

    Ok(Json(TodayResponse {
        user_id: user_id.to_string(),
        date: date_key(date),
        stats,
        persistent: state.counters.is_persistent(),
    }))
}

pub async fn get_team(
    State(state): State<AppState>,
    Query(query): Query<TeamQuery>,
) -> Result<Json<TeamResponse>, AppError> {
    let date = match query.date.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => NaiveDate::parse_from_str(value, "%Y-%m-%d")?,
        _ => today(),
    };
    let team = state.counters.team(date).await;

    Ok(Json(TeamResponse {
        date: date_key(date),
        team,
    }))
}

fn validate_user(user_id: &str) -> Result<&str, AppError> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(AppError::bad_request("user id must not be empty"));
    }
    Ok(user_id)
}

/// Calendar day at the local day boundary.
fn today() -> NaiveDate {
    Local::now().date_naive()
}
