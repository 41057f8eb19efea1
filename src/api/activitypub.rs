//! Federation endpoint
//!
//! Every AS2-negotiated request lands here. GET and HEAD dereference the
//! resource addressed by the request path; POST submits an activity to
//! the addressed inbox or outbox.

use axum::{
    http::{Method, StatusCode, header},
    response::{IntoResponse, Response},
};

use super::router::RouteRequest;
use super::typed_json;
use crate::AppState;
use crate::data::model::ACTIVITY_CONTENT_TYPE;
use crate::error::AppError;
use crate::service::PostOutcome;

/// GET/HEAD/POST /{path:path} for `application/activity+json` and friends
///
/// Content-Type: application/activity+json
pub async fn federation(state: AppState, request: RouteRequest) -> Result<Response, AppError> {
    let uri = request.resource_uri()?;

    match request.method {
        Method::GET | Method::HEAD => {
            let resource = state.activity_service.get(&uri, &request.auth).await?;
            Ok(typed_json(ACTIVITY_CONTENT_TYPE, &resource))
        }
        Method::POST => {
            let activity = request.json()?;
            match state
                .activity_service
                .post(&uri, activity, &request.auth)
                .await?
            {
                PostOutcome::Created(id) => {
                    Ok((StatusCode::CREATED, [(header::LOCATION, id)]).into_response())
                }
                PostOutcome::Accepted => Ok(StatusCode::ACCEPTED.into_response()),
            }
        }
        _ => Err(AppError::MethodNotAllowed),
    }
}
