//! # API REST
//!
//! REST API implementation for the clinic records service.
//!
//! Handles:
//! - HTTP endpoints with axum
//! - OpenAPI/Swagger documentation
//! - REST-specific concerns (JSON serialization, CORS, status codes)
//!
//! Request and response bodies reuse the protobuf messages from `api-shared`, so REST and gRPC
//! speak the same shapes.

#![warn(rust_2018_idioms)]

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use api_shared::{auth, convert, pb, HealthService};
use clinic_core::{ClinicError, ClinicServices, ErrorKind, RequestContext};

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        list_patients,
        create_patient,
        get_patient,
        list_episodes,
        create_episode,
        get_episode,
        list_encounters,
        create_encounter,
        get_encounter,
        save_draft,
        finalize_encounter,
        create_version,
        get_assessment,
        create_assessment,
        update_assessment,
        finalize_assessment,
    ),
    components(schemas(
        ErrorBody,
        pb::HealthRes,
        pb::AckRes,
        pb::Patient,
        pb::CreatePatientReq,
        pb::CreatePatientRes,
        pb::ListPatientsRes,
        pb::Episode,
        pb::CreateEpisodeReq,
        pb::CreateEpisodeRes,
        pb::ListEpisodesRes,
        pb::SoapContent,
        pb::Encounter,
        pb::EncounterVersion,
        pb::VersionSummary,
        pb::EncounterDetail,
        pb::CreateEncounterReq,
        pb::CreateEncounterRes,
        pb::ListEncountersRes,
        pb::SaveDraftRes,
        pb::CreateVersionRes,
        pb::AssessmentFields,
        pb::Assessment,
        pb::GetAssessmentRes,
        pb::CreateAssessmentRes,
    ))
)]
pub struct ApiDoc;

/// Builds the REST application over the given services.
pub fn router(services: ClinicServices) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/patients", get(list_patients).post(create_patient))
        .route("/patients/:id", get(get_patient))
        .route("/episodes", get(list_episodes).post(create_episode))
        .route("/episodes/:id", get(get_episode))
        .route("/encounters", get(list_encounters).post(create_encounter))
        .route("/encounters/:id", get(get_encounter))
        .route("/encounters/:id/draft", put(save_draft))
        .route("/encounters/:id/finalize", post(finalize_encounter))
        .route("/encounters/:id/versions", post(create_version))
        .route(
            "/episodes/:id/anesthesia-assessment",
            get(get_assessment).post(create_assessment),
        )
        .route("/anesthesia-assessments/:id", put(update_assessment))
        .route(
            "/anesthesia-assessments/:id/finalize",
            post(finalize_assessment),
        )
        .merge(
            SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-docs/openapi.json", ApiDoc::openapi()),
        )
        .layer(CorsLayer::permissive())
        .with_state(services)
}

/// JSON error payload.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
}

/// A core error on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(ClinicError);

impl From<ClinicError> for ApiError {
    fn from(err: ClinicError) -> Self {
        Self(err)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotAuthenticated => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidState => StatusCode::CONFLICT,
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::PersistenceFailure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind());
        let error = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("request failed: {}", self.0);
            "Internal error".to_string()
        } else {
            self.0.to_string()
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn context(headers: &HeaderMap) -> Result<RequestContext, ApiError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    Ok(auth::request_context(
        header(auth::ACTOR_ID_HEADER),
        header(auth::ACTOR_ROLES_HEADER),
    )?)
}

fn ack() -> Json<pb::AckRes> {
    Json(pb::AckRes { ok: true })
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check response", body = pb::HealthRes)
    )
)]
async fn health() -> Json<pb::HealthRes> {
    Json(HealthService::check_health())
}

#[utoipa::path(
    get,
    path = "/patients",
    responses(
        (status = 200, description = "Registered patients ordered by name", body = pb::ListPatientsRes),
        (status = 401, description = "No actor", body = ErrorBody)
    )
)]
async fn list_patients(
    State(services): State<ClinicServices>,
    headers: HeaderMap,
) -> ApiResult<pb::ListPatientsRes> {
    let ctx = context(&headers)?;
    let patients = services.patients.list_patients(&ctx)?;
    Ok(Json(pb::ListPatientsRes {
        patients: patients.iter().map(pb::Patient::from).collect(),
    }))
}

#[utoipa::path(
    post,
    path = "/patients",
    request_body = pb::CreatePatientReq,
    responses(
        (status = 200, description = "Patient registered", body = pb::CreatePatientRes),
        (status = 400, description = "Invalid patient details", body = ErrorBody),
        (status = 401, description = "No actor", body = ErrorBody)
    )
)]
#[axum::debug_handler]
async fn create_patient(
    State(services): State<ClinicServices>,
    headers: HeaderMap,
    Json(req): Json<pb::CreatePatientReq>,
) -> ApiResult<pb::CreatePatientRes> {
    let ctx = context(&headers)?;
    let id = services
        .patients
        .create_patient(&ctx, convert::new_patient(req)?)?;
    Ok(Json(pb::CreatePatientRes { id: id.to_string() }))
}

#[utoipa::path(
    get,
    path = "/patients/{id}",
    params(("id" = String, Path, description = "Patient id")),
    responses(
        (status = 200, description = "Patient", body = pb::Patient),
        (status = 404, description = "Unknown patient", body = ErrorBody)
    )
)]
async fn get_patient(
    State(services): State<ClinicServices>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<pb::Patient> {
    let ctx = context(&headers)?;
    let patient = services
        .patients
        .get_patient(&ctx, convert::required("id", &id)?)?;
    Ok(Json(pb::Patient::from(&patient)))
}

#[utoipa::path(
    get,
    path = "/episodes",
    params(("patient_id" = Option<String>, Query, description = "Only this patient's episodes")),
    responses(
        (status = 200, description = "Episodes, newest first", body = pb::ListEpisodesRes),
        (status = 400, description = "Invalid patient id", body = ErrorBody)
    )
)]
async fn list_episodes(
    State(services): State<ClinicServices>,
    headers: HeaderMap,
    Query(query): Query<pb::ListEpisodesReq>,
) -> ApiResult<pb::ListEpisodesRes> {
    let ctx = context(&headers)?;
    let episodes = services
        .episodes
        .list_episodes(&ctx, convert::optional(&query.patient_id)?)?;
    Ok(Json(pb::ListEpisodesRes {
        episodes: episodes.iter().map(pb::Episode::from).collect(),
    }))
}

#[utoipa::path(
    post,
    path = "/episodes",
    request_body = pb::CreateEpisodeReq,
    responses(
        (status = 200, description = "Episode opened", body = pb::CreateEpisodeRes),
        (status = 400, description = "Missing procedure name or malformed schedule", body = ErrorBody),
        (status = 404, description = "Unknown patient", body = ErrorBody)
    )
)]
async fn create_episode(
    State(services): State<ClinicServices>,
    headers: HeaderMap,
    Json(req): Json<pb::CreateEpisodeReq>,
) -> ApiResult<pb::CreateEpisodeRes> {
    let ctx = context(&headers)?;
    let id = services
        .episodes
        .create_episode(&ctx, convert::new_episode(req)?)?;
    Ok(Json(pb::CreateEpisodeRes { id: id.to_string() }))
}

#[utoipa::path(
    get,
    path = "/episodes/{id}",
    params(("id" = String, Path, description = "Episode id")),
    responses(
        (status = 200, description = "Episode", body = pb::Episode),
        (status = 404, description = "Unknown episode", body = ErrorBody)
    )
)]
async fn get_episode(
    State(services): State<ClinicServices>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<pb::Episode> {
    let ctx = context(&headers)?;
    let episode = services
        .episodes
        .get_episode(&ctx, convert::required("id", &id)?)?;
    Ok(Json(pb::Episode::from(&episode)))
}

#[utoipa::path(
    get,
    path = "/encounters",
    params(
        ("patient_id" = Option<String>, Query, description = "Only this patient's encounters"),
        ("episode_id" = Option<String>, Query, description = "Only this episode's encounters"),
        ("status" = Option<String>, Query, description = "draft or finalized")
    ),
    responses(
        (status = 200, description = "Encounters, most recently updated first", body = pb::ListEncountersRes),
        (status = 400, description = "Invalid filter", body = ErrorBody)
    )
)]
async fn list_encounters(
    State(services): State<ClinicServices>,
    headers: HeaderMap,
    Query(query): Query<pb::ListEncountersReq>,
) -> ApiResult<pb::ListEncountersRes> {
    let ctx = context(&headers)?;
    let filter = convert::encounter_filter(&query)?;
    let encounters = services.encounters.list_encounters(&ctx, &filter)?;
    Ok(Json(pb::ListEncountersRes {
        encounters: encounters.iter().map(pb::Encounter::from).collect(),
    }))
}

#[utoipa::path(
    post,
    path = "/encounters",
    request_body = pb::CreateEncounterReq,
    responses(
        (status = 200, description = "Encounter opened with an empty draft", body = pb::CreateEncounterRes),
        (status = 404, description = "Unknown patient", body = ErrorBody)
    )
)]
async fn create_encounter(
    State(services): State<ClinicServices>,
    headers: HeaderMap,
    Json(req): Json<pb::CreateEncounterReq>,
) -> ApiResult<pb::CreateEncounterRes> {
    let ctx = context(&headers)?;
    let id = services
        .encounters
        .create_encounter(&ctx, convert::new_encounter(req)?)?;
    Ok(Json(pb::CreateEncounterRes { id: id.to_string() }))
}

#[utoipa::path(
    get,
    path = "/encounters/{id}",
    params(("id" = String, Path, description = "Encounter id")),
    responses(
        (status = 200, description = "Encounter, current version and version history", body = pb::EncounterDetail),
        (status = 404, description = "Unknown encounter", body = ErrorBody)
    )
)]
async fn get_encounter(
    State(services): State<ClinicServices>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<pb::EncounterDetail> {
    let ctx = context(&headers)?;
    let detail = services
        .encounters
        .get_encounter(&ctx, convert::required("id", &id)?)?;
    Ok(Json(pb::EncounterDetail::from(&detail)))
}

#[utoipa::path(
    put,
    path = "/encounters/{id}/draft",
    params(("id" = String, Path, description = "Encounter id")),
    request_body = pb::SoapContent,
    responses(
        (status = 200, description = "Draft saved", body = pb::SaveDraftRes),
        (status = 409, description = "Encounter is finalized", body = ErrorBody)
    )
)]
async fn save_draft(
    State(services): State<ClinicServices>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(content): Json<pb::SoapContent>,
) -> ApiResult<pb::SaveDraftRes> {
    let ctx = context(&headers)?;
    let version_id = services.encounters.save_draft(
        &ctx,
        convert::required("id", &id)?,
        convert::soap_input(Some(content)),
    )?;
    Ok(Json(pb::SaveDraftRes {
        version_id: version_id.to_string(),
    }))
}

#[utoipa::path(
    post,
    path = "/encounters/{id}/finalize",
    params(("id" = String, Path, description = "Encounter id")),
    responses(
        (status = 200, description = "Encounter finalized", body = pb::AckRes),
        (status = 403, description = "Requires doctor or admin", body = ErrorBody),
        (status = 409, description = "Already finalized", body = ErrorBody)
    )
)]
async fn finalize_encounter(
    State(services): State<ClinicServices>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<pb::AckRes> {
    let ctx = context(&headers)?;
    services
        .encounters
        .finalize_encounter(&ctx, convert::required("id", &id)?)?;
    Ok(ack())
}

#[utoipa::path(
    post,
    path = "/encounters/{id}/versions",
    params(("id" = String, Path, description = "Encounter id")),
    responses(
        (status = 200, description = "New draft version copied from the current one", body = pb::CreateVersionRes),
        (status = 409, description = "A draft already exists", body = ErrorBody)
    )
)]
async fn create_version(
    State(services): State<ClinicServices>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<pb::CreateVersionRes> {
    let ctx = context(&headers)?;
    let version_id = services
        .encounters
        .create_new_version(&ctx, convert::required("id", &id)?)?;
    Ok(Json(pb::CreateVersionRes {
        version_id: version_id.to_string(),
    }))
}

#[utoipa::path(
    get,
    path = "/episodes/{id}/anesthesia-assessment",
    params(("id" = String, Path, description = "Episode id")),
    responses(
        (status = 200, description = "The episode's assessment, if any", body = pb::GetAssessmentRes)
    )
)]
async fn get_assessment(
    State(services): State<ClinicServices>,
    headers: HeaderMap,
    Path(episode_id): Path<String>,
) -> ApiResult<pb::GetAssessmentRes> {
    let ctx = context(&headers)?;
    let assessment = services
        .assessments
        .assessment_for_episode(&ctx, convert::required("id", &episode_id)?)?;
    Ok(Json(pb::GetAssessmentRes {
        assessment: assessment.as_ref().map(pb::Assessment::from),
    }))
}

#[utoipa::path(
    post,
    path = "/episodes/{id}/anesthesia-assessment",
    params(("id" = String, Path, description = "Episode id")),
    request_body = pb::AssessmentFields,
    responses(
        (status = 200, description = "Assessment created", body = pb::CreateAssessmentRes),
        (status = 403, description = "Requires anesthesia or admin", body = ErrorBody),
        (status = 404, description = "Unknown episode", body = ErrorBody),
        (status = 409, description = "Episode already has an assessment", body = ErrorBody)
    )
)]
async fn create_assessment(
    State(services): State<ClinicServices>,
    headers: HeaderMap,
    Path(episode_id): Path<String>,
    Json(fields): Json<pb::AssessmentFields>,
) -> ApiResult<pb::CreateAssessmentRes> {
    let ctx = context(&headers)?;
    let id = services.assessments.create_assessment(
        &ctx,
        convert::required("id", &episode_id)?,
        convert::assessment_fields(Some(fields)),
    )?;
    Ok(Json(pb::CreateAssessmentRes { id: id.to_string() }))
}

#[utoipa::path(
    put,
    path = "/anesthesia-assessments/{id}",
    params(("id" = String, Path, description = "Assessment id")),
    request_body = pb::AssessmentFields,
    responses(
        (status = 200, description = "Assessment updated", body = pb::AckRes),
        (status = 409, description = "Assessment is finalized", body = ErrorBody)
    )
)]
async fn update_assessment(
    State(services): State<ClinicServices>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(fields): Json<pb::AssessmentFields>,
) -> ApiResult<pb::AckRes> {
    let ctx = context(&headers)?;
    services.assessments.update_assessment(
        &ctx,
        convert::required("id", &id)?,
        convert::assessment_fields(Some(fields)),
    )?;
    Ok(ack())
}

#[utoipa::path(
    post,
    path = "/anesthesia-assessments/{id}/finalize",
    params(("id" = String, Path, description = "Assessment id")),
    responses(
        (status = 200, description = "Assessment finalized", body = pb::AckRes),
        (status = 409, description = "Already finalized", body = ErrorBody)
    )
)]
async fn finalize_assessment(
    State(services): State<ClinicServices>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<pb::AckRes> {
    let ctx = context(&headers)?;
    services
        .assessments
        .finalize_assessment(&ctx, convert::required("id", &id)?)?;
    Ok(ack())
}
