// Re-export the proto module from the shared `api-shared` crate so callers
// can reference `api_grpc::pb`.
pub use api_shared::pb;

use api_shared::auth::{self, ApiKey};
use api_shared::pb::clinic_server::Clinic;
use api_shared::{convert, status, HealthService};
use clinic_core::{ClinicServices, RequestContext};
use tonic::{Request, Response, Status};

/// Builds the interceptor that checks `x-api-key` on every call.
pub fn auth_interceptor(
    api_key: ApiKey,
) -> impl FnMut(Request<()>) -> Result<Request<()>, Status> + Clone {
    move |req: Request<()>| {
        let provided = req
            .metadata()
            .get(auth::API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Status::unauthenticated("Missing x-api-key header"))?;
        api_key.validate(provided)?;
        Ok(req)
    }
}

/// Resolves the caller from `x-actor-id` / `x-actor-roles` metadata.
#[allow(clippy::result_large_err)]
fn context<T>(req: &Request<T>) -> Result<RequestContext, Status> {
    let header = |name: &str| req.metadata().get(name).and_then(|v| v.to_str().ok());
    auth::request_context(
        header(auth::ACTOR_ID_HEADER),
        header(auth::ACTOR_ROLES_HEADER),
    )
    .map_err(status::to_status)
}

#[derive(Clone)]
pub struct ClinicService {
    services: ClinicServices,
}

impl ClinicService {
    pub fn new(services: ClinicServices) -> Self {
        Self { services }
    }
}

fn ack() -> Response<pb::AckRes> {
    Response::new(pb::AckRes { ok: true })
}

#[tonic::async_trait]
impl Clinic for ClinicService {
    async fn health(&self, _req: Request<()>) -> Result<Response<pb::HealthRes>, Status> {
        Ok(Response::new(HealthService::check_health()))
    }

    async fn create_patient(
        &self,
        req: Request<pb::CreatePatientReq>,
    ) -> Result<Response<pb::CreatePatientRes>, Status> {
        let ctx = context(&req)?;
        let input = convert::new_patient(req.into_inner()).map_err(status::to_status)?;
        let id = self
            .services
            .patients
            .create_patient(&ctx, input)
            .map_err(status::to_status)?;
        Ok(Response::new(pb::CreatePatientRes { id: id.to_string() }))
    }

    async fn get_patient(
        &self,
        req: Request<pb::GetPatientReq>,
    ) -> Result<Response<pb::Patient>, Status> {
        let ctx = context(&req)?;
        let id = convert::required("id", &req.get_ref().id).map_err(status::to_status)?;
        let patient = self
            .services
            .patients
            .get_patient(&ctx, id)
            .map_err(status::to_status)?;
        Ok(Response::new(pb::Patient::from(&patient)))
    }

    async fn list_patients(
        &self,
        req: Request<()>,
    ) -> Result<Response<pb::ListPatientsRes>, Status> {
        let ctx = context(&req)?;
        let patients = self
            .services
            .patients
            .list_patients(&ctx)
            .map_err(status::to_status)?;
        Ok(Response::new(pb::ListPatientsRes {
            patients: patients.iter().map(pb::Patient::from).collect(),
        }))
    }

    async fn create_episode(
        &self,
        req: Request<pb::CreateEpisodeReq>,
    ) -> Result<Response<pb::CreateEpisodeRes>, Status> {
        let ctx = context(&req)?;
        let input = convert::new_episode(req.into_inner()).map_err(status::to_status)?;
        let id = self
            .services
            .episodes
            .create_episode(&ctx, input)
            .map_err(status::to_status)?;
        Ok(Response::new(pb::CreateEpisodeRes { id: id.to_string() }))
    }

    async fn get_episode(
        &self,
        req: Request<pb::GetEpisodeReq>,
    ) -> Result<Response<pb::Episode>, Status> {
        let ctx = context(&req)?;
        let id = convert::required("id", &req.get_ref().id).map_err(status::to_status)?;
        let episode = self
            .services
            .episodes
            .get_episode(&ctx, id)
            .map_err(status::to_status)?;
        Ok(Response::new(pb::Episode::from(&episode)))
    }

    async fn list_episodes(
        &self,
        req: Request<pb::ListEpisodesReq>,
    ) -> Result<Response<pb::ListEpisodesRes>, Status> {
        let ctx = context(&req)?;
        let patient_id = convert::optional(&req.get_ref().patient_id).map_err(status::to_status)?;
        let episodes = self
            .services
            .episodes
            .list_episodes(&ctx, patient_id)
            .map_err(status::to_status)?;
        Ok(Response::new(pb::ListEpisodesRes {
            episodes: episodes.iter().map(pb::Episode::from).collect(),
        }))
    }

    async fn create_encounter(
        &self,
        req: Request<pb::CreateEncounterReq>,
    ) -> Result<Response<pb::CreateEncounterRes>, Status> {
        let ctx = context(&req)?;
        let input = convert::new_encounter(req.into_inner()).map_err(status::to_status)?;
        let id = self
            .services
            .encounters
            .create_encounter(&ctx, input)
            .map_err(status::to_status)?;
        Ok(Response::new(pb::CreateEncounterRes { id: id.to_string() }))
    }

    async fn get_encounter(
        &self,
        req: Request<pb::GetEncounterReq>,
    ) -> Result<Response<pb::EncounterDetail>, Status> {
        let ctx = context(&req)?;
        let id = convert::required("id", &req.get_ref().id).map_err(status::to_status)?;
        let detail = self
            .services
            .encounters
            .get_encounter(&ctx, id)
            .map_err(status::to_status)?;
        Ok(Response::new(pb::EncounterDetail::from(&detail)))
    }

    async fn list_encounters(
        &self,
        req: Request<pb::ListEncountersReq>,
    ) -> Result<Response<pb::ListEncountersRes>, Status> {
        let ctx = context(&req)?;
        let filter = convert::encounter_filter(req.get_ref()).map_err(status::to_status)?;
        let encounters = self
            .services
            .encounters
            .list_encounters(&ctx, &filter)
            .map_err(status::to_status)?;
        Ok(Response::new(pb::ListEncountersRes {
            encounters: encounters.iter().map(pb::Encounter::from).collect(),
        }))
    }

    async fn save_draft(
        &self,
        req: Request<pb::SaveDraftReq>,
    ) -> Result<Response<pb::SaveDraftRes>, Status> {
        let ctx = context(&req)?;
        let req = req.into_inner();
        let id = convert::required("encounter_id", &req.encounter_id).map_err(status::to_status)?;
        let version_id = self
            .services
            .encounters
            .save_draft(&ctx, id, convert::soap_input(req.content))
            .map_err(status::to_status)?;
        Ok(Response::new(pb::SaveDraftRes {
            version_id: version_id.to_string(),
        }))
    }

    async fn finalize_encounter(
        &self,
        req: Request<pb::FinalizeEncounterReq>,
    ) -> Result<Response<pb::AckRes>, Status> {
        let ctx = context(&req)?;
        let id = convert::required("encounter_id", &req.get_ref().encounter_id)
            .map_err(status::to_status)?;
        self.services
            .encounters
            .finalize_encounter(&ctx, id)
            .map_err(status::to_status)?;
        Ok(ack())
    }

    async fn create_version(
        &self,
        req: Request<pb::CreateVersionReq>,
    ) -> Result<Response<pb::CreateVersionRes>, Status> {
        let ctx = context(&req)?;
        let id = convert::required("encounter_id", &req.get_ref().encounter_id)
            .map_err(status::to_status)?;
        let version_id = self
            .services
            .encounters
            .create_new_version(&ctx, id)
            .map_err(status::to_status)?;
        Ok(Response::new(pb::CreateVersionRes {
            version_id: version_id.to_string(),
        }))
    }

    async fn get_assessment(
        &self,
        req: Request<pb::GetAssessmentReq>,
    ) -> Result<Response<pb::GetAssessmentRes>, Status> {
        let ctx = context(&req)?;
        let episode_id = convert::required("episode_id", &req.get_ref().episode_id)
            .map_err(status::to_status)?;
        let assessment = self
            .services
            .assessments
            .assessment_for_episode(&ctx, episode_id)
            .map_err(status::to_status)?;
        Ok(Response::new(pb::GetAssessmentRes {
            assessment: assessment.as_ref().map(pb::Assessment::from),
        }))
    }

    async fn create_assessment(
        &self,
        req: Request<pb::CreateAssessmentReq>,
    ) -> Result<Response<pb::CreateAssessmentRes>, Status> {
        let ctx = context(&req)?;
        let req = req.into_inner();
        let episode_id =
            convert::required("episode_id", &req.episode_id).map_err(status::to_status)?;
        let id = self
            .services
            .assessments
            .create_assessment(&ctx, episode_id, convert::assessment_fields(req.fields))
            .map_err(status::to_status)?;
        Ok(Response::new(pb::CreateAssessmentRes { id: id.to_string() }))
    }

    async fn update_assessment(
        &self,
        req: Request<pb::UpdateAssessmentReq>,
    ) -> Result<Response<pb::AckRes>, Status> {
        let ctx = context(&req)?;
        let req = req.into_inner();
        let id =
            convert::required("assessment_id", &req.assessment_id).map_err(status::to_status)?;
        self.services
            .assessments
            .update_assessment(&ctx, id, convert::assessment_fields(req.fields))
            .map_err(status::to_status)?;
        Ok(ack())
    }

    async fn finalize_assessment(
        &self,
        req: Request<pb::FinalizeAssessmentReq>,
    ) -> Result<Response<pb::AckRes>, Status> {
        let ctx = context(&req)?;
        let id = convert::required("assessment_id", &req.get_ref().assessment_id)
            .map_err(status::to_status)?;
        self.services
            .assessments
            .finalize_assessment(&ctx, id)
            .map_err(status::to_status)?;
        Ok(ack())
    }
}
