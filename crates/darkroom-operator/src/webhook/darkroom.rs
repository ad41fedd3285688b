//! Darkroom admission webhooks
//!
//! The mutating hook fills in defaults, the validating hook rejects specs
//! whose source is incomplete. Deletes are always allowed.

use axum::Json;
use json_patch::{AddOperation, PatchOperation};
use jsonptr::PointerBuf;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use tracing::{debug, error, info};

use darkroom_common::crd::{Darkroom, DarkroomSpec};

/// Path the API server calls for defaulting
pub const MUTATE_PATH: &str = "/mutate-deployments-gojek-io-v1alpha1-darkroom";

/// Path the API server calls for validation
pub const VALIDATE_PATH: &str = "/validate-deployments-gojek-io-v1alpha1-darkroom";

/// Status code attached to validation denials
const UNPROCESSABLE: u16 = 422;

/// Handle mutating admission review for Darkrooms
pub async fn mutate_handler(
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(mutate(&req).into_review())
}

/// Handle validating admission review for Darkrooms
pub async fn validate_handler(
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(validate(&req).into_review())
}

fn decode(obj: &DynamicObject) -> Result<Darkroom, serde_json::Error> {
    serde_json::to_value(obj).and_then(serde_json::from_value)
}

/// Default the incoming Darkroom, answering with a JSON patch when anything changed
pub fn mutate(request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let Some(obj) = &request.object else {
        debug!(uid = %request.uid, "No object in request, allowing unchanged");
        return AdmissionResponse::from(request);
    };

    let mut darkroom = match decode(obj) {
        Ok(d) => d,
        Err(e) => {
            return AdmissionResponse::from(request).deny(format!("failed to decode Darkroom: {e}"));
        }
    };

    if !darkroom.spec.apply_defaults() {
        return AdmissionResponse::from(request);
    }

    info!(uid = %request.uid, name = ?obj.metadata.name, "Defaulting darkroom");
    match AdmissionResponse::from(request).with_patch(json_patch::Patch(defaults_patch(&darkroom.spec))) {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "Failed to serialize defaulting patch");
            AdmissionResponse::from(request).deny(format!("patch serialization error: {e}"))
        }
    }
}

fn defaults_patch(spec: &DarkroomSpec) -> Vec<PatchOperation> {
    // `add` replaces an existing member, so an explicit empty version is covered too
    vec![PatchOperation::Add(AddOperation {
        path: PointerBuf::from_tokens(["spec", "version"]),
        value: serde_json::Value::String(spec.version.clone()),
    })]
}

/// Admit or deny the incoming Darkroom
pub fn validate(request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    if matches!(request.operation, Operation::Delete) {
        return AdmissionResponse::from(request);
    }
    let Some(obj) = &request.object else {
        return AdmissionResponse::from(request);
    };

    let darkroom = match decode(obj) {
        Ok(d) => d,
        Err(e) => return deny(request, format!("failed to decode Darkroom: {e}")),
    };

    match darkroom.validate_admission() {
        Ok(()) => AdmissionResponse::from(request),
        Err(e) => {
            info!(uid = %request.uid, error = %e, "Denying darkroom");
            deny(request, e.to_string())
        }
    }
}

fn deny(request: &AdmissionRequest<DynamicObject>, message: String) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(request).deny(message);
    response.result.code = UNPROCESSABLE;
    response.result.reason = "Invalid".to_string();
    response
}
