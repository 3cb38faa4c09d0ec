use actix_web::{HttpResponse, Responder, post, web};
use serde::{Deserialize, Serialize};

use super::ErrorResponse;
use crate::evaluator::{EvaluationRequest, Evaluator};

/// Body of `POST /evaluate`
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct EvaluateBody {
    pub submission_file_content: Option<String>,
    pub ground_truth_content: Option<String>,
    pub public_test_content: Option<String>,
    pub evaluation_script_content: Option<String>,
}

impl EvaluateBody {
    /// Validates that every blob is present and non-empty
    ///
    /// On failure returns the names of the missing fields in request order.
    pub fn into_request(self) -> Result<EvaluationRequest, Vec<&'static str>> {
        fn take(value: Option<String>, name: &'static str, missing: &mut Vec<&'static str>) -> String {
            match value {
                Some(value) if !value.is_empty() => value,
                _ => {
                    missing.push(name);
                    String::new()
                }
            }
        }

        let mut missing = Vec::new();
        let request = EvaluationRequest {
            submission: take(self.submission_file_content, "submission_file_content", &mut missing),
            ground_truth: take(self.ground_truth_content, "ground_truth_content", &mut missing),
            public_test: take(self.public_test_content, "public_test_content", &mut missing),
            program: take(
                self.evaluation_script_content,
                "evaluation_script_content",
                &mut missing,
            ),
        };

        if missing.is_empty() {
            Ok(request)
        } else {
            Err(missing)
        }
    }
}

#[post("/evaluate")]
pub async fn post_evaluate_handler(
    evaluator: web::Data<Evaluator>,
    body: web::Json<EvaluateBody>,
) -> impl Responder {
    let request = match body.into_inner().into_request() {
        Ok(request) => request,
        Err(missing) => {
            log::warn!("Evaluation request failed: Missing content for {missing:?}");
            return HttpResponse::BadRequest().json(ErrorResponse {
                error: format!("Missing content: {}", missing.join(", ")),
            });
        }
    };

    let verdict = evaluator.evaluate(&request).await;
    if verdict.is_infrastructure_error() {
        HttpResponse::InternalServerError().json(verdict)
    } else {
        HttpResponse::Ok().json(verdict)
    }
}
