//! Plan structural validation (C2, validation half).
//!
//! Walks the raw [`crate::plan::Plan`] tree and collects every structural
//! violation rather than stopping at the first, mirroring the source
//! project's `validate_plan`. Field legality per step `type` is enforced
//! here instead of via `serde`'s deserialize machinery so a typo like `as`
//! on a `request` step reports as a located [`ValidationError`], not a
//! parse failure.

use serde_json::Value;

use crate::errors::ValidationError;
use crate::plan::{AuthConfig, PaginationSpec, Plan, RequestSpec, Step};

const ALLOWED_CONTENT_TYPES: &[&str] = &[
    "application/json",
    "application/x-www-form-urlencoded",
    "multipart/form-data",
];

pub fn validate_plan(plan: &Plan) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    match &plan.root_context {
        Value::Object(_) | Value::Array(_) => {}
        _ => errors.push(ValidationError::new(
            "plan.rootContext",
            "must be a mapping or a sequence",
        )),
    }

    if plan.stream && !matches!(plan.root_context, Value::Array(_)) {
        errors.push(ValidationError::new(
            "plan.rootContext",
            "must be an empty sequence when `stream` is true",
        ));
    }

    if let Some(auth) = &plan.auth {
        validate_auth("plan.auth", auth, &mut errors);
    }

    if plan.steps.is_empty() {
        errors.push(ValidationError::new("plan.steps", "must contain at least one step"));
    }

    for (i, step) in plan.steps.iter().enumerate() {
        validate_step(&format!("steps[{i}]"), step, &mut errors);
    }

    errors
}

fn validate_step(location: &str, step: &Step, errors: &mut Vec<ValidationError>) {
    match step.step_type.as_str() {
        "request" => validate_request_step(location, step, errors),
        "forEach" => validate_for_each_step(location, step, errors),
        "forValues" => validate_for_values_step(location, step, errors),
        other => errors.push(ValidationError::new(
            location,
            format!("unknown step type `{other}`, expected `request`, `forEach`, or `forValues`"),
        )),
    }

    for (i, child) in step.steps.iter().enumerate() {
        validate_step(&format!("{location}.steps[{i}]"), child, errors);
    }
}

fn validate_request_step(location: &str, step: &Step, errors: &mut Vec<ValidationError>) {
    match &step.request {
        Some(request) => validate_request_spec(&format!("{location}.request"), request, errors),
        None => errors.push(ValidationError::new(location, "`request` step requires `request`")),
    }

    reject_field(location, "path", step.path.is_some(), errors);
    reject_field(location, "parallelism", step.parallelism.is_some(), errors);
    reject_field(location, "values", step.values.is_some(), errors);
    reject_field(location, "as", step.as_name.is_some(), errors);
    reject_field(location, "noopMerge", step.noop_merge.is_some(), errors);

    check_merge_exclusivity(location, step, errors);
}

fn validate_for_each_step(location: &str, step: &Step, errors: &mut Vec<ValidationError>) {
    if step.path.is_none() {
        errors.push(ValidationError::new(location, "`forEach` step requires `path`"));
    }
    if step.as_name.is_none() {
        errors.push(ValidationError::new(location, "`forEach` step requires `as`"));
    }
    if step.steps.is_empty() {
        errors.push(ValidationError::new(location, "`forEach` step requires at least one nested step"));
    }

    reject_field(location, "request", step.request.is_some(), errors);
    reject_field(location, "resultTransformer", step.result_transformer.is_some(), errors);
    reject_field(location, "values", step.values.is_some(), errors);

    check_merge_exclusivity(location, step, errors);
}

fn validate_for_values_step(location: &str, step: &Step, errors: &mut Vec<ValidationError>) {
    if step.values.is_none() {
        errors.push(ValidationError::new(location, "`forValues` step requires `values`"));
    }
    if step.as_name.is_none() {
        errors.push(ValidationError::new(location, "`forValues` step requires `as`"));
    }
    if step.steps.is_empty() {
        errors.push(ValidationError::new(location, "`forValues` step requires at least one nested step"));
    }

    reject_field(location, "request", step.request.is_some(), errors);
    reject_field(location, "resultTransformer", step.result_transformer.is_some(), errors);
    reject_field(location, "path", step.path.is_some(), errors);
    reject_field(location, "parallelism", step.parallelism.is_some(), errors);
    reject_field(location, "mergeOn", step.merge_on.is_some(), errors);
    reject_field(location, "mergeWithParentOn", step.merge_with_parent_on.is_some(), errors);
    reject_field(location, "mergeWithContext", step.merge_with_context.is_some(), errors);
    reject_field(location, "noopMerge", step.noop_merge.is_some(), errors);
}

fn check_merge_exclusivity(location: &str, step: &Step, errors: &mut Vec<ValidationError>) {
    let set = [
        step.merge_on.is_some(),
        step.merge_with_parent_on.is_some(),
        step.merge_with_context.is_some(),
    ]
    .into_iter()
    .filter(|b| *b)
    .count();

    if set > 1 {
        errors.push(ValidationError::new(
            location,
            "at most one of `mergeOn`, `mergeWithParentOn`, `mergeWithContext` may be set",
        ));
    }
}

fn reject_field(location: &str, name: &str, present: bool, errors: &mut Vec<ValidationError>) {
    if present {
        errors.push(ValidationError::new(location, format!("`{name}` is not allowed here")));
    }
}

fn validate_request_spec(location: &str, request: &RequestSpec, errors: &mut Vec<ValidationError>) {
    let method = request.method.to_ascii_uppercase();
    if method != "GET" && method != "POST" {
        errors.push(ValidationError::new(
            format!("{location}.method"),
            format!("unsupported method `{}`, expected GET or POST", request.method),
        ));
    }

    if method == "POST" && request.body.is_some() {
        let has_content_type = request
            .headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case("content-type"));
        if !has_content_type {
            errors.push(ValidationError::new(
                format!("{location}.headers"),
                "POST with a body requires a `Content-Type` header",
            ));
        } else {
            let declared = request
                .headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
                .map(|(_, v)| v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase());
            if let Some(declared) = declared {
                if !ALLOWED_CONTENT_TYPES.contains(&declared.as_str()) {
                    errors.push(ValidationError::new(
                        format!("{location}.headers"),
                        format!("unsupported Content-Type `{declared}`"),
                    ));
                }
            }
        }
    }

    if let Some(pagination) = &request.pagination {
        validate_pagination(&format!("{location}.pagination"), pagination, errors);
    }

    if let Some(auth) = &request.auth {
        validate_auth(&format!("{location}.auth"), auth, errors);
    }
}

fn validate_pagination(location: &str, pagination: &PaginationSpec, errors: &mut Vec<ValidationError>) {
    if pagination.next_page_url_selector.is_none() && pagination.params.is_none() {
        errors.push(ValidationError::new(
            location,
            "requires `nextPageUrlSelector`, `params`, or both",
        ));
    }

    let params_used = pagination.params.as_ref().is_some_and(|p| !p.is_empty());
    let stop_on_missing = pagination.stop_on.as_ref().map(|s| s.is_empty()).unwrap_or(true);
    if params_used && stop_on_missing {
        errors.push(ValidationError::new(
            location,
            "`stopOn` is required when `params` is used",
        ));
    }

    if let Some(params) = &pagination.params {
        for (i, param) in params.iter().enumerate() {
            let loc = format!("{location}.params[{i}]");
            match param.kind.as_str() {
                "int" | "float" | "datetime" | "dynamic" => {}
                other => errors.push(ValidationError::new(
                    &loc,
                    format!("unknown param type `{other}`"),
                )),
            }
            if param.kind == "dynamic" && param.source.is_none() {
                errors.push(ValidationError::new(&loc, "`dynamic` params require `source`"));
            }
        }
    }
}

fn validate_auth(location: &str, auth: &AuthConfig, errors: &mut Vec<ValidationError>) {
    if let AuthConfig::Oauth {
        flow,
        username,
        password,
        client_id,
        client_secret,
        ..
    } = auth
    {
        use crate::plan::OauthFlow;
        match flow {
            OauthFlow::Password => {
                if username.is_none() || password.is_none() {
                    errors.push(ValidationError::new(
                        location,
                        "oauth password flow requires `username` and `password`",
                    ));
                }
            }
            OauthFlow::ClientCredentials => {
                if client_id.is_none() || client_secret.is_none() {
                    errors.push(ValidationError::new(
                        location,
                        "oauth clientCredentials flow requires `clientId` and `clientSecret`",
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::loader::parse_plan;

    #[test]
    fn rejects_request_step_missing_request() {
        let yaml = "rootContext: {}\nsteps:\n  - type: request\n";
        let plan = parse_plan(yaml).unwrap();
        let errors = validate_plan(&plan);
        assert!(errors.iter().any(|e| e.message.contains("requires `request`")));
    }

    #[test]
    fn rejects_as_on_request_step() {
        let yaml = "rootContext: {}\nsteps:\n  - type: request\n    as: x\n    request:\n      url: https://x\n";
        let plan = parse_plan(yaml).unwrap();
        let errors = validate_plan(&plan);
        assert!(errors.iter().any(|e| e.message.contains("`as` is not allowed")));
    }

    #[test]
    fn collects_multiple_errors_in_one_pass() {
        let yaml = "rootContext: {}\nsteps:\n  - type: bogus\n  - type: forEach\n";
        let plan = parse_plan(yaml).unwrap();
        let errors = validate_plan(&plan);
        assert!(errors.len() >= 3);
    }

    #[test]
    fn accepts_minimal_valid_request_plan() {
        let yaml = "rootContext: {}\nsteps:\n  - type: request\n    request:\n      url: https://x\n";
        let plan = parse_plan(yaml).unwrap();
        assert!(validate_plan(&plan).is_empty());
    }

    #[test]
    fn pagination_requires_stop_on_when_params_used() {
        let yaml = r#"
rootContext: {}
steps:
  - type: request
    request:
      url: https://x
      pagination:
        params:
          - name: page
            location: query
            type: int
"#;
        let plan = parse_plan(yaml).unwrap();
        let errors = validate_plan(&plan);
        assert!(errors.iter().any(|e| e.message.contains("stopOn")));
    }
}
