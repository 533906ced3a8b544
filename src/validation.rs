//! Raw request body to [`GenerationRequest`].
//!
//! `max_tokens` is forgiving: anything that is not a usable positive integer
//! falls back to the default, and values above the deployment limit are
//! clamped. Sampling parameters are strict and out-of-range values are
//! rejected.

use serde_json::{Map, Value};

use crate::{config::GenerationDefaults, error::ServiceError, model::GenerationRequest};

pub fn parse_generation_request(
    body: &[u8],
    defaults: &GenerationDefaults,
) -> Result<GenerationRequest, ServiceError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ServiceError::BadRequest(format!("body is not valid JSON: {e}")))?;
    let Value::Object(fields) = value else {
        return Err(ServiceError::BadRequest("body must be a JSON object".into()));
    };

    let prompt = match fields.get("prompt") {
        Some(Value::String(prompt)) => prompt.clone(),
        Some(_) => return Err(ServiceError::BadRequest("`prompt` must be a string".into())),
        None => return Err(ServiceError::BadRequest("`prompt` is required".into())),
    };

    let max_tokens = match fields.get("max_tokens").and_then(coerce_max_tokens) {
        Some(requested) if requested > defaults.max_tokens_limit => {
            tracing::debug!(
                requested,
                limit = defaults.max_tokens_limit,
                "clamping max_tokens"
            );
            defaults.max_tokens_limit
        }
        Some(requested) => requested,
        None => defaults.max_tokens,
    };

    let temperature = float_field(&fields, "temperature")?.unwrap_or(defaults.temperature);
    if !(0.0..=2.0).contains(&temperature) {
        return Err(ServiceError::BadRequest(format!(
            "`temperature` must be within [0, 2], got {temperature}"
        )));
    }
    let top_p = float_field(&fields, "top_p")?.unwrap_or(defaults.top_p);
    if !(top_p > 0.0 && top_p <= 1.0) {
        return Err(ServiceError::BadRequest(format!(
            "`top_p` must be within (0, 1], got {top_p}"
        )));
    }

    let stream = match fields.get("stream") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(stream)) => *stream,
        Some(_) => return Err(ServiceError::BadRequest("`stream` must be a boolean".into())),
    };
    let seed = match fields.get("seed") {
        None | Some(Value::Null) => None,
        Some(value) => Some(value.as_u64().ok_or_else(|| {
            ServiceError::BadRequest("`seed` must be a non-negative integer".into())
        })?),
    };

    Ok(GenerationRequest {
        prompt,
        max_tokens,
        temperature,
        top_p,
        seed,
        stream,
    })
}

/// A positive integer from a number or numeric string; fractional numbers
/// are truncated. Anything else is `None`.
fn coerce_max_tokens(value: &Value) -> Option<usize> {
    let parsed = match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(raw) => raw.trim().parse::<i64>().ok(),
        _ => None,
    }?;
    usize::try_from(parsed).ok().filter(|&tokens| tokens > 0)
}

fn float_field(fields: &Map<String, Value>, name: &str) -> Result<Option<f64>, ServiceError> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => Ok(number.as_f64()),
        Some(_) => Err(ServiceError::BadRequest(format!("`{name}` must be a number"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(body: Value) -> Result<GenerationRequest, ServiceError> {
        parse_generation_request(&serde_json::to_vec(&body).unwrap(), &GenerationDefaults::default())
    }

    #[test]
    fn applies_defaults() {
        let request = parse(json!({"prompt": "Count to 3"})).unwrap();
        assert_eq!(request.prompt, "Count to 3");
        assert_eq!(request.max_tokens, 100);
        assert_eq!(request.temperature, 0.7);
        assert_eq!(request.top_p, 0.9);
        assert_eq!(request.seed, None);
        assert!(!request.stream);
    }

    #[test]
    fn empty_prompt_is_valid() {
        assert_eq!(parse(json!({"prompt": ""})).unwrap().prompt, "");
    }

    #[test]
    fn prompt_is_required_and_must_be_text() {
        assert!(matches!(parse(json!({})), Err(ServiceError::BadRequest(_))));
        assert!(matches!(
            parse(json!({"prompt": 42})),
            Err(ServiceError::BadRequest(_))
        ));
        assert!(matches!(
            parse(json!(["prompt"])),
            Err(ServiceError::BadRequest(_))
        ));
        assert!(matches!(
            parse_generation_request(b"{not json", &GenerationDefaults::default()),
            Err(ServiceError::BadRequest(_))
        ));
    }

    #[test]
    fn max_tokens_is_coerced() {
        let cases = [
            (json!(20), 20),
            (json!("64"), 64),
            (json!(12.9), 12),
            (json!(0), 100),
            (json!(-5), 100),
            (json!("lots"), 100),
            (json!(true), 100),
            (json!(null), 100),
            (json!(1_000_000), 2048),
        ];
        for (raw, expected) in cases {
            let request = parse(json!({"prompt": "p", "max_tokens": raw})).unwrap();
            assert_eq!(request.max_tokens, expected, "max_tokens = {raw}");
        }
    }

    #[test]
    fn sampling_parameters_are_range_checked() {
        let request = parse(json!({"prompt": "p", "temperature": 0, "top_p": 1})).unwrap();
        assert_eq!(request.temperature, 0.0);
        assert_eq!(request.top_p, 1.0);

        for body in [
            json!({"prompt": "p", "temperature": 2.5}),
            json!({"prompt": "p", "temperature": -0.1}),
            json!({"prompt": "p", "temperature": "hot"}),
            json!({"prompt": "p", "top_p": 0}),
            json!({"prompt": "p", "top_p": 1.5}),
        ] {
            assert!(
                matches!(parse(body.clone()), Err(ServiceError::BadRequest(_))),
                "{body}"
            );
        }
    }

    #[test]
    fn stream_and_seed() {
        let request = parse(json!({"prompt": "p", "stream": true, "seed": 42})).unwrap();
        assert!(request.stream);
        assert_eq!(request.seed, Some(42));

        assert!(parse(json!({"prompt": "p", "stream": "yes"})).is_err());
        assert!(parse(json!({"prompt": "p", "seed": -1})).is_err());
    }
}
