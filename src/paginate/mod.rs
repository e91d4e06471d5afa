//! Pagination state machine (C4).
//!
//! A closed state machine holding typed per-parameter state (`pageNum`,
//! arbitrary `dynamic` values carried from the previous response) plus the
//! `nextPageUrl` discovered via `nextPageUrlSelector`. Each call to
//! [`Paginator::next`] evaluates every configured `stopOn` condition against
//! the just-received response before producing the next request's extra
//! query/body/header parameters, or reports that pagination is exhausted.

use std::cmp::Ordering;

use chrono::{DateTime, Duration as ChronoDuration, Months, Utc};
use serde_json::Value;

use crate::errors::CrawlerError;
use crate::plan::{PaginationParam, PaginationSpec, StopCondition};
use crate::query;

#[derive(Debug, Clone)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    DateTime(DateTime<Utc>),
    Dynamic(Value),
}

impl ParamValue {
    fn to_query_string(&self, format: Option<&str>) -> String {
        match self {
            ParamValue::Int(n) => n.to_string(),
            ParamValue::Float(f) => f.to_string(),
            ParamValue::DateTime(dt) => match format {
                Some(fmt) => dt.format(fmt).to_string(),
                None => dt.to_rfc3339(),
            },
            ParamValue::Dynamic(v) => match v {
                Value::String(s) => s.clone(),
                other => other.to_string().trim_matches('"').to_string(),
            },
        }
    }
}

struct ParamState {
    spec: PaginationParam,
    value: ParamValue,
}

/// One page's worth of extra request parameters, keyed by `location`
/// (`query`, `header`, or `body`).
#[derive(Debug, Default)]
pub struct PageParams {
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<(String, Value)>,
}

pub enum Next {
    Continue { params: PageParams, next_page_url: Option<String> },
    Stop,
}

pub struct Paginator {
    spec: PaginationSpec,
    params: Vec<ParamState>,
    next_page_url: Option<String>,
    page_index: u64,
    stopped: bool,
}

impl Paginator {
    pub fn new(spec: PaginationSpec) -> Result<Self, CrawlerError> {
        let mut params = Vec::new();
        for p in spec.params.iter().flatten() {
            let value = initial_value(p)?;
            params.push(ParamState { spec: p.clone(), value });
        }
        Ok(Self { spec, params, next_page_url: None, page_index: 0, stopped: false })
    }

    /// Computes the parameters for the *first* request (page 0): whatever
    /// initial values were configured, with no stop check yet performed.
    /// `dynamic`-kind parameters have no default value and are omitted
    /// entirely until a response has supplied one.
    pub fn first_page_params(&self) -> PageParams {
        self.render_params(false)
    }

    /// Evaluates stop conditions against the response that was just
    /// received, and if pagination should continue, advances internal state
    /// and returns the parameters for the next page.
    pub fn next(&mut self, response_body: &Value) -> Result<Next, CrawlerError> {
        if self.stopped {
            return Ok(Next::Stop);
        }

        if let Some(conditions) = &self.spec.stop_on {
            for cond in conditions {
                if self.stop_condition_met(cond, response_body)? {
                    self.stopped = true;
                    return Ok(Next::Stop);
                }
            }
        }

        if let Some(selector) = &self.spec.next_page_url_selector {
            let compiled = query::compile(selector, &[]).map_err(|e| CrawlerError::Compilation {
                location: "pagination.nextPageUrlSelector".to_string(),
                expression: selector.clone(),
                cause: e.to_string(),
            })?;
            let url = query::run_single(&compiled, response_body, &Default::default())
                .map_err(|e| CrawlerError::query("pagination.nextPageUrlSelector", selector.clone(), e))?;
            self.next_page_url = url.as_str().map(str::to_string);
            if self.next_page_url.is_none() && self.spec.params.is_none() {
                self.stopped = true;
                return Ok(Next::Stop);
            }
        }

        self.page_index += 1;
        for state in &mut self.params {
            advance(state, response_body)?;
        }

        Ok(Next::Continue { params: self.render_params(true), next_page_url: self.next_page_url.clone() })
    }

    fn render_params(&self, include_dynamic: bool) -> PageParams {
        let mut out = PageParams::default();
        for state in &self.params {
            if !include_dynamic && state.spec.kind == "dynamic" {
                continue;
            }
            let rendered = state.value.to_query_string(state.spec.format.as_deref());
            match state.spec.location.as_str() {
                "header" => out.headers.push((state.spec.name.clone(), rendered)),
                "body" => out.body.push((state.spec.name.clone(), Value::String(rendered))),
                _ => out.query.push((state.spec.name.clone(), rendered)),
            }
        }
        out
    }

    fn stop_condition_met(&self, cond: &StopCondition, response_body: &Value) -> Result<bool, CrawlerError> {
        Ok(match cond {
            StopCondition::PageNum { value } => self.page_index + 1 >= *value,
            StopCondition::ResponseBody { query: src } => {
                let compiled = query::compile(src, &[])
                    .map_err(|e| CrawlerError::Compilation { location: "pagination.stopOn".to_string(), expression: src.clone(), cause: e.to_string() })?;
                let result = query::run_single(&compiled, response_body, &Default::default())
                    .map_err(|e| CrawlerError::query("pagination.stopOn", src.clone(), e))?;
                is_truthy(&result)
            }
            StopCondition::RequestParam { param, op, value } => {
                let state = self
                    .params
                    .iter()
                    .find(|s| &s.spec.name == param)
                    .ok_or_else(|| CrawlerError::AuthConfigError { message: format!("stopOn references unknown pagination param `{param}`") })?;
                compare_param(&state.value, op, value)?
            }
        })
    }
}

fn initial_value(param: &PaginationParam) -> Result<ParamValue, CrawlerError> {
    match param.kind.as_str() {
        "int" => Ok(ParamValue::Int(
            param.default.as_deref().and_then(|d| d.parse().ok()).unwrap_or(0),
        )),
        "float" => Ok(ParamValue::Float(
            param.default.as_deref().and_then(|d| d.parse().ok()).unwrap_or(0.0),
        )),
        "datetime" => {
            let dt = match &param.default {
                Some(d) => parse_datetime_default(d)?,
                None => Utc::now(),
            };
            Ok(ParamValue::DateTime(dt))
        }
        "dynamic" => Ok(ParamValue::Dynamic(Value::Null)),
        other => Err(CrawlerError::AuthConfigError { message: format!("unknown pagination param type `{other}`") }),
    }
}

fn advance(state: &mut ParamState, response_body: &Value) -> Result<(), CrawlerError> {
    match &mut state.value {
        ParamValue::Int(n) => {
            let step = match &state.spec.increment {
                Some(expr) => parse_signed_number(expr)? as i64,
                None => 1,
            };
            *n += step;
        }
        ParamValue::Float(f) => {
            let step = match &state.spec.increment {
                Some(expr) => parse_signed_number(expr)?,
                None => 1.0,
            };
            *f += step;
        }
        ParamValue::DateTime(dt) => {
            if let Some(expr) = &state.spec.increment {
                let tokens = parse_duration_tokens(expr)?;
                *dt = apply_duration_tokens(*dt, &tokens);
            }
        }
        ParamValue::Dynamic(_) => {
            let source = state.spec.source.as_deref().unwrap_or(".");
            let compiled = query::compile(source, &[])
                .map_err(|e| CrawlerError::Compilation { location: "pagination.params".to_string(), expression: source.to_string(), cause: e.to_string() })?;
            let value = query::run_single(&compiled, response_body, &Default::default())
                .map_err(|e| CrawlerError::query("pagination.params", source.to_string(), e))?;
            state.value = ParamValue::Dynamic(value);
        }
    }
    Ok(())
}

/// Parses a scalar arithmetic-expression increment such as `"+ 50"`, `"-2"`
/// or `"3.5"`: an optional leading `+`/`-`, optional whitespace, then a
/// numeric literal. A malformed expression is a hard error rather than a
/// silent fallback to any particular step value.
fn parse_signed_number(expr: &str) -> Result<f64, CrawlerError> {
    let trimmed = expr.trim();
    let (sign, rest) = if let Some(rest) = trimmed.strip_prefix('+') {
        (1.0, rest)
    } else if let Some(rest) = trimmed.strip_prefix('-') {
        (-1.0, rest)
    } else {
        (1.0, trimmed)
    };
    rest.trim()
        .parse::<f64>()
        .map(|n| sign * n)
        .map_err(|e| CrawlerError::AuthConfigError { message: format!("invalid pagination increment `{expr}`: {e}") })
}

/// Resolves a datetime `default` of `"now"`, `"now ± <N><unit>"`, or a plain
/// RFC 3339 literal.
fn parse_datetime_default(default: &str) -> Result<DateTime<Utc>, CrawlerError> {
    let trimmed = default.trim();
    if trimmed.eq_ignore_ascii_case("now") {
        return Ok(Utc::now());
    }
    if let Some(rest) = trimmed.strip_prefix("now").or_else(|| trimmed.strip_prefix("Now")) {
        let rest = rest.trim();
        if !rest.is_empty() {
            let tokens = parse_duration_tokens(rest)?;
            return Ok(apply_duration_tokens(Utc::now(), &tokens));
        }
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CrawlerError::AuthConfigError { message: format!("invalid datetime default `{default}`: {e}") })
}

struct DurationToken {
    sign: i64,
    amount: i64,
    unit: char,
}

/// Tokenizes a signed duration expression such as `"+1d"`, `"-2w"` or
/// `"+1y+2M"` into one or more signed `(amount, unit)` tokens. Units are
/// `y M w d h m s` (year, month, week, day, hour, minute, second).
fn parse_duration_tokens(expr: &str) -> Result<Vec<DurationToken>, CrawlerError> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();
    let mut sign = 1i64;

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        let Some(&c) = chars.peek() else { break };
        if c == '+' {
            sign = 1;
            chars.next();
            continue;
        }
        if c == '-' {
            sign = -1;
            chars.next();
            continue;
        }

        let mut digits = String::new();
        while matches!(chars.peek(), Some(c) if c.is_ascii_digit()) {
            digits.push(chars.next().unwrap());
        }
        if digits.is_empty() {
            return Err(CrawlerError::AuthConfigError { message: format!("invalid duration expression `{expr}`") });
        }
        let unit = chars
            .next()
            .ok_or_else(|| CrawlerError::AuthConfigError { message: format!("duration expression `{expr}` is missing a unit") })?;
        if !"yMwdhms".contains(unit) {
            return Err(CrawlerError::AuthConfigError { message: format!("unknown duration unit `{unit}` in `{expr}`") });
        }
        let amount: i64 = digits
            .parse()
            .map_err(|e| CrawlerError::AuthConfigError { message: format!("invalid duration amount in `{expr}`: {e}") })?;
        tokens.push(DurationToken { sign, amount, unit });
        sign = 1;
    }

    if tokens.is_empty() {
        return Err(CrawlerError::AuthConfigError { message: format!("empty duration expression `{expr}`") });
    }
    Ok(tokens)
}

fn apply_duration_tokens(mut dt: DateTime<Utc>, tokens: &[DurationToken]) -> DateTime<Utc> {
    for token in tokens {
        let signed = token.sign * token.amount;
        dt = match token.unit {
            'y' => shift_months(dt, signed * 12),
            'M' => shift_months(dt, signed),
            'w' => dt + ChronoDuration::weeks(signed),
            'd' => dt + ChronoDuration::days(signed),
            'h' => dt + ChronoDuration::hours(signed),
            'm' => dt + ChronoDuration::minutes(signed),
            's' => dt + ChronoDuration::seconds(signed),
            _ => dt,
        };
    }
    dt
}

/// Calendar-aware month/year addition: a `+1M` on Jan 31 lands on the last
/// valid day of February rather than overflowing, matching `chrono::Months`.
fn shift_months(dt: DateTime<Utc>, months: i64) -> DateTime<Utc> {
    if months >= 0 {
        dt.checked_add_months(Months::new(months as u32)).unwrap_or(dt)
    } else {
        dt.checked_sub_months(Months::new(months.unsigned_abs() as u32)).unwrap_or(dt)
    }
}

/// Typed comparison between a pagination parameter's current value and a
/// `stopOn` literal: datetime compares parsed instants, numerics compare as
/// floating-point, everything else falls back to lexicographic string order.
fn compare_param(current: &ParamValue, op: &str, literal: &str) -> Result<bool, CrawlerError> {
    let ordering = match current {
        ParamValue::DateTime(dt) => {
            let other = DateTime::parse_from_rfc3339(literal)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| CrawlerError::AuthConfigError { message: format!("invalid datetime literal `{literal}` in stopOn: {e}") })?;
            dt.cmp(&other)
        }
        ParamValue::Int(n) => {
            let other: f64 = literal
                .parse()
                .map_err(|e: std::num::ParseFloatError| CrawlerError::AuthConfigError { message: format!("invalid numeric literal `{literal}` in stopOn: {e}") })?;
            (*n as f64).partial_cmp(&other).unwrap_or(Ordering::Equal)
        }
        ParamValue::Float(f) => {
            let other: f64 = literal
                .parse()
                .map_err(|e: std::num::ParseFloatError| CrawlerError::AuthConfigError { message: format!("invalid numeric literal `{literal}` in stopOn: {e}") })?;
            f.partial_cmp(&other).unwrap_or(Ordering::Equal)
        }
        ParamValue::Dynamic(v) => {
            let current_str = match v {
                Value::String(s) => s.clone(),
                other => other.to_string().trim_matches('"').to_string(),
            };
            current_str.as_str().cmp(literal)
        }
    };

    Ok(match op {
        "lt" => ordering == Ordering::Less,
        "lte" => ordering != Ordering::Greater,
        "eq" => ordering == Ordering::Equal,
        "gt" => ordering == Ordering::Greater,
        "gte" => ordering != Ordering::Less,
        other => return Err(CrawlerError::AuthConfigError { message: format!("unknown stopOn operator `{other}`") }),
    })
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn int_param(name: &str) -> PaginationParam {
        PaginationParam {
            name: name.to_string(),
            location: "query".to_string(),
            kind: "int".to_string(),
            format: None,
            default: Some("1".to_string()),
            increment: Some("1".to_string()),
            source: None,
        }
    }

    #[test]
    fn page_num_stop_condition_halts_after_n_pages() {
        let spec = PaginationSpec {
            next_page_url_selector: None,
            params: Some(vec![int_param("page")]),
            stop_on: Some(vec![StopCondition::PageNum { value: 2 }]),
        };
        let mut paginator = Paginator::new(spec).unwrap();
        match paginator.next(&json!({})).unwrap() {
            Next::Continue { .. } => {}
            Next::Stop => panic!("should continue after page 0"),
        }
        match paginator.next(&json!({})).unwrap() {
            Next::Stop => {}
            Next::Continue { .. } => panic!("should stop at page 2"),
        }
    }

    #[test]
    fn response_body_stop_condition_checks_query() {
        let spec = PaginationSpec {
            next_page_url_selector: None,
            params: Some(vec![int_param("page")]),
            stop_on: Some(vec![StopCondition::ResponseBody { query: ".done".to_string() }]),
        };
        let mut paginator = Paginator::new(spec).unwrap();
        match paginator.next(&json!({"done": true})).unwrap() {
            Next::Stop => {}
            Next::Continue { .. } => panic!("should stop when done is true"),
        }
    }

    #[test]
    fn int_param_increments_by_configured_step() {
        let spec = PaginationSpec {
            next_page_url_selector: None,
            params: Some(vec![int_param("page")]),
            stop_on: Some(vec![StopCondition::PageNum { value: 5 }]),
        };
        let mut paginator = Paginator::new(spec).unwrap();
        let next = paginator.next(&json!({})).unwrap();
        match next {
            Next::Continue { params, .. } => {
                assert_eq!(params.query[0], ("page".to_string(), "2".to_string()));
            }
            Next::Stop => panic!("expected continuation"),
        }
    }

    #[test]
    fn increment_with_space_after_sign_is_parsed_not_defaulted() {
        let mut param = int_param("offset");
        param.default = Some("0".to_string());
        param.increment = Some("+ 50".to_string());
        let spec = PaginationSpec {
            next_page_url_selector: None,
            params: Some(vec![param]),
            stop_on: Some(vec![StopCondition::PageNum { value: 3 }]),
        };
        let mut paginator = Paginator::new(spec).unwrap();
        let first = paginator.first_page_params();
        assert_eq!(first.query[0], ("offset".to_string(), "0".to_string()));
        match paginator.next(&json!({})).unwrap() {
            Next::Continue { params, .. } => assert_eq!(params.query[0], ("offset".to_string(), "50".to_string())),
            Next::Stop => panic!("expected continuation"),
        }
        match paginator.next(&json!({})).unwrap() {
            Next::Continue { params, .. } => assert_eq!(params.query[0], ("offset".to_string(), "100".to_string())),
            Next::Stop => panic!("expected continuation"),
        }
    }

    #[test]
    fn invalid_increment_expression_is_a_hard_error() {
        let mut param = int_param("offset");
        param.increment = Some("banana".to_string());
        let spec = PaginationSpec {
            next_page_url_selector: None,
            params: Some(vec![param]),
            stop_on: Some(vec![StopCondition::PageNum { value: 5 }]),
        };
        let mut paginator = Paginator::new(spec).unwrap();
        assert!(paginator.next(&json!({})).is_err());
    }

    #[test]
    fn dynamic_param_is_omitted_from_first_page_then_populated() {
        let param = PaginationParam {
            name: "cursor".to_string(),
            location: "query".to_string(),
            kind: "dynamic".to_string(),
            format: None,
            default: None,
            increment: None,
            source: Some(".next_cursor".to_string()),
        };
        let spec = PaginationSpec {
            next_page_url_selector: None,
            params: Some(vec![param]),
            stop_on: Some(vec![StopCondition::PageNum { value: 2 }]),
        };
        let mut paginator = Paginator::new(spec).unwrap();
        assert!(paginator.first_page_params().query.is_empty());
        match paginator.next(&json!({"next_cursor": "abc123"})).unwrap() {
            Next::Continue { params, .. } => assert_eq!(params.query[0], ("cursor".to_string(), "abc123".to_string())),
            Next::Stop => panic!("expected continuation"),
        }
    }

    #[test]
    fn datetime_increment_applies_calendar_aware_month_step() {
        let param = PaginationParam {
            name: "since".to_string(),
            location: "query".to_string(),
            kind: "datetime".to_string(),
            format: None,
            default: Some("2024-01-31T00:00:00Z".to_string()),
            increment: Some("+1M".to_string()),
            source: None,
        };
        let spec = PaginationSpec {
            next_page_url_selector: None,
            params: Some(vec![param]),
            stop_on: Some(vec![StopCondition::PageNum { value: 2 }]),
        };
        let mut paginator = Paginator::new(spec).unwrap();
        match paginator.next(&json!({})).unwrap() {
            Next::Continue { params, .. } => {
                let (_, rendered) = &params.query[0];
                assert!(rendered.starts_with("2024-02-29"), "got {rendered}");
            }
            Next::Stop => panic!("expected continuation"),
        }
    }

    #[test]
    fn request_param_stop_condition_supports_all_operators() {
        let mut param = int_param("offset");
        param.default = Some("0".to_string());
        param.increment = Some("50".to_string());
        let spec = PaginationSpec {
            next_page_url_selector: None,
            params: Some(vec![param]),
            stop_on: Some(vec![StopCondition::RequestParam {
                param: "offset".to_string(),
                op: "gte".to_string(),
                value: "50".to_string(),
            }]),
        };
        let mut paginator = Paginator::new(spec).unwrap();
        match paginator.next(&json!({})).unwrap() {
            Next::Continue { .. } => {}
            Next::Stop => panic!("offset=0 should not satisfy gte 50"),
        }
        match paginator.next(&json!({})).unwrap() {
            Next::Stop => {}
            Next::Continue { .. } => panic!("offset=100 should satisfy gte 50 before advancing"),
        }
    }
}
