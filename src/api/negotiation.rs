//! MIME-type negotiation
//!
//! `Accept` is matched with quality-aware best-match semantics;
//! `Content-Type` is matched by exact membership after normalization.

use axum::http::{HeaderMap, Method, header};

use crate::error::AppError;

/// A parsed media type or media range
#[derive(Debug, Clone, PartialEq)]
pub struct MediaRange {
    pub type_: String,
    pub subtype: String,
    /// Parameters other than `q`, keys lower-cased, values unquoted
    pub params: Vec<(String, String)>,
    pub quality: f32,
}

impl MediaRange {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let malformed = || AppError::Validation(format!("Malformed media type: {}", raw.trim()));

        let mut pieces = raw.split(';');
        let essence = pieces.next().unwrap_or("").trim().to_ascii_lowercase();
        let (type_, subtype) = essence.split_once('/').ok_or_else(malformed)?;
        let valid_token = |token: &str| {
            !token.is_empty()
                && token
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "!#$&-^_.+*".contains(c))
        };
        if !valid_token(type_) || !valid_token(subtype) || (type_ == "*" && subtype != "*") {
            return Err(malformed());
        }

        let mut params = Vec::new();
        let mut quality = 1.0;
        for piece in pieces {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            let (key, value) = piece.split_once('=').ok_or_else(malformed)?;
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().trim_matches('"');
            if key == "q" {
                quality = value
                    .parse::<f32>()
                    .ok()
                    .filter(|q| (0.0..=1.0).contains(q))
                    .ok_or_else(malformed)?;
            } else {
                params.push((key, value.to_string()));
            }
        }
        params.sort();

        Ok(Self {
            type_: type_.to_string(),
            subtype: subtype.to_string(),
            params,
            quality,
        })
    }

    pub fn essence(&self) -> String {
        format!("{}/{}", self.type_, self.subtype)
    }

    /// Specificity of this range against a concrete type, if it covers it
    fn fitness(&self, target: &MediaRange) -> Option<u32> {
        let type_matches = self.type_ == target.type_ || self.type_ == "*" || target.type_ == "*";
        let subtype_matches =
            self.subtype == target.subtype || self.subtype == "*" || target.subtype == "*";
        if !type_matches || !subtype_matches {
            return None;
        }

        let params = target
            .params
            .iter()
            .filter(|param| self.params.contains(param))
            .count() as u32;
        let mut fitness = params;
        if self.type_ == target.type_ {
            fitness += 100;
        }
        if self.subtype == target.subtype {
            fitness += 10;
        }
        Some(fitness)
    }
}

/// Parse an `Accept` header into its media ranges
pub fn parse_accept(header: &str) -> Result<Vec<MediaRange>, AppError> {
    header
        .split(',')
        .map(str::trim)
        .filter(|range| !range.is_empty())
        .map(MediaRange::parse)
        .collect()
}

/// Quality the `Accept` ranges assign to one supported type
///
/// The most specific matching range decides.
fn quality_of(supported: &MediaRange, ranges: &[MediaRange]) -> f32 {
    ranges
        .iter()
        .filter_map(|range| range.fitness(supported).map(|fitness| (fitness, range.quality)))
        .max_by_key(|(fitness, _)| *fitness)
        .map(|(_, quality)| quality)
        .unwrap_or(0.0)
}

/// Best supported type for an `Accept` header
///
/// Returns `None` when no supported type is acceptable. Ties go to the
/// type listed first in `supported`.
pub fn best_match<'a>(supported: &[&'a str], accept: &str) -> Result<Option<&'a str>, AppError> {
    let ranges = parse_accept(accept)?;
    let mut best: Option<(&'a str, f32)> = None;

    for &candidate in supported {
        let parsed = MediaRange::parse(candidate)?;
        let quality = quality_of(&parsed, &ranges);
        if quality <= 0.0 {
            continue;
        }
        if best.is_none_or(|(_, current)| quality > current) {
            best = Some((candidate, quality));
        }
    }

    Ok(best.map(|(candidate, _)| candidate))
}

/// Whether a request `Content-Type` is one of `allowed`
///
/// A bare allowed type also admits the same type with only a `charset`.
pub fn content_type_allowed(allowed: &[&str], content_type: &str) -> Result<bool, AppError> {
    let actual = MediaRange::parse(content_type)?;
    if actual.type_ == "*" || actual.subtype == "*" {
        return Err(AppError::Validation(format!(
            "Content-Type cannot be a range: {}",
            content_type.trim()
        )));
    }

    for candidate in allowed {
        let expected = MediaRange::parse(candidate)?;
        if expected.essence() != actual.essence() {
            continue;
        }
        if expected.params == actual.params {
            return Ok(true);
        }
        if expected.params.is_empty() && actual.params.iter().all(|(key, _)| key == "charset") {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Media types a route accepts
#[derive(Debug, Clone, PartialEq)]
pub enum MediaPolicy {
    /// No restriction; matches with or without negotiation headers
    Any,
    Only(Vec<String>),
}

impl MediaPolicy {
    pub fn only<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MediaPolicy::Only(types.into_iter().map(Into::into).collect())
    }

    /// Whether the request's negotiation header selects this route
    ///
    /// GET and HEAD negotiate on `Accept`, other methods on `Content-Type`.
    /// An absent header is a non-match; a malformed one is an error.
    pub fn admits(&self, method: &Method, headers: &HeaderMap) -> Result<bool, AppError> {
        let MediaPolicy::Only(types) = self else {
            return Ok(true);
        };
        let types: Vec<&str> = types.iter().map(String::as_str).collect();

        let negotiating_accept = method == Method::GET || method == Method::HEAD;
        let name = if negotiating_accept {
            header::ACCEPT
        } else {
            header::CONTENT_TYPE
        };

        let Some(value) = headers.get(&name) else {
            return Ok(false);
        };
        let value = value
            .to_str()
            .map_err(|_| AppError::Validation(format!("Invalid {} header", name)))?;
        if value.trim().is_empty() {
            return Ok(false);
        }

        if negotiating_accept {
            Ok(best_match(&types, value)?.is_some())
        } else {
            content_type_allowed(&types, value)
        }
    }
}
