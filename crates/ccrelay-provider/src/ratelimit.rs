use http::HeaderMap;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Parsed view of one dimension of the upstream rate-limit header family.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DimensionUpdate {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset: Option<OffsetDateTime>,
}

impl DimensionUpdate {
    fn is_empty(&self) -> bool {
        self.limit.is_none() && self.remaining.is_none() && self.reset.is_none()
    }
}

/// `*-ratelimit-{requests,input-tokens,output-tokens}-{limit,remaining,reset}`
/// sampled from an upstream response. Vendor prefixes vary, so names are
/// matched by suffix. Malformed values parse to `None` and leave existing
/// bucket state alone.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateLimitUpdate {
    pub requests: DimensionUpdate,
    pub input_tokens: DimensionUpdate,
    pub output_tokens: DimensionUpdate,
}

impl RateLimitUpdate {
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let mut update = RateLimitUpdate::default();
        for (name, value) in headers {
            let name = name.as_str();
            let Some(rest) = name
                .find("ratelimit-")
                .map(|idx| &name[idx + "ratelimit-".len()..])
            else {
                continue;
            };
            let Ok(value) = value.to_str() else {
                continue;
            };
            let (dimension, field) = match rest.rsplit_once('-') {
                Some(parts) => parts,
                None => continue,
            };
            let target = match dimension {
                "requests" => &mut update.requests,
                "input-tokens" => &mut update.input_tokens,
                "output-tokens" => &mut update.output_tokens,
                _ => continue,
            };
            match field {
                "limit" => target.limit = value.trim().parse().ok(),
                "remaining" => target.remaining = value.trim().parse().ok(),
                "reset" => target.reset = OffsetDateTime::parse(value.trim(), &Rfc3339).ok(),
                _ => {}
            }
        }

        if update.requests.is_empty()
            && update.input_tokens.is_empty()
            && update.output_tokens.is_empty()
        {
            None
        } else {
            Some(update)
        }
    }
}
