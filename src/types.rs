//! Shared primitives: timestamps, actors and request metadata
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use std::cmp::Ordering;
use std::fmt;

pub const SYSTEM_ACTOR_ID: &str = "system";

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    /// Time elapsed from `self` until `later`; negative if `later` is earlier.
    pub fn elapsed_until(&self, later: &TimeStamp<Utc>) -> TimeDelta {
        later.0 - self.0
    }
}

// chrono's `Utc` is not `Ord`, so a derive would never apply
impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl fmt::Display for TimeStamp<Utc> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorKind {
    User,
    Admin,
    System,
}

/// Whoever asked for a state change. Authenticated upstream; this crate only
/// decides what the actor is allowed to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub nickname: Option<String>,
    pub kind: ActorKind,
}

impl Actor {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nickname: None,
            kind: ActorKind::User,
        }
    }
    pub fn admin(id: impl Into<String>, nickname: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nickname: Some(nickname.into()),
            kind: ActorKind::Admin,
        }
    }
    /// Scheduled jobs and processor callbacks.
    pub fn system() -> Self {
        Self {
            id: SYSTEM_ACTOR_ID.to_string(),
            nickname: Some(SYSTEM_ACTOR_ID.to_string()),
            kind: ActorKind::System,
        }
    }
}

/// Best-effort client details attached to audit entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestMeta {
    pub fn new(ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip_address: Some(ip_address.into()),
            user_agent: Some(user_agent.into()),
        }
    }
}

/// An authenticated actor together with where the request came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub actor: Actor,
    pub request: RequestMeta,
}

impl Caller {
    pub fn new(actor: Actor) -> Self {
        Self {
            actor,
            request: RequestMeta::default(),
        }
    }
    pub fn system() -> Self {
        Self::new(Actor::system())
    }
    pub fn with_request(mut self, request: RequestMeta) -> Self {
        self.request = request;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_encoding() {
        let original = TimeStamp::new();

        let encoding = minicbor::to_vec(original.clone()).unwrap();
        let decode: TimeStamp<Utc> = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn timestamps_order_chronologically() {
        let earlier = TimeStamp::from(Utc::now() - TimeDelta::minutes(5));
        let later = TimeStamp::new();
        assert!(earlier < later);
        let mut stamps = vec![later.clone(), earlier.clone()];
        stamps.sort();
        assert_eq!(stamps, vec![earlier, later]);
    }

    #[test]
    fn elapsed_is_signed() {
        let earlier = TimeStamp::from(Utc::now() - TimeDelta::days(3));
        let now = TimeStamp::new();
        assert!(earlier.elapsed_until(&now).num_days() >= 3);
        assert!(now.elapsed_until(&earlier).num_days() <= -3);
    }
}
