//! Route templates and the identity that selects a rate-limit bucket.

use conduit_error::{RestError, RestErrorKind};
use derive_getters::Getters;
use std::collections::BTreeMap;

/// Path parameters that partition rate-limit buckets.
///
/// Every other parameter (message IDs, emoji, user IDs...) is minor and never
/// changes which bucket a request lands in.
pub const MAJOR_PARAMETERS: &[&str] = &[
    "channel_id",
    "guild_id",
    "webhook_id",
    "webhook_token",
    "interaction_token",
];

/// HTTP method of a route.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
}

/// A request target: method, path template and bound path parameters.
///
/// # Examples
///
/// ```
/// use conduit_rate_limit::{Method, Route};
///
/// let route = Route::new(Method::Delete, "/channels/{channel_id}/messages/{message_id}")
///     .param("channel_id", 10)
///     .param("message_id", 99);
///
/// assert_eq!(route.path().unwrap(), "/channels/10/messages/99");
/// assert_eq!(route.identity().route_template(), "DELETE /channels/{channel_id}/messages/{message_id}");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
pub struct Route {
    /// HTTP method
    method: Method,
    /// Path template with `{name}` placeholders
    template: String,
    /// Bound parameter values by name
    #[getter(skip)]
    params: BTreeMap<String, String>,
}

impl Route {
    /// Create a route with no parameters bound.
    pub fn new(method: Method, template: impl Into<String>) -> Self {
        Self {
            method,
            template: template.into(),
            params: BTreeMap::new(),
        }
    }

    /// Bind a path parameter.
    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    /// Look up a bound parameter.
    pub fn get_param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Substitute bound parameters into the template.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if a placeholder is unbound, unterminated, or
    /// its value would escape its path segment.
    pub fn path(&self) -> Result<String, RestError> {
        let mut path = String::with_capacity(self.template.len() + 32);
        let mut rest = self.template.as_str();
        while let Some(open) = rest.find('{') {
            path.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                RestError::new(RestErrorKind::InvalidRequest(format!(
                    "Unterminated placeholder in {}",
                    self.template
                )))
            })?;
            let name = &after[..close];
            let value = self.params.get(name).ok_or_else(|| {
                RestError::new(RestErrorKind::InvalidRequest(format!(
                    "Missing path parameter {} for {}",
                    name, self.template
                )))
            })?;
            if value.is_empty() || value.contains(['/', '?', '#']) {
                return Err(RestError::new(RestErrorKind::InvalidRequest(format!(
                    "Path parameter {} has an invalid value",
                    name
                ))));
            }
            path.push_str(value);
            rest = &after[close + 1..];
        }
        path.push_str(rest);
        Ok(path)
    }

    /// Derive the bucket identity of this route.
    pub fn identity(&self) -> RouteIdentity {
        let route_template = format!("{} {}", self.method, self.template);
        let major_key = MAJOR_PARAMETERS
            .iter()
            .filter(|name| self.template.contains(&format!("{{{}}}", name)))
            .map(|name| {
                let value = self.params.get(*name).map(String::as_str).unwrap_or("");
                // Length prefix keeps the concatenation injective.
                format!("{}={}:{}", name, value.len(), value)
            })
            .collect::<Vec<_>>()
            .join("/");
        let resource_key = format!("{}|{}", route_template, major_key);
        RouteIdentity {
            route_template,
            resource_key,
            major_key,
        }
    }
}

/// Which bucket governs a request.
///
/// Two routes with equal identities always share a bucket. The key is a plain
/// concatenation of the template and the major parameter values, so distinct
/// templates or major values can never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Getters)]
pub struct RouteIdentity {
    /// `"<METHOD> <template>"`
    route_template: String,
    /// Template plus major parameter values
    resource_key: String,
    /// Major parameter values only; pairs with a server bucket hash
    major_key: String,
}

impl std::fmt::Display for RouteIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.resource_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_route(channel: u64, message: u64) -> Route {
        Route::new(Method::Patch, "/channels/{channel_id}/messages/{message_id}")
            .param("channel_id", channel)
            .param("message_id", message)
    }

    #[test]
    fn test_minor_parameters_do_not_change_identity() {
        assert_eq!(message_route(1, 100).identity(), message_route(1, 200).identity());
    }

    #[test]
    fn test_major_parameters_change_identity() {
        assert_ne!(message_route(1, 100).identity(), message_route(2, 100).identity());
    }

    #[test]
    fn test_method_is_part_of_identity() {
        let get = Route::new(Method::Get, "/channels/{channel_id}").param("channel_id", 1);
        let patch = Route::new(Method::Patch, "/channels/{channel_id}").param("channel_id", 1);
        assert_ne!(get.identity(), patch.identity());
        assert_eq!(patch.identity().route_template(), "PATCH /channels/{channel_id}");
    }

    #[test]
    fn test_identity_keys_do_not_collide_on_delimiters() {
        let a = Route::new(Method::Post, "/webhooks/{webhook_id}/{webhook_token}")
            .param("webhook_id", "1")
            .param("webhook_token", "2/webhook_token=1:3");
        let b = Route::new(Method::Post, "/webhooks/{webhook_id}/{webhook_token}")
            .param("webhook_id", "1/webhook_token=1:2")
            .param("webhook_token", "3");
        assert_ne!(a.identity(), b.identity());
    }

    #[test]
    fn test_path_rejects_missing_parameter() {
        let route = Route::new(Method::Get, "/guilds/{guild_id}/members/{user_id}")
            .param("guild_id", 5);
        let err = route.path().expect_err("user_id is unbound");
        assert!(matches!(err.kind(), RestErrorKind::InvalidRequest(_)));
    }

    #[test]
    fn test_path_rejects_segment_escape() {
        let route = Route::new(Method::Get, "/channels/{channel_id}").param("channel_id", "1/../2");
        assert!(route.path().is_err());
    }

    #[test]
    fn test_method_round_trips_through_strings() {
        use std::str::FromStr;
        assert_eq!(Method::from_str("PATCH").expect("parse"), Method::Patch);
        assert_eq!(Method::Delete.to_string(), "DELETE");
    }
}
