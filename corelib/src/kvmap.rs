//! Typed key-value parameter bag used for `ConnectionManager::open`/`listen`
//! parameters, plus the restriction/validation machinery that checks a caller
//! supplied every required key with the right shape before a connection
//! manager touches a socket.

use crate::error::StatusCode;
use crate::logging::{warn, Logger};
use std::collections::HashMap;

/// A single parameter value. Scalars cover the cases the core's own
/// connection managers need (addresses, ports, booleans, byte buffers);
/// arrays let a parameter carry more than one of the same scalar kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    Boolean(bool),
    UInt16(u16),
    UInt32(u32),
    Int32(i32),
    Int64(i64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Variant>),
}

impl Variant {
    fn type_name(&self) -> &'static str {
        match self {
            Variant::Boolean(_) => "Boolean",
            Variant::UInt16(_) => "UInt16",
            Variant::UInt32(_) => "UInt32",
            Variant::Int32(_) => "Int32",
            Variant::Int64(_) => "Int64",
            Variant::String(_) => "String",
            Variant::Bytes(_) => "Bytes",
            Variant::Array(_) => "Array",
        }
    }

    fn is_array(&self) -> bool {
        matches!(self, Variant::Array(_))
    }

    /// The scalar type name this variant would have if unwrapped from an
    /// `Array`; used to check element-type restrictions.
    fn scalar_type_name(&self) -> &'static str {
        match self {
            Variant::Array(items) => items.first().map(Variant::type_name).unwrap_or("Array"),
            other => other.type_name(),
        }
    }
}

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Variant::Boolean(v)
    }
}

impl From<u16> for Variant {
    fn from(v: u16) -> Self {
        Variant::UInt16(v)
    }
}

impl From<u32> for Variant {
    fn from(v: u32) -> Self {
        Variant::UInt32(v)
    }
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Variant::Int64(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Variant::String(v.to_owned())
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Variant::String(v)
    }
}

/// A caller-supplied set of named parameters, e.g. the arguments to
/// `ConnectionManager::open` (`address`, `port`, `listen`, `reuse`, ...).
pub type KeyValueMap = HashMap<String, Variant>;

/// Describes one parameter a connection manager's `open`/`listen` call
/// accepts: its expected type, whether it may repeat (array), and whether
/// its absence is an error or silently falls back to a default.
#[derive(Debug, Clone)]
pub struct ParamRestriction {
    pub key: &'static str,
    pub expected_type: &'static str,
    pub required: bool,
    pub allow_array: bool,
    pub require_array: bool,
}

impl ParamRestriction {
    pub const fn required(key: &'static str, expected_type: &'static str) -> Self {
        ParamRestriction { key, expected_type, required: true, allow_array: false, require_array: false }
    }

    pub const fn optional(key: &'static str, expected_type: &'static str) -> Self {
        ParamRestriction { key, expected_type, required: false, allow_array: false, require_array: false }
    }

    /// Either a scalar or an array of the expected type is accepted.
    pub const fn array(mut self) -> Self {
        self.allow_array = true;
        self
    }

    /// Only an array of the expected type is accepted; a scalar is rejected.
    pub const fn array_only(mut self) -> Self {
        self.allow_array = true;
        self.require_array = true;
        self
    }
}

/// Validates `map` against `restrictions`: every required key must be
/// present and type-correct; every present key (required or optional) must
/// match its declared type, honoring `allow_array`/`require_array`. Unknown
/// keys are logged and ignored rather than rejected, matching the original's
/// tolerance for forward-compatible extra parameters.
pub fn validate(logger: &Logger, prefix: &str, restrictions: &[ParamRestriction], map: &KeyValueMap) -> StatusCode {
    for restriction in restrictions {
        match map.get(restriction.key) {
            Some(value) => {
                let is_array = value.is_array();
                if is_array && !restriction.allow_array {
                    warn!(logger, "parameter is an array but scalar was expected";
                        "prefix" => prefix, "key" => restriction.key);
                    return StatusCode::BadConnectionRejected;
                }
                if !is_array && restriction.require_array {
                    warn!(logger, "parameter is a scalar but array was expected";
                        "prefix" => prefix, "key" => restriction.key);
                    return StatusCode::BadConnectionRejected;
                }
                let actual_type = if is_array { value.scalar_type_name() } else { value.type_name() };
                if actual_type != restriction.expected_type {
                    warn!(logger, "parameter has wrong type";
                        "prefix" => prefix,
                        "key" => restriction.key,
                        "expected" => restriction.expected_type,
                        "actual" => actual_type);
                    return StatusCode::BadInvalidArgument;
                }
            }
            None if restriction.required => {
                warn!(logger, "required parameter is missing"; "prefix" => prefix, "key" => restriction.key);
                return StatusCode::BadInvalidArgument;
            }
            None => {}
        }
    }

    for key in map.keys() {
        if !restrictions.iter().any(|r| r.key == key) {
            warn!(logger, "ignoring unknown parameter"; "prefix" => prefix, "key" => key.as_str());
        }
    }

    StatusCode::Good
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::discard;

    fn restrictions() -> Vec<ParamRestriction> {
        vec![
            ParamRestriction::required("address", "String"),
            ParamRestriction::required("port", "UInt16"),
            ParamRestriction::optional("listen", "Boolean"),
            ParamRestriction::optional("interfaces", "String").array(),
        ]
    }

    #[test]
    fn accepts_a_fully_specified_map() {
        let mut map = KeyValueMap::new();
        map.insert("address".into(), Variant::from("127.0.0.1"));
        map.insert("port".into(), Variant::from(4840u16));
        map.insert("listen".into(), Variant::from(true));

        assert_eq!(validate(&discard(), "tcp", &restrictions(), &map), StatusCode::Good);
    }

    #[test]
    fn rejects_missing_required_key() {
        let mut map = KeyValueMap::new();
        map.insert("address".into(), Variant::from("127.0.0.1"));

        assert_eq!(validate(&discard(), "tcp", &restrictions(), &map), StatusCode::BadInvalidArgument);
    }

    #[test]
    fn rejects_wrong_type() {
        let mut map = KeyValueMap::new();
        map.insert("address".into(), Variant::from("127.0.0.1"));
        map.insert("port".into(), Variant::from("4840"));

        assert_eq!(validate(&discard(), "tcp", &restrictions(), &map), StatusCode::BadInvalidArgument);
    }

    #[test]
    fn allows_array_only_when_declared() {
        let mut map = KeyValueMap::new();
        map.insert("address".into(), Variant::from("127.0.0.1"));
        map.insert("port".into(), Variant::from(4840u16));
        map.insert(
            "interfaces".into(),
            Variant::Array(vec![Variant::from("eth0"), Variant::from("eth1")]),
        );
        assert_eq!(validate(&discard(), "tcp", &restrictions(), &map), StatusCode::Good);

        map.insert("listen".into(), Variant::Array(vec![Variant::from(true)]));
        assert_eq!(validate(&discard(), "tcp", &restrictions(), &map), StatusCode::BadConnectionRejected);
    }

    #[test]
    fn rejects_scalar_against_an_array_only_restriction() {
        let restrictions = vec![ParamRestriction::optional("interfaces", "String").array_only()];

        let mut map = KeyValueMap::new();
        map.insert("interfaces".into(), Variant::Array(vec![Variant::from("eth0")]));
        assert_eq!(validate(&discard(), "eth", &restrictions, &map), StatusCode::Good);

        map.insert("interfaces".into(), Variant::from("eth0"));
        assert_eq!(validate(&discard(), "eth", &restrictions, &map), StatusCode::BadConnectionRejected);
    }

    #[test]
    fn int64_variant_carries_txtime_style_deadlines() {
        let restrictions = vec![ParamRestriction::optional("txtime", "Int64")];
        let mut map = KeyValueMap::new();
        map.insert("txtime".into(), Variant::from(11_644_473_600_000_000_000i64));
        assert_eq!(validate(&discard(), "eth", &restrictions, &map), StatusCode::Good);
    }

    #[test]
    fn tolerates_unknown_keys() {
        let mut map = KeyValueMap::new();
        map.insert("address".into(), Variant::from("127.0.0.1"));
        map.insert("port".into(), Variant::from(4840u16));
        map.insert("extra".into(), Variant::from("ignored"));

        assert_eq!(validate(&discard(), "tcp", &restrictions(), &map), StatusCode::Good);
    }
}
