//! Closed-set registries
//!
//! Reason codes, stages, event types and the various model enums are closed
//! sets. They are sum types internally and strings on the wire; conversion
//! from an external string is the only place an unknown value can appear, and
//! it fails with [`UnknownCode`].

use thiserror::Error;

/// External string outside a closed set
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown {set} value: {value:?}")]
pub struct UnknownCode {
    /// Registry the value was checked against
    pub set: &'static str,
    /// The rejected input
    pub value: String,
}

/// Declare a closed set of upper-snake-case string codes.
///
/// Generates the enum, `ALL`, `as_str`, `Display`, `FromStr` and string-based
/// serde impls. Variant order is the declaration order.
#[macro_export]
macro_rules! closed_set {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident : $label:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $code:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        $vis enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Every member in declaration order
            pub const ALL: &'static [$name] = &[ $( $name::$variant ),+ ];

            /// Wire representation
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $code ),+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::registry::UnknownCode;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                match s {
                    $( $code => Ok($name::$variant), )+
                    _ => Err($crate::registry::UnknownCode {
                        set: $label,
                        value: s.to_string(),
                    }),
                }
            }
        }

        impl ::serde::Serialize for $name {
            fn serialize<S: ::serde::Serializer>(&self, serializer: S) -> ::std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $name {
            fn deserialize<D: ::serde::Deserializer<'de>>(deserializer: D) -> ::std::result::Result<Self, D::Error> {
                let raw = <::std::string::String as ::serde::Deserialize>::deserialize(deserializer)?;
                raw.parse().map_err(::serde::de::Error::custom)
            }
        }
    };
}

/// Parse a list of external strings into a closed set, rejecting on the first unknown
pub fn parse_all<T>(values: &[String]) -> Result<Vec<T>, UnknownCode>
where
    T: std::str::FromStr<Err = UnknownCode>,
{
    values.iter().map(|v| v.parse()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    closed_set! {
        enum Colour: "colour" {
            Red => "RED",
            Green => "GREEN",
        }
    }

    #[test]
    fn test_round_trip_and_rejection() {
        assert_eq!("RED".parse::<Colour>().unwrap(), Colour::Red);
        assert_eq!(Colour::Green.to_string(), "GREEN");
        let err = "BLUE".parse::<Colour>().unwrap_err();
        assert_eq!(err.set, "colour");
        assert_eq!(err.value, "BLUE");
        assert_eq!(Colour::ALL.len(), 2);
    }

    #[test]
    fn test_serde_uses_codes() {
        let json = serde_json::to_string(&vec![Colour::Red, Colour::Green]).unwrap();
        assert_eq!(json, r#"["RED","GREEN"]"#);
        assert!(serde_json::from_str::<Vec<Colour>>(r#"["RED","PINK"]"#).is_err());
    }

    #[test]
    fn test_parse_all_rejects_any_unknown() {
        let ok: Vec<Colour> = parse_all(&["RED".into(), "GREEN".into()]).unwrap();
        assert_eq!(ok, vec![Colour::Red, Colour::Green]);
        assert!(parse_all::<Colour>(&["RED".into(), "red".into()]).is_err());
    }
}
