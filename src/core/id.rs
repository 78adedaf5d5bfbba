/*!
A common identifier type used as the stable, weak back-reference between owner and owned
elements in the model graph (see the "Cyclic graphs" design note in `DESIGN.md`). It is
purposefully opaque: callers get a `String`-like value back from `FromStr`/`Display` but cannot
construct one directly except through [`Id::random`] or [`Id::random_with_prefix`].

# Example

```rust
use uml_state_machine::core::Id;

let first_id = Id::random_with_prefix("state").unwrap();
let _next_id = first_id.append_random();
```
*/

use lazy_static::lazy_static;
use std::fmt::Display;
use std::str::FromStr;

// ------------------------------------------------------------------------------------------------
// Public Types
// ------------------------------------------------------------------------------------------------

///
/// An opaque, stable identifier. Used in place of pointers for owner/child back-references so the
/// model graph never needs `Weak<T>` bookkeeping; cancelling or freeing a subtree is then just a
/// sweep over the owned children keyed by `Id`.
///
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(String);

///
/// Errors raised constructing or parsing an [`Id`].
///
pub mod error {
    error_chain! {
        errors {
            #[doc = "`Id` may not be an empty string."]
            EmptyString {
                description("`Id` may not be an empty string.")
                display("`Id` may not be an empty string.")
            }
            #[doc = "`Id` contains invalid character(s)."]
            InvalidCharacter {
                description("`Id` contains invalid character(s).")
                display("`Id` contains invalid character(s).")
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Public Functions
// ------------------------------------------------------------------------------------------------

pub fn default_path_separator() -> String {
    PATH_SEPARATOR.to_string()
}

// ------------------------------------------------------------------------------------------------
// Implementations
// ------------------------------------------------------------------------------------------------

trait IdValueGenerator: Sync {
    fn next(&self) -> String;
    fn invalid_value(&self) -> String;
    fn is_valid_value(&self, s: &str) -> bool {
        self.is_valid_prefix(s)
    }
    fn is_valid_prefix(&self, s: &str) -> bool {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == ':')
    }
}

lazy_static! {
    static ref ID_GENERATOR: Box<dyn IdValueGenerator> = Box::new(generator::BlobGenerator::default());
}

impl Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Id {
    type Err = error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(error::ErrorKind::EmptyString.into())
        } else if ID_GENERATOR.is_valid_value(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(error::ErrorKind::InvalidCharacter.into())
        }
    }
}

const PATH_SEPARATOR: &str = "::";

impl Id {
    pub fn random() -> Self {
        Self(ID_GENERATOR.next())
    }

    pub fn random_with_prefix(prefix: &str) -> error::Result<Self> {
        if prefix.is_empty() {
            Err(error::ErrorKind::EmptyString.into())
        } else if ID_GENERATOR.is_valid_prefix(prefix) {
            Ok(Self(format!("{}{}{}", prefix, PATH_SEPARATOR, Self::random())))
        } else {
            Err(error::ErrorKind::InvalidCharacter.into())
        }
    }

    pub fn invalid() -> Self {
        Self(ID_GENERATOR.invalid_value())
    }

    pub fn is_valid(&self) -> bool {
        ID_GENERATOR.is_valid_value(&self.0)
    }

    pub fn append_random(&self) -> Self {
        Self(format!("{}{}{}", self.0, PATH_SEPARATOR, Self::random()))
    }

    pub fn split(&self) -> Vec<Id> {
        self.0
            .split(PATH_SEPARATOR)
            .filter_map(|s| {
                if ID_GENERATOR.is_valid_value(s) {
                    Some(Id::from_str(s).unwrap())
                } else {
                    None
                }
            })
            .collect()
    }
}

// ------------------------------------------------------------------------------------------------
// Modules
// ------------------------------------------------------------------------------------------------

mod generator {
    use super::IdValueGenerator;

    #[derive(Debug, Default)]
    pub(super) struct BlobGenerator {}

    #[allow(unsafe_code)]
    unsafe impl Sync for BlobGenerator {}

    impl IdValueGenerator for BlobGenerator {
        fn next(&self) -> String {
            blob_uuid::random_blob()
        }

        fn invalid_value(&self) -> String {
            "<invalid-id>".to_string()
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Unit Tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_with_prefix_then_append() {
        let first_id = Id::random_with_prefix("thing").unwrap();
        let next_id = first_id.append_random();
        assert!(next_id.is_valid());
        assert_eq!(next_id.split().len(), 3);
    }

    #[test]
    fn test_invalid_is_not_valid() {
        assert!(!Id::invalid().is_valid());
    }

    #[test]
    fn test_empty_prefix_rejected() {
        assert!(Id::random_with_prefix("").is_err());
    }
}
