//! Identifiers with distinct namespaces in the container.
//!
//! Bundle identity is built from strings that must never cross wires: a
//! symbolic name is not a package name, even though both look like dotted
//! paths. Giving each namespace its own type makes the mix-up
//! unrepresentable, while `#[serde(transparent)]` keeps the persisted and
//! on-manifest form a plain string.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! identifier {
    ($(#[$docs:meta])* $name:ident) => {
        $(#[$docs])*
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        // Manifest assertions and header lookups compare against literals.
        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }
    };
}

identifier!(
    /// The name a bundle declares for itself in `[bundle]`. Together with
    /// the bundle version it must be unique across installed bundles when
    /// the manifest declares format 2, and it is the key `[requires]`
    /// entries point at.
    SymbolicName
);

identifier!(
    /// A package namespace offered through `[exports]` or consumed through
    /// `[imports]`; the unit the resolver wires between modules.
    PackageName
);
