//! Structured accessibility-bus errors.

use std::fmt;

use thiserror::Error;

/// Classification of a failed bus call.
///
/// Bus adapters derive the kind from the error *name* reported by the peer
/// (or from the transport error), never from the human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusErrorKind {
    /// The peer does not implement the called method.
    UnknownMethod,
    /// The peer does not implement the interface.
    UnknownInterface,
    /// No object lives at the requested path.
    UnknownObject,
    /// The interface has no such property.
    UnknownProperty,
    /// The bus endpoint does not exist (socket missing, unit not up yet).
    NotFound,
    /// Anything else.
    Other,
}

impl BusErrorKind {
    /// Maps a D-Bus error name onto a kind.
    #[must_use]
    pub fn from_error_name(name: &str) -> Self {
        match name {
            "org.freedesktop.DBus.Error.UnknownMethod" => Self::UnknownMethod,
            "org.freedesktop.DBus.Error.UnknownInterface" => Self::UnknownInterface,
            "org.freedesktop.DBus.Error.UnknownObject" => Self::UnknownObject,
            // GDBus reports a missing property as InvalidArgs.
            "org.freedesktop.DBus.Error.UnknownProperty"
            | "org.freedesktop.DBus.Error.InvalidArgs" => Self::UnknownProperty,
            "org.freedesktop.DBus.Error.ServiceUnknown"
            | "org.freedesktop.DBus.Error.FileNotFound" => Self::NotFound,
            _ => Self::Other,
        }
    }

    /// Returns true if the peer simply does not speak the requested
    /// interface (as opposed to a transport or application failure).
    #[must_use]
    pub const fn is_unsupported(self) -> bool {
        matches!(
            self,
            Self::UnknownMethod
                | Self::UnknownInterface
                | Self::UnknownObject
                | Self::UnknownProperty
        )
    }
}

impl fmt::Display for BusErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UnknownMethod => "unknown method",
            Self::UnknownInterface => "unknown interface",
            Self::UnknownObject => "unknown object",
            Self::UnknownProperty => "unknown property",
            Self::NotFound => "not found",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// A failed call on the accessibility bus.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct BusError {
    /// Structured classification.
    pub kind: BusErrorKind,
    /// Message reported by the peer or transport.
    pub message: String,
}

impl BusError {
    /// Creates a new bus error.
    #[must_use]
    pub fn new(kind: BusErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_error_name() {
        assert_eq!(
            BusErrorKind::from_error_name("org.freedesktop.DBus.Error.UnknownMethod"),
            BusErrorKind::UnknownMethod
        );
        assert_eq!(
            BusErrorKind::from_error_name("org.freedesktop.DBus.Error.UnknownInterface"),
            BusErrorKind::UnknownInterface
        );
        assert_eq!(
            BusErrorKind::from_error_name("org.gtk.GDBus.UnmappedGError.Quark._g_2dio_2derror_2dquark.Code1"),
            BusErrorKind::Other
        );
    }

    #[test]
    fn test_unsupported_kinds() {
        assert!(BusErrorKind::UnknownObject.is_unsupported());
        assert!(!BusErrorKind::NotFound.is_unsupported());
        assert!(!BusErrorKind::Other.is_unsupported());
    }

    #[test]
    fn test_display() {
        let err = BusError::new(BusErrorKind::UnknownInterface, "no Accessible here");
        assert_eq!(err.to_string(), "unknown interface: no Accessible here");
    }
}
